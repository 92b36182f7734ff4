use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::{
    block_offset_table::CARD_SIZE,
    header::{fill_with_object, MIN_FILL_WORDS},
    region::HeapRegion,
    utils::{align_up, formatted_size, pointer_delta, HEAP_WORD_SIZE},
};

/// What an allocation cursor allocates for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocPurpose {
    Mutator,
    Survivor,
    Old,
}

/// Hands regions to allocation cursors and takes them back once retired.
pub trait RegionSource {
    /// A fresh region able to hold `word_size` words, or `None`. `force` skips any sizing
    /// policy of the source.
    fn new_alloc_region(
        &self,
        purpose: AllocPurpose,
        word_size: usize,
        force: bool,
        node_index: u32,
    ) -> Option<&HeapRegion>;

    /// `region` stopped being allocated into after `allocated_bytes` were allocated in it
    /// by this cursor.
    fn retire_alloc_region(&self, purpose: AllocPurpose, region: &HeapRegion, allocated_bytes: usize);

    /// A previously retired old region is taken back for allocation. `reclaimed_words`
    /// of trailing filler were dropped from it beforehand.
    fn reuse_alloc_region(&self, region: &HeapRegion, reclaimed_words: usize);
}

/*
 An allocation cursor owns at most one region at a time and bump allocates in it.

   uninitialized --init--> empty (dummy region) --new region--> active
        ^                     ^                                   |
        |                     +------------- retire --------------+
        +-------- release ----+

 `attempt_allocation` is lock-free and may race with everything else on the same
 cursor. Every other method requires the lock guarding the cursor: the heap lock for
 mutator cursors, the allocator's free list lock for GC cursors.

 The dummy region has no space, so lock-free allocation against an empty cursor fails
 like allocation against a full region.
*/
pub struct AllocRegion {
    name: &'static str,
    purpose: AllocPurpose,
    node_index: u32,
    alloc_region: CachePadded<AtomicPtr<HeapRegion>>,
    dummy_region: *mut HeapRegion,
    /// Regions allocated into since the last init.
    count: AtomicUsize,
    /// Used bytes of the current region when it was installed.
    used_bytes_before: AtomicUsize,

    /// Region end waste of retirements.
    wasted_bytes: AtomicUsize,

    // Mutator cursors keep a retired region with enough free space around and keep
    // serving allocations from it.
    retained_alloc_region: AtomicPtr<HeapRegion>,
    min_retain_bytes: usize,
}

unsafe impl Send for AllocRegion {}
unsafe impl Sync for AllocRegion {}

impl AllocRegion {
    fn new(
        name: &'static str,
        purpose: AllocPurpose,
        node_index: u32,
        dummy_region: &HeapRegion,
        min_retain_bytes: usize,
    ) -> Self {
        debug_assert_eq!(dummy_region.free(), 0);
        Self {
            name,
            purpose,
            node_index,
            alloc_region: CachePadded::new(AtomicPtr::new(std::ptr::null_mut())),
            dummy_region: dummy_region as *const HeapRegion as *mut HeapRegion,
            count: AtomicUsize::new(0),
            used_bytes_before: AtomicUsize::new(0),
            retained_alloc_region: AtomicPtr::new(std::ptr::null_mut()),
            wasted_bytes: AtomicUsize::new(0),
            min_retain_bytes,
        }
    }

    /// Eden cursor. Retired regions with at least `min_tlab_bytes` free are retained.
    pub fn mutator(node_index: u32, dummy_region: &HeapRegion, min_tlab_bytes: usize) -> Self {
        Self::new(
            "Mutator Alloc Region",
            AllocPurpose::Mutator,
            node_index,
            dummy_region,
            min_tlab_bytes,
        )
    }

    pub fn survivor(node_index: u32, dummy_region: &HeapRegion) -> Self {
        Self::new(
            "Survivor GC Alloc Region",
            AllocPurpose::Survivor,
            node_index,
            dummy_region,
            0,
        )
    }

    pub fn old(dummy_region: &HeapRegion) -> Self {
        Self::new(
            "Old GC Alloc Region",
            AllocPurpose::Old,
            crate::region::UNKNOWN_NODE,
            dummy_region,
            0,
        )
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn purpose(&self) -> AllocPurpose {
        self.purpose
    }
    pub fn node_index(&self) -> u32 {
        self.node_index
    }
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
    /// Bytes plugged with fillers by retirements since the last call.
    pub fn take_wasted_bytes(&self) -> usize {
        self.wasted_bytes.swap(0, Ordering::Relaxed)
    }

    #[inline(always)]
    fn current(&self) -> &HeapRegion {
        let region = self.alloc_region.load(Ordering::Acquire);
        debug_assert!(!region.is_null(), "{} is not initialized", self.name);
        unsafe { &*region }
    }

    fn is_dummy(&self, region: *const HeapRegion) -> bool {
        region == self.dummy_region as *const _
    }

    /// Current region, `None` when empty or uninitialized.
    pub fn get(&self) -> Option<&HeapRegion> {
        let region = self.alloc_region.load(Ordering::Acquire);
        if region.is_null() || self.is_dummy(region) {
            None
        } else {
            Some(unsafe { &*region })
        }
    }

    pub fn retained(&self) -> Option<&HeapRegion> {
        let region = self.retained_alloc_region.load(Ordering::Acquire);
        if region.is_null() {
            None
        } else {
            Some(unsafe { &*region })
        }
    }

    pub fn is_initialized(&self) -> bool {
        !self.alloc_region.load(Ordering::Acquire).is_null()
    }

    /// Bytes allocated by this cursor in regions not yet reported through
    /// [`RegionSource::retire_alloc_region`].
    pub fn used_in_alloc_regions(&self) -> usize {
        let mut used = match self.get() {
            Some(region) => region.used() - self.used_bytes_before.load(Ordering::Relaxed),
            None => 0,
        };
        if let Some(retained) = self.retained() {
            used += retained.used();
        }
        used
    }

    fn trace(&self, what: &str, min: usize, desired: usize, actual: usize, result: *mut u8) {
        log::trace!(
            target: "gc::alloc::region",
            "{}: {} {:?} count: {} min: {} desired: {} actual: {} result: {:p}",
            self.name,
            what,
            self.get(),
            self.count(),
            min,
            desired,
            actual,
            result
        );
    }

    pub fn init(&self) {
        debug_assert!(
            self.get().is_none(),
            "{}: pre-condition, current region must be empty",
            self.name
        );
        self.alloc_region
            .store(self.dummy_region, Ordering::Release);
        self.count.store(0, Ordering::Relaxed);
        self.used_bytes_before.store(0, Ordering::Relaxed);
        self.trace("initialized", 0, 0, 0, std::ptr::null_mut());
    }

    /// Install `region` as the current region of an empty cursor. Used to continue
    /// allocating into an old region kept from the previous pause.
    pub fn set(&self, region: &HeapRegion) {
        debug_assert!(self.get().is_none(), "{}: cursor must be empty", self.name);
        self.used_bytes_before.store(region.used(), Ordering::Relaxed);
        self.update_alloc_region(region);
        self.trace("set", 0, 0, 0, std::ptr::null_mut());
    }

    fn update_alloc_region(&self, region: &HeapRegion) {
        debug_assert!(!region.is_free(), "{:?} is free", region);
        self.alloc_region.store(
            region as *const HeapRegion as *mut HeapRegion,
            Ordering::Release,
        );
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn reset_alloc_region(&self) {
        self.alloc_region
            .store(self.dummy_region, Ordering::Release);
    }

    /// Lock-free allocation of between `min_word_size` and `desired_word_size` words in the
    /// current region. Null when it does not fit.
    #[inline]
    pub fn attempt_allocation(
        &self,
        min_word_size: usize,
        desired_word_size: usize,
        actual_word_size: &mut usize,
    ) -> *mut u8 {
        let result = self
            .current()
            .par_allocate(min_word_size, desired_word_size, actual_word_size);
        if !result.is_null() {
            self.trace(
                "alloc",
                min_word_size,
                desired_word_size,
                *actual_word_size,
                result,
            );
        } else {
            self.trace("alloc failed", min_word_size, desired_word_size, 0, result);
        }
        result
    }

    /// Lock-free allocation from the region retained by the last retirement.
    #[inline]
    pub fn attempt_retained_allocation(
        &self,
        min_word_size: usize,
        desired_word_size: usize,
        actual_word_size: &mut usize,
    ) -> *mut u8 {
        let retained = self.retained_alloc_region.load(Ordering::Acquire);
        if retained.is_null() {
            return std::ptr::null_mut();
        }
        let result =
            unsafe { &*retained }.par_allocate(min_word_size, desired_word_size, actual_word_size);
        if !result.is_null() {
            self.trace(
                "alloc retained",
                min_word_size,
                desired_word_size,
                *actual_word_size,
                result,
            );
        }
        result
    }

    /// Slow path: retry the lock-free path, then replace the current region. Requires the
    /// cursor's lock.
    pub fn attempt_allocation_locked(
        &self,
        min_word_size: usize,
        desired_word_size: usize,
        actual_word_size: &mut usize,
        source: &dyn RegionSource,
    ) -> *mut u8 {
        // someone may have replaced the region while we waited for the lock
        let result = self.attempt_allocation(min_word_size, desired_word_size, actual_word_size);
        if !result.is_null() {
            return result;
        }
        self.attempt_allocation_using_new_region(
            min_word_size,
            desired_word_size,
            actual_word_size,
            source,
        )
    }

    pub fn attempt_allocation_using_new_region(
        &self,
        min_word_size: usize,
        desired_word_size: usize,
        actual_word_size: &mut usize,
        source: &dyn RegionSource,
    ) -> *mut u8 {
        self.retire(true, source);
        let result = self.new_alloc_region_and_allocate(desired_word_size, false, source);
        if !result.is_null() {
            *actual_word_size = desired_word_size;
            self.trace(
                "alloc locked (second attempt)",
                min_word_size,
                desired_word_size,
                *actual_word_size,
                result,
            );
            return result;
        }
        self.trace(
            "alloc locked failed",
            min_word_size,
            desired_word_size,
            0,
            result,
        );
        std::ptr::null_mut()
    }

    /// Get a region regardless of the source's sizing policy and allocate in it. The
    /// cursor must be empty.
    pub fn attempt_allocation_force(&self, word_size: usize, source: &dyn RegionSource) -> *mut u8 {
        debug_assert!(
            self.get().is_none(),
            "{}: pre-condition, current region must be empty",
            self.name
        );
        self.trace("forcing alloc", word_size, word_size, 0, std::ptr::null_mut());
        let result = self.new_alloc_region_and_allocate(word_size, true, source);
        if !result.is_null() {
            self.trace("alloc forced", word_size, word_size, word_size, result);
            return result;
        }
        self.trace("alloc forced failed", word_size, word_size, 0, result);
        std::ptr::null_mut()
    }

    fn new_alloc_region_and_allocate(
        &self,
        word_size: usize,
        force: bool,
        source: &dyn RegionSource,
    ) -> *mut u8 {
        debug_assert!(self.get().is_none(), "{}: current region must be empty", self.name);
        match source.new_alloc_region(self.purpose, word_size, force, self.node_index) {
            Some(region) => {
                region.reset_pre_dummy_top();
                self.used_bytes_before.store(region.used(), Ordering::Relaxed);
                // not visible to other threads yet
                let result = region.allocate(word_size);
                debug_assert!(!result.is_null(), "the allocation should have succeeded");
                self.update_alloc_region(region);
                self.trace("update", word_size, word_size, word_size, result);
                result
            }
            None => std::ptr::null_mut(),
        }
    }

    /// Claim and plug the free tail of `region` while other threads may still be allocating
    /// into it. Returns the number of bytes wasted.
    fn fill_up_remaining_space(region: &HeapRegion) -> usize {
        let mut result = 0;
        let mut free_word_size = region.free() / HEAP_WORD_SIZE;
        while free_word_size >= MIN_FILL_WORDS {
            let mut actual = 0;
            let dummy = region.par_allocate(free_word_size, free_word_size, &mut actual);
            if !dummy.is_null() {
                unsafe {
                    fill_with_object(dummy, free_word_size);
                }
                region.set_pre_dummy_top(dummy);
                result += free_word_size * HEAP_WORD_SIZE;
                break;
            }
            // lost a race, the free space shrank
            free_word_size = region.free() / HEAP_WORD_SIZE;
        }
        result += region.free();
        debug_assert!(region.free() / HEAP_WORD_SIZE < MIN_FILL_WORDS, "post-condition");
        result
    }

    fn retire_internal(&self, region: &HeapRegion, fill_up: bool, source: &dyn RegionSource) -> usize {
        let waste = if fill_up {
            Self::fill_up_remaining_space(region)
        } else {
            0
        };
        debug_assert!(!self.is_dummy(region), "{}: retiring the dummy region", self.name);
        let before = self.used_bytes_before.load(Ordering::Relaxed);
        debug_assert!(region.used() >= before);
        let allocated_bytes = region.used() - before;
        source.retire_alloc_region(self.purpose, region, allocated_bytes);
        self.used_bytes_before.store(0, Ordering::Relaxed);
        waste
    }

    fn should_retain(&self, region: &HeapRegion) -> bool {
        let free = region.free();
        if free < self.min_retain_bytes {
            return false;
        }
        match self.retained() {
            Some(retained) => free >= retained.free(),
            None => true,
        }
    }

    /// Stop allocating into the current region. With `fill_up` its remaining space is plugged
    /// with a filler first. Mutator cursors may keep the region around instead. Returns the
    /// bytes wasted.
    pub fn retire(&self, fill_up: bool, source: &dyn RegionSource) -> usize {
        self.trace("retiring", 0, 0, 0, std::ptr::null_mut());
        let mut waste = 0;
        if let Some(current) = self.get() {
            if self.purpose == AllocPurpose::Mutator && self.should_retain(current) {
                self.trace("mutator retained", 0, 0, 0, std::ptr::null_mut());
                if let Some(retained) = self.retained() {
                    waste = self.retire_retained(retained, true, source);
                }
                self.retained_alloc_region.store(
                    current as *const HeapRegion as *mut HeapRegion,
                    Ordering::Release,
                );
            } else {
                waste = self.retire_internal(current, fill_up, source);
            }
            self.reset_alloc_region();
        }
        self.wasted_bytes.fetch_add(waste, Ordering::Relaxed);
        self.trace("retired", 0, 0, 0, std::ptr::null_mut());
        waste
    }

    fn retire_retained(&self, retained: &HeapRegion, fill_up: bool, source: &dyn RegionSource) -> usize {
        let waste = if fill_up {
            Self::fill_up_remaining_space(retained)
        } else {
            0
        };
        // the retained region's bytes were not reported at retention time
        source.retire_alloc_region(self.purpose, retained, retained.used());
        self.retained_alloc_region
            .store(std::ptr::null_mut(), Ordering::Release);
        waste
    }

    /// Retire the current region without filling it and leave the cursor uninitialized.
    /// Returns the region that was current, if any.
    pub fn release(&self, source: &dyn RegionSource) -> Option<&HeapRegion> {
        if self.purpose == AllocPurpose::Old {
            self.top_up_to_card_boundary();
        }
        let current = self.alloc_region.load(Ordering::Acquire);
        self.retire(false, source);
        self.alloc_region
            .store(std::ptr::null_mut(), Ordering::Release);
        if self.purpose == AllocPurpose::Mutator {
            if let Some(retained) = self.retained() {
                let waste = self.retire_retained(retained, false, source);
                self.wasted_bytes.fetch_add(waste, Ordering::Relaxed);
            }
            let wasted = self.take_wasted_bytes();
            log::debug!(
                target: "gc::alloc::region",
                "Mutator Allocation stats, regions: {}, wasted size: {}",
                self.count(),
                formatted_size(wasted)
            );
        }
        self.trace("released", 0, 0, 0, std::ptr::null_mut());
        if current.is_null() || self.is_dummy(current) {
            None
        } else {
            Some(unsafe { &*current })
        }
    }

    /// Plug the current old region up to the next card boundary so nothing ever scans a
    /// half written card after the pause.
    fn top_up_to_card_boundary(&self) {
        let current = match self.get() {
            Some(current) => current,
            None => return,
        };
        let top = current.top();
        let aligned_top = align_up(top as usize, CARD_SIZE) as *mut u8;
        let mut to_allocate_words = pointer_delta(aligned_top, top);
        if to_allocate_words == 0 {
            return;
        }
        to_allocate_words = pointer_delta(current.end(), top).min(to_allocate_words.max(MIN_FILL_WORDS));
        if to_allocate_words >= MIN_FILL_WORDS {
            let mut actual = 0;
            let dummy = self.attempt_allocation(to_allocate_words, to_allocate_words, &mut actual);
            if !dummy.is_null() {
                unsafe {
                    fill_with_object(dummy, to_allocate_words);
                }
            }
        }
    }
}

impl std::fmt::Debug for AllocRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}] {:?}", self.name, self.node_index as i32, self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{header::HeapObjectHeader, heap::Heap, utils::word_offset, Config};

    const REGION: usize = 256 * 1024;
    const LARGE: usize = 16_000;

    fn heap(max_eden_regions: Option<usize>) -> Box<Heap> {
        Heap::new(Config {
            initial_heap_size: 8 * REGION,
            max_heap_size: 32 * REGION,
            region_size: Some(REGION),
            min_tlab_size: 2048,
            max_eden_regions,
            concurrent_uncommit: false,
            ..Default::default()
        })
    }

    fn mutator_cursor(heap: &Heap) -> AllocRegion {
        let cursor = AllocRegion::mutator(0, heap.dummy_region(), 2048);
        cursor.init();
        cursor
    }

    #[test]
    fn retained_region_keeps_serving_small_allocations() {
        let heap = heap(None);
        let cursor = mutator_cursor(&heap);
        let mut actual = 0;
        assert!(!cursor
            .attempt_allocation_locked(LARGE, LARGE, &mut actual, &*heap)
            .is_null());
        let first = cursor.get().unwrap().index();
        assert!(!cursor.attempt_allocation(LARGE, LARGE, &mut actual).is_null());
        assert!(cursor.attempt_retained_allocation(8, 8, &mut actual).is_null());

        // 768 words are left, too few for the next large block but worth keeping
        assert!(!cursor
            .attempt_allocation_locked(LARGE, LARGE, &mut actual, &*heap)
            .is_null());
        let second = cursor.get().unwrap().index();
        assert_ne!(first, second);
        assert_eq!(cursor.retained().map(|r| r.index()), Some(first));

        let small = cursor.attempt_retained_allocation(64, 64, &mut actual);
        assert!(!small.is_null());
        assert_eq!(actual, 64);
        assert_eq!(heap.heap_region_containing(small).unwrap().index(), first);

        // the current region ends up with more free space than the retained one and
        // replaces it; the old retained region is plugged
        assert!(!cursor.attempt_allocation(LARGE, LARGE, &mut actual).is_null());
        assert!(!cursor
            .attempt_allocation_locked(LARGE, LARGE, &mut actual, &*heap)
            .is_null());
        assert_eq!(cursor.retained().map(|r| r.index()), Some(second));
        let first_region = heap.region_at(first).unwrap();
        assert_eq!(first_region.top(), first_region.end());
        let filler = unsafe { HeapObjectHeader::from_addr(word_offset(small, 64)) };
        assert!(filler.is_filler());
        assert!(cursor.take_wasted_bytes() > 0);

        cursor.release(&*heap);
        assert!(cursor.retained().is_none());
        assert!(!cursor.is_initialized());
    }

    #[test]
    fn regions_with_little_space_are_not_retained() {
        let heap = heap(None);
        let cursor = mutator_cursor(&heap);
        let mut actual = 0;
        assert!(!cursor
            .attempt_allocation_locked(LARGE, LARGE, &mut actual, &*heap)
            .is_null());
        let first = cursor.get().unwrap();
        assert!(!cursor.attempt_allocation(LARGE, LARGE, &mut actual).is_null());
        assert!(!cursor.attempt_allocation(700, 700, &mut actual).is_null());
        // 68 words left, below the minimum TLAB size
        assert_eq!(first.free(), 68 * HEAP_WORD_SIZE);

        assert!(!cursor
            .attempt_allocation_locked(LARGE, LARGE, &mut actual, &*heap)
            .is_null());
        assert!(cursor.retained().is_none());
        assert_eq!(first.top(), first.end());
        assert_eq!(cursor.take_wasted_bytes(), 68 * HEAP_WORD_SIZE);
        cursor.release(&*heap);
    }

    #[test]
    fn forced_allocation_ignores_the_eden_limit() {
        let heap = heap(Some(0));
        let cursor = mutator_cursor(&heap);
        let mut actual = 0;
        assert!(cursor
            .attempt_allocation_locked(64, 64, &mut actual, &*heap)
            .is_null());
        assert!(cursor.get().is_none());

        let obj = cursor.attempt_allocation_force(64, &*heap);
        assert!(!obj.is_null());
        let region = cursor.get().unwrap();
        assert!(region.is_eden());
        assert_eq!(region.bottom(), obj);
        assert_eq!(region.top(), word_offset(obj, 64));
        assert_eq!(cursor.count(), 1);
        // later allocations go to the forced region lock-free
        assert!(!cursor.attempt_allocation(8, 8, &mut actual).is_null());

        assert_eq!(cursor.release(&*heap).map(|r| r.index()), Some(region.index()));
        assert_eq!(heap.used(), 72 * HEAP_WORD_SIZE);
    }
}
