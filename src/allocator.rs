use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use parking_lot::Mutex;

use crate::{
    alloc_region::{AllocRegion, RegionSource},
    region::{HeapRegion, UNKNOWN_NODE},
    Destination,
};

/// Routes allocation requests to the right cursor.
///
/// Mutators get one eden cursor per NUMA node, GC workers one survivor cursor per node and
/// a single old cursor. Mutator slow paths must hold the heap lock, GC slow paths take the
/// allocator's own free list lock.
pub struct Allocator {
    mutator_alloc_regions: Box<[AllocRegion]>,
    survivor_gc_alloc_regions: Box<[AllocRegion]>,
    old_gc_alloc_region: AllocRegion,
    /// Old region released at the end of the last pause, candidate for reuse by the next.
    retained_old_gc_alloc_region: AtomicPtr<HeapRegion>,
    survivor_is_full: AtomicBool,
    old_is_full: AtomicBool,
    free_list_lock: Mutex<()>,
}

impl Allocator {
    pub fn new(num_nodes: usize, dummy_region: &HeapRegion, min_tlab_bytes: usize) -> Self {
        let num_nodes = num_nodes.max(1);
        Self {
            mutator_alloc_regions: (0..num_nodes)
                .map(|node| AllocRegion::mutator(node as u32, dummy_region, min_tlab_bytes))
                .collect(),
            survivor_gc_alloc_regions: (0..num_nodes)
                .map(|node| AllocRegion::survivor(node as u32, dummy_region))
                .collect(),
            old_gc_alloc_region: AllocRegion::old(dummy_region),
            retained_old_gc_alloc_region: AtomicPtr::new(std::ptr::null_mut()),
            survivor_is_full: AtomicBool::new(false),
            old_is_full: AtomicBool::new(false),
            free_list_lock: Mutex::new(()),
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.mutator_alloc_regions.len()
    }

    fn node(&self, node_index: u32) -> usize {
        if node_index == UNKNOWN_NODE || node_index as usize >= self.num_nodes() {
            0
        } else {
            node_index as usize
        }
    }

    pub fn mutator_alloc_region(&self, node_index: u32) -> &AllocRegion {
        &self.mutator_alloc_regions[self.node(node_index)]
    }

    pub fn survivor_gc_alloc_region(&self, node_index: u32) -> &AllocRegion {
        &self.survivor_gc_alloc_regions[self.node(node_index)]
    }

    pub fn old_gc_alloc_region(&self) -> &AllocRegion {
        &self.old_gc_alloc_region
    }

    pub fn survivor_is_full(&self) -> bool {
        self.survivor_is_full.load(Ordering::Acquire)
    }
    pub fn old_is_full(&self) -> bool {
        self.old_is_full.load(Ordering::Acquire)
    }
    fn set_survivor_full(&self) {
        self.survivor_is_full.store(true, Ordering::Release);
    }
    fn set_old_full(&self) {
        self.old_is_full.store(true, Ordering::Release);
    }

    pub fn init_mutator_alloc_regions(&self) {
        for region in self.mutator_alloc_regions.iter() {
            debug_assert!(region.get().is_none(), "pre-condition");
            region.init();
        }
    }

    pub fn release_mutator_alloc_regions(&self, source: &dyn RegionSource) {
        for region in self.mutator_alloc_regions.iter() {
            region.release(source);
            debug_assert!(region.get().is_none(), "post-condition");
        }
    }

    /// Bytes allocated in mutator regions not yet accounted by the heap.
    pub fn used_in_alloc_regions(&self) -> usize {
        self.mutator_alloc_regions
            .iter()
            .map(AllocRegion::used_in_alloc_regions)
            .sum()
    }

    pub fn is_retained_old_region(&self, region: &HeapRegion) -> bool {
        self.retained_old_gc_alloc_region.load(Ordering::Acquire) as *const _
            == region as *const _
    }

    /// Forget the retained old region if it is `region`, which is about to be freed.
    pub fn forget_retained_old_region(&self, region: &HeapRegion) {
        let _ = self.retained_old_gc_alloc_region.compare_exchange(
            region as *const HeapRegion as *mut HeapRegion,
            std::ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn reuse_retained_old_region(&self, source: &dyn RegionSource) {
        let retained = self
            .retained_old_gc_alloc_region
            .swap(std::ptr::null_mut(), Ordering::AcqRel);
        if retained.is_null() {
            return;
        }
        let retained = unsafe { &*retained };
        if !retained.is_old() {
            return;
        }
        let reclaimed_words = retained.undo_dummy_fill();
        // full, or emptied and reused since the last pause
        if retained.top() == retained.end() || retained.is_empty() {
            return;
        }
        source.reuse_alloc_region(retained, reclaimed_words);
        self.old_gc_alloc_region.set(retained);
    }

    /// Prepare the GC cursors for an evacuation pause.
    pub fn init_gc_alloc_regions(&self, source: &dyn RegionSource) {
        self.survivor_is_full.store(false, Ordering::Release);
        self.old_is_full.store(false, Ordering::Release);
        for region in self.survivor_gc_alloc_regions.iter() {
            region.init();
        }
        self.old_gc_alloc_region.init();
        self.reuse_retained_old_region(source);
    }

    /// Retire the GC cursors at the end of a pause. The old region is kept for the next one.
    pub fn release_gc_alloc_regions(&self, source: &dyn RegionSource) {
        for region in self.survivor_gc_alloc_regions.iter() {
            region.release(source);
        }
        let old = self
            .old_gc_alloc_region
            .release(source)
            .map_or(std::ptr::null_mut(), |r| r as *const HeapRegion as *mut HeapRegion);
        self.retained_old_gc_alloc_region
            .store(old, Ordering::Release);
    }

    /// Bytes plugged at region ends by the GC cursors of `dest` since the last call.
    pub fn take_region_end_waste(&self, dest: Destination) -> usize {
        match dest {
            Destination::Young => self
                .survivor_gc_alloc_regions
                .iter()
                .map(AllocRegion::take_wasted_bytes)
                .sum(),
            Destination::Old => self.old_gc_alloc_region.take_wasted_bytes(),
        }
    }

    /// Drop every GC cursor region after a failed pause. The cursors must already be empty.
    pub fn abandon_gc_alloc_regions(&self) {
        for region in self.survivor_gc_alloc_regions.iter() {
            debug_assert!(region.get().is_none(), "pre-condition");
        }
        debug_assert!(self.old_gc_alloc_region.get().is_none(), "pre-condition");
        self.retained_old_gc_alloc_region
            .store(std::ptr::null_mut(), Ordering::Release);
    }

    /// Largest TLAB the current mutator region can serve without a refill, clamped to
    /// `[min_tlab_bytes, max_tlab_bytes]`.
    pub fn unsafe_max_tlab_alloc(&self, node_index: u32, min_tlab_bytes: usize, max_tlab_bytes: usize) -> usize {
        match self.mutator_alloc_region(node_index).get() {
            None => max_tlab_bytes,
            Some(region) => region.free().clamp(min_tlab_bytes.min(max_tlab_bytes), max_tlab_bytes),
        }
    }

    /// Lock-free mutator allocation, retained region first.
    #[inline]
    pub fn attempt_allocation(
        &self,
        min_word_size: usize,
        desired_word_size: usize,
        actual_word_size: &mut usize,
        node_index: u32,
    ) -> *mut u8 {
        let cursor = self.mutator_alloc_region(node_index);
        let result =
            cursor.attempt_retained_allocation(min_word_size, desired_word_size, actual_word_size);
        if !result.is_null() {
            return result;
        }
        cursor.attempt_allocation(min_word_size, desired_word_size, actual_word_size)
    }

    /// Requires the heap lock.
    pub fn attempt_allocation_locked(
        &self,
        word_size: usize,
        node_index: u32,
        source: &dyn RegionSource,
    ) -> *mut u8 {
        let cursor = self.mutator_alloc_region(node_index);
        let mut actual = 0;
        let result = cursor.attempt_allocation_locked(word_size, word_size, &mut actual, source);
        debug_assert!(
            !result.is_null() || cursor.get().is_none(),
            "must not have a mutator alloc region if there is no memory, but is {:?}",
            cursor.get()
        );
        result
    }

    /// Requires the heap lock.
    pub fn attempt_allocation_force(
        &self,
        word_size: usize,
        node_index: u32,
        source: &dyn RegionSource,
    ) -> *mut u8 {
        self.mutator_alloc_region(node_index)
            .attempt_allocation_force(word_size, source)
    }

    /// Allocation by GC workers during a pause.
    pub fn par_allocate_during_gc(
        &self,
        dest: Destination,
        min_word_size: usize,
        desired_word_size: usize,
        actual_word_size: &mut usize,
        node_index: u32,
        source: &dyn RegionSource,
    ) -> *mut u8 {
        match dest {
            Destination::Young => self.survivor_attempt_allocation(
                min_word_size,
                desired_word_size,
                actual_word_size,
                node_index,
                source,
            ),
            Destination::Old => self.old_attempt_allocation(
                min_word_size,
                desired_word_size,
                actual_word_size,
                source,
            ),
        }
    }

    fn survivor_attempt_allocation(
        &self,
        min_word_size: usize,
        desired_word_size: usize,
        actual_word_size: &mut usize,
        node_index: u32,
        source: &dyn RegionSource,
    ) -> *mut u8 {
        let cursor = self.survivor_gc_alloc_region(node_index);
        let mut result =
            cursor.attempt_allocation(min_word_size, desired_word_size, actual_word_size);
        if result.is_null() && !self.survivor_is_full() {
            let _lock = self.free_list_lock.lock();
            // the space may have run out while we were queueing for the lock
            if !self.survivor_is_full() {
                result = cursor.attempt_allocation_locked(
                    min_word_size,
                    desired_word_size,
                    actual_word_size,
                    source,
                );
                if result.is_null() {
                    self.set_survivor_full();
                }
            }
        }
        result
    }

    fn old_attempt_allocation(
        &self,
        min_word_size: usize,
        desired_word_size: usize,
        actual_word_size: &mut usize,
        source: &dyn RegionSource,
    ) -> *mut u8 {
        let cursor = &self.old_gc_alloc_region;
        let mut result =
            cursor.attempt_allocation(min_word_size, desired_word_size, actual_word_size);
        if result.is_null() && !self.old_is_full() {
            let _lock = self.free_list_lock.lock();
            if !self.old_is_full() {
                result = cursor.attempt_allocation_locked(
                    min_word_size,
                    desired_word_size,
                    actual_word_size,
                    source,
                );
                if result.is_null() {
                    self.set_old_full();
                }
            }
        }
        result
    }
}
