use std::sync::{
    atomic::{AtomicPtr, Ordering},
    Arc,
};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    block_offset_table::BlockOffsetTable,
    committed_map::HeapRegionCommittedMap,
    free_region_list::FreeRegionList,
    mmap::VirtualSpace,
    numa::HeapNuma,
    region::{HeapRegion, RegionOptions, RegionType, UNKNOWN_NODE},
    utils::formatted_size,
    Config,
};

/// One slot per reserved region. A region object is created the first time its memory is
/// committed and lives until the table is dropped, whatever its commit state later becomes.
pub struct HeapRegionTable {
    regions: Box<[AtomicPtr<HeapRegion>]>,
    heap_bottom: *mut u8,
    region_size_bytes_shift: usize,
    bot: Arc<BlockOffsetTable>,
}

unsafe impl Send for HeapRegionTable {}
unsafe impl Sync for HeapRegionTable {}

impl HeapRegionTable {
    pub fn new(
        heap_bottom: *mut u8,
        region_count: usize,
        region_size_bytes_shift: usize,
        bot: Arc<BlockOffsetTable>,
    ) -> Self {
        Self {
            regions: (0..region_count)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            heap_bottom,
            region_size_bytes_shift,
            bot,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_testing(region_count: usize) -> Self {
        let region_size = RegionOptions::MIN_REGION_SIZE;
        let space: &'static VirtualSpace = Box::leak(Box::new(VirtualSpace::reserve(
            region_count * region_size,
            region_size,
        )));
        let bot = Arc::new(BlockOffsetTable::new(
            space.start(),
            region_count * region_size,
        ));
        Self::new(
            space.start(),
            region_count,
            region_size.trailing_zeros() as usize,
            bot,
        )
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn region_size_bytes(&self) -> usize {
        1 << self.region_size_bytes_shift
    }

    pub fn heap_bottom(&self) -> *mut u8 {
        self.heap_bottom
    }

    pub fn heap_end(&self) -> *mut u8 {
        self.bottom_for(self.len() as u32)
    }

    pub fn bot(&self) -> &Arc<BlockOffsetTable> {
        &self.bot
    }

    #[inline]
    pub fn bottom_for(&self, index: u32) -> *mut u8 {
        (self.heap_bottom as usize + ((index as usize) << self.region_size_bytes_shift)) as _
    }

    pub fn is_in_reserved(&self, addr: *const u8) -> bool {
        addr >= self.heap_bottom as *const u8 && addr < self.heap_end() as *const u8
    }

    #[inline]
    pub fn addr_to_index(&self, addr: *const u8) -> u32 {
        debug_assert!(self.is_in_reserved(addr), "{:p} is not in the heap", addr);
        ((addr as usize - self.heap_bottom as usize) >> self.region_size_bytes_shift) as u32
    }

    #[inline]
    pub fn get(&self, index: u32) -> Option<&HeapRegion> {
        let region = self.regions.get(index as usize)?.load(Ordering::Acquire);
        if region.is_null() {
            None
        } else {
            Some(unsafe { &*region })
        }
    }

    /// Region at `index`, which must have been committed at least once.
    #[inline]
    pub fn at(&self, index: u32) -> &HeapRegion {
        match self.get(index) {
            Some(region) => region,
            None => panic!("region {} was never committed", index),
        }
    }

    /// Only called with the uncommit lock held, so there is a single creator.
    pub(crate) fn get_or_create(&self, index: u32) -> &HeapRegion {
        if let Some(region) = self.get(index) {
            return region;
        }
        let region = Box::into_raw(Box::new(HeapRegion::new(
            index,
            self.bottom_for(index),
            self.region_size_bytes() >> crate::utils::LOG_HEAP_WORD_SIZE,
            self.bot.clone(),
        )));
        self.regions[index as usize].store(region, Ordering::Release);
        unsafe { &*region }
    }
}

impl Drop for HeapRegionTable {
    fn drop(&mut self) {
        for slot in self.regions.iter() {
            let region = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !region.is_null() {
                unsafe {
                    drop(Box::from_raw(region));
                }
            }
        }
    }
}

pub struct ManagerState {
    pub(crate) free_list: FreeRegionList,
    pub(crate) committed: HeapRegionCommittedMap,
}

/// Owns the reserved range and decides which regions are committed, active and free.
///
/// Lock order: the uncommit lock is taken before the state lock. The state lock is never
/// held while memory is committed or uncommitted.
pub struct HeapRegionManager {
    opts: RegionOptions,
    space: VirtualSpace,
    table: Arc<HeapRegionTable>,
    numa: HeapNuma,
    state: Mutex<ManagerState>,
    uncommit_lock: Mutex<()>,
    free_list_id: u32,
    numa_search_depth: usize,
    always_pretouch: bool,
    verbose: bool,
}

impl HeapRegionManager {
    pub fn new(opts: RegionOptions, config: &Config) -> Self {
        let space = VirtualSpace::reserve(opts.max_heap_size, opts.region_size_bytes);
        let bot = Arc::new(BlockOffsetTable::new(space.start(), opts.max_heap_size));
        let table = Arc::new(HeapRegionTable::new(
            space.start(),
            opts.region_count,
            opts.region_size_bytes_shift,
            bot,
        ));
        let numa = HeapNuma::new(config.numa_nodes, opts.region_size_bytes, opts.page_size);
        let free_list = FreeRegionList::new("Free list", table.clone(), numa.num_active_nodes());
        logln_if!(
            config.verbose,
            "[gc] reserved {} at {:p} for {} regions of {}",
            formatted_size(opts.max_heap_size),
            space.start(),
            opts.region_count,
            formatted_size(opts.region_size_bytes)
        );
        Self {
            free_list_id: free_list.id(),
            state: Mutex::new(ManagerState {
                free_list,
                committed: HeapRegionCommittedMap::new(opts.region_count),
            }),
            uncommit_lock: Mutex::new(()),
            numa_search_depth: config.numa_search_depth,
            always_pretouch: config.always_pretouch,
            verbose: config.verbose,
            opts,
            space,
            table,
            numa,
        }
    }

    pub fn opts(&self) -> &RegionOptions {
        &self.opts
    }
    pub fn table(&self) -> &Arc<HeapRegionTable> {
        &self.table
    }
    pub fn numa(&self) -> &HeapNuma {
        &self.numa
    }
    pub fn heap_bottom(&self) -> *mut u8 {
        self.space.start()
    }
    pub fn heap_end(&self) -> *mut u8 {
        self.space.end()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock()
    }

    /// Number of reserved regions.
    pub fn max_length(&self) -> usize {
        self.opts.region_count
    }
    /// Number of active regions.
    pub fn length(&self) -> usize {
        self.state.lock().committed.num_active()
    }
    /// Regions that can still be made active.
    pub fn available(&self) -> usize {
        self.max_length() - self.length()
    }
    pub fn num_free_regions(&self) -> usize {
        self.state.lock().free_list.length()
    }
    pub fn num_free_regions_in_node(&self, node: u32) -> usize {
        self.state.lock().free_list.length_in_node(node)
    }
    pub fn num_inactive_regions(&self) -> usize {
        self.state.lock().committed.num_inactive()
    }
    pub fn has_inactive_regions(&self) -> bool {
        self.num_inactive_regions() > 0
    }

    pub fn is_available(&self, index: u32) -> bool {
        self.state.lock().committed.active(index as usize)
    }

    /// Active region at `index`.
    pub fn region_at(&self, index: u32) -> Option<&HeapRegion> {
        if self.is_available(index) {
            self.table.get(index)
        } else {
            None
        }
    }

    pub fn addr_to_region(&self, addr: *const u8) -> Option<&HeapRegion> {
        if !self.table.is_in_reserved(addr) {
            return None;
        }
        self.region_at(self.table.addr_to_index(addr))
    }

    /// Calls `f` for every active region in index order, without holding any lock.
    pub fn iterate(&self, mut f: impl FnMut(&HeapRegion)) {
        let active: Vec<u32> = {
            let state = self.state.lock();
            (0..self.max_length())
                .filter(|&i| state.committed.active(i))
                .map(|i| i as u32)
                .collect()
        };
        for index in active {
            f(self.table.at(index));
        }
    }

    pub fn new_free_list(&self, name: &'static str) -> FreeRegionList {
        FreeRegionList::new(name, self.table.clone(), self.numa.num_active_nodes())
    }

    fn is_free_in_list(&self, state: &ManagerState, index: usize) -> bool {
        state.committed.active(index)
            && self
                .table
                .get(index as u32)
                .map_or(false, |r| r.containing_set() == self.free_list_id)
    }

    /// Commit the memory of `num` regions starting at `start`, creating region objects on
    /// first use. Requires the uncommit lock.
    fn commit_regions(&self, start: usize, num: usize) -> bool {
        let bottom = self.table.bottom_for(start as u32);
        let size = num * self.opts.region_size_bytes;
        if !self.space.commit(bottom, size) {
            log::warn!(
                "failed to commit {} regions ({}) at {:p}",
                num,
                formatted_size(size),
                bottom
            );
            return false;
        }
        for i in start..start + num {
            let region = self.table.get_or_create(i as u32);
            self.numa
                .request_memory_on_node(region.bottom(), self.opts.region_size_bytes, i as u32);
        }
        if self.always_pretouch {
            self.space.pretouch(bottom, size, self.opts.page_size);
        }
        true
    }

    fn initialize_regions(&self, state: &mut ManagerState, start: usize, num: usize) {
        for i in start..start + num {
            let region = self.table.at(i as u32);
            region.initialize();
            region.set_node_index(self.numa.preferred_node_index_for_index(i as u32));
            state.free_list.add_ordered(i as u32);
        }
    }

    fn activate_regions(&self, state: &mut ManagerState, start: usize, num: usize) {
        state.committed.activate(start, start + num);
        self.initialize_regions(state, start, num);
    }

    fn reactivate_regions(&self, state: &mut ManagerState, start: usize, num: usize) {
        state.committed.reactivate(start, start + num);
        self.initialize_regions(state, start, num);
    }

    fn expand_inactive(&self, num_regions: usize) -> usize {
        let mut state = self.state.lock();
        let mut expanded = 0;
        let mut offset = 0;
        while expanded < num_regions {
            let (start, end) = state.committed.next_inactive_range(offset);
            if start == end {
                break;
            }
            let num = (end - start).min(num_regions - expanded);
            self.reactivate_regions(&mut state, start, num);
            expanded += num;
            offset = start + num;
        }
        expanded
    }

    fn expand_any(&self, num_regions: usize) -> usize {
        let _uncommit = self.uncommit_lock.lock();
        let mut expanded = 0;
        let mut offset = 0;
        while expanded < num_regions {
            let (start, end) = self.state.lock().committed.next_committable_range(offset);
            if start == end {
                break;
            }
            let num = (end - start).min(num_regions - expanded);
            if !self.commit_regions(start, num) {
                break;
            }
            self.activate_regions(&mut self.state.lock(), start, num);
            expanded += num;
            offset = start + num;
        }
        expanded
    }

    /// Make up to `num_regions` more regions active, reusing inactive ones first. Returns
    /// how many were made active.
    pub fn expand_by(&self, num_regions: usize) -> usize {
        let mut expanded = self.expand_inactive(num_regions);
        if expanded < num_regions {
            expanded += self.expand_any(num_regions - expanded);
        }
        logln_if!(
            self.verbose && expanded > 0,
            "[gc] expanded heap by {} regions ({} requested), {} active",
            expanded,
            num_regions,
            self.length()
        );
        self.verify_optional();
        expanded
    }

    /// Make the regions in `[start, start + num_regions)` active. Returns how many regions
    /// were actually activated by this call.
    pub fn expand_exact(&self, start: u32, num_regions: usize) -> usize {
        let _uncommit = self.uncommit_lock.lock();
        let start = start as usize;
        let end = (start + num_regions).min(self.max_length());
        let mut expanded = 0;
        for i in start..end {
            let mut state = self.state.lock();
            if state.committed.active(i) {
                continue;
            }
            if state.committed.inactive(i) {
                self.reactivate_regions(&mut state, i, 1);
            } else {
                drop(state);
                if !self.commit_regions(i, 1) {
                    break;
                }
                self.activate_regions(&mut self.state.lock(), i, 1);
            }
            expanded += 1;
        }
        self.verify_optional();
        expanded
    }

    /// Activate one region. Inactive regions are reused before fresh memory is committed,
    /// and within each kind a region whose preferred node is `node` wins.
    pub fn expand_on_preferred_node(&self, node: u32) -> bool {
        let candidate = {
            let state = self.state.lock();
            let on_node = |i: usize| {
                node == UNKNOWN_NODE || self.numa.preferred_node_index_for_index(i as u32) == node
            };
            let mut best: Option<(u8, usize)> = None;
            for i in 0..self.max_length() {
                if state.committed.active(i) {
                    continue;
                }
                let rank = match (state.committed.inactive(i), on_node(i)) {
                    (true, true) => 0,
                    (true, false) => 1,
                    (false, true) => 2,
                    (false, false) => 3,
                };
                if best.map_or(true, |(best_rank, _)| rank < best_rank) {
                    best = Some((rank, i));
                    if rank == 0 {
                        break;
                    }
                }
            }
            best.map(|(_, index)| index)
        };
        match candidate {
            Some(index) => self.expand_exact(index as u32, 1) == 1,
            None => false,
        }
    }

    /// Highest run `[start, start + num)` of free regions lying entirely below `start_idx`.
    fn find_empty_from_idx_reverse(
        &self,
        state: &ManagerState,
        start_idx: usize,
    ) -> Option<(usize, usize)> {
        let mut cur = start_idx;
        while cur > 0 && !self.is_free_in_list(state, cur - 1) {
            cur -= 1;
        }
        if cur == 0 {
            return None;
        }
        let end = cur;
        while cur > 0 && self.is_free_in_list(state, cur - 1) {
            cur -= 1;
        }
        Some((cur, end - cur))
    }

    /// Deactivate up to `num_regions` free regions, searching from the top of the heap.
    /// Their memory stays committed until [`HeapRegionManager::uncommit_inactive_regions`].
    pub fn shrink_by(&self, num_regions: usize) -> usize {
        let mut state = self.state.lock();
        let mut removed = 0;
        let mut cur = self.max_length();
        while removed < num_regions {
            let (idx_last_found, num_last_found) =
                match self.find_empty_from_idx_reverse(&state, cur) {
                    Some(found) => found,
                    None => break,
                };
            let to_remove = (num_regions - removed).min(num_last_found);
            let start = idx_last_found + num_last_found - to_remove;
            state.free_list.remove_starting_at(start as u32, to_remove);
            state.committed.deactivate(start, start + to_remove);
            removed += to_remove;
            cur = idx_last_found;
        }
        drop(state);
        logln_if!(
            self.verbose && removed > 0,
            "[gc] shrunk heap by {} regions ({} requested)",
            removed,
            num_regions
        );
        self.verify_optional();
        removed
    }

    /// Give the memory of at most `limit` inactive regions back to the OS. A region that is
    /// reactivated before its range is claimed here is simply skipped.
    pub fn uncommit_inactive_regions(&self, limit: usize) -> usize {
        let _uncommit = self.uncommit_lock.lock();
        let mut uncommitted = 0;
        let mut offset = 0;
        while uncommitted < limit {
            let (start, end) = {
                let mut state = self.state.lock();
                let (start, end) = state.committed.next_inactive_range(offset);
                if start == end {
                    break;
                }
                let end = end.min(start + limit - uncommitted);
                state.committed.uncommit(start, end);
                (start, end)
            };
            self.space.uncommit(
                self.table.bottom_for(start as u32),
                (end - start) * self.opts.region_size_bytes,
            );
            uncommitted += end - start;
            offset = end;
        }
        logln_if!(
            self.verbose && uncommitted > 0,
            "[gc] uncommitted {} regions ({})",
            uncommitted,
            formatted_size(uncommitted * self.opts.region_size_bytes)
        );
        uncommitted
    }

    /// Take a free region for a region of type `ty`. Young regions come from the tail of the
    /// free list, everything else from the head.
    pub fn allocate_free_region(&self, ty: RegionType, node: u32) -> Option<u32> {
        let from_head = !ty.is_young();
        let mut state = self.state.lock();
        if self.numa.is_enabled() && node != UNKNOWN_NODE {
            state
                .free_list
                .remove_region_with_node_index(from_head, node, self.numa_search_depth)
        } else {
            state.free_list.remove_region(from_head)
        }
    }

    fn find_contiguous_in_range(
        &self,
        start: usize,
        end: usize,
        num_regions: usize,
        pred: impl Fn(usize) -> bool,
    ) -> Option<usize> {
        let mut candidate = start;
        while candidate + num_regions <= end {
            match (candidate..candidate + num_regions).rev().find(|&i| !pred(i)) {
                None => return Some(candidate),
                Some(unusable) => candidate = unusable + 1,
            }
        }
        None
    }

    fn find_contiguous_in_free_list(&self, state: &ManagerState, num_regions: usize) -> Option<usize> {
        let mut offset = 0;
        loop {
            let (start, end) = state.committed.next_active_range(offset);
            if start == end {
                return None;
            }
            if let Some(found) = self.find_contiguous_in_range(start, end, num_regions, |i| {
                self.is_free_in_list(state, i)
            }) {
                return Some(found);
            }
            offset = end;
        }
    }

    fn find_contiguous_allow_expand(&self, state: &ManagerState, num_regions: usize) -> Option<usize> {
        self.find_contiguous_in_range(0, self.max_length(), num_regions, |i| {
            !state.committed.active(i) || self.is_free_in_list(state, i)
        })
    }

    /// Take `num_regions` contiguous free regions among the active ones. Returns the first.
    pub fn allocate_humongous(&self, num_regions: usize) -> Option<u32> {
        debug_assert!(num_regions > 0);
        let mut state = self.state.lock();
        if num_regions == 1 {
            return state.free_list.remove_region(false);
        }
        let first = self.find_contiguous_in_free_list(&state, num_regions)?;
        state.free_list.remove_starting_at(first as u32, num_regions);
        Some(first as u32)
    }

    /// Like [`HeapRegionManager::allocate_humongous`] but may commit regions to close gaps.
    ///
    /// The state lock is dropped while memory is committed, so another thread may take part
    /// of the run in the meantime. The search is then repeated.
    pub fn expand_and_allocate_humongous(&self, num_regions: usize) -> Option<u32> {
        debug_assert!(num_regions > 0);
        for _ in 0..=self.max_length() {
            let first = {
                let state = self.state.lock();
                self.find_contiguous_allow_expand(&state, num_regions)?
            };
            self.expand_exact(first as u32, num_regions);
            let mut state = self.state.lock();
            if (first..first + num_regions).all(|i| self.is_free_in_list(&state, i)) {
                state.free_list.remove_starting_at(first as u32, num_regions);
                return Some(first as u32);
            }
            log::trace!(
                target: "gc::alloc",
                "humongous run at {} taken concurrently, searching again",
                first
            );
        }
        None
    }

    /// Highest region that is free or not active, activating it if needed. The region stays
    /// in the free list. `expanded` tells whether it had to be activated.
    pub fn find_highest_free(&self, expanded: &mut bool) -> Option<u32> {
        for index in (0..self.max_length()).rev() {
            let (active, free) = {
                let state = self.state.lock();
                (state.committed.active(index), self.is_free_in_list(&state, index))
            };
            if !active {
                if self.expand_exact(index as u32, 1) != 1 {
                    return None;
                }
                *expanded = true;
                return Some(index as u32);
            }
            if free {
                *expanded = false;
                return Some(index as u32);
            }
        }
        None
    }

    /// Remove the free regions `[first, first + num_regions)` from the free list.
    pub fn allocate_free_regions_starting_at(&self, first: u32, num_regions: usize) -> bool {
        let mut state = self.state.lock();
        let first_idx = first as usize;
        if !(first_idx..first_idx + num_regions).all(|i| self.is_free_in_list(&state, i)) {
            return false;
        }
        state.free_list.remove_starting_at(first, num_regions);
        true
    }

    /// Put a cleared free region back.
    pub fn insert_into_free_list(&self, index: u32) {
        debug_assert!(self.is_available(index));
        self.state.lock().free_list.add_ordered(index);
    }

    pub fn insert_list_into_free_list(&self, list: &mut FreeRegionList) {
        self.state.lock().free_list.add_ordered_list(list);
    }

    fn verify_optional(&self) {
        if cfg!(debug_assertions) {
            self.verify();
        }
    }

    /// Check the free list against the commit map.
    pub fn verify(&self) {
        let state = self.state.lock();
        state.free_list.verify();
        state.committed.verify();
        for index in state.free_list.iter() {
            assert!(
                state.committed.active(index as usize),
                "free region {} is not active",
                index
            );
        }
        assert!(state.free_list.length() <= state.committed.num_active());
        assert!(
            state.committed.num_active() + state.committed.num_inactive() <= self.max_length()
        );
    }
}

impl std::fmt::Debug for HeapRegionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "HeapRegionManager(reserved: {}, active: {}, inactive: {}, free: {})",
            self.max_length(),
            state.committed.num_active(),
            state.committed.num_inactive(),
            state.free_list.length()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_regions: usize) -> HeapRegionManager {
        let mut config = Config::default();
        config.region_size = Some(RegionOptions::MIN_REGION_SIZE);
        config.max_heap_size = max_regions * RegionOptions::MIN_REGION_SIZE;
        config.initial_heap_size = 0;
        let opts = RegionOptions::setup_sizes(&config);
        HeapRegionManager::new(opts, &config)
    }

    #[test]
    fn expand_then_shrink_round_trips() {
        let hrm = manager(32);
        assert_eq!(hrm.expand_by(8), 8);
        let before = hrm.available() + hrm.length();
        assert_eq!(hrm.num_free_regions(), 8);

        assert_eq!(hrm.shrink_by(8), 8);
        assert_eq!(hrm.length(), 0);
        assert_eq!(hrm.num_free_regions(), 0);
        assert_eq!(hrm.num_inactive_regions(), 8);
        assert_eq!(hrm.available() + hrm.length(), before);

        // inactive regions are reused before anything new is committed
        assert_eq!(hrm.expand_by(4), 4);
        assert_eq!(hrm.num_inactive_regions(), 4);
        assert_eq!(hrm.uncommit_inactive_regions(usize::MAX), 4);
        assert!(!hrm.has_inactive_regions());
        hrm.verify();
    }

    #[test]
    fn shrink_skips_regions_in_use() {
        let hrm = manager(32);
        hrm.expand_by(6);
        // region 5 is taken from the tail
        let young = hrm.allocate_free_region(RegionType::Eden, UNKNOWN_NODE).unwrap();
        assert_eq!(young, 5);
        hrm.table().at(young).set_eden();
        assert_eq!(hrm.shrink_by(3), 3);
        assert!(hrm.is_available(5));
        assert!(!hrm.is_available(4) && !hrm.is_available(3) && !hrm.is_available(2));
        assert!(hrm.is_available(1));
    }

    #[test]
    fn humongous_runs_are_contiguous_and_free() {
        let hrm = manager(32);
        hrm.expand_by(10);
        let old = hrm.allocate_free_region(RegionType::Old, UNKNOWN_NODE).unwrap();
        assert_eq!(old, 0);
        hrm.table().at(old).set_old();
        let middle = {
            let mut state = hrm.lock_state();
            state.free_list.remove_starting_at(4, 1);
            4
        };
        hrm.table().at(middle).set_old();

        let first = hrm.allocate_humongous(3).unwrap();
        assert_eq!(first, 1);
        let second = hrm.allocate_humongous(5).unwrap();
        assert_eq!(second, 5);
        assert!(hrm.allocate_humongous(2).is_none());

        let expanded = hrm.expand_and_allocate_humongous(4).unwrap();
        assert_eq!(expanded, 10);
        assert_eq!(hrm.length(), 14);
        for i in 10..14 {
            assert!(!hrm.lock_state().free_list.contains(i));
        }
        hrm.verify();
    }

    #[test]
    fn humongous_beyond_committed_expands_exactly() {
        let hrm = manager(32);
        hrm.expand_by(2);
        assert!(hrm.allocate_humongous(6).is_none());
        let first = hrm.expand_and_allocate_humongous(6).unwrap();
        assert_eq!(first, 0);
        assert_eq!(hrm.length(), 6);
        assert_eq!(hrm.num_free_regions(), 0);
    }

    #[test]
    fn expand_exact_reactivates_inactive_regions() {
        let hrm = manager(32);
        assert_eq!(hrm.expand_by(8), 8);
        assert_eq!(hrm.shrink_by(4), 4);
        assert_eq!(hrm.num_inactive_regions(), 4);
        assert!(!hrm.is_available(4));

        // 2 and 3 are active already, 4..8 are inactive and 8 was never committed
        assert_eq!(hrm.expand_exact(2, 7), 5);
        assert_eq!(hrm.num_inactive_regions(), 0);
        assert_eq!(hrm.length(), 9);
        assert_eq!(hrm.num_free_regions(), 9);
        assert!((0..9).all(|i| hrm.is_available(i)));
        // nothing is left for the uncommitter
        assert_eq!(hrm.uncommit_inactive_regions(usize::MAX), 0);
        assert_eq!(hrm.expand_exact(0, 9), 0);
        hrm.verify();
    }

    #[test]
    fn preferred_node_expansion_reuses_inactive_regions() {
        let hrm = manager(32);
        assert_eq!(hrm.expand_by(2), 2);
        assert_eq!(hrm.expand_exact(10, 2), 2);
        assert_eq!(hrm.shrink_by(1), 1);
        assert!(!hrm.is_available(11));
        assert_eq!(hrm.num_inactive_regions(), 1);

        assert!(hrm.expand_on_preferred_node(UNKNOWN_NODE));
        assert!(hrm.is_available(11));
        assert!(!hrm.is_available(2));
        assert_eq!(hrm.num_inactive_regions(), 0);

        // with nothing inactive the lowest uncommitted region is committed
        assert!(hrm.expand_on_preferred_node(0));
        assert!(hrm.is_available(2));
        assert_eq!(hrm.length(), 5);
        hrm.verify();
    }

    #[test]
    fn racing_humongous_expansions_all_succeed() {
        let hrm = manager(32);
        let firsts = crossbeam_utils::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let hrm = &hrm;
                    scope.spawn(move |_| hrm.expand_and_allocate_humongous(4))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        })
        .unwrap();
        let mut firsts: Vec<u32> = firsts.into_iter().map(Option::unwrap).collect();
        firsts.sort_unstable();
        assert_eq!(firsts, vec![0, 4, 8, 12, 16, 20, 24, 28]);
        assert_eq!(hrm.length(), 32);
        assert_eq!(hrm.num_free_regions(), 0);
        hrm.verify();
    }

    #[test]
    fn highest_free_region_is_activated_on_demand() {
        let hrm = manager(16);
        hrm.expand_by(2);
        let mut expanded = false;
        let top = hrm.find_highest_free(&mut expanded).unwrap();
        assert_eq!(top, 15);
        assert!(expanded);
        assert!(hrm.allocate_free_regions_starting_at(top, 1));
        assert!(!hrm.allocate_free_regions_starting_at(top, 1));
        let next = hrm.find_highest_free(&mut expanded).unwrap();
        assert_eq!(next, 14);
    }
}
