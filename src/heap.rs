use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    alloc_region::{AllocPurpose, RegionSource},
    allocator::Allocator,
    archive_allocator::ArchiveAllocator,
    header::{fill_with_objects, HeapObjectHeader, MIN_FILL_WORDS, MIN_OBJECT_WORDS},
    plab::{PlabAllocator, PlabStats},
    region::{HeapRegion, RegionOptions, RegionType},
    region_manager::HeapRegionManager,
    region_set::HeapRegionSet,
    statistics::HeapStatistics,
    uncommit::UncommitService,
    utils::{
        align_down, align_up, bytes_to_words, formatted_size, pointer_delta, word_offset,
        words_to_bytes,
    },
    Config, Destination,
};

struct HeapSets {
    eden: HeapRegionSet,
    survivor: HeapRegionSet,
    old: HeapRegionSet,
    humongous: HeapRegionSet,
    archive: HeapRegionSet,
}

impl HeapSets {
    fn for_type(&mut self, ty: RegionType) -> Option<&mut HeapRegionSet> {
        match ty {
            RegionType::Eden => Some(&mut self.eden),
            RegionType::Survivor => Some(&mut self.survivor),
            RegionType::Old => Some(&mut self.old),
            RegionType::StartsHumongous | RegionType::ContinuesHumongous => {
                Some(&mut self.humongous)
            }
            RegionType::OpenArchive | RegionType::ClosedArchive => Some(&mut self.archive),
            RegionType::Free => None,
        }
    }
}

/// The region based heap.
///
/// Mutators allocate with [`Heap::attempt_allocation`] and fall back to
/// [`Heap::attempt_allocation_slow`], which serializes on the heap lock. A collector brackets
/// each evacuation pause with [`Heap::init_gc_alloc_regions`] and
/// [`Heap::release_gc_alloc_regions`], copies through the [`PlabAllocator`] of each worker
/// and hands evacuated regions back with [`Heap::free_regions`].
pub struct Heap {
    config: Config,
    opts: RegionOptions,
    hrm: Arc<HeapRegionManager>,
    allocator: Allocator,
    /// Zero sized region empty cursors point at.
    dummy_region: Box<HeapRegion>,
    heap_lock: Mutex<()>,
    sets: Mutex<HeapSets>,
    /// Bytes used by retired regions. Bytes of current mutator regions are added by
    /// [`Heap::used`].
    summary_bytes_used: AtomicUsize,
    bytes_used_during_gc: AtomicUsize,
    survivor_regions_this_pause: AtomicUsize,
    expand_heap_after_alloc_failure: AtomicBool,
    young_plab_stats: PlabStats,
    old_plab_stats: PlabStats,
    uncommit: UncommitService,
}

impl Heap {
    pub fn new(config: Config) -> Box<Self> {
        let opts = RegionOptions::setup_sizes(&config);
        logln_if!(config.verbose, "[gc] {:?}", opts);
        let hrm = Arc::new(HeapRegionManager::new(opts, &config));
        let dummy_region = Box::new(HeapRegion::dummy(hrm.table().bot().clone()));
        let allocator = Allocator::new(
            hrm.numa().num_active_nodes(),
            &dummy_region,
            words_to_bytes(opts.min_tlab_size_words),
        );
        let plab_min = opts.min_tlab_size_words.max(MIN_OBJECT_WORDS);
        let plab_max = opts.max_tlab_size_words.max(plab_min);
        let workers = config.gc_workers.max(1);
        let young_plab_stats = PlabStats::new(
            "Young",
            config.young_plab_size * workers,
            plab_min,
            plab_max,
            &config,
        );
        let old_plab_stats = PlabStats::new(
            "Old",
            config.old_plab_size * workers,
            plab_min,
            plab_max,
            &config,
        );
        let uncommit = UncommitService::new(hrm.clone(), &config);

        let heap = Box::new(Self {
            opts,
            allocator,
            dummy_region,
            heap_lock: Mutex::new(()),
            sets: Mutex::new(HeapSets {
                eden: HeapRegionSet::eden(),
                survivor: HeapRegionSet::survivor(),
                old: HeapRegionSet::old(),
                humongous: HeapRegionSet::humongous(),
                archive: HeapRegionSet::archive(),
            }),
            summary_bytes_used: AtomicUsize::new(0),
            bytes_used_during_gc: AtomicUsize::new(0),
            survivor_regions_this_pause: AtomicUsize::new(0),
            expand_heap_after_alloc_failure: AtomicBool::new(true),
            young_plab_stats,
            old_plab_stats,
            uncommit,
            hrm,
            config,
        });

        let expanded = heap.hrm.expand_by(opts.initial_region_count);
        if expanded < opts.initial_region_count {
            log::warn!(
                "committed only {} of {} initial regions",
                expanded,
                opts.initial_region_count
            );
        }
        heap.allocator.init_mutator_alloc_regions();
        heap
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn opts(&self) -> &RegionOptions {
        &self.opts
    }

    pub fn region_manager(&self) -> &HeapRegionManager {
        &self.hrm
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn dummy_region(&self) -> &HeapRegion {
        &self.dummy_region
    }

    fn current_node(&self) -> u32 {
        self.hrm.numa().index_of_current_thread()
    }

    pub fn is_humongous(&self, word_size: usize) -> bool {
        self.opts.is_humongous(word_size)
    }

    /// Lock-free allocation of between `min_word_size` and `desired_word_size` words in the
    /// current mutator region. Null if it does not have `min_word_size` words left.
    #[inline]
    pub fn attempt_allocation(
        &self,
        min_word_size: usize,
        desired_word_size: usize,
        actual_word_size: &mut usize,
    ) -> *mut u8 {
        debug_assert!(!self.is_humongous(desired_word_size));
        self.allocator.attempt_allocation(
            min_word_size,
            desired_word_size,
            actual_word_size,
            self.current_node(),
        )
    }

    /// Allocate `word_size` words after the fast path failed. Takes the heap lock, retries,
    /// installs a new mutator region, expands the heap by one region and finally forces a
    /// region past the eden limit. Null only when no region can be had at all.
    pub fn attempt_allocation_slow(&self, word_size: usize) -> *mut u8 {
        debug_assert!(
            !self.is_humongous(word_size),
            "attempt_allocation_slow() should not be called for humongous objects"
        );
        let node = self.current_node();
        let _lock = self.heap_lock.lock();

        let result = self.allocator.attempt_allocation_locked(word_size, node, self);
        if !result.is_null() {
            return result;
        }
        if self.should_allocate_mutator_region() && self.hrm.expand_on_preferred_node(node) {
            logln_if!(
                self.config.verbose,
                "[gc] expanded heap by one region for a mutator allocation of {}",
                formatted_size(words_to_bytes(word_size))
            );
            let result = self.allocator.attempt_allocation_locked(word_size, node, self);
            if !result.is_null() {
                return result;
            }
        }
        let result = self.allocator.attempt_allocation_force(word_size, node, self);
        if result.is_null() {
            log::debug!(
                target: "gc::alloc",
                "mutator allocation of {} words failed",
                word_size
            );
        }
        result
    }

    /// A new TLAB of between `min_size` and `requested_size` words.
    pub fn allocate_new_tlab(
        &self,
        min_size: usize,
        requested_size: usize,
        actual_size: &mut usize,
    ) -> *mut u8 {
        debug_assert!(
            requested_size <= self.opts.max_tlab_size_words,
            "TLAB of {} words exceeds the maximum of {}",
            requested_size,
            self.opts.max_tlab_size_words
        );
        let result = self.attempt_allocation(min_size, requested_size, actual_size);
        if !result.is_null() {
            return result;
        }
        let result = self.attempt_allocation_slow(requested_size);
        *actual_size = if result.is_null() { 0 } else { requested_size };
        result
    }

    /// Allocate a single block of `word_size` words, humongous or not.
    pub fn mem_allocate(&self, word_size: usize) -> *mut u8 {
        if self.is_humongous(word_size) {
            return self.attempt_allocation_humongous(word_size);
        }
        let mut actual = 0;
        let result = self.attempt_allocation(word_size, word_size, &mut actual);
        if !result.is_null() {
            return result;
        }
        self.attempt_allocation_slow(word_size)
    }

    /// Like [`Heap::mem_allocate`] but out of memory is fatal.
    pub fn mem_allocate_or_fail(&self, word_size: usize) -> *mut u8 {
        let result = self.mem_allocate(word_size);
        if result.is_null() {
            panic!(
                "out of memory: failed to allocate {} ({} used, {} committed, {} reserved)",
                formatted_size(words_to_bytes(word_size)),
                formatted_size(self.used()),
                formatted_size(self.capacity()),
                formatted_size(self.opts.max_heap_size)
            );
        }
        result
    }

    /// Allocate a humongous object in a run of whole regions, committing more of the heap
    /// if the active part has no large enough run.
    pub fn attempt_allocation_humongous(&self, word_size: usize) -> *mut u8 {
        debug_assert!(self.is_humongous(word_size));
        let _lock = self.heap_lock.lock();
        self.humongous_obj_allocate(word_size)
    }

    fn humongous_obj_allocate(&self, word_size: usize) -> *mut u8 {
        let obj_regions = self.opts.humongous_size_in_regions(word_size);
        let first = match self.hrm.allocate_humongous(obj_regions) {
            Some(first) => first,
            None => match self.hrm.expand_and_allocate_humongous(obj_regions) {
                Some(first) => {
                    logln_if!(
                        self.config.verbose,
                        "[gc] heap expansion for humongous allocation of {}",
                        formatted_size(words_to_bytes(word_size))
                    );
                    first
                }
                None => {
                    log::debug!(
                        target: "gc::alloc",
                        "humongous allocation of {} words ({} regions) failed",
                        word_size,
                        obj_regions
                    );
                    return std::ptr::null_mut();
                }
            },
        };
        self.humongous_obj_allocate_initialize_regions(first, obj_regions, word_size)
    }

    fn humongous_obj_allocate_initialize_regions(
        &self,
        first: u32,
        num_regions: usize,
        word_size: usize,
    ) -> *mut u8 {
        let table = self.hrm.table();
        let last = first + num_regions as u32 - 1;
        let first_hr = table.at(first);
        let new_obj = first_hr.bottom();
        let obj_top = word_offset(new_obj, word_size);

        let word_size_sum = num_regions * self.opts.region_size_words;
        debug_assert!(word_size <= word_size_sum);
        let mut words_fillable = word_size_sum - word_size;
        let mut words_not_fillable = 0;
        if words_fillable >= MIN_FILL_WORDS {
            unsafe {
                fill_with_objects(obj_top, words_fillable);
            }
        } else {
            words_not_fillable = words_fillable;
            words_fillable = 0;
        }
        unsafe {
            HeapObjectHeader::install(new_obj, word_size, 0);
        }

        // block offset entries for the whole run are written here
        first_hr.set_starts_humongous(obj_top, words_fillable);
        for index in first + 1..=last {
            table.at(index).set_continues_humongous(first_hr);
        }

        // no region of the run may look parsable before its header and BOT entries are
        std::sync::atomic::fence(Ordering::Release);
        for index in first..last {
            let region = table.at(index);
            region.set_top(region.end());
        }
        let last_hr = table.at(last);
        last_hr.set_top((last_hr.end() as usize - words_to_bytes(words_not_fillable)) as *mut u8);

        let used = words_to_bytes(pointer_delta(last_hr.top(), first_hr.bottom()));
        self.increase_used(used);
        let mut sets = self.sets.lock();
        for index in first..=last {
            sets.humongous.add(table.at(index));
        }
        log::trace!(
            target: "gc::alloc",
            "humongous object of {} words at {:p} in regions [{}, {}]",
            word_size,
            new_obj,
            first,
            last
        );
        new_obj
    }

    fn should_allocate_mutator_region(&self) -> bool {
        match self.config.max_eden_regions {
            Some(max) => self.sets.lock().eden.length() < max,
            None => true,
        }
    }

    fn new_region(
        &self,
        word_size: usize,
        ty: RegionType,
        do_expand: bool,
        node_index: u32,
    ) -> Option<&HeapRegion> {
        debug_assert!(word_size <= self.opts.region_size_words);
        let mut index = self.hrm.allocate_free_region(ty, node_index);
        if index.is_none()
            && do_expand
            && self.expand_heap_after_alloc_failure.load(Ordering::Relaxed)
        {
            log::debug!(
                target: "gc::ergo",
                "attempt heap expansion (region allocation request failed), allocation request: {}",
                formatted_size(words_to_bytes(word_size))
            );
            if self.hrm.expand_on_preferred_node(node_index) {
                index = self.hrm.allocate_free_region(ty, node_index);
            } else {
                self.expand_heap_after_alloc_failure
                    .store(false, Ordering::Relaxed);
            }
        }
        index.map(|index| self.hrm.table().at(index))
    }

    fn new_mutator_alloc_region(
        &self,
        word_size: usize,
        force: bool,
        node_index: u32,
    ) -> Option<&HeapRegion> {
        if !force && !self.should_allocate_mutator_region() {
            return None;
        }
        // only a forced request may grow the heap past the eden limit
        let region = self.new_region(word_size, RegionType::Eden, force, node_index)?;
        region.set_eden();
        self.sets.lock().eden.add(region);
        Some(region)
    }

    fn retire_mutator_alloc_region(&self, region: &HeapRegion, allocated_bytes: usize) {
        debug_assert!(region.is_eden());
        self.increase_used(allocated_bytes);
    }

    fn new_gc_alloc_region(
        &self,
        word_size: usize,
        dest: Destination,
        node_index: u32,
    ) -> Option<&HeapRegion> {
        if dest == Destination::Young
            && self.survivor_regions_this_pause.load(Ordering::Relaxed)
                >= self.config.max_survivor_regions
        {
            return None;
        }
        let ty = match dest {
            Destination::Young => RegionType::Survivor,
            Destination::Old => RegionType::Old,
        };
        let region = self.new_region(word_size, ty, true, node_index)?;
        match dest {
            Destination::Young => {
                region.set_survivor();
                self.sets.lock().survivor.add(region);
                self.survivor_regions_this_pause
                    .fetch_add(1, Ordering::Relaxed);
            }
            Destination::Old => region.set_old(),
        }
        Some(region)
    }

    fn retire_gc_alloc_region(&self, region: &HeapRegion, allocated_bytes: usize, dest: Destination) {
        self.bytes_used_during_gc
            .fetch_add(allocated_bytes, Ordering::Relaxed);
        if dest == Destination::Old {
            debug_assert!(region.is_old());
            let mut sets = self.sets.lock();
            if !sets.old.contains(region) {
                sets.old.add(region);
            }
        }
    }

    /// Allocation by a GC worker during a pause, outside of any PLAB.
    pub fn par_allocate_during_gc(
        &self,
        dest: Destination,
        min_word_size: usize,
        desired_word_size: usize,
        actual_word_size: &mut usize,
        node_index: u32,
    ) -> *mut u8 {
        self.allocator.par_allocate_during_gc(
            dest,
            min_word_size,
            desired_word_size,
            actual_word_size,
            node_index,
            self,
        )
    }

    /// Commit at least `expand_bytes` more of the heap, in whole regions.
    pub fn expand(&self, expand_bytes: usize) -> bool {
        let aligned_expand_bytes = align_up(
            align_up(expand_bytes, self.opts.page_size),
            self.opts.region_size_bytes,
        );
        log::debug!(
            target: "gc::ergo",
            "expand the heap, requested expansion amount: {}, expansion amount: {}",
            formatted_size(expand_bytes),
            formatted_size(aligned_expand_bytes)
        );
        if self.hrm.available() == 0 {
            log::debug!(target: "gc::ergo", "did not expand the heap (heap already fully expanded)");
            return false;
        }
        let regions_to_expand = (aligned_expand_bytes / self.opts.region_size_bytes).max(1);
        let expanded_by = self.hrm.expand_by(regions_to_expand);
        self.expand_heap_after_alloc_failure
            .store(true, Ordering::Relaxed);
        expanded_by > 0
    }

    /// Deactivate free regions worth up to `shrink_bytes` from the top of the heap and hand
    /// them to the uncommit service. Returns the bytes deactivated.
    pub fn shrink(&self, shrink_bytes: usize) -> usize {
        let aligned_shrink_bytes = align_down(shrink_bytes, self.opts.region_size_bytes);
        let num_regions_to_remove = aligned_shrink_bytes / self.opts.region_size_bytes;
        let num_regions_removed = self.hrm.shrink_by(num_regions_to_remove);
        let shrunk_bytes = num_regions_removed * self.opts.region_size_bytes;
        log::debug!(
            target: "gc::ergo",
            "shrink the heap, requested shrinking amount: {}, aligned shrinking amount: {}, actual amount shrunk: {}",
            formatted_size(shrink_bytes),
            formatted_size(aligned_shrink_bytes),
            formatted_size(shrunk_bytes)
        );
        if num_regions_removed > 0 {
            self.uncommit.request();
        } else {
            log::debug!(target: "gc::ergo", "did not shrink the heap (heap shrinking operation failed)");
        }
        shrunk_bytes
    }

    pub fn init_mutator_alloc_regions(&self) {
        let _lock = self.heap_lock.lock();
        self.allocator.init_mutator_alloc_regions();
    }

    /// Retire every mutator region. Must be called before a pause and followed by
    /// [`Heap::init_mutator_alloc_regions`] after it.
    pub fn release_mutator_alloc_regions(&self) {
        let _lock = self.heap_lock.lock();
        self.allocator.release_mutator_alloc_regions(self);
    }

    pub fn init_gc_alloc_regions(&self) {
        self.survivor_regions_this_pause
            .store(0, Ordering::Relaxed);
        self.bytes_used_during_gc.store(0, Ordering::Relaxed);
        self.expand_heap_after_alloc_failure
            .store(true, Ordering::Relaxed);
        self.allocator.init_gc_alloc_regions(self);
    }

    pub fn release_gc_alloc_regions(&self) {
        self.allocator.release_gc_alloc_regions(self);
        self.young_plab_stats.add_region_end_waste(
            bytes_to_words(self.allocator.take_region_end_waste(Destination::Young)),
        );
        self.old_plab_stats.add_region_end_waste(
            bytes_to_words(self.allocator.take_region_end_waste(Destination::Old)),
        );
        self.increase_used(self.bytes_used_during_gc.swap(0, Ordering::Relaxed));
    }

    pub fn abandon_gc_alloc_regions(&self) {
        self.allocator.abandon_gc_alloc_regions();
    }

    fn prepare_region_for_free(&self, region: &HeapRegion) {
        assert!(!region.is_free(), "region {} is already free", region.index());
        assert!(
            !region.is_archive(),
            "archive region {} cannot be freed",
            region.index()
        );
        self.allocator.forget_retained_old_region(region);
        {
            let mut sets = self.sets.lock();
            if let Some(set) = sets.for_type(region.region_type()) {
                if set.contains(region) {
                    set.remove(region);
                }
            }
        }
        self.decrease_used(region.used());
        region.hr_clear();
    }

    /// Return the region at `index` to the free list. It must not be the current region of
    /// any allocation cursor.
    pub fn free_region(&self, index: u32) {
        let region = self.hrm.table().at(index);
        self.prepare_region_for_free(region);
        self.hrm.insert_into_free_list(index);
    }

    /// Free many regions at once. They are collected in a local ordered list first, which
    /// is merged into the free list under a single lock acquisition.
    pub fn free_regions(&self, indices: &[u32]) {
        let mut local = self.hrm.new_free_list("Local Free List");
        for &index in indices {
            let region = self.hrm.table().at(index);
            self.prepare_region_for_free(region);
            local.add_ordered(index);
        }
        self.hrm.insert_list_into_free_list(&mut local);
    }

    pub fn plab_stats(&self, dest: Destination) -> &PlabStats {
        match dest {
            Destination::Young => &self.young_plab_stats,
            Destination::Old => &self.old_plab_stats,
        }
    }

    /// Per worker PLAB size for `dest`.
    pub fn desired_plab_size(&self, dest: Destination) -> usize {
        self.plab_stats(dest)
            .desired_plab_size(self.config.gc_workers)
            .min(self.opts.humongous_threshold_words)
    }

    /// PLABs for one GC worker. Dropping it flushes its statistics.
    pub fn new_plab_allocator(&self) -> PlabAllocator<'_> {
        PlabAllocator::new(
            &self.allocator,
            self,
            &self.young_plab_stats,
            &self.old_plab_stats,
            self.desired_plab_size(Destination::Young),
            self.desired_plab_size(Destination::Old),
            self.config.parallel_gc_buffer_waste_pct,
        )
    }

    /// Fold the PLAB statistics of the pause into the desired PLAB sizes. Call after every
    /// worker flushed its PLAB allocator.
    pub fn flush_plab_stats(&self) {
        self.young_plab_stats.adjust_desired_plab_size();
        self.old_plab_stats.adjust_desired_plab_size();
    }

    /// Take the highest free region of the reserved range, committing it if needed.
    pub fn alloc_highest_free_region(&self) -> Option<&HeapRegion> {
        let mut expanded = false;
        let index = self.hrm.find_highest_free(&mut expanded)?;
        if expanded {
            log::debug!(
                target: "gc::ergo",
                "attempt heap expansion (requested address range outside heap bounds), region size: {}",
                formatted_size(self.opts.region_size_bytes)
            );
        }
        if self.hrm.allocate_free_regions_starting_at(index, 1) {
            Some(self.hrm.table().at(index))
        } else {
            None
        }
    }

    pub fn archive_allocator(&self, open: bool) -> ArchiveAllocator<'_> {
        ArchiveAllocator::new(self, open)
    }

    pub(crate) fn archive_set_add(&self, region: &HeapRegion) {
        self.sets.lock().archive.add(region);
    }

    pub(crate) fn increase_used(&self, bytes: usize) {
        self.summary_bytes_used.fetch_add(bytes, Ordering::Relaxed);
    }

    fn decrease_used(&self, bytes: usize) {
        let _ = self
            .summary_bytes_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                debug_assert!(used >= bytes, "used {} smaller than freed {}", used, bytes);
                Some(used.saturating_sub(bytes))
            });
    }

    /// Bytes in use, including what was allocated in the current mutator regions.
    pub fn used(&self) -> usize {
        self.summary_bytes_used.load(Ordering::Relaxed) + self.allocator.used_in_alloc_regions()
    }

    /// Committed and active bytes.
    pub fn capacity(&self) -> usize {
        self.hrm.length() * self.opts.region_size_bytes
    }

    pub fn max_capacity(&self) -> usize {
        self.opts.max_heap_size
    }

    pub fn num_free_regions(&self) -> usize {
        self.hrm.num_free_regions()
    }

    pub fn num_committed_regions(&self) -> usize {
        self.hrm.length()
    }

    pub fn region_at(&self, index: u32) -> Option<&HeapRegion> {
        self.hrm.region_at(index)
    }

    pub fn is_in_reserved(&self, addr: *const u8) -> bool {
        self.hrm.table().is_in_reserved(addr)
    }

    pub fn heap_region_containing(&self, addr: *const u8) -> Option<&HeapRegion> {
        self.hrm.addr_to_region(addr)
    }

    /// Start of the block containing `addr`, or null if `addr` is not below the top of an
    /// active region.
    pub fn block_start(&self, addr: *const u8) -> *mut u8 {
        match self.heap_region_containing(addr) {
            Some(region) if addr < region.top() as *const u8 => region.block_start(addr),
            _ => std::ptr::null_mut(),
        }
    }

    /// Largest TLAB in bytes the calling thread could get without a refill.
    pub fn unsafe_max_tlab_alloc(&self) -> usize {
        self.allocator.unsafe_max_tlab_alloc(
            self.current_node(),
            words_to_bytes(self.opts.min_tlab_size_words),
            words_to_bytes(self.opts.max_tlab_size_words),
        )
    }

    pub fn statistics(&self) -> HeapStatistics {
        let sets = self.sets.lock();
        HeapStatistics {
            reserved: self.opts.max_heap_size,
            committed: self.capacity(),
            used: self.used(),
            region_size: self.opts.region_size_bytes,
            max_regions: self.hrm.max_length(),
            active_regions: self.hrm.length(),
            inactive_regions: self.hrm.num_inactive_regions(),
            free_regions: self.hrm.num_free_regions(),
            eden_regions: sets.eden.length(),
            survivor_regions: sets.survivor.length(),
            old_regions: sets.old.length(),
            humongous_regions: sets.humongous.length(),
            archive_regions: sets.archive.length(),
            young_plab_size: self.desired_plab_size(Destination::Young),
            old_plab_size: self.desired_plab_size(Destination::Old),
        }
    }

    /// Check the region manager and that every region is in the set matching its type.
    pub fn verify(&self) {
        self.hrm.verify();
        let mut counts = [0usize; 5];
        let mut sets = self.sets.lock();
        self.hrm.iterate(|region| {
            let ty = region.region_type();
            if let Some(set) = sets.for_type(ty) {
                if set.contains(region) {
                    let slot = match ty {
                        RegionType::Eden => 0,
                        RegionType::Survivor => 1,
                        RegionType::Old => 2,
                        RegionType::StartsHumongous | RegionType::ContinuesHumongous => 3,
                        _ => 4,
                    };
                    counts[slot] += 1;
                }
            }
            assert!(region.is_parsable(), "region {:?} is not parsable", region);
        });
        assert_eq!(counts[0], sets.eden.length(), "eden set length");
        assert_eq!(counts[1], sets.survivor.length(), "survivor set length");
        assert_eq!(counts[2], sets.old.length(), "old set length");
        assert_eq!(counts[3], sets.humongous.length(), "humongous set length");
        assert_eq!(counts[4], sets.archive.length(), "archive set length");
    }
}

impl RegionSource for Heap {
    fn new_alloc_region(
        &self,
        purpose: AllocPurpose,
        word_size: usize,
        force: bool,
        node_index: u32,
    ) -> Option<&HeapRegion> {
        match purpose {
            AllocPurpose::Mutator => self.new_mutator_alloc_region(word_size, force, node_index),
            AllocPurpose::Survivor => {
                self.new_gc_alloc_region(word_size, Destination::Young, node_index)
            }
            AllocPurpose::Old => self.new_gc_alloc_region(word_size, Destination::Old, node_index),
        }
    }

    fn retire_alloc_region(&self, purpose: AllocPurpose, region: &HeapRegion, allocated_bytes: usize) {
        match purpose {
            AllocPurpose::Mutator => self.retire_mutator_alloc_region(region, allocated_bytes),
            AllocPurpose::Survivor => {
                self.retire_gc_alloc_region(region, allocated_bytes, Destination::Young)
            }
            AllocPurpose::Old => {
                self.retire_gc_alloc_region(region, allocated_bytes, Destination::Old)
            }
        }
    }

    fn reuse_alloc_region(&self, region: &HeapRegion, reclaimed_words: usize) {
        debug_assert!(region.is_old());
        {
            let mut sets = self.sets.lock();
            if sets.old.contains(region) {
                sets.old.remove(region);
            }
        }
        self.decrease_used(words_to_bytes(reclaimed_words));
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Heap(used: {}, capacity: {}, {:?})",
            formatted_size(self.used()),
            formatted_size(self.capacity()),
            self.hrm
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::block_size;

    const REGION: usize = 256 * 1024;
    const REGION_WORDS: usize = REGION / 8;

    fn config() -> Config {
        Config {
            initial_heap_size: 4 * REGION,
            max_heap_size: 32 * REGION,
            region_size: Some(REGION),
            concurrent_uncommit: false,
            ..Default::default()
        }
    }

    #[test]
    fn initial_commit() {
        let heap = Heap::new(config());
        assert_eq!(heap.num_committed_regions(), 4);
        assert_eq!(heap.num_free_regions(), 4);
        assert_eq!(heap.capacity(), 4 * REGION);
        assert_eq!(heap.used(), 0);
        heap.verify();
    }

    #[test]
    fn mutator_allocation_moves_through_regions() {
        let heap = Heap::new(config());
        let mut last = std::ptr::null_mut();
        for _ in 0..(2 * REGION_WORDS / 64) {
            let obj = heap.mem_allocate(64);
            assert!(!obj.is_null());
            unsafe {
                HeapObjectHeader::install(obj, 64, 1);
            }
            assert!(
                obj > last
                    || heap.heap_region_containing(obj).map(|r| r.index())
                        != heap.heap_region_containing(last).map(|r| r.index())
            );
            last = obj;
        }
        assert_eq!(heap.used(), 2 * REGION);
        let stats = heap.statistics();
        assert_eq!(stats.eden_regions, 2);
        heap.release_mutator_alloc_regions();
        assert_eq!(heap.used(), 2 * REGION);
        heap.init_mutator_alloc_regions();
        heap.verify();
    }

    #[test]
    fn slow_path_expands_past_initial_size() {
        let heap = Heap::new(config());
        let mut allocated = 0;
        while allocated < 6 * REGION_WORDS {
            let obj = heap.mem_allocate(REGION_WORDS / 4);
            assert!(!obj.is_null());
            allocated += REGION_WORDS / 4;
        }
        assert!(heap.num_committed_regions() >= 6);
    }

    #[test]
    fn eden_limit_is_enforced_without_force() {
        let heap = Heap::new(Config {
            max_eden_regions: Some(1),
            ..config()
        });
        assert!(heap.new_mutator_alloc_region(16, false, 0).is_some());
        assert!(heap.new_mutator_alloc_region(16, false, 0).is_none());
        assert!(heap.new_mutator_alloc_region(16, true, 0).is_some());
    }

    #[test]
    fn forced_mutator_region_expands_the_heap() {
        let heap = Heap::new(Config {
            initial_heap_size: REGION,
            max_eden_regions: Some(1),
            ..config()
        });
        assert_eq!(heap.num_committed_regions(), 1);
        let block = REGION_WORDS / 2 - 384;
        assert!(!heap.mem_allocate(block).is_null());
        assert!(!heap.mem_allocate(block).is_null());
        assert_eq!(heap.num_free_regions(), 0);

        // eden is at its limit and nothing is free, only the forced path can help
        let obj = heap.mem_allocate(block);
        assert!(!obj.is_null());
        assert_eq!(heap.num_committed_regions(), 2);
        assert_eq!(heap.statistics().eden_regions, 2);
        assert!(heap.heap_region_containing(obj).unwrap().is_eden());
    }

    #[test]
    fn humongous_object_spans_regions() {
        let heap = Heap::new(config());
        let word_size = 2 * REGION_WORDS + 100;
        let obj = heap.mem_allocate(word_size);
        assert!(!obj.is_null());
        let first = heap.heap_region_containing(obj).unwrap();
        assert!(first.is_starts_humongous());
        assert_eq!(first.bottom(), obj);
        let third = heap.region_at(first.index() + 2).unwrap();
        assert!(third.is_continues_humongous());
        assert_eq!(third.humongous_start_region(), first.index());
        assert_eq!(third.top(), third.end());
        assert_eq!(heap.statistics().humongous_regions, 3);
        assert_eq!(heap.used(), 3 * REGION);

        // interior addresses resolve to the object, the tail to the filler
        let inside = word_offset(obj, 2 * REGION_WORDS + 10);
        assert_eq!(heap.block_start(inside), obj);
        let tail = word_offset(obj, word_size + 5);
        let filler = heap.block_start(tail);
        assert_eq!(filler, word_offset(obj, word_size));
        assert!(unsafe { HeapObjectHeader::from_addr(filler).is_filler() });
        assert_eq!(unsafe { block_size(obj) }, word_size);

        let indices: Vec<u32> = (first.index()..first.index() + 3).collect();
        heap.free_regions(&indices);
        assert_eq!(heap.used(), 0);
        assert_eq!(heap.statistics().humongous_regions, 0);
        heap.verify();
    }

    #[test]
    fn gc_alloc_regions_account_used_bytes() {
        let heap = Heap::new(config());
        heap.init_gc_alloc_regions();
        let mut actual = 0;
        let young = heap.par_allocate_during_gc(Destination::Young, 100, 100, &mut actual, 0);
        assert!(!young.is_null());
        let old = heap.par_allocate_during_gc(Destination::Old, 50, 200, &mut actual, 0);
        assert!(!old.is_null());
        assert_eq!(actual, 200);
        unsafe {
            HeapObjectHeader::install(young, 100, 1);
            HeapObjectHeader::install(old, 200, 2);
        }
        heap.release_gc_alloc_regions();
        // the old region was padded to the next card
        assert!(heap.used() >= words_to_bytes(300));
        let stats = heap.statistics();
        assert_eq!(stats.survivor_regions, 1);
        assert_eq!(stats.old_regions, 1);

        // the old region keeps being used by the next pause
        let old_region = heap.heap_region_containing(old).unwrap().index();
        heap.init_gc_alloc_regions();
        let again = heap.par_allocate_during_gc(Destination::Old, 8, 8, &mut actual, 0);
        unsafe {
            HeapObjectHeader::install(again, 8, 3);
        }
        assert_eq!(heap.heap_region_containing(again).unwrap().index(), old_region);
        heap.release_gc_alloc_regions();
        heap.verify();
    }

    #[test]
    fn survivor_limit_per_pause() {
        let heap = Heap::new(Config {
            max_survivor_regions: 1,
            ..config()
        });
        heap.init_gc_alloc_regions();
        let mut actual = 0;
        let first = heap.par_allocate_during_gc(
            Destination::Young,
            REGION_WORDS,
            REGION_WORDS,
            &mut actual,
            0,
        );
        assert!(!first.is_null());
        let second = heap.par_allocate_during_gc(Destination::Young, 8, 8, &mut actual, 0);
        assert!(second.is_null());
        assert!(heap.allocator().survivor_is_full());
        heap.release_gc_alloc_regions();
    }

    #[test]
    fn freeing_a_region_returns_its_bytes() {
        let heap = Heap::new(config());
        let obj = heap.mem_allocate(64);
        let index = heap.heap_region_containing(obj).unwrap().index();
        heap.release_mutator_alloc_regions();
        assert_eq!(heap.used(), words_to_bytes(64));
        heap.free_region(index);
        assert_eq!(heap.used(), 0);
        assert!(heap.region_at(index).unwrap().is_free());
        heap.init_mutator_alloc_regions();
        heap.verify();
    }

    #[test]
    fn expand_and_shrink() {
        let heap = Heap::new(config());
        assert!(heap.expand(3 * REGION));
        assert_eq!(heap.num_committed_regions(), 7);
        assert_eq!(heap.shrink(5 * REGION + 17), 5 * REGION);
        assert_eq!(heap.num_committed_regions(), 2);
        assert_eq!(heap.region_manager().num_inactive_regions(), 0);
        assert!(heap.expand(1));
        assert_eq!(heap.num_committed_regions(), 3);
        heap.verify();
    }

    #[test]
    fn statistics_display() {
        let heap = Heap::new(config());
        heap.mem_allocate(16);
        let text = heap.statistics().to_string();
        assert!(text.starts_with("Heap statistics:"));
        assert!(text.contains("Eden: 1"));
    }
}
