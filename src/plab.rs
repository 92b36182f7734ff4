use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::{
    alloc_region::RegionSource,
    allocator::Allocator,
    header::fill_with_objects,
    utils::{pointer_delta, word_offset, words_to_bytes},
    Config, Destination,
};

/// Promotion local allocation buffer: a chunk of a GC region owned by one worker.
pub struct Plab {
    word_size: usize,
    bottom: *mut u8,
    top: *mut u8,
    end: *mut u8,
    // words handed to this buffer, words plugged on retire and words plugged by undo
    allocated: usize,
    wasted: usize,
    undo_wasted: usize,
}

impl Plab {
    pub fn new(desired_word_size: usize) -> Self {
        Self {
            word_size: desired_word_size,
            bottom: std::ptr::null_mut(),
            top: std::ptr::null_mut(),
            end: std::ptr::null_mut(),
            allocated: 0,
            wasted: 0,
            undo_wasted: 0,
        }
    }

    pub fn word_size(&self) -> usize {
        self.word_size
    }
    pub fn set_word_size(&mut self, word_size: usize) {
        self.word_size = word_size;
    }
    pub fn words_remaining(&self) -> usize {
        if self.top.is_null() {
            0
        } else {
            pointer_delta(self.end, self.top)
        }
    }
    pub fn contains(&self, addr: *const u8) -> bool {
        addr >= self.bottom as *const u8 && addr < self.end as *const u8
    }
    pub fn allocated(&self) -> usize {
        self.allocated
    }
    pub fn wasted(&self) -> usize {
        self.wasted
    }
    pub fn undo_wasted(&self) -> usize {
        self.undo_wasted
    }

    /// Start allocating from `[buf, buf + word_size)`.
    pub fn set_buf(&mut self, buf: *mut u8, word_size: usize) {
        debug_assert!(self.words_remaining() == 0, "retire the old buffer first");
        self.bottom = buf;
        self.top = buf;
        self.end = word_offset(buf, word_size);
        self.allocated += word_size;
    }

    #[inline]
    pub fn allocate(&mut self, word_size: usize) -> *mut u8 {
        if self.words_remaining() < word_size || word_size == 0 {
            return std::ptr::null_mut();
        }
        let obj = self.top;
        self.top = word_offset(obj, word_size);
        obj
    }

    /// Give back the speculative allocation `[obj, obj + word_size)`. The last allocation is
    /// rolled back, anything else is plugged and counted as undo waste.
    pub fn undo_allocation(&mut self, obj: *mut u8, word_size: usize) {
        if self.contains(obj) && word_offset(obj, word_size) == self.top {
            self.top = obj;
        } else {
            unsafe {
                fill_with_objects(obj, word_size);
            }
            self.undo_wasted += word_size;
        }
    }

    fn retire_internal(&mut self) -> usize {
        if self.top.is_null() || self.top >= self.end {
            self.invalidate();
            return 0;
        }
        let remaining = pointer_delta(self.end, self.top);
        unsafe {
            fill_with_objects(self.top, remaining);
        }
        self.invalidate();
        remaining
    }

    fn invalidate(&mut self) {
        self.bottom = std::ptr::null_mut();
        self.top = std::ptr::null_mut();
        self.end = std::ptr::null_mut();
    }

    /// Plug the rest of the buffer, counting it as waste. Returns the words plugged.
    pub fn retire(&mut self) -> usize {
        let waste = self.retire_internal();
        self.wasted += waste;
        waste
    }

    /// Retire the last buffer of the pause and move the counters into `stats`.
    pub fn flush_and_retire_stats(&mut self, stats: &PlabStats) {
        let unused = self.retire_internal();
        stats.add_allocated(self.allocated);
        stats.add_wasted(self.wasted);
        stats.add_undo_wasted(self.undo_wasted);
        stats.add_unused(unused);
        self.allocated = 0;
        self.wasted = 0;
        self.undo_wasted = 0;
    }
}

impl Drop for Plab {
    fn drop(&mut self) {
        debug_assert!(
            self.words_remaining() == 0,
            "PLAB dropped with {} words left, flush it first",
            self.words_remaining()
        );
    }
}

const OLD_THRESHOLD: usize = 100;

/// Exponentially decaying average where early samples weigh more until enough history
/// exists.
#[derive(Clone, Copy, Debug)]
pub struct AdaptiveWeightedAverage {
    average: f64,
    count: usize,
    weight: usize,
    last_sample: f64,
}

impl AdaptiveWeightedAverage {
    pub fn new(weight: usize, initial: f64) -> Self {
        Self {
            average: initial,
            count: 0,
            weight,
            last_sample: 0.0,
        }
    }

    pub fn average(&self) -> f64 {
        self.average
    }
    pub fn last_sample(&self) -> f64 {
        self.last_sample
    }

    pub fn sample(&mut self, new_sample: f64) {
        self.count = self.count.saturating_add(1);
        let count_weight = if self.count < OLD_THRESHOLD {
            OLD_THRESHOLD / self.count
        } else {
            0
        };
        let weight = self.weight.max(count_weight).min(100) as f64;
        self.average = (100.0 - weight) * self.average / 100.0 + weight * new_sample / 100.0;
        self.last_sample = new_sample;
    }
}

/// Allocation statistics of all PLABs of one destination, accumulated over a pause.
pub struct PlabStats {
    description: &'static str,
    allocated: AtomicUsize,
    wasted: AtomicUsize,
    undo_wasted: AtomicUsize,
    unused: AtomicUsize,
    region_end_waste: AtomicUsize,
    direct_allocated: AtomicUsize,
    desired_net_plab_size: AtomicUsize,
    filter: Mutex<AdaptiveWeightedAverage>,
    min_size: usize,
    max_size: usize,
    target_waste_pct: usize,
    last_average_occupancy: f64,
    verbose: bool,
}

impl PlabStats {
    pub fn new(
        description: &'static str,
        desired_net_plab_size: usize,
        min_size: usize,
        max_size: usize,
        config: &Config,
    ) -> Self {
        let desired = desired_net_plab_size.max(min_size);
        Self {
            description,
            allocated: AtomicUsize::new(0),
            wasted: AtomicUsize::new(0),
            undo_wasted: AtomicUsize::new(0),
            unused: AtomicUsize::new(0),
            region_end_waste: AtomicUsize::new(0),
            direct_allocated: AtomicUsize::new(0),
            desired_net_plab_size: AtomicUsize::new(desired),
            filter: Mutex::new(AdaptiveWeightedAverage::new(config.plab_weight, desired as f64)),
            min_size,
            max_size: max_size.max(min_size),
            target_waste_pct: config.target_plab_waste_pct,
            last_average_occupancy: config.last_plab_average_occupancy,
            verbose: config.verbose,
        }
    }

    pub fn description(&self) -> &'static str {
        self.description
    }
    pub fn min_size(&self) -> usize {
        self.min_size
    }
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn add_allocated(&self, words: usize) {
        self.allocated.fetch_add(words, Ordering::Relaxed);
    }
    pub fn add_wasted(&self, words: usize) {
        self.wasted.fetch_add(words, Ordering::Relaxed);
    }
    pub fn add_undo_wasted(&self, words: usize) {
        self.undo_wasted.fetch_add(words, Ordering::Relaxed);
    }
    pub fn add_unused(&self, words: usize) {
        self.unused.fetch_add(words, Ordering::Relaxed);
    }
    pub fn add_region_end_waste(&self, words: usize) {
        self.region_end_waste.fetch_add(words, Ordering::Relaxed);
    }
    pub fn add_direct_allocated(&self, words: usize) {
        self.direct_allocated.fetch_add(words, Ordering::Relaxed);
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
    pub fn wasted(&self) -> usize {
        self.wasted.load(Ordering::Relaxed)
    }
    pub fn undo_wasted(&self) -> usize {
        self.undo_wasted.load(Ordering::Relaxed)
    }
    pub fn unused(&self) -> usize {
        self.unused.load(Ordering::Relaxed)
    }
    pub fn region_end_waste(&self) -> usize {
        self.region_end_waste.load(Ordering::Relaxed)
    }
    pub fn direct_allocated(&self) -> usize {
        self.direct_allocated.load(Ordering::Relaxed)
    }

    /// Words actually used by objects in PLABs.
    pub fn used(&self) -> usize {
        self.allocated()
            .saturating_sub(self.wasted() + self.unused())
    }

    pub fn desired_net_plab_size(&self) -> usize {
        self.desired_net_plab_size.load(Ordering::Relaxed)
    }

    /// Per worker PLAB size for `workers` workers.
    pub fn desired_plab_size(&self, workers: usize) -> usize {
        (self.desired_net_plab_size() / workers.max(1)).clamp(self.min_size, self.max_size)
    }

    /// PLAB size that would have wasted `target_waste_pct` of what was used if the last
    /// buffer of each worker had been `last_average_occupancy` percent full, i.e. left
    /// `100 - last_average_occupancy` percent unused. Region end waste is charged to
    /// PLABs as well.
    pub fn compute_desired_plab_size(&self) -> usize {
        let used_for_waste_calculation = self.used().saturating_sub(self.region_end_waste());
        let total_waste_allowed = used_for_waste_calculation * self.target_waste_pct;
        let unused_pct = (100.0 - self.last_average_occupancy).max(1.0);
        (total_waste_allowed as f64 / unused_pct) as usize
    }

    /// Fold the statistics of the last pause into the desired size and reset them.
    pub fn adjust_desired_plab_size(&self) {
        logln_if!(
            self.verbose,
            "[gc] {} PLAB allocation: allocated: {}B, wasted: {}B, unused: {}B, used: {}B, undo waste: {}B, region end waste: {}B, direct allocation: {}B",
            self.description,
            words_to_bytes(self.allocated()),
            words_to_bytes(self.wasted()),
            words_to_bytes(self.unused()),
            words_to_bytes(self.used()),
            words_to_bytes(self.undo_wasted()),
            words_to_bytes(self.region_end_waste()),
            words_to_bytes(self.direct_allocated())
        );
        debug_assert!(
            self.allocated() != 0 || self.unused() == 0,
            "inconsistent PLAB stats: allocated {} unused {}",
            self.allocated(),
            self.unused()
        );
        let plab_size = self.compute_desired_plab_size();
        let desired = {
            let mut filter = self.filter.lock();
            filter.sample(plab_size as f64);
            (filter.average() as usize).max(self.min_size)
        };
        self.desired_net_plab_size.store(desired, Ordering::Relaxed);
        logln_if!(
            self.verbose,
            "[gc] {} PLAB sizing: calculated {} words, actual {} words",
            self.description,
            plab_size,
            desired
        );
        self.reset();
    }

    fn reset(&self) {
        self.allocated.store(0, Ordering::Relaxed);
        self.wasted.store(0, Ordering::Relaxed);
        self.undo_wasted.store(0, Ordering::Relaxed);
        self.unused.store(0, Ordering::Relaxed);
        self.region_end_waste.store(0, Ordering::Relaxed);
        self.direct_allocated.store(0, Ordering::Relaxed);
    }
}

/// Per worker PLABs for both destinations, one young PLAB per NUMA node.
pub struct PlabAllocator<'a> {
    allocator: &'a Allocator,
    source: &'a dyn RegionSource,
    young_stats: &'a PlabStats,
    old_stats: &'a PlabStats,
    young_buffers: Vec<Plab>,
    old_buffer: Plab,
    direct_allocated: [usize; 2],
    buffer_waste_pct: usize,
}

fn dest_index(dest: Destination) -> usize {
    match dest {
        Destination::Young => 0,
        Destination::Old => 1,
    }
}

impl<'a> PlabAllocator<'a> {
    /// `young_plab_size` and `old_plab_size` are the per worker buffer sizes in words.
    pub fn new(
        allocator: &'a Allocator,
        source: &'a dyn RegionSource,
        young_stats: &'a PlabStats,
        old_stats: &'a PlabStats,
        young_plab_size: usize,
        old_plab_size: usize,
        buffer_waste_pct: usize,
    ) -> Self {
        Self {
            young_buffers: (0..allocator.num_nodes())
                .map(|_| Plab::new(young_plab_size))
                .collect(),
            old_buffer: Plab::new(old_plab_size),
            allocator,
            source,
            young_stats,
            old_stats,
            direct_allocated: [0; 2],
            buffer_waste_pct,
        }
    }

    pub fn alloc_buffer(&mut self, dest: Destination, node_index: u32) -> &mut Plab {
        match dest {
            Destination::Young => {
                let node = if (node_index as usize) < self.young_buffers.len() {
                    node_index as usize
                } else {
                    0
                };
                &mut self.young_buffers[node]
            }
            Destination::Old => &mut self.old_buffer,
        }
    }

    pub fn direct_allocated(&self, dest: Destination) -> usize {
        self.direct_allocated[dest_index(dest)]
    }

    /// A new buffer is only worth it when the object is small next to it: retiring the
    /// current buffer then wastes less than `buffer_waste_pct` of a buffer.
    pub fn may_throw_away_buffer(&self, allocation_word_size: usize, buffer_size: usize) -> bool {
        allocation_word_size * 100 < buffer_size * self.buffer_waste_pct
    }

    /// Allocate `word_size` words for an object copied to `dest`. `plab_refill_failed` is
    /// set when a new buffer was wanted but could not be had.
    #[inline]
    pub fn allocate(
        &mut self,
        dest: Destination,
        word_size: usize,
        plab_refill_failed: &mut bool,
        node_index: u32,
    ) -> *mut u8 {
        let obj = self.alloc_buffer(dest, node_index).allocate(word_size);
        if !obj.is_null() {
            return obj;
        }
        self.allocate_direct_or_new_plab(dest, word_size, plab_refill_failed, node_index)
    }

    pub fn allocate_direct_or_new_plab(
        &mut self,
        dest: Destination,
        word_size: usize,
        plab_refill_failed: &mut bool,
        node_index: u32,
    ) -> *mut u8 {
        let plab_word_size = self.alloc_buffer(dest, node_index).word_size();
        let required_in_plab = word_size;
        if required_in_plab <= plab_word_size
            && self.may_throw_away_buffer(required_in_plab, plab_word_size)
        {
            let allocator = self.allocator;
            let source = self.source;
            let buffer = self.alloc_buffer(dest, node_index);
            buffer.retire();
            let mut actual_plab_size = 0;
            let buf = allocator.par_allocate_during_gc(
                dest,
                required_in_plab,
                plab_word_size,
                &mut actual_plab_size,
                node_index,
                source,
            );
            debug_assert!(
                buf.is_null()
                    || (actual_plab_size >= required_in_plab && actual_plab_size <= plab_word_size),
                "requested at least {}, desired {} words, but got {} at {:p}",
                required_in_plab,
                plab_word_size,
                actual_plab_size,
                buf
            );
            if !buf.is_null() {
                buffer.set_buf(buf, actual_plab_size);
                let obj = buffer.allocate(word_size);
                debug_assert!(!obj.is_null(), "PLAB should have been big enough");
                return obj;
            }
            *plab_refill_failed = true;
        }
        let mut actual = 0;
        let result = self.allocator.par_allocate_during_gc(
            dest,
            word_size,
            word_size,
            &mut actual,
            node_index,
            self.source,
        );
        if !result.is_null() {
            self.direct_allocated[dest_index(dest)] += word_size;
        }
        result
    }

    pub fn undo_allocation(&mut self, dest: Destination, obj: *mut u8, word_size: usize, node_index: u32) {
        self.alloc_buffer(dest, node_index)
            .undo_allocation(obj, word_size);
    }

    /// Retire every buffer and publish the counters. Called by each worker at the end of
    /// the pause.
    pub fn flush_and_retire_stats(&mut self) {
        for buffer in self.young_buffers.iter_mut() {
            buffer.flush_and_retire_stats(self.young_stats);
        }
        self.old_buffer.flush_and_retire_stats(self.old_stats);
        self.young_stats
            .add_direct_allocated(std::mem::take(&mut self.direct_allocated[0]));
        self.old_stats
            .add_direct_allocated(std::mem::take(&mut self.direct_allocated[1]));
    }

    /// Words wasted so far by retired buffers and undone allocations.
    pub fn waste(&self) -> (usize, usize) {
        let buffers = self.young_buffers.iter().chain(std::iter::once(&self.old_buffer));
        buffers.fold((0, 0), |(wasted, undo), b| (wasted + b.wasted(), undo + b.undo_wasted()))
    }
}

impl Drop for PlabAllocator<'_> {
    fn drop(&mut self) {
        let buffers_dirty = self
            .young_buffers
            .iter()
            .chain(std::iter::once(&self.old_buffer))
            .any(|b| b.allocated() != 0 || b.wasted() != 0 || b.undo_wasted() != 0);
        if buffers_dirty || self.direct_allocated != [0; 2] {
            self.flush_and_retire_stats();
        }
    }
}
