//! Region based heap allocation engine.
//!
//! The heap is a reserved range split into power-of-two sized regions. Mutators allocate
//! through lock-free bump cursors over eden regions, GC workers copy into survivor and old
//! regions through PLABs, objects of half a region or more get whole contiguous runs of
//! regions, and archive data is packed sequentially at the top of the heap. Every block
//! handed out starts with a [`header::HeapObjectHeader`] and every hole is plugged with a
//! filler, so each region can always be walked from bottom to top.
//!
//! Everything hangs off [`heap::Heap`], which owns the region manager, the allocator and
//! the background uncommit thread.

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        }
    };
}

pub mod alloc_region;
pub mod allocator;
pub mod archive_allocator;
pub mod block_offset_table;
pub mod committed_map;
pub mod free_region_list;
pub mod header;
pub mod heap;
pub mod mmap;
pub mod numa;
pub mod plab;
pub mod region;
pub mod region_manager;
pub mod region_set;
pub mod statistics;
pub mod uncommit;
pub mod utils;

#[cfg(test)]
mod tests;

pub use heap::Heap;
pub use region::{HeapRegion, RegionOptions, RegionType};

/// Where an allocation made during a collection pause ends up.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Destination {
    Young,
    Old,
}

/// Configuration for heap constructor.
#[derive(Clone, Debug)]
pub struct Config {
    /// Heap size committed at startup. Rounded up to whole regions.
    pub initial_heap_size: usize,
    /// Size of the reserved range. Rounded up to whole regions.
    pub max_heap_size: usize,
    /// Explicit region size, must be a power of two. Computed from `target_region_count`
    /// when `None`.
    pub region_size: Option<usize>,
    pub target_region_count: usize,
    /// Number of NUMA nodes to spread regions over, 1 disables NUMA awareness.
    pub numa_nodes: usize,
    /// How many free regions to look at when searching for one on a given node.
    pub numa_search_depth: usize,
    /// Minimum TLAB size in bytes. Mutator regions with less free space are not retained.
    pub min_tlab_size: usize,
    /// Maximum number of eden regions, unlimited when `None`.
    pub max_eden_regions: Option<usize>,
    /// Maximum number of survivor regions allocated during one pause.
    pub max_survivor_regions: usize,
    /// Percentage of a PLAB that may be thrown away instead of serving an allocation directly.
    pub parallel_gc_buffer_waste_pct: usize,
    /// Wasted percentage of PLAB space the adaptive sizing aims for.
    pub target_plab_waste_pct: usize,
    /// Weight of the newest sample in the PLAB size average, in percent.
    pub plab_weight: usize,
    /// Assumed fill percentage of the last PLAB of every worker.
    pub last_plab_average_occupancy: f64,
    /// Initial survivor PLAB size in words.
    pub young_plab_size: usize,
    /// Initial old PLAB size in words.
    pub old_plab_size: usize,
    /// Number of GC workers sharing the desired PLAB size.
    pub gc_workers: usize,
    /// Upper bound in bytes of memory returned to the OS per uncommit step.
    pub uncommit_size_limit: usize,
    /// Delay before the uncommit service starts working after a shrink.
    pub uncommit_delay_ms: u64,
    /// Uncommit on a background thread instead of inside `Heap::shrink`.
    pub concurrent_uncommit: bool,
    /// Touch every page of newly committed regions.
    pub always_pretouch: bool,
    /// Enables verbose printing
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_heap_size: 16 * 1024 * 1024,
            max_heap_size: 256 * 1024 * 1024,
            region_size: None,
            target_region_count: 2048,
            numa_nodes: 1,
            numa_search_depth: 8,
            min_tlab_size: 2 * 1024,
            max_eden_regions: None,
            max_survivor_regions: usize::MAX,
            parallel_gc_buffer_waste_pct: 10,
            target_plab_waste_pct: 10,
            plab_weight: 75,
            last_plab_average_occupancy: 50.0,
            young_plab_size: 1024,
            old_plab_size: 1024,
            gc_workers: 4,
            uncommit_size_limit: 128 * 1024 * 1024,
            uncommit_delay_ms: 100,
            concurrent_uncommit: true,
            always_pretouch: false,
            verbose: false,
        }
    }
}
