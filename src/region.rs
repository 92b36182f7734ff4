use std::sync::{
    atomic::{AtomicPtr, AtomicU32, Ordering},
    Arc,
};

use atomic::Atomic;
use crossbeam_utils::CachePadded;

use crate::{
    block_offset_table::{BlockOffsetTable, BlockOffsetTablePart, CARD_SIZE},
    header::HeapObjectHeader,
    utils::{
        align_down, align_up, formatted_size, page_size, pointer_delta, word_offset,
        HEAP_WORD_SIZE, LOG_HEAP_WORD_SIZE,
    },
    Config,
};

/// Index value used for "no region" in links and back references.
pub const NO_REGION: u32 = u32::MAX;
pub const UNKNOWN_NODE: u32 = u32::MAX;

/*
 Region type transitions. All of them happen under the heap lock or the
 free list lock, except for the very first commit which happens under the
 region manager lock.

     Free ----> Eden ------------------------------> Free
       |                                              ^
       +------> Survivor ---------------------------->|
       |                                              |
       +------> Old --------------------------------->|
       |                                              |
       +------> StartsHumongous + ContinuesHumongous ->|
       |
       +------> OpenArchive / ClosedArchive  (never freed)

 A region that is the current region of an allocation cursor is never free.
 A free region always has top == bottom.
*/
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RegionType {
    Free,
    Eden,
    Survivor,
    Old,
    StartsHumongous,
    ContinuesHumongous,
    OpenArchive,
    ClosedArchive,
}

impl RegionType {
    pub fn is_young(self) -> bool {
        matches!(self, Self::Eden | Self::Survivor)
    }
    pub fn is_humongous(self) -> bool {
        matches!(self, Self::StartsHumongous | Self::ContinuesHumongous)
    }
    pub fn is_archive(self) -> bool {
        matches!(self, Self::OpenArchive | Self::ClosedArchive)
    }
    pub fn short_name(self) -> &'static str {
        match self {
            Self::Free => "F",
            Self::Eden => "E",
            Self::Survivor => "S",
            Self::Old => "O",
            Self::StartsHumongous => "HS",
            Self::ContinuesHumongous => "HC",
            Self::OpenArchive => "OA",
            Self::ClosedArchive => "CA",
        }
    }
}

pub struct HeapRegion {
    index: u32,
    bottom: *mut u8,
    end: *mut u8,

    top: CachePadded<AtomicPtr<u8>>,
    /// Top before the last dummy object was plugged at the end of the region, null if none.
    pre_dummy_top: AtomicPtr<u8>,
    region_type: Atomic<RegionType>,
    node_index: AtomicU32,
    humongous_start: AtomicU32,

    // links for FreeRegionList, valid only under the list's lock
    prev: AtomicU32,
    next: AtomicU32,
    /// Set the region is currently a member of, for assertions only.
    containing_set: AtomicU32,

    bot_part: BlockOffsetTablePart,
}

unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    pub fn new(index: u32, bottom: *mut u8, word_size: usize, bot: Arc<BlockOffsetTable>) -> Self {
        Self {
            index,
            bottom,
            end: word_offset(bottom, word_size),
            top: CachePadded::new(AtomicPtr::new(bottom)),
            pre_dummy_top: AtomicPtr::new(std::ptr::null_mut()),
            region_type: Atomic::new(RegionType::Free),
            node_index: AtomicU32::new(UNKNOWN_NODE),
            humongous_start: AtomicU32::new(NO_REGION),
            prev: AtomicU32::new(NO_REGION),
            next: AtomicU32::new(NO_REGION),
            containing_set: AtomicU32::new(0),
            bot_part: BlockOffsetTablePart::new(bot),
        }
    }

    /// Zero capacity region standing in for "no current region" in allocation cursors.
    /// Every allocation attempt against it fails.
    pub fn dummy(bot: Arc<BlockOffsetTable>) -> Self {
        let this = Self::new(NO_REGION, std::ptr::null_mut(), 0, bot);
        this.region_type.store(RegionType::Eden, Ordering::Relaxed);
        this
    }

    #[inline(always)]
    pub fn index(&self) -> u32 {
        self.index
    }
    #[inline(always)]
    pub fn bottom(&self) -> *mut u8 {
        self.bottom
    }
    #[inline(always)]
    pub fn end(&self) -> *mut u8 {
        self.end
    }
    #[inline(always)]
    pub fn top(&self) -> *mut u8 {
        self.top.load(Ordering::Acquire)
    }
    pub fn set_top(&self, top: *mut u8) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.top.store(top, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.end as usize - self.bottom as usize
    }
    pub fn used(&self) -> usize {
        self.top() as usize - self.bottom as usize
    }
    pub fn free(&self) -> usize {
        self.end as usize - self.top() as usize
    }
    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }
    pub fn contains(&self, addr: *const u8) -> bool {
        addr >= self.bottom as *const u8 && addr < self.end as *const u8
    }

    #[inline(always)]
    pub fn region_type(&self) -> RegionType {
        self.region_type.load(Ordering::Acquire)
    }
    fn set_type(&self, ty: RegionType) {
        self.region_type.store(ty, Ordering::Release);
    }
    pub fn is_free(&self) -> bool {
        self.region_type() == RegionType::Free
    }
    pub fn is_eden(&self) -> bool {
        self.region_type() == RegionType::Eden
    }
    pub fn is_survivor(&self) -> bool {
        self.region_type() == RegionType::Survivor
    }
    pub fn is_young(&self) -> bool {
        self.region_type().is_young()
    }
    pub fn is_old(&self) -> bool {
        self.region_type() == RegionType::Old
    }
    pub fn is_humongous(&self) -> bool {
        self.region_type().is_humongous()
    }
    pub fn is_starts_humongous(&self) -> bool {
        self.region_type() == RegionType::StartsHumongous
    }
    pub fn is_continues_humongous(&self) -> bool {
        self.region_type() == RegionType::ContinuesHumongous
    }
    pub fn is_archive(&self) -> bool {
        self.region_type().is_archive()
    }

    pub fn set_free(&self) {
        self.set_type(RegionType::Free);
    }
    pub fn set_eden(&self) {
        self.set_type(RegionType::Eden);
    }
    pub fn set_survivor(&self) {
        self.set_type(RegionType::Survivor);
    }
    pub fn set_old(&self) {
        self.set_type(RegionType::Old);
    }
    pub fn set_open_archive(&self) {
        self.set_type(RegionType::OpenArchive);
    }
    pub fn set_closed_archive(&self) {
        self.set_type(RegionType::ClosedArchive);
    }

    /// Turn this region into the first region of a humongous object ending at `obj_top`
    /// followed by `fill_words` words of filler. The block offset entries of the whole
    /// run are written here, before any top is published.
    pub fn set_starts_humongous(&self, obj_top: *mut u8, fill_words: usize) {
        debug_assert!(self.is_free() && self.is_empty());
        self.set_type(RegionType::StartsHumongous);
        self.humongous_start.store(self.index, Ordering::Relaxed);
        self.bot_part.alloc_block(self.bottom, obj_top);
        if fill_words > 0 {
            self.bot_part.alloc_block_words(obj_top, fill_words);
        }
    }

    pub fn set_continues_humongous(&self, first: &HeapRegion) {
        debug_assert!(self.is_free() && self.is_empty());
        debug_assert!(first.is_starts_humongous());
        self.set_type(RegionType::ContinuesHumongous);
        self.humongous_start.store(first.index(), Ordering::Relaxed);
        self.bot_part.set_object_can_span(true);
    }

    pub fn humongous_start_region(&self) -> u32 {
        self.humongous_start.load(Ordering::Relaxed)
    }

    pub fn node_index(&self) -> u32 {
        self.node_index.load(Ordering::Relaxed)
    }
    pub fn set_node_index(&self, node: u32) {
        self.node_index.store(node, Ordering::Relaxed);
    }

    pub fn pre_dummy_top(&self) -> *mut u8 {
        self.pre_dummy_top.load(Ordering::Relaxed)
    }
    pub fn set_pre_dummy_top(&self, top: *mut u8) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.pre_dummy_top.store(top, Ordering::Relaxed);
    }
    pub fn reset_pre_dummy_top(&self) {
        self.pre_dummy_top
            .store(std::ptr::null_mut(), Ordering::Relaxed);
    }

    /// Drop the dummy object plugged at the end of this region by a previous retirement
    /// so allocation can continue where the real objects ended. Returns the words given back.
    pub fn undo_dummy_fill(&self) -> usize {
        let pre = self.pre_dummy_top();
        if pre.is_null() || self.top() != self.end {
            return 0;
        }
        let words = pointer_delta(self.end, pre);
        self.set_top(pre);
        self.reset_pre_dummy_top();
        words
    }

    pub(crate) fn prev(&self) -> u32 {
        self.prev.load(Ordering::Relaxed)
    }
    pub(crate) fn next(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }
    pub(crate) fn set_prev(&self, prev: u32) {
        self.prev.store(prev, Ordering::Relaxed);
    }
    pub(crate) fn set_next(&self, next: u32) {
        self.next.store(next, Ordering::Relaxed);
    }

    pub fn containing_set(&self) -> u32 {
        self.containing_set.load(Ordering::Relaxed)
    }
    pub(crate) fn set_containing_set(&self, set: u32) {
        self.containing_set.store(set, Ordering::Relaxed);
    }

    pub fn bot_part(&self) -> &BlockOffsetTablePart {
        &self.bot_part
    }

    /// Reset everything but the commit state. Used when a region becomes free again and
    /// when it is (re)activated.
    pub fn hr_clear(&self) {
        debug_assert_eq!(self.containing_set(), 0, "region {} still in a set", self.index);
        self.set_top(self.bottom);
        self.reset_pre_dummy_top();
        self.humongous_start.store(NO_REGION, Ordering::Relaxed);
        self.bot_part.set_object_can_span(false);
        self.set_free();
    }

    pub fn initialize(&self) {
        self.hr_clear();
        self.set_prev(NO_REGION);
        self.set_next(NO_REGION);
    }

    /// Lock-free bump allocation of between `min_word_size` and `desired_word_size` words.
    /// Returns null without side effects when the remaining space is below the minimum.
    #[inline]
    pub fn par_allocate(
        &self,
        min_word_size: usize,
        desired_word_size: usize,
        actual_word_size: &mut usize,
    ) -> *mut u8 {
        debug_assert!(min_word_size <= desired_word_size);
        let mut obj = self.top.load(Ordering::Acquire);
        loop {
            let available = pointer_delta(self.end, obj);
            let want = available.min(desired_word_size);
            if want < min_word_size || want == 0 {
                return std::ptr::null_mut();
            }
            let new_top = word_offset(obj, want);
            match self.top.compare_exchange_weak(
                obj,
                new_top,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.bot_part.alloc_block(obj, new_top);
                    *actual_word_size = want;
                    return obj;
                }
                Err(current) => obj = current,
            }
        }
    }

    /// Single-threaded bump allocation. The caller must be the only one allocating here.
    pub fn allocate(&self, word_size: usize) -> *mut u8 {
        let obj = self.top();
        if pointer_delta(self.end, obj) < word_size || word_size == 0 {
            return std::ptr::null_mut();
        }
        let new_top = word_offset(obj, word_size);
        self.set_top(new_top);
        self.bot_part.alloc_block(obj, new_top);
        obj
    }

    /// Start of the block containing `addr`, which must lie in `[bottom, top)`.
    pub fn block_start(&self, addr: *const u8) -> *mut u8 {
        debug_assert!(
            addr >= self.bottom as *const u8 && addr < self.top() as *const u8,
            "{:p} not in [{:p}, {:p}) of region {}",
            addr,
            self.bottom,
            self.top(),
            self.index
        );
        self.bot_part.block_start(self.bottom, addr)
    }

    /// Walk `[bottom, top)` block by block. Returns false if a block header is broken.
    pub fn is_parsable(&self) -> bool {
        let top = self.top();
        let mut cur = self.bottom;
        while cur < top {
            let size = unsafe { HeapObjectHeader::from_addr(cur).size_words() };
            if size == 0 {
                return false;
            }
            cur = word_offset(cur, size);
        }
        cur == top
    }
}

impl std::fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HR({}, {}, [{:p}, {:p}, {:p}), node {})",
            self.index,
            self.region_type().short_name(),
            self.bottom,
            self.top(),
            self.end,
            self.node_index() as i32
        )
    }
}

/// Region geometry computed once at heap initialization.
#[derive(Default, Clone, Copy)]
pub struct RegionOptions {
    pub region_size_bytes: usize,
    pub region_size_words: usize,
    pub region_size_bytes_shift: usize,
    pub region_size_words_shift: usize,
    pub region_size_bytes_mask: usize,
    pub region_count: usize,
    pub initial_region_count: usize,
    pub humongous_threshold_words: usize,
    pub max_tlab_size_words: usize,
    pub min_tlab_size_words: usize,
    pub max_heap_size: usize,
    pub page_size: usize,
}

impl std::fmt::Debug for RegionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "RegionOptions:")?;
        writeln!(
            f,
            "\tregion_size_bytes: {}",
            formatted_size(self.region_size_bytes)
        )?;
        writeln!(f, "\tregion_size_words: {}", self.region_size_words)?;
        writeln!(
            f,
            "\tregion_size_bytes_shift: {}",
            self.region_size_bytes_shift
        )?;
        writeln!(f, "\tregion_count: {}", self.region_count)?;
        writeln!(f, "\tinitial_region_count: {}", self.initial_region_count)?;
        writeln!(
            f,
            "\thumongous_threshold_words: {}",
            self.humongous_threshold_words
        )?;
        writeln!(f, "\tmax_tlab_size_words: {}", self.max_tlab_size_words)?;
        writeln!(f, "\tmax_heap_size: {}", formatted_size(self.max_heap_size))
    }
}

impl RegionOptions {
    pub const MIN_REGION_SIZE: usize = 256 * 1024;
    pub const MIN_NUM_REGIONS: usize = 10;
    pub const MAX_REGION_SIZE: usize = 32 * 1024 * 1024;

    pub fn setup_sizes(config: &Config) -> RegionOptions {
        let mut opts = RegionOptions::default();
        let page_size = page_size();
        let mut max_heap_size = config.max_heap_size;

        let mut region_size = match config.region_size {
            Some(size) => {
                assert!(
                    size.is_power_of_two()
                        && size >= Self::MIN_REGION_SIZE
                        && size <= Self::MAX_REGION_SIZE,
                    "region size {} must be a power of two in [{}, {}]",
                    formatted_size(size),
                    formatted_size(Self::MIN_REGION_SIZE),
                    formatted_size(Self::MAX_REGION_SIZE)
                );
                size
            }
            None => {
                let size = max_heap_size / config.target_region_count.max(1);
                size.max(Self::MIN_REGION_SIZE).min(Self::MAX_REGION_SIZE)
            }
        };
        if region_size > max_heap_size / Self::MIN_NUM_REGIONS {
            panic!("Max heap size ({}) is too low to afford the minimum number of regions ({}) of region size ({})",
                formatted_size(max_heap_size), Self::MIN_NUM_REGIONS, formatted_size(region_size)
            );
        }

        region_size = align_up(region_size, page_size);
        let region_size_log = (usize::BITS - 1 - region_size.leading_zeros()) as usize;
        region_size = 1 << region_size_log;
        debug_assert!(region_size >= CARD_SIZE);

        max_heap_size = align_up(max_heap_size, region_size);

        opts.page_size = page_size;
        opts.region_size_bytes_shift = region_size_log;
        opts.region_size_bytes = region_size;
        opts.region_size_words = region_size >> LOG_HEAP_WORD_SIZE;
        opts.region_size_words_shift = region_size_log - LOG_HEAP_WORD_SIZE;
        opts.region_size_bytes_mask = region_size - 1;
        opts.region_count = max_heap_size / region_size;
        opts.initial_region_count = (align_up(config.initial_heap_size, region_size)
            / region_size)
            .min(opts.region_count);
        opts.humongous_threshold_words = opts.region_size_words / 2;
        opts.max_tlab_size_words = align_down(
            (opts.region_size_words / 8).min(opts.humongous_threshold_words),
            8,
        );
        opts.min_tlab_size_words =
            (align_up(config.min_tlab_size, HEAP_WORD_SIZE) / HEAP_WORD_SIZE)
                .min(opts.max_tlab_size_words);
        opts.max_heap_size = max_heap_size;
        opts
    }

    pub fn is_humongous(&self, word_size: usize) -> bool {
        word_size >= self.humongous_threshold_words
    }

    pub fn humongous_size_in_regions(&self, word_size: usize) -> usize {
        align_up(word_size, self.region_size_words) / self.region_size_words
    }
}
