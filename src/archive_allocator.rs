use crate::{
    header::fill_with_objects,
    heap::Heap,
    region::{HeapRegion, RegionOptions},
    utils::{align_up, bytes_to_words, is_aligned, pointer_delta, word_offset, HEAP_WORD_SIZE},
};

/// A contiguous range of archive data, `word_size` words starting at `start`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MemRange {
    pub start: *mut u8,
    pub word_size: usize,
}

impl MemRange {
    pub fn end(&self) -> *mut u8 {
        word_offset(self.start, self.word_size)
    }
}

/// Packs archive objects sequentially into the highest free regions of the heap.
///
/// Allocation proceeds in chunks of [`RegionOptions::MIN_REGION_SIZE`] bytes: an object never straddles
/// a chunk boundary, so the archive can later be mapped into a heap with the smallest
/// region size. Single threaded; the caller must not allocate anything else meanwhile.
pub struct ArchiveAllocator<'a> {
    heap: &'a Heap,
    open: bool,
    allocation_region: Option<&'a HeapRegion>,
    allocated_regions: Vec<&'a HeapRegion>,
    bottom: *mut u8,
    max: *mut u8,
    summary_bytes_used: usize,
}

const CHUNK_WORDS: usize = bytes_to_words(RegionOptions::MIN_REGION_SIZE);

impl<'a> ArchiveAllocator<'a> {
    pub fn new(heap: &'a Heap, open: bool) -> Self {
        Self {
            heap,
            open,
            allocation_region: None,
            allocated_regions: Vec::new(),
            bottom: std::ptr::null_mut(),
            max: std::ptr::null_mut(),
            summary_bytes_used: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Bytes handed out so far, fillers included.
    pub fn used(&self) -> usize {
        self.summary_bytes_used
    }

    pub fn allocated_regions(&self) -> &[&'a HeapRegion] {
        &self.allocated_regions
    }

    fn alloc_new_region(&mut self) -> bool {
        let region = match self.heap.alloc_highest_free_region() {
            Some(region) => region,
            None => return false,
        };
        debug_assert!(region.is_empty(), "expected empty region {}", region.index());
        if self.open {
            region.set_open_archive();
        } else {
            region.set_closed_archive();
        }
        self.heap.archive_set_add(region);
        log::debug!(
            target: "gc::archive",
            "alloc {} region {}",
            region.region_type().short_name(),
            region.index()
        );
        self.allocated_regions.push(region);
        self.allocation_region = Some(region);
        self.bottom = region.bottom();
        self.max = word_offset(self.bottom, CHUNK_WORDS.min(pointer_delta(region.end(), region.bottom())));
        true
    }

    /// Allocate `word_size` words, or null when no free region is left. Allocations may not
    /// exceed one chunk.
    pub fn allocate(&mut self, word_size: usize) -> *mut u8 {
        assert!(word_size != 0, "size must not be zero");
        assert!(word_size <= CHUNK_WORDS, "{} words exceeds an archive chunk", word_size);
        if self.allocation_region.is_none() && !self.alloc_new_region() {
            return std::ptr::null_mut();
        }
        let mut region = match self.allocation_region {
            Some(region) => region,
            None => return std::ptr::null_mut(),
        };
        let mut old_top = region.top();
        debug_assert!(
            self.bottom >= region.bottom() && self.max <= region.end(),
            "inconsistent allocation state: [{:p}, {:p}) outside {:?}",
            self.bottom,
            self.max,
            region
        );
        debug_assert!(self.bottom <= old_top && old_top <= self.max);

        if word_offset(old_top, word_size) > self.max {
            let remainder = pointer_delta(self.max, old_top);
            if remainder > 0 {
                unsafe {
                    fill_with_objects(old_top, remainder);
                }
                region.bot_part().alloc_block_words(old_top, remainder);
                region.set_top(self.max);
            }
            self.summary_bytes_used += remainder * HEAP_WORD_SIZE;
            self.bottom = self.max;
            self.max = word_offset(self.bottom, CHUNK_WORDS).min(region.end());
            if self.bottom >= region.end() {
                if !self.alloc_new_region() {
                    return std::ptr::null_mut();
                }
                region = match self.allocation_region {
                    Some(region) => region,
                    None => return std::ptr::null_mut(),
                };
            }
            old_top = region.top();
        }
        let new_top = word_offset(old_top, word_size);
        region.bot_part().alloc_block(old_top, new_top);
        region.set_top(new_top);
        self.summary_bytes_used += word_size * HEAP_WORD_SIZE;
        old_top
    }

    /// Pad the last region to `end_alignment` bytes and return the allocated address ranges,
    /// contiguous regions coalesced, lowest range first. The allocated bytes are accounted
    /// to the heap.
    pub fn complete(mut self, end_alignment: usize) -> Vec<MemRange> {
        assert!(
            bytes_to_words(end_alignment) < CHUNK_WORDS,
            "alignment {} too large",
            end_alignment
        );
        assert!(
            is_aligned(end_alignment, HEAP_WORD_SIZE),
            "alignment {} is not word aligned",
            end_alignment
        );
        let mut ranges = Vec::new();
        let last = match self.allocation_region {
            Some(region) => region,
            None => return ranges,
        };

        if end_alignment != 0 {
            let current_top = last.top();
            let new_top = align_up(current_top as usize, end_alignment) as *mut u8;
            let fill_size = pointer_delta(new_top, current_top);
            if fill_size != 0 {
                let fill = self.allocate(fill_size);
                if !fill.is_null() {
                    unsafe {
                        fill_with_objects(fill, fill_size);
                    }
                }
            }
        }

        debug_assert!(self
            .allocated_regions
            .last()
            .map_or(false, |r| std::ptr::eq(*r, last)));
        let mut base = last.bottom();
        let mut top = base;
        for region in self.allocated_regions.iter().rev() {
            if region.bottom() != top {
                ranges.push(MemRange {
                    start: base,
                    word_size: pointer_delta(top, base),
                });
                base = region.bottom();
            }
            top = region.top();
        }
        debug_assert!(top != base, "zero-sized range at {:p}", base);
        ranges.push(MemRange {
            start: base,
            word_size: pointer_delta(top, base),
        });

        self.heap.increase_used(self.summary_bytes_used);
        self.summary_bytes_used = 0;
        self.allocated_regions.clear();
        self.allocation_region = None;
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{header::HeapObjectHeader, Config};

    const REGION: usize = 256 * 1024;
    const REGION_WORDS: usize = REGION / 8;

    fn heap() -> Box<Heap> {
        Heap::new(Config {
            initial_heap_size: 4 * REGION,
            max_heap_size: 32 * REGION,
            region_size: Some(REGION),
            concurrent_uncommit: false,
            ..Default::default()
        })
    }

    #[test]
    fn packs_from_the_top_of_the_heap() {
        let heap = heap();
        let used_before = heap.used();
        let mut archive = heap.archive_allocator(false);
        let a = archive.allocate(100);
        let b = archive.allocate(CHUNK_WORDS);
        let c = archive.allocate(10);
        unsafe {
            HeapObjectHeader::install(a, 100, 1);
            HeapObjectHeader::install(b, CHUNK_WORDS, 2);
            HeapObjectHeader::install(c, 10, 3);
        }
        let indices: Vec<u32> = archive.allocated_regions().iter().map(|r| r.index()).collect();
        assert_eq!(indices, vec![31, 30, 29]);
        assert!(archive.allocated_regions()[0].is_archive());
        assert_eq!(heap.region_at(30).unwrap().bottom(), b);
        assert_eq!(heap.region_at(29).unwrap().bottom(), c);
        // the rest of the first chunk was plugged
        let filler = unsafe { HeapObjectHeader::from_addr(word_offset(a, 100)) };
        assert!(filler.is_filler());
        assert_eq!(filler.size_words(), REGION_WORDS - 100);

        let ranges = archive.complete(4096);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start, c);
        assert_eq!(ranges[0].word_size, 512);
        assert_eq!(ranges[1].start, b);
        assert_eq!(ranges[1].end(), heap.region_at(31).unwrap().end());
        assert_eq!(heap.used() - used_before, 2 * REGION + 4096);

        let stats = heap.statistics();
        assert_eq!(stats.archive_regions, 3);
        heap.verify();
    }

    #[test]
    fn open_archive_and_empty_completion() {
        let heap = heap();
        let archive = heap.archive_allocator(true);
        assert!(archive.is_open());
        assert!(archive.complete(0).is_empty());

        let mut archive = heap.archive_allocator(true);
        let obj = archive.allocate(64);
        unsafe {
            HeapObjectHeader::install(obj, 64, 1);
        }
        let region = heap.heap_region_containing(obj).unwrap();
        assert_eq!(region.region_type(), crate::RegionType::OpenArchive);
        assert_eq!(archive.used(), 64 * 8);
        let ranges = archive.complete(0);
        assert_eq!(
            ranges,
            vec![MemRange {
                start: obj,
                word_size: 64
            }]
        );
        assert_eq!(heap.block_start(word_offset(obj, 63)), obj);
    }
}
