use std::collections::HashSet;

use crossbeam_utils::thread;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    header::{HeapObjectHeader, MIN_OBJECT_WORDS},
    heap::Heap,
    region::RegionType,
    utils::{pointer_delta, word_offset},
    Config, Destination,
};

const REGION: usize = 256 * 1024;
const REGION_WORDS: usize = REGION / 8;

fn config() -> Config {
    Config {
        initial_heap_size: 8 * REGION,
        max_heap_size: 64 * REGION,
        region_size: Some(REGION),
        concurrent_uncommit: false,
        ..Default::default()
    }
}

#[test]
pub fn test_concurrent_mutators_never_overlap() {
    let heap = Heap::new(config());
    let ranges = thread::scope(|scope| {
        let handles: Vec<_> = (0..8u64)
            .map(|id| {
                let heap = &*heap;
                scope.spawn(move |_| {
                    let mut rng = StdRng::seed_from_u64(id);
                    let mut ranges = Vec::new();
                    for _ in 0..2000 {
                        let words = rng.gen_range(MIN_OBJECT_WORDS..128);
                        let obj = heap.mem_allocate(words);
                        assert!(!obj.is_null());
                        unsafe {
                            HeapObjectHeader::install(obj, words, id);
                        }
                        ranges.push((obj as usize, words));
                    }
                    ranges
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    })
    .unwrap();

    let mut sorted = ranges.clone();
    sorted.sort_unstable();
    for pair in sorted.windows(2) {
        let (start, words) = pair[0];
        assert!(start + words * 8 <= pair[1].0, "overlapping blocks at {:#x}", start);
    }
    for &(start, words) in &ranges {
        let region = heap.heap_region_containing(start as *const u8).unwrap();
        assert!(region.is_eden());
        assert!(start + words * 8 <= region.end() as usize);
        // the block was written by its owner only
        let header = unsafe { HeapObjectHeader::from_addr(start as *const u8) };
        assert_eq!(header.size_words(), words);
    }
    heap.release_mutator_alloc_regions();
    heap.verify();
    heap.init_mutator_alloc_regions();
}

#[test]
pub fn test_retire_with_fill_is_walkable() {
    let heap = Heap::new(config());
    heap.init_gc_alloc_regions();
    let mut actual = 0;
    let obj = heap.par_allocate_during_gc(Destination::Young, 100, 100, &mut actual, 0);
    assert!(!obj.is_null());
    unsafe {
        HeapObjectHeader::install(obj, 100, 7);
    }
    let region = heap.heap_region_containing(obj).unwrap();
    let prior_top = region.top();
    heap.allocator()
        .survivor_gc_alloc_region(0)
        .retire(true, &*heap);
    assert_eq!(region.top(), region.end());
    assert_eq!(region.pre_dummy_top(), prior_top);

    let mut addr = prior_top;
    while addr < region.end() {
        assert_eq!(heap.block_start(addr), prior_top);
        addr = word_offset(addr, 1);
    }
    let filler = unsafe { HeapObjectHeader::from_addr(prior_top) };
    assert!(filler.is_filler());
    assert_eq!(filler.size_words(), pointer_delta(region.end(), prior_top));
    assert_eq!(heap.block_start(word_offset(obj, 99)), obj);

    heap.release_gc_alloc_regions();
    heap.verify();
}

#[test]
pub fn test_block_offset_round_trip() {
    let heap = Heap::new(config());
    let index = heap
        .region_manager()
        .allocate_free_region(RegionType::Old, 0)
        .unwrap();
    let region = heap.region_manager().table().at(index);
    region.set_old();

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut starts = Vec::new();
    loop {
        let words = if rng.gen_bool(0.05) {
            rng.gen_range(64..2048)
        } else {
            rng.gen_range(MIN_OBJECT_WORDS..48)
        };
        let obj = region.allocate(words);
        if obj.is_null() {
            break;
        }
        unsafe {
            HeapObjectHeader::install(obj, words, 0);
        }
        starts.push(obj as usize);
    }
    assert!(region.bot_part().verify(region.bottom(), region.top()));

    let mut addr = region.bottom();
    while addr < region.top() {
        let expected = match starts.binary_search(&(addr as usize)) {
            Ok(i) => starts[i],
            Err(i) => starts[i - 1],
        };
        assert_eq!(region.block_start(addr) as usize, expected);
        addr = word_offset(addr, 1);
    }
}

#[test]
pub fn test_expand_shrink_round_trip() {
    let heap = Heap::new(Config {
        initial_heap_size: 0,
        ..config()
    });
    let hrm = heap.region_manager();
    let before = hrm.available() + hrm.length();
    assert_eq!(hrm.expand_by(12), 12);
    assert_eq!(hrm.num_free_regions(), 12);
    assert_eq!(hrm.shrink_by(12), 12);
    assert_eq!(hrm.num_free_regions(), 0);
    assert_eq!(hrm.length(), 0);
    assert_eq!(hrm.num_inactive_regions(), 12);
    assert_eq!(hrm.available() + hrm.length(), before);
    hrm.uncommit_inactive_regions(usize::MAX);
    assert_eq!(hrm.num_inactive_regions(), 0);
    hrm.verify();
}

#[test]
pub fn test_humongous_beyond_committed() {
    let heap = Heap::new(Config {
        initial_heap_size: 0,
        ..config()
    });
    assert_eq!(heap.num_committed_regions(), 0);
    let obj = heap.mem_allocate(4 * REGION_WORDS + 1);
    assert!(!obj.is_null());
    assert_eq!(heap.num_committed_regions(), 5);
    assert_eq!(heap.num_free_regions(), 0);
    let first = heap.heap_region_containing(obj).unwrap();
    for index in first.index()..first.index() + 5 {
        let region = heap.region_at(index).unwrap();
        assert!(region.is_humongous());
        assert_eq!(region.humongous_start_region(), first.index());
    }
    heap.verify();
}

#[test]
pub fn test_humongous_runs_are_free_at_allocation() {
    let heap = Heap::new(config());
    let mut seen = HashSet::new();
    // interleave small objects so some regions are in use
    for _ in 0..4 {
        let small = heap.mem_allocate(REGION_WORDS / 4);
        assert!(!small.is_null());
        let obj = heap.mem_allocate(REGION_WORDS + 7);
        assert!(!obj.is_null());
        let first = heap.heap_region_containing(obj).unwrap().index();
        for index in first..first + 2 {
            assert!(seen.insert(index), "region {} handed out twice", index);
        }
        let small_region = heap.heap_region_containing(small).unwrap().index();
        assert!(!(first..first + 2).contains(&small_region));
    }
    assert_eq!(heap.statistics().humongous_regions, 8);
}

#[test]
pub fn test_plab_waste_bound() {
    let heap = Heap::new(Config {
        parallel_gc_buffer_waste_pct: 10,
        young_plab_size: 1024,
        gc_workers: 1,
        ..config()
    });
    heap.init_gc_alloc_regions();
    let buffer_words = heap.desired_plab_size(Destination::Young);
    let limit = buffer_words * 10 / 100;
    {
        let mut plab = heap.new_plab_allocator();
        let mut rng = StdRng::seed_from_u64(42);
        let mut refill_failed = false;
        let mut refills = 0;
        let mut last_remaining = 0;
        for _ in 0..5000 {
            let words = if rng.gen_bool(0.1) {
                rng.gen_range(limit..buffer_words)
            } else {
                rng.gen_range(MIN_OBJECT_WORDS..limit)
            };
            let wasted_before = plab.waste().0;
            let remaining_before = plab.alloc_buffer(Destination::Young, 0).words_remaining();
            let direct_before = plab.direct_allocated(Destination::Young);
            let obj = plab.allocate(Destination::Young, words, &mut refill_failed, 0);
            assert!(!obj.is_null());
            let wasted = plab.waste().0 - wasted_before;
            if wasted > 0 {
                refills += 1;
                assert_eq!(wasted, remaining_before);
                assert!(wasted < limit, "wasted {} of a {} word buffer", wasted, buffer_words);
            }
            if plab.direct_allocated(Destination::Young) > direct_before {
                // large objects leave the buffer alone
                assert!(words * 100 >= buffer_words * 10);
                assert_eq!(
                    plab.alloc_buffer(Destination::Young, 0).words_remaining(),
                    remaining_before
                );
            }
            last_remaining = plab.alloc_buffer(Destination::Young, 0).words_remaining();
        }
        assert!(refills > 0);
        assert!(last_remaining <= buffer_words);
        assert!(!refill_failed);
        plab.flush_and_retire_stats();
    }
    heap.release_gc_alloc_regions();
    let stats = heap.plab_stats(Destination::Young);
    assert!(stats.allocated() > 0);
    assert!(stats.direct_allocated() > 0);
    heap.flush_plab_stats();
    assert_eq!(stats.allocated(), 0);
}

#[test]
pub fn test_evacuation_pause_cycle() {
    let heap = Heap::new(config());
    let mut eden = Vec::new();
    for _ in 0..(3 * REGION_WORDS / 32) {
        let obj = heap.mem_allocate(32);
        unsafe {
            HeapObjectHeader::install(obj, 32, 1);
        }
        eden.push(obj);
    }
    heap.release_mutator_alloc_regions();
    let eden_regions: Vec<u32> = {
        let mut set: Vec<u32> = eden
            .iter()
            .map(|&obj| heap.heap_region_containing(obj).unwrap().index())
            .collect();
        set.sort_unstable();
        set.dedup();
        set
    };
    assert_eq!(eden_regions.len(), 3);

    // copy every other object
    heap.init_gc_alloc_regions();
    {
        let mut plab = heap.new_plab_allocator();
        let mut refill_failed = false;
        for (i, _) in eden.iter().enumerate().filter(|(i, _)| i % 2 == 0) {
            let dest = if i % 4 == 0 {
                Destination::Young
            } else {
                Destination::Old
            };
            let copy = plab.allocate(dest, 32, &mut refill_failed, 0);
            assert!(!copy.is_null());
            unsafe {
                HeapObjectHeader::install(copy, 32, 2);
            }
        }
    }
    heap.release_gc_alloc_regions();
    heap.flush_plab_stats();
    heap.free_regions(&eden_regions);
    heap.init_mutator_alloc_regions();

    let stats = heap.statistics();
    assert_eq!(stats.eden_regions, 0);
    assert!(stats.survivor_regions >= 1);
    assert!(stats.old_regions >= 1);
    assert!(heap.used() >= 3 * REGION / 2);
    assert!(heap.used() < 3 * REGION);
    heap.verify();
}

#[test]
pub fn test_plab_stats_survive_an_exactly_filled_buffer() {
    let heap = Heap::new(config());
    heap.init_gc_alloc_regions();
    let buffer_words = heap.desired_plab_size(Destination::Young);
    {
        let mut plab = heap.new_plab_allocator();
        let mut refill_failed = false;
        let first = plab.allocate(Destination::Young, buffer_words / 20, &mut refill_failed, 0);
        assert!(!first.is_null());
        let remaining = plab.alloc_buffer(Destination::Young, 0).words_remaining();
        assert_eq!(remaining, buffer_words - buffer_words / 20);
        let rest = plab.allocate(Destination::Young, remaining, &mut refill_failed, 0);
        assert_eq!(rest, word_offset(first, buffer_words / 20));
        assert_eq!(plab.alloc_buffer(Destination::Young, 0).words_remaining(), 0);
        assert!(!refill_failed);
        // dropped without an explicit flush
    }
    let stats = heap.plab_stats(Destination::Young);
    assert_eq!(stats.allocated(), buffer_words);
    assert_eq!(stats.wasted(), 0);
    assert_eq!(stats.unused(), 0);
    assert_eq!(stats.used(), buffer_words);
    heap.release_gc_alloc_regions();
}

#[test]
pub fn test_direct_allocations_are_flushed_on_drop() {
    let heap = Heap::new(config());
    heap.init_gc_alloc_regions();
    let buffer_words = heap.desired_plab_size(Destination::Old);
    {
        let mut plab = heap.new_plab_allocator();
        let mut refill_failed = false;
        // too large to be worth a new buffer
        let obj = plab.allocate(Destination::Old, buffer_words / 2, &mut refill_failed, 0);
        assert!(!obj.is_null());
        assert_eq!(plab.direct_allocated(Destination::Old), buffer_words / 2);
        assert_eq!(plab.alloc_buffer(Destination::Old, 0).words_remaining(), 0);
    }
    assert_eq!(
        heap.plab_stats(Destination::Old).direct_allocated(),
        buffer_words / 2
    );
    heap.release_gc_alloc_regions();
}

#[test]
pub fn test_unknown_node_uses_the_first_buffer() {
    let heap = Heap::new(config());
    heap.init_gc_alloc_regions();
    {
        let mut plab = heap.new_plab_allocator();
        let mut refill_failed = false;
        let obj = plab.allocate(Destination::Young, 16, &mut refill_failed, crate::region::UNKNOWN_NODE);
        assert!(!obj.is_null());
        assert!(plab.alloc_buffer(Destination::Young, 0).contains(obj));
        let survivor = heap.allocator().survivor_gc_alloc_region(crate::region::UNKNOWN_NODE);
        assert!(std::ptr::eq(
            survivor,
            heap.allocator().survivor_gc_alloc_region(0)
        ));
        plab.flush_and_retire_stats();
    }
    heap.release_gc_alloc_regions();
}
