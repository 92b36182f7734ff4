//! Block offset table.
//!
//! The reserved heap is divided into cards of [`CARD_SIZE`] bytes. For every card the
//! table holds one byte describing where the block covering the first word of the card
//! starts:
//!
//! - values below [`CARD_SIZE_WORDS`] are a word offset back from the card boundary to
//!   the block start;
//! - values `CARD_SIZE_WORDS + i` mean "the block starts at least `BASE^i` cards further
//!   back, go there and look again".
//!
//! A lookup therefore needs a logarithmic number of backward jumps followed by a short
//! forward walk over block headers.
use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc,
};

use memmap2::MmapMut;

use crate::{
    header::block_size,
    utils::{align_up, pointer_delta, word_offset, LOG_HEAP_WORD_SIZE},
};

pub const LOG_CARD_SIZE: usize = 9;
pub const CARD_SIZE: usize = 1 << LOG_CARD_SIZE;
pub const LOG_CARD_SIZE_WORDS: usize = LOG_CARD_SIZE - LOG_HEAP_WORD_SIZE;
pub const CARD_SIZE_WORDS: usize = 1 << LOG_CARD_SIZE_WORDS;

pub const LOG_BASE: usize = 4;
pub const BASE: usize = 1 << LOG_BASE;
/// Number of distinct back-skip powers an entry can encode.
pub const N_POWERS: usize = 14;

#[inline(always)]
pub const fn power_to_cards_back(i: usize) -> usize {
    1 << (LOG_BASE * i)
}

#[inline(always)]
pub const fn entry_to_cards_back(entry: u8) -> usize {
    debug_assert!(entry as usize >= CARD_SIZE_WORDS);
    power_to_cards_back(entry as usize - CARD_SIZE_WORDS)
}

/// Table shared by all regions of a heap, one byte per card of the reserved range.
pub struct BlockOffsetTable {
    map: MmapMut,
    reserved_start: *mut u8,
    reserved_end: *mut u8,
}

unsafe impl Send for BlockOffsetTable {}
unsafe impl Sync for BlockOffsetTable {}

impl BlockOffsetTable {
    pub fn new(reserved_start: *mut u8, reserved_size: usize) -> Self {
        let cards = reserved_size >> LOG_CARD_SIZE;
        let map = MmapMut::map_anon(cards.max(1)).unwrap_or_else(|err| {
            panic!("failed to map block offset table of {} cards: {}", cards, err)
        });
        Self {
            map,
            reserved_start,
            reserved_end: (reserved_start as usize + reserved_size) as *mut u8,
        }
    }

    #[inline(always)]
    fn entry(&self, index: usize) -> &AtomicU8 {
        debug_assert!(index < self.map.len(), "card index {} out of bounds", index);
        unsafe { &*self.map.as_ptr().cast::<AtomicU8>().add(index) }
    }

    #[inline(always)]
    pub fn index_for(&self, addr: *const u8) -> usize {
        debug_assert!(
            addr >= self.reserved_start as *const u8 && addr < self.reserved_end as *const u8,
            "address {:p} outside of reserved heap",
            addr
        );
        (addr as usize - self.reserved_start as usize) >> LOG_CARD_SIZE
    }

    #[inline(always)]
    pub fn address_for_index(&self, index: usize) -> *mut u8 {
        (self.reserved_start as usize + (index << LOG_CARD_SIZE)) as *mut u8
    }

    #[inline(always)]
    pub fn offset_array(&self, index: usize) -> u8 {
        self.entry(index).load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_offset_array(&self, index: usize, offset: u8) {
        self.entry(index).store(offset, Ordering::Relaxed);
    }

    fn set_offset_array_range(&self, left: usize, right: usize, offset: u8) {
        for index in left..=right {
            self.set_offset_array(index, offset);
        }
    }

    /// Make every card in `[start_card, end_card]` point back towards the card just before
    /// `start_card`, using the largest jumps that never overshoot it.
    fn set_remainder_to_point_to_start_incl(&self, start_card: usize, end_card: usize) {
        if start_card > end_card {
            return;
        }
        let mut start_card_for_region = start_card;
        for i in 0..N_POWERS {
            // the card holding the real offset sits at start_card - 1
            let reach = start_card - 1 + (power_to_cards_back(i + 1) - 1);
            let offset = (CARD_SIZE_WORDS + i) as u8;
            if reach >= end_card {
                self.set_offset_array_range(start_card_for_region, end_card, offset);
                return;
            }
            self.set_offset_array_range(start_card_for_region, reach, offset);
            start_card_for_region = reach + 1;
        }
        unreachable!("block spans more cards than the table can encode");
    }

    /// Record the block `[start, end)`. Only cards whose boundary lies inside the block are
    /// touched, so concurrent calls for disjoint blocks never write the same entry.
    pub fn alloc_block(&self, start: *mut u8, end: *mut u8) {
        if start >= end {
            return;
        }
        let first_boundary = align_up(start as usize, CARD_SIZE) as *mut u8;
        if first_boundary >= end {
            return;
        }
        let first_card = self.index_for(first_boundary);
        let end_card = self.index_for((end as usize - 1) as *const u8);
        let offset = pointer_delta(first_boundary, start);
        debug_assert!(offset < CARD_SIZE_WORDS);
        self.set_offset_array(first_card, offset as u8);
        self.set_remainder_to_point_to_start_incl(first_card + 1, end_card);
    }

    /// Start of the block covering the first word of the card containing `addr`.
    pub fn block_start_reaching_into_card(&self, addr: *const u8) -> *mut u8 {
        let mut index = self.index_for(addr);
        let mut offset = self.offset_array(index);
        while offset as usize >= CARD_SIZE_WORDS {
            let n_cards_back = entry_to_cards_back(offset);
            debug_assert!(n_cards_back <= index, "jumped before reserved start");
            index -= n_cards_back;
            offset = self.offset_array(index);
        }
        (self.address_for_index(index) as usize - ((offset as usize) << LOG_HEAP_WORD_SIZE))
            as *mut u8
    }
}

/// A region's view of the shared table.
pub struct BlockOffsetTablePart {
    bot: Arc<BlockOffsetTable>,
    object_can_span: AtomicBool,
}

impl BlockOffsetTablePart {
    pub fn new(bot: Arc<BlockOffsetTable>) -> Self {
        Self {
            bot,
            object_can_span: AtomicBool::new(false),
        }
    }

    pub fn table(&self) -> &BlockOffsetTable {
        &self.bot
    }

    /// Only continues-humongous regions may contain cards whose block starts in an
    /// earlier region.
    pub fn set_object_can_span(&self, can_span: bool) {
        self.object_can_span.store(can_span, Ordering::Relaxed);
    }

    pub fn object_can_span(&self) -> bool {
        self.object_can_span.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn alloc_block(&self, start: *mut u8, end: *mut u8) {
        self.bot.alloc_block(start, end);
    }

    #[inline]
    pub fn alloc_block_words(&self, start: *mut u8, words: usize) {
        self.bot.alloc_block(start, word_offset(start, words));
    }

    /// Start of the block containing `addr`. Requires `bottom <= addr < top` and a fully
    /// parsable `[bottom, top)`.
    pub fn block_start(&self, bottom: *mut u8, addr: *const u8) -> *mut u8 {
        let mut q = self.bot.block_start_reaching_into_card(addr);
        debug_assert!(
            self.object_can_span() || q >= bottom,
            "block start {:p} for {:p} is below region bottom {:p}",
            q,
            addr,
            bottom
        );
        unsafe {
            let mut n = word_offset(q, block_size(q));
            debug_assert!(n > q, "zero sized block at {:p}", q);
            while n as *const u8 <= addr {
                q = n;
                let size = block_size(q);
                debug_assert!(size > 0, "zero sized block at {:p}", q);
                n = word_offset(q, size);
            }
        }
        debug_assert!(q as *const u8 <= addr);
        q
    }

    /// Check that every card boundary in `[bottom, top)` resolves to a block start at or
    /// below it. Used by tests and region verification.
    pub fn verify(&self, bottom: *mut u8, top: *mut u8) -> bool {
        let mut boundary = align_up(bottom as usize, CARD_SIZE);
        while boundary < top as usize {
            let start = self.bot.block_start_reaching_into_card(boundary as *const u8);
            if start as usize > boundary || (!self.object_can_span() && start < bottom) {
                return false;
            }
            boundary += CARD_SIZE;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{fill_with_object, HeapObjectHeader};
    use crate::mmap::VirtualSpace;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    const SPACE: usize = 1024 * 1024;

    fn space() -> (VirtualSpace, Arc<BlockOffsetTable>) {
        let space = VirtualSpace::reserve(SPACE, SPACE);
        assert!(space.commit(space.start(), SPACE));
        let bot = Arc::new(BlockOffsetTable::new(space.start(), SPACE));
        (space, bot)
    }

    #[test]
    fn entries_encode_logarithmic_jumps() {
        let (space, bot) = space();
        let start = space.start();
        // one block covering 300 cards starting mid card
        let block = word_offset(start, 3);
        let end = word_offset(block, 300 * CARD_SIZE_WORDS);
        bot.alloc_block(block, end);
        assert_eq!(bot.offset_array(1) as usize, CARD_SIZE_WORDS - 3);
        assert_eq!(bot.offset_array(2) as usize, CARD_SIZE_WORDS);
        assert_eq!(bot.offset_array(16) as usize, CARD_SIZE_WORDS);
        assert_eq!(bot.offset_array(17) as usize, CARD_SIZE_WORDS + 1);
        assert_eq!(bot.offset_array(256) as usize, CARD_SIZE_WORDS + 1);
        assert_eq!(bot.offset_array(257) as usize, CARD_SIZE_WORDS + 2);
        for card in 1..300 {
            let addr = bot.address_for_index(card);
            assert_eq!(bot.block_start_reaching_into_card(addr), block);
        }
    }

    #[test]
    fn block_start_finds_covering_object() {
        let (space, bot) = space();
        let part = BlockOffsetTablePart::new(bot.clone());
        let bottom = space.start();
        let mut rng = StdRng::seed_from_u64(0x6c6f6f6b);
        let mut top = bottom;
        let mut blocks = vec![];
        let limit = word_offset(bottom, SPACE / 8 - 4096);
        while top < limit {
            let words = match rng.gen_range(0..10) {
                0 => rng.gen_range(CARD_SIZE_WORDS..CARD_SIZE_WORDS * 40),
                _ => rng.gen_range(2..48),
            };
            unsafe {
                HeapObjectHeader::install(top, words, 1);
            }
            part.alloc_block_words(top, words);
            blocks.push((top, words));
            top = word_offset(top, words);
        }
        assert!(part.verify(bottom, top));
        for &(start, words) in blocks.iter() {
            for w in (0..words).step_by(3) {
                let addr = word_offset(start, w);
                assert_eq!(part.block_start(bottom, addr), start);
            }
            assert_eq!(part.block_start(bottom, word_offset(start, words - 1)), start);
        }
    }

    #[test]
    fn filler_after_objects_is_found() {
        let (space, bot) = space();
        let part = BlockOffsetTablePart::new(bot);
        let bottom = space.start();
        unsafe {
            HeapObjectHeader::install(bottom, 10, 1);
            part.alloc_block_words(bottom, 10);
            let filler = word_offset(bottom, 10);
            let filler_words = 5 * CARD_SIZE_WORDS;
            fill_with_object(filler, filler_words);
            part.alloc_block_words(filler, filler_words);
            for w in 0..filler_words {
                assert_eq!(part.block_start(bottom, word_offset(filler, w)), filler);
            }
        }
    }
}
