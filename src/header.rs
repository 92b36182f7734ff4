use crate::utils::{pointer_delta, word_offset, HEAP_WORD_SIZE};
use modular_bitfield::prelude::*;
use std::mem::size_of;

// Every block in a region starts with a HeapObjectHeader. The engine itself only
// needs the size of a block to walk a region, everything else belongs to the
// embedder.
//
// +-----------------+------+------------------------------------------+
// | name            | bits |                                          |
// +-----------------+------+------------------------------------------+
// | size            |   48 | Block size in heap words, header included|
// | filler          |    1 | Set for dummy objects plugging holes.    |
// | unused          |   15 |                                          |
// +-----------------+------+------------------------------------------+
// | type id         |   64 | Opaque to the engine.                    |
// +-----------------+------+------------------------------------------+
//
// A zero size word means "no object here yet" and is never produced by
// `install` or the fill routines.
#[repr(C)]
pub struct HeapObjectHeader {
    encoded: u64,
    type_id: u64,
}

#[bitfield(bits = 64)]
#[repr(u64)]
#[derive(Clone, Copy)]
pub struct EncodedHeader {
    size: B48,
    filler: bool,
    #[skip]
    __: B15,
}

/// Smallest real object, a bare header.
pub const MIN_OBJECT_WORDS: usize = size_of::<HeapObjectHeader>() / HEAP_WORD_SIZE;
/// Smallest block that can be turned into a filler object. Fillers only carry the
/// encoded word, so any hole can be plugged.
pub const MIN_FILL_WORDS: usize = 1;
/// Largest block a single header can describe.
pub const MAX_BLOCK_WORDS: usize = (1 << 48) - 1;

impl HeapObjectHeader {
    /// Write a header for a block of `word_size` words at `addr`.
    ///
    /// # Safety
    /// `addr` must point to at least `word_size` writable words.
    #[inline]
    pub unsafe fn install(addr: *mut u8, word_size: usize, type_id: u64) -> *mut Self {
        debug_assert!(word_size >= MIN_OBJECT_WORDS && word_size <= MAX_BLOCK_WORDS);
        let header = addr.cast::<Self>();
        header.write(Self {
            encoded: EncodedHeader::new().with_size(word_size as u64).into(),
            type_id,
        });
        header
    }

    /// # Safety
    /// `addr` must be the start of a block.
    #[inline(always)]
    pub unsafe fn from_addr<'a>(addr: *const u8) -> &'a Self {
        &*addr.cast::<Self>()
    }

    #[inline(always)]
    pub fn size_words(&self) -> usize {
        EncodedHeader::from(self.encoded).size() as usize
    }

    #[inline(always)]
    pub fn is_filler(&self) -> bool {
        EncodedHeader::from(self.encoded).filler()
    }

    #[inline(always)]
    pub fn type_id(&self) -> u64 {
        self.type_id
    }

    pub fn payload(&self) -> *mut u8 {
        (self as *const Self as usize + size_of::<Self>()) as _
    }
}

/// Size in words of the block starting at `addr`.
///
/// # Safety
/// `addr` must be the start of an initialized block.
#[inline(always)]
pub unsafe fn block_size(addr: *const u8) -> usize {
    HeapObjectHeader::from_addr(addr).size_words()
}

/// Plug `words` words at `addr` with a single filler object.
///
/// # Safety
/// The range must be writable and not in use by anybody else.
pub unsafe fn fill_with_object(addr: *mut u8, words: usize) {
    assert!(
        words >= MIN_FILL_WORDS,
        "cannot fill {} words at {:p}, minimum is {}",
        words,
        addr,
        MIN_FILL_WORDS
    );
    debug_assert!(words <= MAX_BLOCK_WORDS);
    let encoded: u64 = EncodedHeader::new()
        .with_size(words as u64)
        .with_filler(true)
        .into();
    addr.cast::<u64>().write(encoded);
}

/// Plug an arbitrarily large range with as few filler objects as possible.
///
/// # Safety
/// Same as [`fill_with_object`].
pub unsafe fn fill_with_objects(addr: *mut u8, words: usize) {
    let mut cur = addr;
    let mut remaining = words;
    while remaining > MAX_BLOCK_WORDS {
        // never leave a tail too small to fill
        let chunk = MAX_BLOCK_WORDS - MIN_FILL_WORDS;
        fill_with_object(cur, chunk);
        cur = word_offset(cur, chunk);
        remaining -= chunk;
    }
    fill_with_object(cur, remaining);
}

/// # Safety
/// Same as [`fill_with_object`].
pub unsafe fn fill_with_dummy_object(start: *mut u8, end: *mut u8) {
    fill_with_objects(start, pointer_delta(end, start));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_size_and_kind() {
        let mut mem = [0usize; 16];
        let addr = mem.as_mut_ptr().cast::<u8>();
        unsafe {
            HeapObjectHeader::install(addr, 16, 7);
            let header = HeapObjectHeader::from_addr(addr);
            assert_eq!(header.size_words(), 16);
            assert!(!header.is_filler());
            assert_eq!(header.type_id(), 7);

            fill_with_object(addr, 4);
            assert_eq!(block_size(addr), 4);
            assert!(HeapObjectHeader::from_addr(addr).is_filler());

            fill_with_object(addr.add(15 * HEAP_WORD_SIZE), 1);
            assert_eq!(block_size(addr.add(15 * HEAP_WORD_SIZE)), 1);
        }
    }

    #[test]
    #[should_panic]
    fn filler_below_minimum_is_rejected() {
        let mut mem = [0usize; 4];
        unsafe { fill_with_object(mem.as_mut_ptr().cast(), MIN_FILL_WORDS - 1) }
    }
}
