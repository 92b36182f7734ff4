use std::mem::size_of;

/// Size of a heap word in bytes. All sizes handed to the allocation paths are in words.
pub const HEAP_WORD_SIZE: usize = size_of::<usize>();
pub const LOG_HEAP_WORD_SIZE: usize = 3;

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

/// Distance between two addresses in heap words. `end` must not be below `start`.
#[inline(always)]
pub fn pointer_delta(end: *const u8, start: *const u8) -> usize {
    debug_assert!(end >= start, "pointer_delta: {:p} < {:p}", end, start);
    (end as usize - start as usize) >> LOG_HEAP_WORD_SIZE
}

#[inline(always)]
pub fn word_offset(addr: *mut u8, words: usize) -> *mut u8 {
    (addr as usize + (words << LOG_HEAP_WORD_SIZE)) as *mut u8
}

#[inline(always)]
pub const fn words_to_bytes(words: usize) -> usize {
    words << LOG_HEAP_WORD_SIZE
}

#[inline(always)]
pub const fn bytes_to_words(bytes: usize) -> usize {
    bytes >> LOG_HEAP_WORD_SIZE
}

pub fn page_size() -> usize {
    #[cfg(unix)]
    unsafe {
        libc::sysconf(libc::_SC_PAGESIZE) as usize
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

pub struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

pub fn percent_of(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(align_up(13, 8), 16);
        assert_eq!(align_up(16, 8), 16);
        assert_eq!(align_down(4097, 4096), 4096);
        assert!(is_aligned(1 << 20, 4096));
        assert!(!is_aligned(24, 16));
    }

    #[test]
    fn sizes_are_formatted() {
        assert_eq!(formatted_size(512).to_string(), "512B");
        assert_eq!(formatted_size(2048).to_string(), "2.0K");
        assert_eq!(formatted_size(3 * 1024 * 1024).to_string(), "3.0M");
    }
}
