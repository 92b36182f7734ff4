#[cfg(windows)]
pub mod _win {
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE},
    };

    use crate::utils::align_up;

    /// Reserved address range. Pages are committed and uncommitted on demand.
    pub struct VirtualSpace {
        map: *mut u8,
        start: *mut u8,
        end: *mut u8,
    }

    impl VirtualSpace {
        /// Reserve `size` bytes of address space whose start is aligned to `alignment`.
        pub fn reserve(size: usize, alignment: usize) -> Self {
            unsafe {
                let map_size = size + alignment;
                let mem = VirtualAlloc(null_mut(), map_size, MEM_RESERVE, PAGE_NOACCESS) as *mut u8;
                if mem.is_null() {
                    panic!("VirtualAlloc failed to reserve {} bytes", map_size);
                }
                let start = align_up(mem as usize, alignment) as *mut u8;
                Self {
                    map: mem,
                    start,
                    end: start.add(size),
                }
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }
        pub fn size(&self) -> usize {
            self.end as usize - self.start as usize
        }

        pub fn commit(&self, page: *mut u8, size: usize) -> bool {
            unsafe { !VirtualAlloc(page.cast(), size, MEM_COMMIT, PAGE_READWRITE).is_null() }
        }

        pub fn uncommit(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualFree(page.cast(), size, MEM_DECOMMIT);
            }
        }
    }

    impl Drop for VirtualSpace {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.map.cast(), 0, MEM_RELEASE);
            }
        }
    }
}

#[cfg(unix)]
pub mod _unix {
    use crate::utils::align_up;

    /// Reserved address range. Pages are committed and uncommitted on demand.
    pub struct VirtualSpace {
        map: *mut u8,
        map_size: usize,
        start: *mut u8,
        end: *mut u8,
    }

    impl VirtualSpace {
        /// Reserve `size` bytes of address space whose start is aligned to `alignment`.
        /// Nothing is accessible until [`VirtualSpace::commit`] is called for it.
        pub fn reserve(size: usize, alignment: usize) -> Self {
            unsafe {
                let map_size = size + alignment;
                let map = libc::mmap(
                    core::ptr::null_mut(),
                    map_size as _,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    panic!("mmap failed to reserve {} bytes", map_size);
                }
                let start = align_up(map as usize, alignment) as *mut u8;
                Self {
                    map: map as *mut u8,
                    map_size,
                    start,
                    end: start.add(size),
                }
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }
        pub fn size(&self) -> usize {
            self.end as usize - self.start as usize
        }

        pub fn commit(&self, page: *mut u8, size: usize) -> bool {
            debug_assert!(page >= self.start && page as usize + size <= self.end as usize);
            unsafe {
                if libc::mprotect(page as *mut _, size as _, libc::PROT_READ | libc::PROT_WRITE) != 0 {
                    return false;
                }
                libc::madvise(page as *mut _, size as _, libc::MADV_WILLNEED);
            }
            true
        }

        /// Give the pages back to the OS. Contents are lost; the range stays reserved.
        pub fn uncommit(&self, page: *mut u8, size: usize) {
            debug_assert!(page >= self.start && page as usize + size <= self.end as usize);
            unsafe {
                libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
                libc::mprotect(page as *mut _, size as _, libc::PROT_NONE);
            }
        }
    }

    impl Drop for VirtualSpace {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.map as *mut _, self.map_size as _);
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;

unsafe impl Send for VirtualSpace {}
unsafe impl Sync for VirtualSpace {}

impl VirtualSpace {
    /// Write one word into every page of a committed range so the OS backs it eagerly.
    pub fn pretouch(&self, page: *mut u8, size: usize, page_size: usize) {
        let mut cur = page as usize;
        let end = page as usize + size;
        while cur < end {
            unsafe {
                core::ptr::write_volatile(cur as *mut usize, 0);
            }
            cur += page_size;
        }
    }
}
