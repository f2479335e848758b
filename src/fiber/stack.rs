//! Stack allocation for stackful fibers
//!
//! Each stack is mapped with `mmap` and backed by a `PROT_NONE` guard page
//! below it, so a stack overflow faults immediately instead of silently
//! corrupting an adjacent heap allocation — the standard technique used by
//! stackful coroutine crates (`generator`, `corosensei`, `may`).
use std::io;
use std::ptr::NonNull;

/// A fiber's stack: one guard page followed by `size` usable bytes.
///
/// `top()` returns the highest address, since every supported architecture
/// here grows the stack downward.
pub struct Stack {
    /// Base of the guard-page + usable region, as returned by `mmap`.
    mapping: NonNull<u8>,
    /// Total mapped length, including the guard page.
    mapped_len: usize,
    /// Usable length (`mapped_len` minus one guard page).
    usable_len: usize,
}

unsafe impl Send for Stack {}

impl Stack {
    /// Allocate a stack with at least `size` usable bytes, rounded up to a
    /// whole number of pages.
    pub fn new(size: usize) -> io::Result<Self> {
        let page_size = page_size();
        let usable_len = round_up(size.max(page_size), page_size);
        let mapped_len = usable_len + page_size;

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Guard page at the low end: fibers grow the stack downward, so a
        // guard here catches overflow before it walks into whatever mapping
        // happens to sit below.
        let rc = unsafe { libc::mprotect(addr, page_size, libc::PROT_NONE) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(addr, mapped_len) };
            return Err(err);
        }

        Ok(Stack {
            mapping: NonNull::new(addr as *mut u8).unwrap(),
            mapped_len,
            usable_len,
        })
    }

    /// Highest usable address, i.e. where a downward-growing stack starts.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.mapping.as_ptr().add(self.mapped_len) }
    }

    pub fn usable_len(&self) -> usize {
        self.usable_len
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mapping.as_ptr() as *mut libc::c_void, self.mapped_len);
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(n: usize, multiple: usize) -> usize {
    (n + multiple - 1) / multiple * multiple
}
