use std::ffi::c_void;
use std::ptr::NonNull;
use std::{fmt, io, slice};

use crate::utils::interop::*;

/// System page size, falling back to 4 KiB if it cannot be queried.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

/// A page-aligned, zero-initialized heap allocation that is locked into
/// physical memory when the system allows it.
///
/// The address of a `PinnedBuf` never changes, so it can be registered with
/// an RDMA device for as long as the buffer lives.
pub struct PinnedBuf {
    ptr: NonNull<u8>,
    len: usize,
    locked: bool,
}

// SAFETY: `PinnedBuf` uniquely owns its allocation.
unsafe impl Send for PinnedBuf {}
unsafe impl Sync for PinnedBuf {}

impl PinnedBuf {
    /// Allocate `len` bytes. A zero length still allocates one byte so that
    /// the buffer has a valid address.
    pub fn new(len: usize) -> io::Result<Self> {
        let mut ptr = std::ptr::null_mut::<c_void>();
        let size = len.max(1);

        // SAFETY: `ptr` is a valid out-pointer and the alignment is a power
        // of two multiple of `sizeof(void *)`.
        from_c_ret(unsafe { libc::posix_memalign(&mut ptr, page_size(), size) })?;
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;

        // SAFETY: the allocation is `size` bytes long.
        unsafe { ptr.as_ptr().write_bytes(0, size) };

        // SAFETY: the range is owned by this allocation.
        let locked = match from_c_errno(unsafe { libc::mlock(ptr.as_ptr() as *const c_void, size) }) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("mlock of {} bytes failed: {}", size, e);
                false
            }
        };
        Ok(Self { ptr, len, locked })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the pages are locked in memory.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation is valid and initialized for `len` bytes.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PinnedBuf {
    fn drop(&mut self) {
        // SAFETY: the pointer came from `posix_memalign` and is freed once.
        unsafe {
            if self.locked {
                libc::munlock(self.ptr.as_ptr() as *const c_void, self.len.max(1));
            }
            libc::free(self.ptr.as_ptr() as *mut c_void);
        }
    }
}

impl fmt::Debug for PinnedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedBuf")
            .field("addr", &self.ptr)
            .field("len", &self.len)
            .field("locked", &self.locked)
            .finish()
    }
}
