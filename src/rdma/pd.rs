//! Protection domains.

use std::any::Any;
use std::io;
use std::sync::Arc;

use super::mr::{Mr, Permission};
use super::srq::Srq;

/// Protection domain.
pub trait Pd: Send + Sync {
    /// Register a memory area.
    ///
    /// # Safety
    ///
    /// - `[addr, addr + len)` must be valid, allocated memory.
    /// - The memory must outlive the returned region and every work request
    ///   that refers to it.
    unsafe fn reg_mr(&self, addr: *mut u8, len: usize, perm: Permission) -> io::Result<Arc<dyn Mr>>;

    /// Create a shared receive queue on this protection domain.
    fn create_srq(&self, max_wr: u32, max_sge: u32) -> io::Result<Arc<dyn Srq>>;

    fn as_any(&self) -> &dyn Any;
}
