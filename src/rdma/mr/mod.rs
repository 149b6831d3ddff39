//! Memory regions.

mod perm;
mod remote;

use std::fmt;

pub use self::perm::*;
pub use self::remote::*;
use super::type_alias::{LKey, RKey};

/// A registered memory region.
///
/// The region stays registered for as long as the handle lives; dropping the
/// last `Arc` deregisters it. The registered memory itself does not belong to
/// this type, but it must outlive it.
pub trait Mr: Send + Sync {
    /// Get the start address of the registered memory area.
    fn addr(&self) -> u64;

    /// Get the length of the registered memory area.
    fn len(&self) -> usize;

    /// Get the local key of the memory region.
    fn lkey(&self) -> LKey;

    /// Get the remote key of the memory region.
    fn rkey(&self) -> RKey;

    /// Get the permissions the region was registered with.
    fn perm(&self) -> Permission;

    /// Return `true` if `[addr, addr + len)` lies inside this region.
    #[inline]
    fn covers(&self, addr: u64, len: usize) -> bool {
        addr >= self.addr()
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.addr() + self.len() as u64)
    }

    /// Describe a part of this region for a remote peer.
    #[inline]
    fn remote(&self, addr: u64, len: usize) -> MrRemote {
        MrRemote::new(addr, len, self.rkey())
    }
}

impl fmt::Debug for dyn Mr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mr")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .field("lkey", &self.lkey())
            .field("rkey", &self.rkey())
            .finish()
    }
}
