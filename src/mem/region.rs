use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::iobuf::{Arena, IoBuf};
use crate::proto::Segment;
use crate::rdma::mr::{Mr, Permission};
use crate::rdma::pd::Pd;
use crate::rdma::wr::Sge;

/// Registration statistics of one device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegStats {
    /// Registrations made for a single exchange.
    pub fresh_registrations: u64,
    /// Registrations served by a pre-registered arena.
    pub arena_hits: u64,
}

/// A buffer registered for one transfer.
///
/// Holds the buffer alive for as long as the remote side may access it.
/// Dropping a fresh region deregisters it; dropping an arena-backed region
/// leaves the arena registration in place.
pub struct RegisteredRegion {
    buf: IoBuf,
    mr: Arc<dyn Mr>,
    fresh: bool,
}

impl RegisteredRegion {
    #[inline]
    pub fn buf(&self) -> &IoBuf {
        &self.buf
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        self.mr.lkey()
    }

    #[inline]
    pub fn rkey(&self) -> u32 {
        self.mr.rkey()
    }

    /// Whether this region owns its own registration.
    #[inline]
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Wire descriptor of the whole buffer.
    pub fn segment(&self) -> Segment {
        Segment::new(self.mr.rkey(), self.buf.len() as u32, self.buf.addr() as u64)
    }

    /// Local scatter/gather entry of the whole buffer.
    pub fn sge(&self) -> Sge {
        Sge {
            addr: self.buf.addr() as u64,
            length: self.buf.len() as u32,
            lkey: self.mr.lkey(),
        }
    }

    /// Release the registration now.
    pub fn deregister(self) {
        if self.fresh {
            log::trace!("deregistering {:#x}+{}", self.buf.addr(), self.buf.len());
        }
    }
}

impl fmt::Debug for RegisteredRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredRegion")
            .field("addr", &format_args!("{:#x}", self.buf.addr()))
            .field("len", &self.buf.len())
            .field("rkey", &self.mr.rkey())
            .field("fresh", &self.fresh)
            .finish()
    }
}

fn arena_perm() -> Permission {
    Permission::LOCAL_WRITE | Permission::REMOTE_READ | Permission::REMOTE_WRITE
}

struct ArenaReg {
    base: usize,
    len: usize,
    mr: Arc<dyn Mr>,
}

/// Per-device memory registration.
///
/// Keeps the index of pre-registered pool arenas and serializes every
/// registration made on the device.
pub struct MemRegistry {
    pd: Arc<dyn Pd>,
    arenas: Mutex<Vec<ArenaReg>>,
    reg_lock: Mutex<()>,
    fresh: AtomicU64,
    hits: AtomicU64,
}

impl MemRegistry {
    pub fn new(pd: Arc<dyn Pd>) -> Self {
        Self {
            pd,
            arenas: Mutex::new(Vec::new()),
            reg_lock: Mutex::new(()),
            fresh: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    pub fn pd(&self) -> &Arc<dyn Pd> {
        &self.pd
    }

    /// Pre-register a pool arena.
    pub fn register_arena(&self, arena: &Arc<Arena>) -> io::Result<()> {
        let mr = {
            let _guard = self.reg_lock.lock();
            // SAFETY: arenas live as long as the pool, which outlives devices.
            unsafe { self.pd.reg_mr(arena.base(), arena.len(), arena_perm())? }
        };
        self.arenas.lock().push(ArenaReg {
            base: arena.base() as usize,
            len: arena.len(),
            mr,
        });
        log::debug!("pre-registered arena #{} ({} bytes)", arena.id(), arena.len());
        Ok(())
    }

    /// Number of pre-registered arenas.
    pub fn arena_count(&self) -> usize {
        self.arenas.lock().len()
    }

    fn arena_mr(&self, addr: usize, len: usize, perm: Permission) -> Option<Arc<dyn Mr>> {
        self.arenas
            .lock()
            .iter()
            .find(|r| addr >= r.base && addr + len <= r.base + r.len && r.mr.perm().contains(perm))
            .map(|r| r.mr.clone())
    }

    /// Register `buf` for a remote transfer with `perm`, reusing an arena
    /// registration when the buffer lies inside one.
    pub fn register_for_transfer(&self, buf: &IoBuf, perm: Permission) -> io::Result<RegisteredRegion> {
        if let Some(mr) = self.arena_mr(buf.addr(), buf.len(), perm) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(RegisteredRegion {
                buf: buf.clone(),
                mr,
                fresh: false,
            });
        }

        let mr = {
            let _guard = self.reg_lock.lock();
            // SAFETY: the region keeps a view of the buffer, so the memory
            // outlives the registration.
            unsafe { self.pd.reg_mr(buf.as_ptr(), buf.len(), perm)? }
        };
        self.fresh.fetch_add(1, Ordering::Relaxed);
        Ok(RegisteredRegion {
            buf: buf.clone(),
            mr,
            fresh: true,
        })
    }

    /// Register every buffer of `iov`. Nothing stays registered on failure.
    pub fn register_all(&self, iov: &[IoBuf], perm: Permission) -> io::Result<Vec<RegisteredRegion>> {
        iov.iter().map(|buf| self.register_for_transfer(buf, perm)).collect()
    }

    pub fn stats(&self) -> RegStats {
        RegStats {
            fresh_registrations: self.fresh.load(Ordering::Relaxed),
            arena_hits: self.hits.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for MemRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemRegistry")
            .field("arenas", &self.arena_count())
            .field("stats", &self.stats())
            .finish()
    }
}
