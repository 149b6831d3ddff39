use std::ops::Range;
use std::sync::Arc;
use std::{fmt, io, slice};

use parking_lot::{Mutex, RwLock};

use super::pinned::PinnedBuf;

/// A fixed-size region carved into equally-sized pages.
pub struct Arena {
    id: usize,
    buf: PinnedBuf,
    page_size: usize,
    free: Mutex<Vec<usize>>,
}

impl Arena {
    fn new(id: usize, page_size: usize, pages: usize) -> io::Result<Self> {
        let buf = PinnedBuf::new(page_size * pages)?;
        Ok(Self {
            id,
            buf,
            page_size,
            free: Mutex::new((0..pages).rev().collect()),
        })
    }

    /// Identifier, unique within the owning pool.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.buf.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whether `[addr, addr + len)` lies inside this arena.
    #[inline]
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        let base = self.base() as usize;
        addr >= base && addr + len <= base + self.len()
    }

    /// Number of pages not handed out.
    pub fn free_pages(&self) -> usize {
        self.free.lock().len()
    }

    fn take_page(&self) -> Option<usize> {
        self.free.lock().pop()
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("base", &self.base())
            .field("len", &self.len())
            .field("free_pages", &self.free_pages())
            .finish()
    }
}

enum Storage {
    Heap(PinnedBuf),
    Page { arena: Arc<Arena>, index: usize },
}

impl Storage {
    fn base(&self) -> *mut u8 {
        match self {
            Storage::Heap(buf) => buf.as_ptr(),
            // SAFETY: the page index is within the arena.
            Storage::Page { arena, index } => unsafe { arena.base().add(index * arena.page_size) },
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Storage::Page { arena, index } = self {
            arena.free.lock().push(*index);
        }
    }
}

/// A cheaply cloneable view of pinned memory.
///
/// All clones of an `IoBuf` share storage; the storage is released when the
/// last view is dropped. Memory behind an `IoBuf` keeps its address for its
/// whole lifetime, so views can be handed to the RDMA device.
#[derive(Clone)]
pub struct IoBuf {
    storage: Arc<Storage>,
    offset: usize,
    len: usize,
}

impl IoBuf {
    /// Allocate a zeroed buffer on the heap, outside any arena.
    pub fn new(len: usize) -> io::Result<Self> {
        Ok(Self {
            storage: Arc::new(Storage::Heap(PinnedBuf::new(len)?)),
            offset: 0,
            len,
        })
    }

    /// Allocate a heap buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> io::Result<Self> {
        let mut buf = PinnedBuf::new(data.len())?;
        buf.as_mut_slice().copy_from_slice(data);
        Ok(Self {
            storage: Arc::new(Storage::Heap(buf)),
            offset: 0,
            len: data.len(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first byte of this view.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        // SAFETY: `offset` is within the storage.
        unsafe { self.storage.base().add(self.offset) }
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.as_ptr() as usize
    }

    /// Id of the pool arena backing this view, if any.
    pub fn arena_id(&self) -> Option<usize> {
        match &*self.storage {
            Storage::Page { arena, .. } => Some(arena.id()),
            Storage::Heap(_) => None,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the view is within initialized, live storage.
        unsafe { slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    /// Mutable access, available only while this is the sole view.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let (ptr, len) = (self.as_ptr(), self.len);
        Arc::get_mut(&mut self.storage).map(|_| {
            // SAFETY: no other view of the storage exists.
            unsafe { slice::from_raw_parts_mut(ptr, len) }
        })
    }

    /// Sub-view of `range` relative to this view. Return `None` if the range
    /// is out of bounds.
    pub fn slice(&self, range: Range<usize>) -> Option<IoBuf> {
        if range.start <= range.end && range.end <= self.len {
            Some(IoBuf {
                storage: self.storage.clone(),
                offset: self.offset + range.start,
                len: range.end - range.start,
            })
        } else {
            None
        }
    }

    /// Shorten the view to at most `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Whether `other` immediately follows this view in the same storage.
    pub fn is_followed_by(&self, other: &IoBuf) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage) && self.offset + self.len == other.offset
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}

impl AsRef<[u8]> for IoBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for IoBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuf")
            .field("addr", &self.as_ptr())
            .field("len", &self.len)
            .field("arena", &self.arena_id())
            .finish()
    }
}

/// Total length of a vector of buffers.
pub fn iov_len(iov: &[IoBuf]) -> usize {
    iov.iter().map(IoBuf::len).sum()
}

/// Merge adjacent views of the same storage.
pub fn coalesce(iov: Vec<IoBuf>) -> Vec<IoBuf> {
    let mut out: Vec<IoBuf> = Vec::with_capacity(iov.len());
    for buf in iov {
        match out.last_mut() {
            Some(last) if last.is_followed_by(&buf) => last.len += buf.len,
            _ => out.push(buf),
        }
    }
    out
}

/// Callback invoked once for every arena of a pool.
pub type ArenaHook = Box<dyn Fn(&Arc<Arena>) + Send + Sync>;

/// General-purpose pool of pinned buffers.
///
/// Requests up to one page are served from arenas; larger requests get a
/// dedicated heap allocation. Arenas are never freed while the pool lives,
/// which lets devices register each arena once and reuse the registration
/// for every buffer carved from it.
pub struct IoBufPool {
    page_size: usize,
    arena_pages: usize,
    arenas: RwLock<Vec<Arc<Arena>>>,
    hooks: Mutex<Vec<Arc<ArenaHook>>>,
}

impl IoBufPool {
    pub fn new(page_size: usize, arena_pages: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            arena_pages: arena_pages.max(1),
            arenas: RwLock::new(Vec::new()),
            hooks: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Snapshot of the current arenas.
    pub fn arenas(&self) -> Vec<Arc<Arena>> {
        self.arenas.read().clone()
    }

    /// Register a hook called for every existing and future arena.
    pub fn on_arena(&self, hook: ArenaHook) {
        let hook = Arc::new(hook);
        self.hooks.lock().push(hook.clone());
        for arena in self.arenas() {
            hook(&arena);
        }
    }

    /// Allocate a zeroed buffer of `len` bytes.
    pub fn alloc(&self, len: usize) -> io::Result<IoBuf> {
        if len > self.page_size {
            return IoBuf::new(len);
        }

        let found = self
            .arenas
            .read()
            .iter()
            .find_map(|a| a.take_page().map(|i| (a.clone(), i)));
        let (arena, index) = match found {
            Some(x) => x,
            None => {
                let arena = self.grow()?;
                let index = arena
                    .take_page()
                    .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
                (arena, index)
            }
        };

        let storage = Storage::Page { arena, index };
        // SAFETY: the page is exclusively ours until `storage` drops.
        unsafe { storage.base().write_bytes(0, self.page_size) };
        Ok(IoBuf {
            storage: Arc::new(storage),
            offset: 0,
            len,
        })
    }

    /// Allocate a buffer holding a copy of `data`.
    pub fn alloc_from(&self, data: &[u8]) -> io::Result<IoBuf> {
        let buf = self.alloc(data.len())?;
        // SAFETY: the buffer is fresh, unshared and `data.len()` bytes long.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), buf.as_ptr(), data.len()) };
        Ok(buf)
    }

    fn grow(&self) -> io::Result<Arc<Arena>> {
        let arena = {
            let mut arenas = self.arenas.write();
            let arena = Arc::new(Arena::new(arenas.len(), self.page_size, self.arena_pages)?);
            arenas.push(arena.clone());
            arena
        };
        log::debug!("buffer pool grew to arena #{} ({} bytes)", arena.id(), arena.len());

        let hooks = self.hooks.lock().clone();
        for hook in hooks {
            hook(&arena);
        }
        Ok(arena)
    }
}

impl fmt::Debug for IoBufPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBufPool")
            .field("page_size", &self.page_size)
            .field("arena_pages", &self.arena_pages)
            .field("arenas", &self.arenas.read().len())
            .finish()
    }
}
