//! Posts: pinned, registered buffers used for one send or receive at a time.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use super::error::PostError;
use super::msg::ReplyInfo;
use super::stats::PoolStats;
use crate::mem::{IoBuf, PinnedBuf, RegisteredRegion};
use crate::rdma::mr::{Mr, Permission};
use crate::rdma::pd::Pd;
use crate::rdma::type_alias::WrId;
use crate::rdma::wr::Sge;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PostKind {
    Send,
    Recv,
}

const RECV_BIT: u64 = 1 << 63;

/// Work request id of a post.
#[inline]
pub(crate) fn encode_wr_id(kind: PostKind, index: u32) -> WrId {
    match kind {
        PostKind::Send => index as u64,
        PostKind::Recv => RECV_BIT | index as u64,
    }
}

/// Pool and slot named by a work request id.
#[inline]
pub(crate) fn decode_wr_id(wr_id: WrId) -> (PostKind, u32) {
    let kind = if wr_id & RECV_BIT != 0 {
        PostKind::Recv
    } else {
        PostKind::Send
    };
    (kind, wr_id as u32)
}

/// Per-message bookkeeping attached to a post while it is in use.
#[derive(Default)]
pub(crate) struct PostCtx {
    /// Vectors of a received message.
    pub vectors: Vec<IoBuf>,
    /// Registrations that must outlive the post's work requests.
    pub regions: Vec<RegisteredRegion>,
    /// RDMA reads still outstanding for this message.
    pub pending_reads: u32,
    /// A read could not be issued; the message is dropped.
    pub read_failed: bool,
    pub reply_info: Option<ReplyInfo>,
    pub is_request: bool,
    pub xid: u32,
}

pub(crate) struct PostState {
    refs: u32,
    active: bool,
    pub ctx: PostCtx,
    pub buf: PinnedBuf,
}

impl PostState {
    #[cfg(test)]
    pub fn refs(&self) -> u32 {
        self.refs
    }
}

pub(crate) struct Post {
    kind: PostKind,
    index: u32,
    addr: u64,
    len: usize,
    mr: Arc<dyn Mr>,
    state: Mutex<PostState>,
}

impl Post {
    fn new(pd: &dyn Pd, kind: PostKind, index: u32, len: usize) -> Result<Self, PostError> {
        let buf = PinnedBuf::new(len)?;
        // SAFETY: the buffer is owned by the post and dropped after the MR.
        let mr = unsafe { pd.reg_mr(buf.as_ptr(), len, Permission::LOCAL_WRITE)? };
        Ok(Self {
            kind,
            index,
            addr: buf.as_ptr() as u64,
            len,
            mr,
            state: Mutex::new(PostState {
                refs: 0,
                active: false,
                ctx: PostCtx::default(),
                buf,
            }),
        })
    }

    #[inline]
    pub fn kind(&self) -> PostKind {
        self.kind
    }

    #[inline]
    pub fn wr_id(&self) -> WrId {
        encode_wr_id(self.kind, self.index)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Scatter/gather entry over the first `len` bytes of the buffer.
    #[inline]
    pub fn sge(&self, len: usize) -> Sge {
        Sge {
            addr: self.addr,
            length: len.min(self.len) as u32,
            lkey: self.mr.lkey(),
        }
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, PostState> {
        self.state.lock()
    }

    /// Take one more reference. Return the new count.
    pub fn take_ref(&self) -> u32 {
        let mut state = self.state.lock();
        state.refs += 1;
        state.refs
    }
}

impl fmt::Debug for Post {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Post")
            .field("kind", &self.kind)
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

/// A pool of posts of one kind.
///
/// A slot index is the post's work request id. Idle send posts sit on the
/// passive stack until [`PostPool::get`] hands them out again. Send posts
/// allocated beyond the pre-allocated count are retired when released while
/// the pool is over that count; their slot is reused by the next fresh post.
pub(crate) struct PostPool {
    kind: PostKind,
    slots: RwLock<Vec<Option<Arc<Post>>>>,
    vacant: Mutex<Vec<u32>>,
    passive: Mutex<Vec<u32>>,
    /// Posts kept once released.
    limit: AtomicUsize,
}

impl PostPool {
    pub fn new(kind: PostKind) -> Self {
        Self {
            kind,
            slots: RwLock::new(Vec::new()),
            vacant: Mutex::new(Vec::new()),
            passive: Mutex::new(Vec::new()),
            limit: AtomicUsize::new(0),
        }
    }

    fn push_slot(&self, pd: &dyn Pd, len: usize) -> Result<Arc<Post>, PostError> {
        let mut slots = self.slots.write();
        let mut vacant = self.vacant.lock();
        let index = vacant.last().copied().unwrap_or(slots.len() as u32);
        let post = Arc::new(Post::new(pd, self.kind, index, len)?);
        match vacant.pop() {
            Some(i) => slots[i as usize] = Some(post.clone()),
            None => slots.push(Some(post.clone())),
        }
        Ok(post)
    }

    /// Pre-allocate `count` idle posts of `len` bytes.
    pub fn fill(&self, pd: &dyn Pd, len: usize, count: u32) -> Result<Vec<Arc<Post>>, PostError> {
        let mut posts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let post = self.push_slot(pd, len)?;
            if self.kind == PostKind::Send {
                self.passive.lock().push(post.index);
            }
            posts.push(post);
        }
        self.limit.fetch_add(count as usize, Ordering::Relaxed);
        Ok(posts)
    }

    /// Pop the most recently released idle post of at least `need` bytes,
    /// holding one reference. Return `None` if there is none.
    pub fn get(&self, need: usize) -> Option<Arc<Post>> {
        let post = {
            let slots = self.slots.read();
            let mut passive = self.passive.lock();
            let fits = |i: &u32| {
                slots
                    .get(*i as usize)
                    .and_then(Option::as_ref)
                    .is_some_and(|p| p.len >= need)
            };
            let at = passive.iter().rposition(fits)?;
            let index = passive.remove(at);
            slots.get(index as usize).cloned().flatten()?
        };
        {
            let mut state = post.state.lock();
            state.refs = 1;
            state.active = true;
        }
        Some(post)
    }

    /// Allocate a fresh post, holding one reference. Nothing is kept if the
    /// allocation or registration fails.
    pub fn new_post(&self, pd: &dyn Pd, len: usize) -> Result<Arc<Post>, PostError> {
        let post = self.push_slot(pd, len)?;
        {
            let mut state = post.state.lock();
            state.refs = 1;
            state.active = true;
        }
        log::debug!("allocated fresh {:?} post #{} ({} bytes)", self.kind, post.index, len);
        Ok(post)
    }

    /// Mark a receive post as owned by the receive queue.
    pub fn activate(&self, post: &Post) {
        let mut state = post.state.lock();
        state.refs = 1;
        state.active = true;
    }

    pub fn lookup(&self, index: u32) -> Option<Arc<Post>> {
        self.slots.read().get(index as usize).cloned().flatten()
    }

    /// Drop one reference. Return `true` if that was the last one; the
    /// post's context is then cleared and a send post goes back to the
    /// passive stack, or is retired if the pool holds more posts than it
    /// pre-allocated.
    pub fn unref(&self, post: &Post) -> Result<bool, PostError> {
        {
            let mut state = post.state.lock();
            if state.refs == 0 {
                return Err(PostError::RefUnderflow(post.wr_id()));
            }
            state.refs -= 1;
            if state.refs > 0 {
                return Ok(false);
            }
            state.ctx = PostCtx::default();
            if !state.active {
                log::warn!("post {:#x} released twice", post.wr_id());
                return Ok(false);
            }
            state.active = false;
        }
        if self.kind == PostKind::Send {
            let mut slots = self.slots.write();
            let mut vacant = self.vacant.lock();
            if slots.len() - vacant.len() > self.limit.load(Ordering::Relaxed) {
                slots[post.index as usize] = None;
                vacant.push(post.index);
                log::debug!("retired {:?} post #{} ({} bytes)", self.kind, post.index, post.len);
            } else {
                self.passive.lock().push(post.index);
            }
        }
        Ok(true)
    }

    pub fn stats(&self) -> PoolStats {
        let total = self.slots.read().len() - self.vacant.lock().len();
        let passive = self.passive.lock().len();
        PoolStats {
            active: total - passive,
            passive,
        }
    }
}
