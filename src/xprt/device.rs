//! Per-NIC resources shared by every connection on the NIC.

use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use super::completion::{self, CqKind};
use super::error::{DeviceError, PostError};
use super::options::TransportOptions;
use super::post::{decode_wr_id, Post, PostKind, PostPool};
use super::stats::DeviceStats;
use super::{Transport, XprtInner};
use crate::mem::{IoBufPool, MemRegistry};
use crate::proto::INLINE_THRESHOLD;
use crate::rdma::context::{AsyncEvent, Context};
use crate::rdma::cq::{CompChannel, Cq};
use crate::rdma::pd::Pd;
use crate::rdma::qp::{Mtu, QpCaps, QpInitAttr};
use crate::rdma::srq::Srq;
use crate::rdma::type_alias::{Qpn, WrId};
use crate::rdma::wr::RecvWr;

/// Buckets of the QP-number table.
const QP_BUCKETS: usize = 42;

type QpTable = Vec<Vec<(Qpn, Weak<XprtInner>)>>;

/// The device-level part of [`TransportOptions`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Shape {
    send_count: u32,
    recv_count: u32,
    send_size: usize,
    recv_size: usize,
}

impl Shape {
    fn of(opts: &TransportOptions) -> Self {
        Self {
            send_count: opts.send_count,
            recv_count: opts.recv_count,
            send_size: opts.effective_send_size(),
            recv_size: opts.effective_recv_size(),
        }
    }
}

/// An opened NIC with its protection domain, receive queue, completion
/// queues and post pools.
pub(crate) struct Device {
    name: String,
    context: Arc<dyn Context>,
    pd: Arc<dyn Pd>,
    srq: Arc<dyn Srq>,
    send_chan: Arc<dyn CompChannel>,
    recv_chan: Arc<dyn CompChannel>,
    send_cq: Arc<dyn Cq>,
    recv_cq: Arc<dyn Cq>,
    send_pool: PostPool,
    recv_pool: PostPool,
    registry: Arc<MemRegistry>,
    pool: Arc<IoBufPool>,
    send_size: usize,
    recv_size: usize,
    /// Options the device was created with.
    shape: Shape,
    caps: QpCaps,
    mtu: Mtu,
    qps: Mutex<QpTable>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Device {
    /// Open every resource of `context` and start its threads.
    ///
    /// Nothing is kept if any step fails.
    pub fn create(
        context: Arc<dyn Context>,
        opts: &TransportOptions,
        pool: Arc<IoBufPool>,
    ) -> Result<Arc<Self>, DeviceError> {
        let name = context.name().to_owned();
        let attr = context.attr();
        let send_count = opts.send_count.min(attr.max_qp_wr);
        let recv_count = opts.recv_count.min(attr.max_srq_wr);
        let send_size = opts.effective_send_size();
        let recv_size = opts.effective_recv_size();

        let pd = context.alloc_pd().map_err(DeviceError::create("protection domain"))?;
        let send_chan = context
            .create_comp_channel()
            .map_err(DeviceError::create("send completion channel"))?;
        let recv_chan = context
            .create_comp_channel()
            .map_err(DeviceError::create("receive completion channel"))?;
        // RDMA reads and writes complete on the send queue too.
        let send_cq = context
            .create_cq(send_count.saturating_mul(2).min(attr.max_cqe), &send_chan)
            .map_err(DeviceError::create("send completion queue"))?;
        let recv_cq = context
            .create_cq(recv_count.min(attr.max_cqe), &recv_chan)
            .map_err(DeviceError::create("receive completion queue"))?;
        let srq = pd
            .create_srq(recv_count, 1)
            .map_err(DeviceError::create("shared receive queue"))?;

        let registry = Arc::new(MemRegistry::new(pd.clone()));
        let send_pool = PostPool::new(PostKind::Send);
        send_pool.fill(&*pd, send_size, send_count)?;
        let recv_pool = PostPool::new(PostKind::Recv);
        for post in recv_pool.fill(&*pd, recv_size, recv_count)? {
            recv_pool.activate(&post);
            srq.post_recv(&RecvWr::new(vec![post.sge(recv_size)], post.wr_id()))
                .map_err(DeviceError::create("receive queue entries"))?;
        }

        let device = Arc::new(Self {
            name,
            context,
            pd,
            srq,
            send_chan,
            recv_chan,
            send_cq,
            recv_cq,
            send_pool,
            recv_pool,
            registry,
            pool,
            send_size,
            recv_size,
            shape: Shape::of(opts),
            caps: QpCaps {
                max_send_wr: send_count,
                max_recv_wr: recv_count,
                max_send_sge: 2,
                max_recv_sge: 1,
            },
            mtu: opts.effective_mtu(),
            qps: Mutex::new(vec![Vec::new(); QP_BUCKETS]),
            threads: Mutex::new(Vec::new()),
        });

        if let Err(e) = device.start() {
            device.shutdown();
            return Err(e);
        }

        let weak = Arc::downgrade(&device.registry);
        device.pool.on_arena(Box::new(move |arena| {
            if let Some(registry) = weak.upgrade() {
                if let Err(e) = registry.register_arena(arena) {
                    log::warn!("cannot pre-register arena #{}: {}", arena.id(), e);
                }
            }
        }));

        log::debug!(
            "device {} ready: {} send posts, {} receive posts, mtu {}",
            device.name,
            send_count,
            recv_count,
            device.mtu.bytes()
        );
        Ok(device)
    }

    fn start(self: &Arc<Self>) -> Result<(), DeviceError> {
        for kind in [CqKind::Send, CqKind::Recv] {
            let device = self.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, kind))
                .spawn(move || completion::run(device, kind))
                .map_err(DeviceError::create("completion thread"))?;
            self.threads.lock().push(handle);
        }

        let device = self.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-async", self.name))
            .spawn(move || device.run_async())
            .map_err(DeviceError::create("async event thread"))?;
        self.threads.lock().push(handle);
        Ok(())
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the pre-allocated send posts.
    #[inline]
    pub fn send_size(&self) -> usize {
        self.send_size
    }

    /// Size of the receive posts.
    #[inline]
    pub fn recv_size(&self) -> usize {
        self.recv_size
    }

    /// Warn if `opts` asks for post counts or sizes other than those this
    /// device was created with. Such options have no effect.
    pub fn check_options(&self, opts: &TransportOptions) {
        let want = Shape::of(opts);
        if want != self.shape {
            log::warn!(
                "{}: created with {:?}, ignoring {:?} of a later transport",
                self.name,
                self.shape,
                want
            );
        }
    }

    #[inline]
    pub fn pd(&self) -> &Arc<dyn Pd> {
        &self.pd
    }

    #[inline]
    pub fn registry(&self) -> &MemRegistry {
        &self.registry
    }

    #[inline]
    pub fn pool(&self) -> &IoBufPool {
        &self.pool
    }

    pub(crate) fn channel(&self, kind: CqKind) -> &Arc<dyn CompChannel> {
        match kind {
            CqKind::Send => &self.send_chan,
            CqKind::Recv => &self.recv_chan,
        }
    }

    pub(crate) fn cq(&self, kind: CqKind) -> &Arc<dyn Cq> {
        match kind {
            CqKind::Send => &self.send_cq,
            CqKind::Recv => &self.recv_cq,
        }
    }

    /// Attributes of a queue pair on this device.
    pub fn qp_init_attr(&self) -> QpInitAttr {
        QpInitAttr {
            send_cq: self.send_cq.clone(),
            recv_cq: self.recv_cq.clone(),
            srq: Some(self.srq.clone()),
            caps: self.caps,
            mtu: self.mtu,
        }
    }

    pub fn register_peer(&self, qpn: Qpn, xprt: &Arc<XprtInner>) {
        let mut qps = self.qps.lock();
        let bucket = &mut qps[qpn as usize % QP_BUCKETS];
        bucket.retain(|(n, _)| *n != qpn);
        bucket.push((qpn, Arc::downgrade(xprt)));
    }

    /// Return `true` if `qpn` was registered.
    pub fn unregister_peer(&self, qpn: Qpn) -> bool {
        let mut qps = self.qps.lock();
        let bucket = &mut qps[qpn as usize % QP_BUCKETS];
        let before = bucket.len();
        bucket.retain(|(n, _)| *n != qpn);
        bucket.len() != before
    }

    /// The transport owning `qpn`, if it is still alive.
    pub fn lookup_peer(&self, qpn: Qpn) -> Option<Transport> {
        let weak = {
            let qps = self.qps.lock();
            qps[qpn as usize % QP_BUCKETS]
                .iter()
                .find(|(n, _)| *n == qpn)
                .map(|(_, w)| w.clone())
        };
        weak.and_then(|w| w.upgrade()).map(Transport::from_inner)
    }

    /// A send post of at least `need` bytes, holding one reference.
    pub fn get_send_post(&self, need: usize) -> Result<Arc<Post>, PostError> {
        if let Some(post) = self.send_pool.get(need) {
            return Ok(post);
        }
        self.send_pool
            .new_post(&*self.pd, need.max(self.send_size + INLINE_THRESHOLD))
    }

    pub fn lookup_post(&self, wr_id: WrId) -> Result<Arc<Post>, PostError> {
        let (kind, index) = decode_wr_id(wr_id);
        let pool = match kind {
            PostKind::Send => &self.send_pool,
            PostKind::Recv => &self.recv_pool,
        };
        pool.lookup(index).ok_or(PostError::UnknownWrId(wr_id))
    }

    /// Drop one reference of `post`. The last reference of a receive post
    /// hands it back to the receive queue.
    pub fn release(&self, post: &Post) {
        let pool = match post.kind() {
            PostKind::Send => &self.send_pool,
            PostKind::Recv => &self.recv_pool,
        };
        match pool.unref(post) {
            Ok(true) if post.kind() == PostKind::Recv => self.repost(post),
            Ok(_) => {}
            Err(e) => log::error!("{}: {}", self.name, e),
        }
    }

    fn repost(&self, post: &Post) {
        self.recv_pool.activate(post);
        let wr = RecvWr::new(vec![post.sge(post.capacity())], post.wr_id());
        if let Err(e) = self.srq.post_recv(&wr) {
            log::error!("{}: cannot repost receive buffer: {}", self.name, e);
        }
    }

    fn run_async(self: Arc<Self>) {
        while let Ok(event) = self.context.get_async_event() {
            match event {
                AsyncEvent::QpFatal(qpn) => {
                    log::error!("{}: {}", self.name, event);
                    if let Some(xprt) = self.lookup_peer(qpn) {
                        xprt.disconnect_on_fault();
                    }
                }
                AsyncEvent::CqError | AsyncEvent::DeviceFatal => log::error!("{}: {}", self.name, event),
                AsyncEvent::SrqLimitReached | AsyncEvent::QpLastWqeReached(_) | AsyncEvent::PortError(_) => {
                    log::warn!("{}: {}", self.name, event)
                }
                AsyncEvent::PortActive(_) => log::debug!("{}: {}", self.name, event),
            }
        }
        log::debug!("{}: async event thread exits", self.name);
    }

    pub fn stats(&self) -> DeviceStats {
        let reg = self.registry.stats();
        DeviceStats {
            name: self.name.clone(),
            send_posts: self.send_pool.stats(),
            recv_posts: self.recv_pool.stats(),
            peers: self.qps.lock().iter().map(Vec::len).sum(),
            fresh_registrations: reg.fresh_registrations,
            arena_hits: reg.arena_hits,
        }
    }

    /// Stop the device's threads and wait for them.
    pub fn shutdown(&self) {
        self.send_chan.shutdown();
        self.recv_chan.shutdown();
        self.context.shutdown();
        let threads = std::mem::take(&mut *self.threads.lock());
        let me = thread::current().id();
        for handle in threads {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                log::error!("{}: a device thread panicked", self.name);
            }
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("send_posts", &self.send_pool.stats())
            .field("recv_posts", &self.recv_pool.stats())
            .finish()
    }
}
