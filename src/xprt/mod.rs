//! RPC-over-RDMA transport.
//!
//! A [`Transport`] is one endpoint: a client connection, a server-side
//! connection accepted by a listener, or the listener itself. The RPC layer
//! above talks to it through [`Transport::submit_request`] and
//! [`Transport::submit_reply`], and is called back through its
//! [`RpcHandler`].
//!
//! Requests pick their chunk types on submission (see [`ChunkPlan`]). Sends
//! are bounded by the credit the remote side advertised; what does not fit
//! waits in a FIFO queue drained by send completions. Connection setup and
//! teardown are driven by the CM thread of the owning [`RdmaCtx`]; message
//! delivery happens on the per-device completion threads.

mod cm;
mod completion;
mod ctx;
mod device;
mod error;
mod msg;
mod name;
mod options;
mod peer;
mod plan;
mod post;
mod stats;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

pub use self::ctx::RdmaCtx;
pub use self::error::{DeviceError, PostError, TransportError};
pub use self::msg::{FlushedEntry, InboundMsg, ReplyChunk, ReplyInfo, RpcReply, RpcRequest};
pub use self::options::{AddressFamily, ConfigError, TransportOptions, DEFAULT_PORT, MIN_BUFFER_SIZE, UNIX_PATH_MAX};
pub use self::peer::{ConnState, Role};
pub use self::plan::{ChunkPlan, ReadType, WriteType};
pub use self::stats::{DeviceStats, PoolStats, TransportStats};

use self::ctx::CtxInner;
use self::peer::{IoqEntry, Peer};
use self::stats::Counters;
use crate::rdma::cm::{CmId, SockAddr};
use crate::rdma::nic::NicFinder;

/// Listen backlog of listening endpoints.
const LISTEN_BACKLOG: u32 = 10;

static NEXT_XPRT_ID: AtomicU64 = AtomicU64::new(1);

/// Callbacks from a transport to the RPC layer.
///
/// Called from the CM thread (connection events) and from completion
/// threads (messages). No transport lock is held during a call, so
/// handlers may submit and disconnect freely.
pub trait RpcHandler: Send + Sync {
    /// A client connection is established.
    fn on_connect(&self, _xprt: &Transport) {}

    /// `listener` accepted the connection `xprt`.
    fn on_accept(&self, _listener: &Transport, _xprt: &Transport) {}

    /// A connection went away. Called once per connection.
    fn on_disconnect(&self, _xprt: &Transport) {}

    /// A request or reply arrived.
    fn on_message(&self, xprt: &Transport, msg: InboundMsg);

    /// Find the outstanding request a reply with `xid` answers. A reply for
    /// which this returns `None` is a protocol violation.
    fn map_xid(&self, _xprt: &Transport, xid: u32) -> Option<u64> {
        Some(xid as u64)
    }

    /// A queued message was dropped by teardown.
    fn on_flush(&self, _xprt: &Transport, _entry: FlushedEntry) {}
}

pub(crate) struct XprtInner {
    id: u64,
    ctx: Arc<CtxInner>,
    opts: TransportOptions,
    handler: Arc<dyn RpcHandler>,
    /// The listener an accepted connection came from.
    listener: Option<Weak<XprtInner>>,
    peer: Mutex<Peer>,
    counters: Arc<Counters>,
}

/// A transport endpoint. Cloning yields another handle to the same endpoint.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<XprtInner>,
}

impl Transport {
    fn build(
        ctx: Arc<CtxInner>,
        opts: TransportOptions,
        handler: Arc<dyn RpcHandler>,
        role: Role,
        listener: Option<Weak<XprtInner>>,
        cm_id: Option<Arc<dyn CmId>>,
    ) -> Self {
        let counters = Arc::new(Counters::default());
        let mut peer = Peer::new(opts.send_count, counters.clone());
        peer.role = role;
        peer.cm_id = cm_id;
        Self {
            inner: Arc::new(XprtInner {
                id: NEXT_XPRT_ID.fetch_add(1, Ordering::Relaxed),
                ctx,
                opts,
                handler,
                listener,
                peer: Mutex::new(peer),
                counters,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<XprtInner>) -> Self {
        Self { inner }
    }

    /// Create an idle endpoint. It becomes a client with
    /// [`connect`](Self::connect) or a listener with [`listen`](Self::listen).
    ///
    /// Fails fast if `device-name` matches no device of the fabric.
    pub fn new(ctx: &RdmaCtx, opts: TransportOptions, handler: Arc<dyn RpcHandler>) -> Result<Self, TransportError> {
        opts.validate()?;
        if let Some(pattern) = &opts.device_name {
            NicFinder::new()
                .dev_name(pattern)
                .map_err(DeviceError::from)?
                .probe_name(&*ctx.inner.fabric)
                .map_err(|_| DeviceError::NotFound(pattern.clone()))?;
        }
        Ok(Self::build(ctx.inner.clone(), opts, handler, Role::Client, None, None))
    }

    /// A server-side endpoint for a connection request on `listener`.
    pub(crate) fn accepted(listener: &Transport, id: Arc<dyn CmId>) -> Self {
        let inner = &listener.inner;
        Self::build(
            inner.ctx.clone(),
            inner.opts.clone(),
            inner.handler.clone(),
            Role::Server,
            Some(Arc::downgrade(inner)),
            Some(id),
        )
    }

    /// Start connecting. `port` is used unless `remote-port` is configured.
    ///
    /// Completion is reported through [`RpcHandler::on_connect`], failure
    /// through [`RpcHandler::on_disconnect`].
    pub fn connect(&self, port: Option<u16>) -> Result<(), TransportError> {
        {
            let peer = self.inner.peer.lock();
            if peer.role == Role::Listener {
                return Err(TransportError::Listener);
            }
            if peer.cm_id.is_some() {
                return Err(TransportError::AlreadyConnected);
            }
        }

        let opts = &self.inner.opts;
        let remote = name::remote_addr(opts, port)?;
        let id = self.inner.ctx.channel.create_id()?;
        let bound = match name::bind_client(&*id, opts, &remote) {
            Ok(bound) => bound,
            Err(e) => {
                id.destroy();
                return Err(e);
            }
        };

        {
            let mut peer = self.inner.peer.lock();
            if peer.cm_id.is_some() {
                drop(peer);
                id.destroy();
                return Err(TransportError::AlreadyConnected);
            }
            peer.reset();
            peer.role = Role::Client;
            peer.cm_id = Some(id.clone());
            peer.state = ConnState::AddrResolving;
            peer.resolve_start = Some(quanta::Instant::now());
        }
        self.inner.ctx.add_endpoint(self);

        log::debug!(
            "{}: connecting to {} from {}",
            self,
            remote,
            bound.map_or_else(|| "an ephemeral port".to_owned(), |a| a.to_string())
        );
        let timeout = Duration::from_millis(opts.resolve_timeout_ms);
        if let Err(e) = id.resolve_addr(None, &remote, timeout) {
            self.abandon(&id);
            return Err(e.into());
        }
        Ok(())
    }

    /// Start listening. Accepted connections are reported through
    /// [`RpcHandler::on_accept`].
    pub fn listen(&self) -> Result<(), TransportError> {
        let addr = name::listen_addr(&self.inner.opts)?;
        let id = self.inner.ctx.channel.create_id()?;
        {
            let mut peer = self.inner.peer.lock();
            if peer.cm_id.is_some() {
                drop(peer);
                id.destroy();
                return Err(TransportError::AlreadyConnected);
            }
            peer.reset();
            peer.role = Role::Listener;
            peer.cm_id = Some(id.clone());
            peer.state = ConnState::Listening;
        }
        self.inner.ctx.add_endpoint(self);

        if let Err(e) = id.bind_addr(&addr).and_then(|()| id.listen(LISTEN_BACKLOG)) {
            self.abandon(&id);
            return Err(e.into());
        }
        log::info!("{}: listening on {}", self, addr);
        Ok(())
    }

    /// Undo a connect or listen that failed before any CM event.
    fn abandon(&self, id: &Arc<dyn CmId>) {
        {
            let mut peer = self.inner.peer.lock();
            peer.cm_id = None;
            peer.state = ConnState::Idle;
        }
        self.inner.ctx.remove_endpoint(id.handle());
        id.destroy();
    }

    /// Send a request, or queue it until credit is available.
    ///
    /// Malformed requests fail without touching the connection. A failure to
    /// put the request on the wire disconnects.
    pub fn submit_request(&self, req: RpcRequest) -> Result<(), TransportError> {
        let xid = req.xid()?;
        let inline_size = self.inner.peer.lock().inline_size;
        let plan = ChunkPlan::for_request(&req, inline_size)?;
        self.submit(IoqEntry::Request { xid, req, plan })
    }

    /// Send a reply, or queue it until credit is available.
    pub fn submit_reply(&self, reply: RpcReply) -> Result<(), TransportError> {
        let xid = reply.xid()?;
        self.submit(IoqEntry::Reply { xid, reply })
    }

    /// Submit an entry generated by the transport itself.
    pub(crate) fn submit_entry(&self, entry: IoqEntry) {
        let xid = entry.xid();
        if let Err(e) = self.submit(entry) {
            log::debug!("{}: cannot submit {:#x}: {}", self, xid, e);
        }
    }

    fn submit(&self, entry: IoqEntry) -> Result<(), TransportError> {
        let res = {
            let mut peer = self.inner.peer.lock();
            match peer.role {
                Role::Listener => return Err(TransportError::Listener),
                // Requests to a client whose credit we have not learnt yet.
                Role::Server if peer.connected && !peer.quota_set && !entry.is_reply() => {
                    log::debug!("{}: request {:#x} dropped, peer credit unknown", self, entry.xid());
                    return Ok(());
                }
                _ => {}
            }
            peer.submit(entry, |p, e| p.issue(e))
        };
        match res {
            Ok(_) => Ok(()),
            Err(TransportError::NotConnected) => Err(TransportError::NotConnected),
            Err(e) => {
                log::error!("{}: cannot issue message: {}", self, e);
                self.disconnect();
                Err(e)
            }
        }
    }

    /// Disconnect. Teardown follows asynchronously once the connection
    /// manager confirms; endpoints that never connected are torn down at
    /// once.
    pub fn disconnect(&self) {
        let (id, state) = {
            let mut peer = self.inner.peer.lock();
            let Some(id) = peer.cm_id.clone() else {
                return;
            };
            let state = peer.state;
            peer.connected = false;
            (id, state)
        };
        match state {
            ConnState::Established | ConnState::Connecting | ConnState::Accepting => {
                log::debug!("{}: disconnecting", self);
                if let Err(e) = id.disconnect() {
                    log::warn!("{}: CM disconnect failed, tearing down: {}", self, e);
                    self.teardown();
                }
            }
            _ => self.teardown(),
        }
    }

    /// Disconnect after a fault on the connection's queue pair.
    pub(crate) fn disconnect_on_fault(&self) {
        if self.is_connected() {
            log::error!("{}: fault on the connection, disconnecting", self);
        }
        self.disconnect();
    }

    /// Release every resource of the connection, fail its queued messages
    /// and notify the RPC layer. Only the first call does anything.
    pub(crate) fn teardown(&self) {
        let (id, qp, device, ioq, pending, role, was_established) = {
            let mut peer = self.inner.peer.lock();
            let Some(id) = peer.cm_id.take() else {
                return;
            };
            let was_established = peer.state == ConnState::Established;
            peer.state = ConnState::Disconnected;
            peer.connected = false;
            peer.quota_set = false;
            (
                id,
                peer.qp.take(),
                peer.device.take(),
                std::mem::take(&mut peer.ioq),
                std::mem::take(&mut peer.pending),
                peer.role,
                was_established,
            )
        };

        if let (Some(qp), Some(device)) = (&qp, &device) {
            device.unregister_peer(qp.qp_num());
        }
        id.destroy_qp();
        id.destroy();
        self.inner.ctx.remove_endpoint(id.handle());
        log::debug!(
            "{}: torn down, {} queued and {} outstanding messages dropped",
            self,
            ioq.len(),
            pending.len()
        );

        completion::flush(self, ioq);
        drop(pending);

        let notify = match role {
            Role::Client => true,
            Role::Server => was_established,
            Role::Listener => false,
        };
        if notify {
            self.inner.handler.on_disconnect(self);
        }
    }

    pub(crate) fn deliver(&self, msg: InboundMsg) {
        log::trace!(
            "{}: delivering {} {:#x} ({} bytes)",
            self,
            if msg.is_reply { "reply" } else { "request" },
            msg.xid,
            msg.len()
        );
        self.inner.handler.on_message(self, msg);
    }

    pub(crate) fn cm_handle(&self) -> Option<u64> {
        self.inner.peer.lock().cm_id.as_ref().map(|id| id.handle())
    }

    pub fn role(&self) -> Role {
        self.inner.peer.lock().role
    }

    pub fn state(&self) -> ConnState {
        self.inner.peer.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.inner.peer.lock().connected
    }

    pub fn options(&self) -> &TransportOptions {
        &self.inner.opts
    }

    pub fn local_addr(&self) -> Option<SockAddr> {
        self.inner.peer.lock().cm_id.as_ref().and_then(|id| id.local_addr())
    }

    pub fn peer_addr(&self) -> Option<SockAddr> {
        self.inner.peer.lock().cm_id.as_ref().and_then(|id| id.peer_addr())
    }

    /// Snapshot of the endpoint's counters.
    pub fn stats(&self) -> TransportStats {
        self.inner.counters.snapshot()
    }
}

impl PartialEq for Transport {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Transport {}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xprt#{}", self.inner.id)
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peer = self.inner.peer.lock();
        f.debug_struct("Transport")
            .field("id", &self.inner.id)
            .field("role", &peer.role)
            .field("state", &peer.state)
            .field("quota", &peer.quota)
            .field("queued", &peer.ioq.len())
            .finish()
    }
}
