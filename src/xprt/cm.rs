//! Connection manager event handling.
//!
//! A single thread per [`RdmaCtx`](super::RdmaCtx) consumes the CM event
//! channel and drives every endpoint through resolution, connection setup
//! and teardown. Nothing is posted to a queue pair from this thread.

use std::sync::{Arc, Weak};
use std::time::Duration;

use super::ctx::CtxInner;
use super::device::Device;
use super::error::TransportError;
use super::options::MIN_BUFFER_SIZE;
use super::peer::{ConnState, Role};
use super::Transport;
use crate::proto::{INLINE_THRESHOLD, RDMA_VERSION};
use crate::rdma::cm::{CmChannel, CmEvent, CmEventKind, CmId, ConnParam};

/// Length of the private data exchanged by `connect` and `accept`.
const PRIVATE_DATA_LEN: usize = 16;

/// Private data of peers that advertise credit only.
const SHORT_PRIVATE_DATA_LEN: usize = 8;

/// What the remote side offered while connecting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PeerParams {
    pub credit: u32,
    pub send_size: usize,
    pub recv_size: usize,
}

impl PeerParams {
    /// Assumed of a peer that sent no private data.
    fn unknown(credit: u32) -> Self {
        Self {
            credit,
            send_size: INLINE_THRESHOLD,
            recv_size: INLINE_THRESHOLD,
        }
    }

    /// Largest message we may send this peer inline from `device`.
    fn inline_limit(&self, device: Option<&Arc<Device>>) -> usize {
        device.map_or(INLINE_THRESHOLD, |d| d.send_size()).min(self.recv_size)
    }
}

/// Private data advertising `credit` and our buffer sizes at our protocol
/// version.
pub(crate) fn encode_private(credit: u32, send_size: usize, recv_size: usize) -> Vec<u8> {
    [RDMA_VERSION, credit, send_size as u32, recv_size as u32]
        .iter()
        .flat_map(|w| w.to_be_bytes())
        .collect()
}

/// Parameters offered by the remote side, if it sent any private data.
pub(crate) fn decode_private(data: &[u8]) -> Result<Option<PeerParams>, TransportError> {
    if data.len() < SHORT_PRIVATE_DATA_LEN {
        return Ok(None);
    }
    let word = |i: usize| u32::from_be_bytes([data[4 * i], data[4 * i + 1], data[4 * i + 2], data[4 * i + 3]]);
    let version = word(0);
    if version != RDMA_VERSION {
        return Err(TransportError::PrivateData(version));
    }
    let mut params = PeerParams::unknown(word(1));
    if data.len() >= PRIVATE_DATA_LEN {
        params.send_size = word(2) as usize;
        params.recv_size = word(3) as usize;
        if params.recv_size < MIN_BUFFER_SIZE {
            return Err(TransportError::PeerRecvSize(params.recv_size));
        }
    }
    Ok(Some(params))
}

/// Body of the CM thread. Return once the channel is shut down or the
/// context is gone.
pub(crate) fn run(channel: Arc<dyn CmChannel>, ctx: Weak<CtxInner>) {
    while let Ok(event) = channel.get_cm_event() {
        let Some(ctx) = ctx.upgrade() else {
            break;
        };
        handle_event(&ctx, event);
    }
    log::debug!("CM thread exits");
}

fn handle_event(ctx: &Arc<CtxInner>, event: CmEvent) {
    log::debug!("{:?}", event);
    if event.kind == CmEventKind::ConnectionRequest {
        on_request(ctx, event);
        return;
    }

    let Some(xprt) = ctx.endpoint(event.id.handle()) else {
        log::debug!("{:?} for an unknown identifier ignored", event.kind);
        return;
    };
    match event.kind {
        CmEventKind::AddressResolved => {
            if let Err(e) = xprt.resolve_route() {
                log::error!("{}: cannot resolve route: {}", xprt, e);
                xprt.teardown();
            }
        }
        CmEventKind::RouteResolved => {
            if let Err(e) = xprt.start_connect() {
                log::error!("{}: cannot connect: {}", xprt, e);
                xprt.teardown();
            }
        }
        CmEventKind::Established => xprt.established(&event.private_data),
        CmEventKind::AddressError
        | CmEventKind::RouteError
        | CmEventKind::ConnectionError
        | CmEventKind::Unreachable
        | CmEventKind::Rejected => {
            log::error!("{}: {:?} (status {})", xprt, event.kind, event.status);
            xprt.teardown();
        }
        CmEventKind::Disconnected | CmEventKind::DeviceRemoval => {
            log::debug!("{}: {:?}", xprt, event.kind);
            xprt.teardown();
        }
        CmEventKind::ConnectionRequest | CmEventKind::ConnectionResponse | CmEventKind::TimewaitExit => {}
    }
}

fn refuse(id: &Arc<dyn CmId>) {
    if let Err(e) = id.reject(&[]) {
        log::warn!("cannot reject connection request: {}", e);
    }
    id.destroy();
}

fn on_request(ctx: &Arc<CtxInner>, event: CmEvent) {
    let listener = event
        .listen_id
        .as_ref()
        .and_then(|id| ctx.endpoint(id.handle()))
        .filter(|l| l.role() == Role::Listener);
    let Some(listener) = listener else {
        log::warn!("connection request for no listener, rejecting");
        refuse(&event.id);
        return;
    };

    let params = match decode_private(&event.private_data) {
        Ok(params) => params.unwrap_or_else(|| PeerParams::unknown(1)),
        Err(e) => {
            log::warn!("{}: rejecting connection: {}", listener, e);
            refuse(&event.id);
            return;
        }
    };

    let xprt = Transport::accepted(&listener, event.id.clone());
    if let Err(e) = xprt.accept(params) {
        log::error!("{}: cannot accept connection: {}", xprt, e);
        if let Err(e) = event.id.reject(&[]) {
            log::debug!("{}: reject after failed accept: {}", xprt, e);
        }
        xprt.teardown();
    }
}

impl Transport {
    fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.opts.resolve_timeout_ms)
    }

    /// Check the resolution phase has not run out of time.
    fn check_deadline(&self, what: &'static str) -> Result<Arc<dyn CmId>, TransportError> {
        let peer = self.inner.peer.lock();
        let id = peer.cm_id.clone().ok_or(TransportError::NotConnected)?;
        if let Some(start) = peer.resolve_start {
            if start.elapsed() > self.resolve_timeout() {
                return Err(TransportError::Timeout(what));
            }
        }
        Ok(id)
    }

    fn resolve_route(&self) -> Result<(), TransportError> {
        let id = self.check_deadline("address")?;
        self.inner.peer.lock().state = ConnState::RouteResolving;
        id.resolve_route(self.resolve_timeout())?;
        Ok(())
    }

    fn start_connect(&self) -> Result<(), TransportError> {
        let id = self.check_deadline("route")?;
        let device = self.attach_qp(&id)?;
        self.inner.peer.lock().state = ConnState::Connecting;

        let opts = &self.inner.opts;
        id.connect(&ConnParam {
            private_data: encode_private(opts.send_count, device.send_size(), device.recv_size()),
            responder_resources: 1,
            initiator_depth: 1,
            retry_count: opts.attr_retry_cnt,
            rnr_retry_count: opts.attr_rnr_retry,
        })?;
        Ok(())
    }

    /// Create the queue pair of `id` on its device and make completions on it
    /// find this transport.
    fn attach_qp(&self, id: &Arc<dyn CmId>) -> Result<Arc<Device>, TransportError> {
        let device = self.inner.ctx.device_for(&**id, &self.inner.opts)?;
        let qp = id.create_qp(device.pd(), &device.qp_init_attr())?;
        let qpn = qp.qp_num();
        {
            let mut peer = self.inner.peer.lock();
            peer.qp = Some(qp);
            peer.device = Some(device.clone());
        }
        device.register_peer(qpn, &self.inner);
        log::debug!("{}: QP {} on {}", self, qpn, device.name());
        Ok(device)
    }

    fn accept(&self, remote: PeerParams) -> Result<(), TransportError> {
        let id = self.inner.peer.lock().cm_id.clone().ok_or(TransportError::NotConnected)?;
        self.inner.ctx.add_endpoint(self);
        let device = self.attach_qp(&id)?;
        {
            let mut peer = self.inner.peer.lock();
            peer.remote_credit = remote.credit;
            peer.inline_size = remote.inline_limit(Some(&device));
            peer.state = ConnState::Accepting;
            log::debug!(
                "{}: peer offers credit {} with {}/{} byte send/receive buffers",
                self,
                remote.credit,
                remote.send_size,
                remote.recv_size
            );
        }
        id.accept(&ConnParam {
            private_data: encode_private(self.inner.opts.send_count, device.send_size(), device.recv_size()),
            responder_resources: 1,
            initiator_depth: 1,
            ..Default::default()
        })?;
        Ok(())
    }

    fn established(&self, private_data: &[u8]) {
        let role = {
            let mut peer = self.inner.peer.lock();
            let pending = matches!(peer.state, ConnState::Connecting | ConnState::Accepting);
            if !pending || peer.connected || peer.cm_id.is_none() {
                return;
            }
            let role = peer.role;
            match role {
                Role::Client => match decode_private(private_data) {
                    Ok(params) => {
                        let remote = params.unwrap_or_else(|| PeerParams::unknown(self.inner.opts.send_count));
                        peer.quota = remote.credit;
                        peer.inline_size = remote.inline_limit(peer.device.as_ref());
                        peer.quota_set = true;
                    }
                    Err(e) => {
                        drop(peer);
                        log::error!("{}: {}", self, e);
                        self.disconnect();
                        return;
                    }
                },
                Role::Server => {
                    peer.quota = peer.remote_credit;
                    peer.quota_set = false;
                }
                Role::Listener => return,
            }
            peer.connected = true;
            peer.state = ConnState::Established;
            log::debug!(
                "{}: established with quota {}, inline limit {}",
                self,
                peer.quota,
                peer.inline_size
            );
            role
        };

        match role {
            Role::Client => self.inner.handler.on_connect(self),
            Role::Server => {
                let listener = self.inner.listener.as_ref().and_then(Weak::upgrade);
                match listener {
                    Some(listener) => self.inner.handler.on_accept(&Transport::from_inner(listener), self),
                    None => {
                        log::warn!("{}: listener is gone, dropping connection", self);
                        self.disconnect();
                    }
                }
            }
            Role::Listener => {}
        }
    }
}
