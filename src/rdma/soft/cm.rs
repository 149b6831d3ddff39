//! Loopback connection manager.

use std::any::Any;
use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::qp::{QpInner, SoftQp};
use super::{FabricInner, SoftContext, SoftPd};
use crate::rdma::cm::*;
use crate::rdma::context::Context;
use crate::rdma::pd::Pd;
use crate::rdma::qp::{Qp, QpInitAttr};

#[derive(Default)]
struct ChanState {
    events: VecDeque<CmEvent>,
    shutdown: bool,
}

struct ChanInner {
    fabric: Weak<FabricInner>,
    state: Mutex<ChanState>,
    cv: Condvar,
}

/// A software CM event channel.
#[derive(Clone)]
pub struct SoftCmChannel {
    inner: Arc<ChanInner>,
}

impl SoftCmChannel {
    pub(crate) fn new(fabric: Weak<FabricInner>) -> Self {
        Self {
            inner: Arc::new(ChanInner {
                fabric,
                state: Mutex::new(ChanState::default()),
                cv: Condvar::new(),
            }),
        }
    }

    fn post(&self, event: CmEvent) {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return;
        }
        state.events.push_back(event);
        drop(state);
        self.inner.cv.notify_one();
    }

    fn new_id(&self) -> io::Result<Arc<SoftCmId>> {
        let fabric = self
            .inner
            .fabric
            .upgrade()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "fabric dropped"))?;
        let handle = fabric.next_handle();
        Ok(Arc::new_cyclic(|me| SoftCmId {
            handle,
            me: me.clone(),
            fabric: Arc::downgrade(&fabric),
            channel: self.clone(),
            state: Mutex::new(IdState::default()),
        }))
    }
}

impl CmChannel for SoftCmChannel {
    fn create_id(&self) -> io::Result<Arc<dyn CmId>> {
        Ok(self.new_id()?)
    }

    fn get_cm_event(&self) -> io::Result<CmEvent> {
        let mut state = self.inner.state.lock();
        loop {
            if state.shutdown {
                return Err(io::Error::new(ErrorKind::BrokenPipe, "event channel shut down"));
            }
            if let Some(event) = state.events.pop_front() {
                return Ok(event);
            }
            self.inner.cv.wait(&mut state);
        }
    }

    fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.cv.notify_all();
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ConnState {
    #[default]
    Idle,
    /// Client side, request delivered to a listener.
    Connecting,
    /// Server side, request not yet accepted or rejected.
    Requested,
    Established,
    Disconnected,
}

#[derive(Default)]
struct IdState {
    local: Option<SockAddr>,
    peer: Option<SockAddr>,
    ctx: Option<SoftContext>,
    qp: Option<SoftQp>,
    listening: bool,
    remote: Option<Weak<SoftCmId>>,
    conn: ConnState,
    destroyed: bool,
}

/// A software CM identifier.
pub struct SoftCmId {
    handle: u64,
    me: Weak<SoftCmId>,
    fabric: Weak<FabricInner>,
    channel: SoftCmChannel,
    state: Mutex<IdState>,
}

impl Drop for SoftCmId {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl SoftCmId {
    fn fabric(&self) -> io::Result<Arc<FabricInner>> {
        self.fabric
            .upgrade()
            .ok_or_else(|| io::Error::new(ErrorKind::NotConnected, "fabric dropped"))
    }

    fn event(&self, id: Arc<dyn CmId>, kind: CmEventKind, status: i32, private_data: Vec<u8>) {
        self.channel.post(CmEvent {
            id,
            listen_id: None,
            kind,
            status,
            private_data,
        });
    }

    /// Report an event about this identifier on its own channel.
    fn notify(&self, kind: CmEventKind, status: i32, private_data: Vec<u8>) {
        if let Some(me) = self.me.upgrade() {
            self.event(me, kind, status, private_data);
        }
    }

    /// Tell the other end that the connection is gone.
    fn notify_remote_disconnect(remote: Option<Weak<SoftCmId>>) {
        let Some(remote) = remote.and_then(|w| w.upgrade()) else {
            return;
        };
        let (notify, qp) = {
            let mut state = remote.state.lock();
            let notify = matches!(state.conn, ConnState::Established | ConnState::Connecting);
            if state.conn != ConnState::Idle {
                state.conn = ConnState::Disconnected;
            }
            state.remote = None;
            (notify, state.qp.clone())
        };
        if let Some(qp) = qp {
            qp.inner.set_error();
        }
        if notify {
            remote.event(remote.clone(), CmEventKind::Disconnected, 0, Vec::new());
        }
    }

    fn wildcard_for(dst: &SockAddr) -> Option<SockAddr> {
        match dst {
            SockAddr::Inet(SocketAddr::V4(_)) => Some(SockAddr::Inet((Ipv4Addr::UNSPECIFIED, 0).into())),
            SockAddr::Inet(SocketAddr::V6(_)) => Some(SockAddr::Inet((Ipv6Addr::UNSPECIFIED, 0).into())),
            SockAddr::Unix(_) => None,
        }
    }
}

impl CmId for SoftCmId {
    fn handle(&self) -> u64 {
        self.handle
    }

    fn bind_addr(&self, addr: &SockAddr) -> io::Result<()> {
        let fabric = self.fabric()?;
        let mut state = self.state.lock();
        if state.local.is_some() {
            return Err(io::Error::new(ErrorKind::InvalidInput, "identifier already bound"));
        }
        state.local = Some(fabric.bind(addr, self.handle)?);
        Ok(())
    }

    fn resolve_addr(&self, src: Option<&SockAddr>, dst: &SockAddr, _timeout: Duration) -> io::Result<()> {
        let fabric = self.fabric()?;
        let bound = self.state.lock().local.is_some();
        if !bound {
            if let Some(src) = src.cloned().or_else(|| Self::wildcard_for(dst)) {
                self.bind_addr(&src)?;
            }
        }

        self.state.lock().peer = Some(dst.clone());
        if fabric.is_unreachable(dst) {
            self.notify(CmEventKind::AddressError, -libc::ETIMEDOUT, Vec::new());
            return Ok(());
        }
        self.state.lock().ctx = fabric.default_device();
        self.notify(CmEventKind::AddressResolved, 0, Vec::new());
        Ok(())
    }

    fn resolve_route(&self, _timeout: Duration) -> io::Result<()> {
        if self.state.lock().ctx.is_none() {
            return Err(io::Error::new(ErrorKind::InvalidInput, "address not resolved"));
        }
        self.notify(CmEventKind::RouteResolved, 0, Vec::new());
        Ok(())
    }

    fn listen(&self, _backlog: u32) -> io::Result<()> {
        let fabric = self.fabric()?;
        let local = {
            let mut state = self.state.lock();
            let local = state
                .local
                .clone()
                .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "listen on an unbound identifier"))?;
            state.listening = true;
            local
        };
        fabric.add_listener(&local, self.handle, self.me.clone());
        Ok(())
    }

    fn context(&self) -> Option<Arc<dyn Context>> {
        self.state
            .lock()
            .ctx
            .clone()
            .map(|ctx| Arc::new(ctx) as Arc<dyn Context>)
    }

    fn create_qp(&self, pd: &Arc<dyn Pd>, attr: &QpInitAttr) -> io::Result<Arc<dyn Qp>> {
        let fabric = self.fabric()?;
        let mut state = self.state.lock();
        let ctx = state
            .ctx
            .clone()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "identifier has no device"))?;
        let pd = pd
            .as_any()
            .downcast_ref::<SoftPd>()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "foreign protection domain"))?;
        if !pd.ctx.same_device(&ctx) {
            return Err(io::Error::new(ErrorKind::InvalidInput, "PD belongs to another device"));
        }
        if state.qp.is_some() {
            return Err(io::Error::from(ErrorKind::AlreadyExists));
        }
        let qp = SoftQp {
            inner: QpInner::new(&fabric, ctx, attr)?,
        };
        state.qp = Some(qp.clone());
        Ok(Arc::new(qp))
    }

    fn destroy_qp(&self) {
        let qp = self.state.lock().qp.take();
        if let Some(qp) = qp {
            qp.inner.set_error();
        }
    }

    fn connect(&self, param: &ConnParam) -> io::Result<()> {
        let fabric = self.fabric()?;
        let (peer, local) = {
            let state = self.state.lock();
            if state.conn != ConnState::Idle {
                return Err(io::Error::new(ErrorKind::InvalidInput, "connect on a used identifier"));
            }
            if state.qp.is_none() {
                return Err(io::Error::new(ErrorKind::InvalidInput, "connect without a QP"));
            }
            let peer = state
                .peer
                .clone()
                .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "address not resolved"))?;
            (peer, state.local.clone())
        };

        let Some(listener) = fabric.listener(&peer) else {
            self.notify(CmEventKind::Rejected, -libc::ECONNREFUSED, Vec::new());
            return Ok(());
        };

        let server = listener.channel.new_id()?;
        {
            let mut state = server.state.lock();
            state.local = listener.state.lock().local.clone();
            state.peer = local;
            state.ctx = fabric.default_device();
            state.remote = Some(self.me.clone());
            state.conn = ConnState::Requested;
        }
        {
            let mut state = self.state.lock();
            state.remote = Some(Arc::downgrade(&server));
            state.conn = ConnState::Connecting;
        }
        listener.channel.post(CmEvent {
            id: server,
            listen_id: Some(listener.clone()),
            kind: CmEventKind::ConnectionRequest,
            status: 0,
            private_data: param.private_data.clone(),
        });
        Ok(())
    }

    fn accept(&self, param: &ConnParam) -> io::Result<()> {
        let (remote, qp) = {
            let state = self.state.lock();
            if state.conn != ConnState::Requested {
                return Err(io::Error::new(ErrorKind::InvalidInput, "no pending connection request"));
            }
            let qp = state
                .qp
                .clone()
                .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "accept without a QP"))?;
            (state.remote.clone(), qp)
        };
        let client = remote
            .and_then(|w| w.upgrade())
            .ok_or_else(|| io::Error::from(ErrorKind::ConnectionReset))?;
        let client_qp = {
            let mut state = client.state.lock();
            if state.conn != ConnState::Connecting {
                return Err(io::Error::from(ErrorKind::ConnectionReset));
            }
            let client_qp = state
                .qp
                .clone()
                .ok_or_else(|| io::Error::from(ErrorKind::ConnectionReset))?;
            state.conn = ConnState::Established;
            client_qp
        };

        qp.inner.connect_to(&client_qp.inner);
        client_qp.inner.connect_to(&qp.inner);
        self.state.lock().conn = ConnState::Established;

        self.notify(CmEventKind::Established, 0, Vec::new());
        client.event(client.clone(), CmEventKind::Established, 0, param.private_data.clone());
        Ok(())
    }

    fn reject(&self, private_data: &[u8]) -> io::Result<()> {
        let remote = {
            let mut state = self.state.lock();
            if state.conn != ConnState::Requested {
                return Err(io::Error::new(ErrorKind::InvalidInput, "no pending connection request"));
            }
            state.conn = ConnState::Disconnected;
            state.remote.take()
        };
        if let Some(client) = remote.and_then(|w| w.upgrade()) {
            {
                let mut state = client.state.lock();
                state.conn = ConnState::Disconnected;
                state.remote = None;
            }
            client.event(
                client.clone(),
                CmEventKind::Rejected,
                -libc::ECONNREFUSED,
                private_data.to_vec(),
            );
        }
        Ok(())
    }

    fn disconnect(&self) -> io::Result<()> {
        let (remote, qp) = {
            let mut state = self.state.lock();
            match state.conn {
                ConnState::Established | ConnState::Connecting | ConnState::Requested => {}
                ConnState::Idle | ConnState::Disconnected => return Ok(()),
            }
            state.conn = ConnState::Disconnected;
            (state.remote.take(), state.qp.clone())
        };
        if let Some(qp) = qp {
            qp.inner.set_error();
        }
        self.notify(CmEventKind::Disconnected, 0, Vec::new());
        Self::notify_remote_disconnect(remote);
        Ok(())
    }

    fn destroy(&self) {
        let (local, remote, qp) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.listening = false;
            let remote = match state.conn {
                ConnState::Established | ConnState::Connecting | ConnState::Requested => state.remote.take(),
                _ => None,
            };
            state.conn = ConnState::Disconnected;
            (state.local.take(), remote, state.qp.take())
        };
        if let Some(qp) = qp {
            qp.inner.set_error();
        }
        Self::notify_remote_disconnect(remote);
        if let (Some(local), Some(fabric)) = (local, self.fabric.upgrade()) {
            fabric.unbind(&local, self.handle);
        }
    }

    fn local_addr(&self) -> Option<SockAddr> {
        self.state.lock().local.clone()
    }

    fn peer_addr(&self) -> Option<SockAddr> {
        self.state.lock().peer.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::nic::Fabric;
    use crate::rdma::qp::{Mtu, QpCaps};
    use crate::rdma::soft::SoftFabric;

    fn addr(port: u16) -> SockAddr {
        SockAddr::Inet(([127, 0, 0, 1], port).into())
    }

    fn qp_attr(ctx: &Arc<dyn Context>, pd: &Arc<dyn Pd>) -> QpInitAttr {
        let comp = ctx.create_comp_channel().unwrap();
        let cq = ctx.create_cq(16, &comp).unwrap();
        QpInitAttr {
            send_cq: cq.clone(),
            recv_cq: cq,
            srq: Some(pd.create_srq(16, 1).unwrap()),
            caps: QpCaps::default(),
            mtu: Mtu::default(),
        }
    }

    #[test]
    fn test_connect_accept_disconnect() {
        let fabric = SoftFabric::new();
        let server_ch = fabric.create_event_channel().unwrap();
        let client_ch = fabric.create_event_channel().unwrap();

        let listener = server_ch.create_id().unwrap();
        listener.bind_addr(&addr(24008)).unwrap();
        listener.listen(8).unwrap();

        let client = client_ch.create_id().unwrap();
        client.resolve_addr(None, &addr(24008), Duration::from_secs(1)).unwrap();
        assert_eq!(client_ch.get_cm_event().unwrap().kind, CmEventKind::AddressResolved);
        client.resolve_route(Duration::from_secs(1)).unwrap();
        assert_eq!(client_ch.get_cm_event().unwrap().kind, CmEventKind::RouteResolved);

        let ctx = client.context().unwrap();
        let pd = ctx.alloc_pd().unwrap();
        client.create_qp(&pd, &qp_attr(&ctx, &pd)).unwrap();
        let param = ConnParam {
            private_data: vec![1, 2, 3],
            ..Default::default()
        };
        client.connect(&param).unwrap();

        let req = server_ch.get_cm_event().unwrap();
        assert_eq!(req.kind, CmEventKind::ConnectionRequest);
        assert_eq!(req.private_data, vec![1, 2, 3]);
        assert_eq!(req.listen_id.as_ref().unwrap().handle(), listener.handle());

        let sctx = req.id.context().unwrap();
        let spd = sctx.alloc_pd().unwrap();
        req.id.create_qp(&spd, &qp_attr(&sctx, &spd)).unwrap();
        req.id.accept(&ConnParam::default()).unwrap();

        assert_eq!(server_ch.get_cm_event().unwrap().kind, CmEventKind::Established);
        assert_eq!(client_ch.get_cm_event().unwrap().kind, CmEventKind::Established);

        client.disconnect().unwrap();
        client.disconnect().unwrap();
        assert_eq!(client_ch.get_cm_event().unwrap().kind, CmEventKind::Disconnected);
        let ev = server_ch.get_cm_event().unwrap();
        assert_eq!((ev.kind, ev.id.handle()), (CmEventKind::Disconnected, req.id.handle()));
    }

    #[test]
    fn test_refused_and_unreachable() {
        let fabric = SoftFabric::new();
        let ch = fabric.create_event_channel().unwrap();

        let id = ch.create_id().unwrap();
        id.resolve_addr(None, &addr(4000), Duration::from_secs(1)).unwrap();
        ch.get_cm_event().unwrap();
        let ctx = id.context().unwrap();
        let pd = ctx.alloc_pd().unwrap();
        id.create_qp(&pd, &qp_attr(&ctx, &pd)).unwrap();
        id.connect(&ConnParam::default()).unwrap();
        let ev = ch.get_cm_event().unwrap();
        assert_eq!((ev.kind, ev.status), (CmEventKind::Rejected, -libc::ECONNREFUSED));

        fabric.set_unreachable(addr(4001), true);
        let id = ch.create_id().unwrap();
        id.resolve_addr(None, &addr(4001), Duration::from_secs(1)).unwrap();
        assert_eq!(ch.get_cm_event().unwrap().kind, CmEventKind::AddressError);
    }

    #[test]
    fn test_destroy_releases_listener() {
        let fabric = SoftFabric::new();
        let ch = fabric.create_event_channel().unwrap();
        let listener = ch.create_id().unwrap();
        listener.bind_addr(&addr(24010)).unwrap();
        listener.listen(1).unwrap();
        listener.destroy();

        let again = ch.create_id().unwrap();
        again.bind_addr(&addr(24010)).unwrap();
    }
}
