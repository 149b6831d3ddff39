//! Shared receive queues and reliable-connected queue pairs.

use std::any::Any;
use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::sync::{Arc, Weak};
use std::{ptr, slice};

use parking_lot::Mutex;

use super::cq::SoftCq;
use super::{FabricInner, SoftContext};
use crate::rdma::cq::{Cq, Wc, WcOpcode, WcStatus};
use crate::rdma::mr::{MrRemote, Permission};
use crate::rdma::qp::{Mtu, Qp, QpCaps, QpInitAttr};
use crate::rdma::srq::Srq;
use crate::rdma::type_alias::Qpn;
use crate::rdma::wr::{RecvWr, SendWr, SendWrDetails, Sge};

struct SrqInner {
    ctx: SoftContext,
    max_wr: u32,
    wrs: Mutex<VecDeque<RecvWr>>,
}

/// A software shared receive queue.
#[derive(Clone)]
pub struct SoftSrq {
    inner: Arc<SrqInner>,
}

impl SoftSrq {
    pub(crate) fn new(ctx: SoftContext, max_wr: u32) -> Self {
        Self {
            inner: Arc::new(SrqInner {
                ctx,
                max_wr,
                wrs: Mutex::new(VecDeque::with_capacity(max_wr as usize)),
            }),
        }
    }

    fn take(&self) -> Option<RecvWr> {
        self.inner.wrs.lock().pop_front()
    }
}

impl Srq for SoftSrq {
    fn post_recv(&self, wr: &RecvWr) -> io::Result<()> {
        let mut wrs = self.inner.wrs.lock();
        if wrs.len() >= self.inner.max_wr as usize {
            return Err(io::Error::new(ErrorKind::OutOfMemory, "SRQ full"));
        }
        wrs.push_back(wr.clone());
        Ok(())
    }

    fn posted(&self) -> usize {
        self.inner.wrs.lock().len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct QpState {
    remote: Option<Weak<QpInner>>,
    error: bool,
}

pub(crate) struct QpInner {
    qpn: Qpn,
    ctx: SoftContext,
    fabric: Weak<FabricInner>,
    send_cq: SoftCq,
    recv_cq: SoftCq,
    srq: SoftSrq,
    caps: QpCaps,
    #[allow(dead_code)]
    mtu: Mtu,
    state: Mutex<QpState>,
}

impl Drop for QpInner {
    fn drop(&mut self) {
        if let Some(fabric) = self.fabric.upgrade() {
            fabric.unregister_qp(self.qpn);
        }
    }
}

impl QpInner {
    pub(crate) fn new(fabric: &Arc<FabricInner>, ctx: SoftContext, attr: &QpInitAttr) -> io::Result<Arc<Self>> {
        let cq = |cq: &Arc<dyn Cq>| {
            cq.as_any()
                .downcast_ref::<SoftCq>()
                .cloned()
                .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "foreign CQ"))
        };
        let srq = attr
            .srq
            .as_ref()
            .and_then(|srq| srq.as_any().downcast_ref::<SoftSrq>().cloned())
            .ok_or_else(|| io::Error::new(ErrorKind::Unsupported, "soft QPs require a soft SRQ"))?;
        if !srq.inner.ctx.same_device(&ctx) {
            return Err(io::Error::new(ErrorKind::InvalidInput, "SRQ belongs to another device"));
        }

        let qp = Arc::new(QpInner {
            qpn: fabric.alloc_qpn(),
            ctx,
            fabric: Arc::downgrade(fabric),
            send_cq: cq(&attr.send_cq)?,
            recv_cq: cq(&attr.recv_cq)?,
            srq,
            caps: attr.caps,
            mtu: attr.mtu,
            state: Mutex::new(QpState::default()),
        });
        fabric.register_qp(qp.qpn, Arc::downgrade(&qp));
        Ok(qp)
    }

    pub(crate) fn set_error(&self) {
        self.state.lock().error = true;
    }

    pub(crate) fn connect_to(&self, remote: &Arc<QpInner>) {
        let mut state = self.state.lock();
        state.remote = Some(Arc::downgrade(remote));
        state.error = false;
    }

    fn is_error(&self) -> bool {
        self.state.lock().error
    }

    fn complete(&self, wr: &SendWr, status: WcStatus, bytes: usize) {
        if status != WcStatus::Success {
            self.set_error();
        }
        if status == WcStatus::Success && !wr.signal {
            return;
        }
        let opcode = match wr.details {
            SendWrDetails::Send => WcOpcode::Send,
            SendWrDetails::Read(_) => WcOpcode::RdmaRead,
            SendWrDetails::Write(_) => WcOpcode::RdmaWrite,
        };
        self.send_cq
            .push(Wc::new(wr.wr_id, status, opcode, bytes as u32, self.qpn));
    }

    /// Copy the bytes described by a local scatter/gather list.
    fn gather(&self, sgl: &[Sge]) -> Result<Vec<u8>, WcStatus> {
        let mut data = Vec::with_capacity(sgl.iter().map(|s| s.length as usize).sum());
        for sge in sgl {
            let len = sge.length as usize;
            if !self.ctx.check_access(sge.lkey, sge.addr, len, Permission::EMPTY) {
                return Err(WcStatus::LocProtErr);
            }
            // SAFETY: the range lies inside a live registration, whose owner
            // keeps the memory valid until it deregisters.
            data.extend_from_slice(unsafe { slice::from_raw_parts(sge.addr as *const u8, len) });
        }
        Ok(data)
    }

    /// Place `data` into a scatter/gather list owned by `ctx`.
    fn scatter(ctx: &SoftContext, sgl: &[Sge], data: &[u8]) -> Result<(), WcStatus> {
        let room: usize = sgl.iter().map(|s| s.length as usize).sum();
        if data.len() > room {
            return Err(WcStatus::LocLenErr);
        }
        let mut rest = data;
        for sge in sgl {
            if rest.is_empty() {
                break;
            }
            let n = rest.len().min(sge.length as usize);
            if !ctx.check_access(sge.lkey, sge.addr, n, Permission::LOCAL_WRITE) {
                return Err(WcStatus::LocProtErr);
            }
            // SAFETY: validated against a live, locally writable registration.
            unsafe { ptr::copy(rest.as_ptr(), sge.addr as *mut u8, n) };
            rest = &rest[n..];
        }
        Ok(())
    }

    fn do_send(&self, wr: &SendWr, remote: &QpInner) -> WcStatus {
        let data = match self.gather(&wr.sgl) {
            Ok(data) => data,
            Err(status) => return status,
        };
        let Some(recv) = remote.srq.take() else {
            return WcStatus::RnrRetryExcErr;
        };
        match Self::scatter(&remote.ctx, &recv.sgl, &data) {
            Ok(()) => {
                remote.recv_cq.push(Wc::new(
                    recv.wr_id,
                    WcStatus::Success,
                    WcOpcode::Recv,
                    data.len() as u32,
                    remote.qpn,
                ));
                WcStatus::Success
            }
            Err(status) => {
                remote
                    .recv_cq
                    .push(Wc::new(recv.wr_id, status, WcOpcode::Recv, 0, remote.qpn));
                remote.set_error();
                WcStatus::RemInvReqErr
            }
        }
    }

    fn do_read(&self, wr: &SendWr, remote: &QpInner, from: MrRemote) -> WcStatus {
        let len = wr.total_len();
        if !remote.ctx.check_access(from.rkey, from.addr, len, Permission::REMOTE_READ) {
            return WcStatus::RemAccessErr;
        }
        // SAFETY: validated against a live, remotely readable registration.
        let data = unsafe { slice::from_raw_parts(from.addr as *const u8, len) }.to_vec();
        match Self::scatter(&self.ctx, &wr.sgl, &data) {
            Ok(()) => WcStatus::Success,
            Err(status) => status,
        }
    }

    fn do_write(&self, wr: &SendWr, remote: &QpInner, to: MrRemote) -> WcStatus {
        let data = match self.gather(&wr.sgl) {
            Ok(data) => data,
            Err(status) => return status,
        };
        if !remote.ctx.check_access(to.rkey, to.addr, data.len(), Permission::REMOTE_WRITE) {
            return WcStatus::RemAccessErr;
        }
        // SAFETY: validated against a live, remotely writable registration.
        unsafe { ptr::copy(data.as_ptr(), to.addr as *mut u8, data.len()) };
        WcStatus::Success
    }

    fn post_send(&self, wr: &SendWr) -> io::Result<()> {
        let (remote, error) = {
            let state = self.state.lock();
            (state.remote.clone(), state.error)
        };
        if error {
            self.complete(wr, WcStatus::WrFlushErr, 0);
            return Ok(());
        }
        let Some(remote) = remote.and_then(|w| w.upgrade()) else {
            self.complete(wr, WcStatus::RetryExcErr, 0);
            return Ok(());
        };
        if remote.is_error() {
            self.complete(wr, WcStatus::RetryExcErr, 0);
            return Ok(());
        }

        let status = match wr.details {
            SendWrDetails::Send => self.do_send(wr, &remote),
            SendWrDetails::Read(from) => self.do_read(wr, &remote, from),
            SendWrDetails::Write(to) => self.do_write(wr, &remote, to),
        };
        let bytes = if status == WcStatus::Success { wr.total_len() } else { 0 };
        self.complete(wr, status, bytes);
        Ok(())
    }
}

/// A software reliable-connected queue pair.
#[derive(Clone)]
pub struct SoftQp {
    pub(crate) inner: Arc<QpInner>,
}

impl Qp for SoftQp {
    fn qp_num(&self) -> Qpn {
        self.inner.qpn
    }

    fn post_send(&self, wr: &SendWr) -> io::Result<()> {
        if wr.sgl.len() > self.inner.caps.max_send_sge as usize {
            return Err(io::Error::new(ErrorKind::InvalidInput, "too many SGEs"));
        }
        self.inner.post_send(wr)
    }

    fn is_error(&self) -> bool {
        self.inner.is_error()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
