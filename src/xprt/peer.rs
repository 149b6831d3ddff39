//! Per-connection state: credit, the pending-send queue and message issue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::device::Device;
use super::error::TransportError;
use super::msg::{ReplyChunk, RpcReply, RpcRequest};
use super::plan::{non_empty, write_plan, ChunkPlan, ReadType, WritePlan};
use super::post::Post;
use super::stats::Counters;
use crate::mem::{iov_len, IoBuf, RegisteredRegion};
use crate::proto::*;
use crate::rdma::cm::CmId;
use crate::rdma::mr::Permission;
use crate::rdma::qp::Qp;
use crate::rdma::wr::{SendWr, SendWrDetails, Sge};

/// Which end of a connection a transport is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
    Listener,
}

/// Connection state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnState {
    #[default]
    Idle,
    AddrResolving,
    RouteResolving,
    Connecting,
    Accepting,
    Established,
    Listening,
    Disconnected,
}

/// A message waiting for credit.
#[derive(Clone, Debug)]
pub(crate) enum IoqEntry {
    Request {
        xid: u32,
        req: RpcRequest,
        plan: ChunkPlan,
    },
    Reply {
        xid: u32,
        reply: RpcReply,
    },
    /// A protocol error answered to the peer.
    Error { xid: u32, code: ErrorCode },
}

impl IoqEntry {
    pub fn xid(&self) -> u32 {
        match self {
            IoqEntry::Request { xid, .. } | IoqEntry::Reply { xid, .. } | IoqEntry::Error { xid, .. } => *xid,
        }
    }

    pub fn is_reply(&self) -> bool {
        !matches!(self, IoqEntry::Request { .. })
    }
}

/// Registrations and reply buffers of a request awaiting its reply.
#[derive(Debug, Default)]
pub(crate) struct RequestContext {
    /// Held until the reply arrives; dropping deregisters.
    pub _regions: Vec<RegisteredRegion>,
    pub rsphdr: Vec<IoBuf>,
    pub rsp_payload: Vec<IoBuf>,
}

/// Outcome of a submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Submitted {
    Issued,
    Queued,
}

pub(crate) struct Peer {
    pub role: Role,
    pub state: ConnState,
    pub cm_id: Option<Arc<dyn CmId>>,
    pub qp: Option<Arc<dyn Qp>>,
    pub device: Option<Arc<Device>>,

    pub connected: bool,
    pub quota: u32,
    /// Set once the remote side's credit is known to be usable.
    pub quota_set: bool,
    /// Credit the remote side offered while connecting.
    pub remote_credit: u32,
    /// Credit advertised in every header we send.
    credit: u32,
    /// Largest message sent inline: the smaller of our send buffers and the
    /// remote side's receive buffers.
    pub inline_size: usize,

    pub ioq: VecDeque<IoqEntry>,
    pub pending: HashMap<u32, RequestContext>,
    pub resolve_start: Option<quanta::Instant>,
    counters: Arc<Counters>,
}

impl Peer {
    pub fn new(credit: u32, counters: Arc<Counters>) -> Self {
        Self {
            role: Role::Client,
            state: ConnState::Idle,
            cm_id: None,
            qp: None,
            device: None,
            connected: false,
            quota: 1,
            quota_set: false,
            remote_credit: 1,
            credit,
            inline_size: INLINE_THRESHOLD,
            ioq: VecDeque::new(),
            pending: HashMap::new(),
            resolve_start: None,
            counters,
        }
    }

    /// Reset for a new connection attempt.
    pub fn reset(&mut self) {
        self.state = ConnState::Idle;
        self.connected = false;
        self.quota = 1;
        self.quota_set = false;
        self.remote_credit = 1;
        self.inline_size = INLINE_THRESHOLD;
        self.resolve_start = None;
    }

    /// Take one credit.
    pub fn quota_get(&mut self) -> bool {
        if self.connected && self.quota > 0 {
            self.quota -= 1;
            true
        } else {
            false
        }
    }

    pub fn quota_put(&mut self) {
        self.quota += 1;
    }

    /// Issue `entry` right away if nothing is queued ahead of it and credit
    /// is available, queue it otherwise.
    ///
    /// A failure to issue is returned and the entry is dropped; the caller
    /// is expected to disconnect.
    pub fn submit<F>(&mut self, entry: IoqEntry, mut issue: F) -> Result<Submitted, TransportError>
    where
        F: FnMut(&mut Peer, &IoqEntry) -> Result<(), TransportError>,
    {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.ioq.is_empty() && self.quota_get() {
            return match issue(self, &entry) {
                Ok(()) => Ok(Submitted::Issued),
                Err(e) => {
                    self.quota_put();
                    Err(e)
                }
            };
        }
        Counters::add(&self.counters.quota_stalls, 1);
        log::trace!("xid {:#x} queued behind {} entries (quota {})", entry.xid(), self.ioq.len(), self.quota);
        self.ioq.push_back(entry);
        Ok(Submitted::Queued)
    }

    /// Issue queued entries while credit lasts. Return how many were issued.
    ///
    /// An entry that fails to issue goes back to the head of the queue with
    /// its credit, so that teardown can flush it.
    pub fn churn<F>(&mut self, mut issue: F) -> Result<usize, TransportError>
    where
        F: FnMut(&mut Peer, &IoqEntry) -> Result<(), TransportError>,
    {
        let mut issued = 0;
        while !self.ioq.is_empty() && self.quota_get() {
            let Some(entry) = self.ioq.pop_front() else {
                self.quota_put();
                break;
            };
            if let Err(e) = issue(self, &entry) {
                self.quota_put();
                self.ioq.push_front(entry);
                return Err(e);
            }
            issued += 1;
        }
        if issued > 0 {
            log::debug!("churned {} entries, quota now {}", issued, self.quota);
        }
        Ok(issued)
    }

    /// Return one credit and drain the queue with it.
    pub fn credit_returned<F>(&mut self, issue: F) -> Result<usize, TransportError>
    where
        F: FnMut(&mut Peer, &IoqEntry) -> Result<(), TransportError>,
    {
        self.quota_put();
        Counters::add(&self.counters.credits_returned, 1);
        if self.ioq.is_empty() {
            return Ok(0);
        }
        Counters::add(&self.counters.churns, 1);
        self.churn(issue)
    }

    /// Put `entry` on the wire.
    pub fn issue(&mut self, entry: &IoqEntry) -> Result<(), TransportError> {
        match entry {
            IoqEntry::Request { xid, req, plan } => self.issue_request(*xid, req, *plan),
            IoqEntry::Reply { xid, reply } => self.issue_reply(*xid, reply),
            IoqEntry::Error { xid, code } => self.issue_error(*xid, *code),
        }
    }

    fn device(&self) -> Result<Arc<Device>, TransportError> {
        self.device.clone().ok_or(TransportError::NotConnected)
    }

    fn qp(&self) -> Result<&Arc<dyn Qp>, TransportError> {
        self.qp.as_ref().ok_or(TransportError::NotConnected)
    }

    fn post_send(&self, post: &Post, len: usize) -> Result<(), TransportError> {
        let wr = SendWr::new(vec![post.sge(len)], post.wr_id(), true, SendWrDetails::Send);
        self.qp()?.post_send(&wr)?;
        Counters::add(&self.counters.msgs_sent, 1);
        Counters::add(&self.counters.bytes_sent, len as u64);
        Ok(())
    }

    /// Encode, send, and give the post back if anything fails.
    fn send_with<F>(&self, device: &Device, need: usize, encode: F) -> Result<Arc<Post>, TransportError>
    where
        F: FnOnce(&mut [u8]) -> Result<usize, ProtoError>,
    {
        let post = device.get_send_post(need)?;
        let res = {
            let mut state = post.lock();
            encode(state.buf.as_mut_slice())
        };
        let sent = res
            .map_err(TransportError::from)
            .and_then(|len| self.post_send(&post, len));
        match sent {
            Ok(()) => Ok(post),
            Err(e) => {
                device.release(&post);
                Err(e)
            }
        }
    }

    fn issue_request(&mut self, xid: u32, req: &RpcRequest, plan: ChunkPlan) -> Result<(), TransportError> {
        let device = self.device()?;
        let registry = device.registry();
        let reads = registry.register_all(&plan.read_vectors(req), Permission::REMOTE_READ)?;
        let replies = registry.register_all(
            &plan.reply_vectors(req),
            Permission::REMOTE_WRITE | Permission::LOCAL_WRITE,
        )?;

        let read_segs: Vec<Segment> = reads.iter().map(RegisteredRegion::segment).collect();
        let reply_segs: Vec<Segment> = replies.iter().map(RegisteredRegion::segment).collect();
        let lists = plan.lists(req.header_len() as u32, &read_segs, &reply_segs);
        let msg_type = match plan.read {
            ReadType::Whole => MsgType::NoMsg,
            _ => MsgType::Msg,
        };
        let header = Header::new(xid, self.credit, msg_type);
        let inline = plan.inline_vectors(req);
        log::trace!(
            "request {:#x}: {:?}, {} inline bytes, {} segments",
            xid,
            plan,
            iov_len(&inline),
            lists.segment_count()
        );

        let mut regions = reads;
        regions.extend(replies);
        self.pending.insert(
            xid,
            RequestContext {
                _regions: regions,
                rsphdr: req.rsphdr.clone(),
                rsp_payload: req.rsp_payload.clone(),
            },
        );

        let need = HEADER_SIZE + lists.encoded_len() + iov_len(&inline);
        let sent = self.send_with(&device, need, |buf| {
            let n = encode_message(buf, &header, &lists)?;
            Ok(n + copy_inline(&mut buf[n..], &inline)?)
        });
        match sent {
            Ok(post) => {
                let mut state = post.lock();
                state.ctx.is_request = true;
                state.ctx.xid = xid;
                Ok(())
            }
            Err(e) => {
                self.pending.remove(&xid);
                Err(e)
            }
        }
    }

    fn issue_reply(&mut self, xid: u32, reply: &RpcReply) -> Result<(), TransportError> {
        let chunk = reply
            .reply_info
            .as_ref()
            .map_or(ReplyChunk::Inline, |info| info.chunk.clone());
        let headers: Vec<IoBuf> = reply.rpchdr.iter().chain(&reply.proghdr).cloned().collect();

        match chunk {
            ReplyChunk::Inline => {
                let mut iov = headers;
                iov.extend(reply.payload.iter().cloned());
                let lists = ChunkLists::default();
                let need = HEADER_SIZE + lists.encoded_len() + iov_len(&iov);
                if need > self.inline_size {
                    log::warn!("reply {:#x} of {} bytes does not fit inline and has no chunk", xid, need);
                    return self.issue_error(xid, ErrorCode::Chunk);
                }
                let device = self.device()?;
                self.send_with(&device, need, |buf| {
                    let n = encode_reply_header(buf, xid, self.credit, None, None)?;
                    Ok(n + copy_inline(&mut buf[n..], &iov)?)
                })?;
                Ok(())
            }
            ReplyChunk::Reply(segs) => {
                let mut iov = non_empty(&headers);
                iov.extend(non_empty(&reply.payload));
                let plan = write_plan(&segs, &lens(&iov));
                if plan.remaining > 0 {
                    log::warn!("reply {:#x} overflows its reply chunk by {} bytes", xid, plan.remaining);
                    return self.issue_error(xid, ErrorCode::Chunk);
                }
                log::trace!("reply {:#x}: {} bytes into reply chunk", xid, iov_len(&iov));
                self.write_and_send(xid, &iov, &plan, &[], |buf, credit| {
                    encode_reply_header(buf, xid, credit, None, Some(&plan.written))
                })
            }
            ReplyChunk::Write(segs) => {
                if HEADER_SIZE + MAX_HEADER_SIZE + iov_len(&headers) > self.inline_size {
                    log::warn!("reply {:#x} headers do not fit inline", xid);
                    return self.issue_error(xid, ErrorCode::Chunk);
                }
                let payload = non_empty(&reply.payload);
                let plan = write_plan(&segs, &lens(&payload));
                if plan.remaining > 0 {
                    log::warn!("reply {:#x} overflows its write list by {} bytes", xid, plan.remaining);
                    return self.issue_error(xid, ErrorCode::Chunk);
                }
                log::trace!("reply {:#x}: {} bytes into write list", xid, iov_len(&payload));
                self.write_and_send(xid, &payload, &plan, &headers, |buf, credit| {
                    encode_reply_header(buf, xid, credit, Some(&plan.written), None)
                })
            }
        }
    }

    /// RDMA-write `iov` as `plan` says, then send the header built by
    /// `encode` followed by `inline`.
    fn write_and_send<F>(
        &mut self,
        xid: u32,
        iov: &[IoBuf],
        plan: &WritePlan,
        inline: &[IoBuf],
        encode: F,
    ) -> Result<(), TransportError>
    where
        F: FnOnce(&mut [u8], u32) -> Result<usize, ProtoError>,
    {
        let device = self.device()?;
        let regions = device.registry().register_all(iov, Permission::LOCAL_WRITE)?;
        let sges: Vec<Sge> = regions.iter().map(RegisteredRegion::sge).collect();

        let need = HEADER_SIZE + MAX_HEADER_SIZE + iov_len(inline);
        let post = device.get_send_post(need)?;
        post.lock().ctx.regions = regions;

        if let Err(e) = self.post_writes(&device, &post, &sges, plan) {
            device.release(&post);
            return Err(e);
        }

        let credit = self.credit;
        let res = {
            let mut state = post.lock();
            state.ctx.xid = xid;
            let buf = state.buf.as_mut_slice();
            encode(&mut *buf, credit).and_then(|n| Ok(n + copy_inline(&mut buf[n..], inline)?))
        };
        let sent = res
            .map_err(TransportError::from)
            .and_then(|len| self.post_send(&post, len));
        if let Err(e) = sent {
            device.release(&post);
            return Err(e);
        }
        Ok(())
    }

    /// One RDMA write per piece, each holding a reference on `post`.
    fn post_writes(&self, device: &Device, post: &Arc<Post>, sges: &[Sge], plan: &WritePlan) -> Result<(), TransportError> {
        let qp = self.qp()?;
        for piece in &plan.pieces {
            let base = sges[piece.vector];
            let sge = Sge {
                addr: base.addr + piece.offset as u64,
                length: piece.len as u32,
                lkey: base.lkey,
            };
            post.take_ref();
            let wr = SendWr::new(vec![sge], post.wr_id(), true, SendWrDetails::Write(piece.remote));
            if let Err(e) = qp.post_send(&wr) {
                device.release(post);
                return Err(e.into());
            }
            Counters::add(&self.counters.rdma_writes, 1);
        }
        Ok(())
    }

    fn issue_error(&mut self, xid: u32, code: ErrorCode) -> Result<(), TransportError> {
        let device = self.device()?;
        log::debug!("sending {:?} error for xid {:#x}", code, xid);
        self.send_with(&device, HEADER_SIZE + 12, |buf| {
            encode_error(buf, xid, self.credit, code)
        })?;
        Ok(())
    }
}

fn lens(iov: &[IoBuf]) -> Vec<usize> {
    iov.iter().map(IoBuf::len).collect()
}

fn copy_inline(buf: &mut [u8], iov: &[IoBuf]) -> Result<usize, ProtoError> {
    let mut w = Writer::new(buf);
    for v in iov {
        w.bytes(v.as_slice())?;
    }
    Ok(w.position())
}
