//! Completion processing.
//!
//! Every device runs one thread per completion queue. A thread sleeps on the
//! queue's channel, re-arms the queue, then drains it in batches. Receive
//! completions are decoded and delivered (or turned into RDMA reads);
//! send-side completions release posts and hand returned credit to the
//! owning transport.

use std::fmt;
use std::sync::Arc;

use super::device::Device;
use super::error::TransportError;
use super::msg::{reply_denied_vers, rpc_direction, FlushedEntry, InboundMsg, ReplyChunk, ReplyInfo, RPC_CALL, RPC_REPLY};
use super::peer::{IoqEntry, Role};
use super::plan::non_empty;
use super::post::Post;
use super::stats::Counters;
use super::Transport;
use crate::mem::{coalesce, IoBuf};
use crate::proto::*;
use crate::rdma::cq::{Wc, WcOpcode, WcStatus};
use crate::rdma::mr::{MrRemote, Permission};
use crate::rdma::wr::{SendWr, SendWrDetails, Sge};

/// Work completions polled at once.
const POLL_BATCH: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum CqKind {
    Send,
    Recv,
}

impl fmt::Display for CqKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CqKind::Send => "send",
            CqKind::Recv => "recv",
        })
    }
}

/// Body of a completion thread. Return once the channel is shut down.
pub(crate) fn run(device: Arc<Device>, kind: CqKind) {
    let cq = device.cq(kind).clone();
    let channel = device.channel(kind).clone();
    if let Err(e) = cq.req_notify() {
        log::error!("{}: cannot arm {} CQ: {}", device.name(), kind, e);
        return;
    }

    let mut wcs = vec![Wc::default(); POLL_BATCH];
    'events: while channel.get_cq_event().is_ok() {
        cq.ack_events(1);
        if let Err(e) = cq.req_notify() {
            log::error!("{}: cannot re-arm {} CQ: {}", device.name(), kind, e);
            break;
        }
        loop {
            let n = match cq.poll_into(&mut wcs) {
                Ok(n) => n as usize,
                Err(e) => {
                    log::error!("{}: cannot poll {} CQ: {}", device.name(), kind, e);
                    break 'events;
                }
            };
            for wc in &wcs[..n] {
                handle(&device, wc);
            }
            if n < wcs.len() {
                break;
            }
        }
    }
    log::debug!("{}: {} completion thread exits", device.name(), kind);
}

fn handle(device: &Device, wc: &Wc) {
    let post = match device.lookup_post(wc.wr_id()) {
        Ok(post) => post,
        Err(e) => {
            log::error!("{}: {}", device.name(), e);
            return;
        }
    };
    let xprt = device.lookup_peer(wc.qp_num());

    if let Err(status) = wc.ok() {
        on_failure(device, &post, xprt, wc, status);
        return;
    }
    match wc.opcode() {
        WcOpcode::Send => on_send(device, &post, xprt),
        WcOpcode::RdmaWrite => device.release(&post),
        WcOpcode::RdmaRead => on_read(device, &post, xprt),
        WcOpcode::Recv => on_recv(device, &post, xprt, wc.bytes()),
    }
}

fn on_failure(device: &Device, post: &Post, xprt: Option<Transport>, wc: &Wc, status: WcStatus) {
    if status == WcStatus::WrFlushErr {
        log::debug!("{}: {:?} on QP {} flushed", device.name(), wc.opcode(), wc.qp_num());
    } else {
        log::warn!("{}: {:?} on QP {} failed: {}", device.name(), wc.opcode(), wc.qp_num(), status);
    }
    if wc.opcode() == WcOpcode::RdmaRead {
        let mut state = post.lock();
        state.ctx.read_failed = true;
        state.ctx.pending_reads = state.ctx.pending_reads.saturating_sub(1);
    }
    if let Some(xprt) = xprt {
        xprt.disconnect_on_fault();
    }
    device.release(post);
}

fn on_send(device: &Device, post: &Post, xprt: Option<Transport>) {
    device.release(post);
    let Some(xprt) = xprt else {
        return;
    };
    let res = {
        let mut peer = xprt.inner.peer.lock();
        if !peer.connected {
            return;
        }
        peer.credit_returned(|p, e| p.issue(e))
    };
    if let Err(e) = res {
        log::warn!("{}: cannot issue queued message: {}", xprt, e);
        xprt.disconnect();
    }
}

fn on_read(device: &Device, post: &Post, xprt: Option<Transport>) {
    let done = {
        let mut state = post.lock();
        state.ctx.pending_reads = state.ctx.pending_reads.saturating_sub(1);
        if state.ctx.pending_reads == 0 && !state.ctx.read_failed {
            let ctx = &mut state.ctx;
            Some((
                ctx.xid,
                std::mem::take(&mut ctx.vectors),
                ctx.reply_info.take(),
                std::mem::take(&mut ctx.regions),
            ))
        } else {
            None
        }
    };

    if let Some(xprt) = xprt {
        Counters::add(&xprt.inner.counters.rdma_reads, 1);
        if let Some((xid, vectors, reply_info, regions)) = done {
            drop(regions);
            log::trace!("{}: request {:#x} read in full", xprt, xid);
            xprt.deliver(InboundMsg {
                xid,
                vectors: coalesce(vectors),
                is_reply: false,
                reply_info,
                request: None,
            });
        }
    }
    device.release(post);
}

fn on_recv(device: &Device, post: &Post, xprt: Option<Transport>, len: usize) {
    let Some(xprt) = xprt else {
        log::debug!("{}: message for a gone connection dropped", device.name());
        device.release(post);
        return;
    };
    Counters::add(&xprt.inner.counters.msgs_received, 1);
    Counters::add(&xprt.inner.counters.bytes_received, len as u64);

    if let Err(e) = recv_message(device, post, &xprt, len) {
        log::warn!("{}: bad message received: {}", xprt, e);
        xprt.disconnect();
    }
    device.release(post);
}

/// What a received message turned out to be.
enum Received {
    Call {
        xid: u32,
        lists: ChunkLists,
        whole: bool,
        inline: IoBuf,
    },
    Reply {
        xid: u32,
        lists: ChunkLists,
        nomsg: bool,
        inline: IoBuf,
    },
    Error {
        xid: u32,
        code: ErrorCode,
    },
    /// A header of another protocol version.
    BadVersion { xid: u32, vers: u32 },
}

fn parse(device: &Device, post: &Post, len: usize) -> Result<Received, TransportError> {
    let state = post.lock();
    let buf = &state.buf.as_slice()[..len.min(post.capacity())];
    let decoded = match decode_message(buf) {
        Ok(decoded) => decoded,
        Err(ProtoError::BadVersion(vers)) => {
            let header = decode_header(&mut Reader::new(buf))?;
            return Ok(Received::BadVersion { xid: header.xid, vers });
        }
        Err(e) => return Err(e.into()),
    };

    match decoded {
        Decoded::Error { header, code } => Ok(Received::Error { xid: header.xid, code }),
        Decoded::Chunks {
            header,
            lists,
            inline_offset,
        } => {
            let body = &buf[inline_offset..];
            let nomsg = header.msg_type == MsgType::NoMsg;
            let is_call = if nomsg {
                !lists.reads.is_empty()
            } else {
                match rpc_direction(body) {
                    Some(RPC_CALL) => true,
                    Some(RPC_REPLY) => false,
                    Some(_) => return Err(TransportError::BadRpc("unknown message direction")),
                    None => return Err(TransportError::BadRpc("inline body shorter than an RPC header")),
                }
            };
            let inline = device.pool().alloc_from(body)?;
            let xid = header.xid;
            Ok(if is_call {
                Received::Call {
                    xid,
                    lists,
                    whole: nomsg,
                    inline,
                }
            } else {
                Received::Reply {
                    xid,
                    lists,
                    nomsg,
                    inline,
                }
            })
        }
    }
}

fn recv_message(device: &Device, post: &Post, xprt: &Transport, len: usize) -> Result<(), TransportError> {
    let received = parse(device, post, len)?;
    if xprt.role() == Role::Server {
        xprt.inner.peer.lock().quota_set = true;
    }

    match received {
        Received::BadVersion { xid, vers } => {
            log::warn!("{}: peer speaks protocol version {}, answering {:#x} with a version error", xprt, vers, xid);
            xprt.submit_entry(IoqEntry::Error {
                xid,
                code: ErrorCode::Vers {
                    low: RDMA_VERSION,
                    high: RDMA_VERSION,
                },
            });
            Ok(())
        }
        Received::Error {
            code: ErrorCode::Chunk,
            xid,
        } => {
            log::error!("{}: peer could not place message {:#x} in chunks", xprt, xid);
            xprt.disconnect();
            Ok(())
        }
        Received::Error {
            code: ErrorCode::Vers { low, high },
            xid,
        } => {
            log::error!("{}: peer only speaks protocol versions {}..={}", xprt, low, high);
            let denied = device.pool().alloc_from(&reply_denied_vers(xid, low, high))?;
            recv_reply(xprt, xid, ChunkLists::default(), false, denied)
        }
        Received::Reply {
            xid,
            lists,
            nomsg,
            inline,
        } => recv_reply(xprt, xid, lists, nomsg, inline),
        Received::Call {
            xid,
            lists,
            whole,
            inline,
        } => recv_call(device, post, xprt, xid, lists, whole, inline),
    }
}

fn recv_reply(xprt: &Transport, xid: u32, lists: ChunkLists, nomsg: bool, inline: IoBuf) -> Result<(), TransportError> {
    let Some(request) = xprt.inner.handler.map_xid(xprt, xid) else {
        log::warn!("{}: reply {:#x} matches no outstanding request", xprt, xid);
        xprt.disconnect();
        return Ok(());
    };
    let ctx = xprt.inner.peer.lock().pending.remove(&xid).unwrap_or_default();

    let vectors = if nomsg {
        let len: u64 = lists.reply.iter().flatten().map(|s| u64::from(s.length)).sum();
        let buf = ctx
            .rsphdr
            .first()
            .zip(usize::try_from(len).ok())
            .and_then(|(b, len)| b.slice(0..len))
            .ok_or(TransportError::BadRpc("reply chunk exceeds the reply buffer"))?;
        vec![buf]
    } else if let Some(written) = &lists.writes {
        let targets = non_empty(&ctx.rsp_payload);
        let mut vectors = vec![inline];
        for (seg, buf) in written.iter().zip(&targets) {
            let part = buf
                .slice(0..seg.length as usize)
                .ok_or(TransportError::BadRpc("write chunk exceeds the reply buffer"))?;
            vectors.push(part);
        }
        vectors
    } else {
        vec![inline]
    };
    drop(ctx);

    xprt.deliver(InboundMsg {
        xid,
        vectors,
        is_reply: true,
        reply_info: None,
        request: Some(request),
    });
    Ok(())
}

fn recv_call(
    device: &Device,
    post: &Post,
    xprt: &Transport,
    xid: u32,
    lists: ChunkLists,
    whole: bool,
    inline: IoBuf,
) -> Result<(), TransportError> {
    let chunk = match (lists.writes, lists.reply) {
        (Some(segs), _) => ReplyChunk::Write(segs),
        (None, Some(segs)) => ReplyChunk::Reply(segs),
        (None, None) => ReplyChunk::Inline,
    };
    let reply_info = ReplyInfo { xid, chunk };

    if lists.reads.is_empty() {
        xprt.deliver(InboundMsg {
            xid,
            vectors: vec![inline],
            is_reply: false,
            reply_info: Some(reply_info),
            request: None,
        });
        return Ok(());
    }

    let headers = if whole { None } else { Some(inline) };
    start_reads(device, post, xprt, xid, &lists.reads, headers, reply_info)
}

/// Pull the read chunks of a request into one pool buffer.
///
/// Every read holds a reference on the receive post; the last read to
/// complete delivers the request.
fn start_reads(
    device: &Device,
    post: &Post,
    xprt: &Transport,
    xid: u32,
    reads: &[ReadChunk],
    headers: Option<IoBuf>,
    reply_info: ReplyInfo,
) -> Result<(), TransportError> {
    let qp = xprt.inner.peer.lock().qp.clone().ok_or(TransportError::NotConnected)?;
    let total: usize = reads.iter().map(|c| c.target.length as usize).sum();
    let data = device.pool().alloc(total)?;
    let region = device.registry().register_for_transfer(&data, Permission::LOCAL_WRITE)?;
    let base = region.sge();
    log::trace!("{}: reading {} bytes of request {:#x} in {} chunks", xprt, total, xid, reads.len());

    {
        let mut state = post.lock();
        state.ctx.pending_reads = reads.len() as u32;
        state.ctx.read_failed = false;
        state.ctx.vectors = headers.into_iter().chain(std::iter::once(data)).collect();
        state.ctx.regions = vec![region];
        state.ctx.reply_info = Some(reply_info);
        state.ctx.is_request = true;
        state.ctx.xid = xid;
    }

    let mut offset = 0u64;
    for (i, chunk) in reads.iter().enumerate() {
        let len = chunk.target.length;
        let sge = Sge {
            addr: base.addr + offset,
            length: len,
            lkey: base.lkey,
        };
        let remote = MrRemote::new(chunk.target.offset, len as usize, chunk.target.handle);
        let wr = SendWr::new(vec![sge], post.wr_id(), true, SendWrDetails::Read(remote));
        post.take_ref();
        if let Err(e) = qp.post_send(&wr) {
            {
                let mut state = post.lock();
                state.ctx.read_failed = true;
                let unposted = (reads.len() - i) as u32;
                state.ctx.pending_reads = state.ctx.pending_reads.saturating_sub(unposted);
            }
            device.release(post);
            return Err(e.into());
        }
        offset += len as u64;
    }
    Ok(())
}

/// Fail every entry of a torn-down queue.
pub(crate) fn flush(xprt: &Transport, entries: impl IntoIterator<Item = IoqEntry>) {
    for entry in entries {
        xprt.inner.handler.on_flush(
            xprt,
            FlushedEntry {
                xid: entry.xid(),
                is_reply: entry.is_reply(),
            },
        );
    }
}
