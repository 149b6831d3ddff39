mod common;

use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use rpcrdma::prelude::*;
use rpcrdma::proto::{
    decode_message, encode_error, encode_message, ChunkLists, Decoded, ErrorCode, Header, MsgType, Segment,
    INLINE_THRESHOLD, RDMA_VERSION,
};
use rpcrdma::rdma::cm::{CmChannel, CmEventKind, CmId, ConnParam, SockAddr};
use rpcrdma::rdma::cq::{Cq, Wc, WcOpcode};
use rpcrdma::rdma::mr::{Mr, Permission};
use rpcrdma::rdma::nic::Fabric;
use rpcrdma::rdma::pd::Pd;
use rpcrdma::rdma::qp::{Mtu, Qp, QpCaps, QpInitAttr};
use rpcrdma::rdma::soft::SoftFabric;
use rpcrdma::rdma::srq::Srq;
use rpcrdma::rdma::wr::{RecvWr, SendWr, SendWrDetails, Sge};
use rpcrdma::xprt::{ChunkPlan, DeviceError, ReadType};

use common::*;

fn reply_body(xid: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = rpc_header(xid, 1);
    body.extend_from_slice(payload);
    body
}

#[test]
fn test_inline_call_and_reply() -> Result<()> {
    let pair = Pair::connect(24001)?;
    let payload = pattern(1024, 1);
    pair.client.submit_request(call(1, &payload)?)?;

    let req = next_message(&pair.server_rx)?;
    assert!(!req.is_reply);
    assert_eq!(req.xid, 1);
    assert_eq!(req.to_vec(), [rpc_header(1, 0), payload.clone()].concat());
    assert_eq!(req.reply_info.as_ref().map(|i| &i.chunk), Some(&ReplyChunk::Inline));

    let rsp = next_message(&pair.client_rx)?;
    assert!(rsp.is_reply);
    assert_eq!(rsp.request, Some(1));
    assert_eq!(rsp.to_vec(), reply_body(1, &payload));

    assert!(eventually(|| pair.client.stats().credits_returned == 1));
    let stats = pair.client.stats();
    assert_eq!((stats.msgs_sent, stats.msgs_received), (1, 1));
    assert_eq!((stats.rdma_reads, stats.rdma_writes), (0, 0));
    Ok(())
}

#[test]
fn test_large_payload_is_read_by_server() -> Result<()> {
    let pair = Pair::connect(24002)?;
    let payload = pattern(4 << 20, 2);
    pair.client.submit_request(call(2, &payload)?)?;

    let req = next_message(&pair.server_rx)?;
    assert_eq!(req.xid, 2);
    assert_eq!(req.len(), 8 + payload.len());
    assert!(req.to_vec()[8..] == payload[..]);
    assert_eq!(pair.server.stats().rdma_reads, 1);

    let rsp = next_message(&pair.client_rx)?;
    let total = (8 + payload.len()) as u64;
    assert_eq!(rsp.to_vec(), reply_body(2, &total.to_be_bytes()));
    Ok(())
}

#[test]
fn test_oversized_headers_read_whole() -> Result<()> {
    let pair = Pair::connect(24003)?;
    let proghdr = pattern(2000, 3);
    let payload = pattern(100, 4);
    let req = call(3, &payload)?.with_proghdr(vec![IoBuf::from_slice(&proghdr)?]);
    assert_eq!(ChunkPlan::for_request(&req, INLINE_THRESHOLD)?.read, ReadType::Whole);
    pair.client.submit_request(req)?;

    let req = next_message(&pair.server_rx)?;
    assert_eq!(req.xid, 3);
    assert_eq!(req.to_vec(), [rpc_header(3, 0), proghdr, payload].concat());

    let rsp = next_message(&pair.client_rx)?;
    assert_eq!(rsp.to_vec(), reply_body(3, &2108u64.to_be_bytes()));
    Ok(())
}

#[test]
fn test_reply_payload_through_write_list() -> Result<()> {
    let pair = Pair::connect(24004)?;
    let payload = pattern(6000, 5);
    let sink = IoBuf::new(6000)?;
    let req = call(4, &payload)?.with_reply_payload(vec![sink]);
    pair.client.submit_request(req)?;

    let req = next_message(&pair.server_rx)?;
    match req.reply_info.as_ref().map(|i| &i.chunk) {
        Some(ReplyChunk::Write(segs)) => assert_eq!(segs.iter().map(|s| s.length).sum::<u32>(), 6000),
        other => bail!("expected a write list, got {:?}", other),
    }

    let rsp = next_message(&pair.client_rx)?;
    assert_eq!(rsp.xid, 4);
    assert_eq!(rsp.to_vec(), reply_body(4, &payload));
    assert!(eventually(|| pair.server.stats().rdma_writes == 1));
    Ok(())
}

#[test]
fn test_whole_reply_through_reply_chunk() -> Result<()> {
    let pair = Pair::connect(24005)?;
    let payload = pattern(3000, 6);
    let req = call(5, &payload)?.with_reply_buffer(IoBuf::new(16384)?);
    pair.client.submit_request(req)?;

    let req = next_message(&pair.server_rx)?;
    assert!(matches!(
        req.reply_info.as_ref().map(|i| &i.chunk),
        Some(ReplyChunk::Reply(_))
    ));

    let rsp = next_message(&pair.client_rx)?;
    assert_eq!(rsp.xid, 5);
    assert_eq!(rsp.len(), 3008);
    assert_eq!(rsp.to_vec(), reply_body(5, &payload));
    Ok(())
}

#[test]
fn test_single_credit_keeps_order() -> Result<()> {
    let sopts = TransportOptions {
        send_count: 1,
        ..server_opts(24006)
    };
    let copts = TransportOptions {
        send_count: 1,
        ..client_opts(24006)
    };
    let pair = Pair::connect_with(sopts, copts)?;

    for xid in 1..=5 {
        pair.client.submit_request(call(xid, &pattern(64, xid as u8))?)?;
    }
    for xid in 1..=5 {
        let rsp = next_message(&pair.client_rx)?;
        assert_eq!(rsp.xid, xid);
        assert_eq!(rsp.to_vec(), reply_body(xid, &pattern(64, xid as u8)));
    }

    assert!(eventually(|| pair.client.stats().credits_returned == 5));
    let stats = pair.client.stats();
    assert_eq!(stats.msgs_sent, 5);
    assert!(stats.quota_stalls <= 4);
    assert_eq!(stats.churns, stats.quota_stalls);
    Ok(())
}

#[test]
fn test_disconnect_flushes_queued_requests() -> Result<()> {
    let sopts = TransportOptions {
        send_count: 1,
        ..server_opts(24007)
    };
    let pair = Pair::connect_with(sopts, client_opts(24007))?;

    // The read completion of a large request stalls the device's send
    // completions while the server handler waits on the gate.
    let gate = pair.server_handler.gate(4096);
    pair.client.submit_request(call(1, &pattern(8192, 1))?)?;
    assert_eq!(next_message(&pair.server_rx)?.xid, 1);
    assert!(eventually(|| pair.client.stats().credits_returned == 1));

    for xid in 2..=5 {
        pair.client.submit_request(call(xid, b"queued")?)?;
    }
    pair.client.disconnect();

    let mut flushed = Vec::new();
    loop {
        match next(&pair.client_rx)? {
            Event::Flushed(entry) => {
                assert!(!entry.is_reply);
                flushed.push(entry.xid);
            }
            Event::Disconnected(x) => {
                assert_eq!(x, pair.client);
                break;
            }
            Event::Message(..) => {}
            ev => bail!("unexpected {:?}", ev),
        }
    }
    assert_eq!(flushed, vec![3, 4, 5]);
    assert_eq!(pair.client.state(), ConnState::Disconnected);
    assert!(!pair.client.is_connected());
    assert!(matches!(
        pair.client.submit_request(call(6, b"late")?),
        Err(TransportError::NotConnected)
    ));

    drop(gate);
    while let Ok(ev) = pair.client_rx.recv_timeout(Duration::from_millis(200)) {
        if let Event::Disconnected(_) = ev {
            bail!("second disconnect notification");
        }
    }
    assert!(eventually(|| pair.ctx.device_stats()[0].peers == 0));
    Ok(())
}

#[test]
fn test_server_disconnect_reaches_client() -> Result<()> {
    let pair = Pair::connect(24008)?;
    pair.server.disconnect();

    match next(&pair.client_rx)? {
        Event::Disconnected(x) => assert_eq!(x, pair.client),
        ev => bail!("unexpected {:?}", ev),
    }
    match next(&pair.server_rx)? {
        Event::Disconnected(x) => assert_eq!(x, pair.server),
        ev => bail!("unexpected {:?}", ev),
    }
    assert_eq!(pair.listener.state(), ConnState::Listening);
    Ok(())
}

fn failed_connect(fabric: SoftFabric, port: u16) -> Result<()> {
    let ctx = RdmaCtx::new(Arc::new(fabric))?;
    let (handler, rx) = Recorder::new(Answer::Silent);
    let client = Transport::new(&ctx, client_opts(port), handler)?;
    client.connect(None)?;

    let res = match next(&rx)? {
        Event::Disconnected(x) if x == client => {
            assert_eq!(client.state(), ConnState::Disconnected);
            quiet(&rx, Duration::from_millis(100))
        }
        ev => Err(anyhow!("unexpected {:?}", ev)),
    };
    ctx.shutdown();
    res
}

#[test]
fn test_connect_refused() -> Result<()> {
    failed_connect(SoftFabric::new(), 24009)
}

#[test]
fn test_connect_unreachable() -> Result<()> {
    let fabric = SoftFabric::new();
    fabric.set_unreachable(SockAddr::Inet("127.0.0.1:24010".parse()?), true);
    failed_connect(fabric, 24010)
}

#[test]
fn test_submission_errors() -> Result<()> {
    let pair = Pair::connect(24011)?;
    assert!(matches!(
        pair.listener.submit_request(call(1, b"x")?),
        Err(TransportError::Listener)
    ));
    assert!(matches!(
        pair.client.submit_request(RpcRequest::new(vec![IoBuf::from_slice(&[1, 2])?])),
        Err(TransportError::BadRpc(_))
    ));
    let conflicting = call(2, b"x")?
        .with_reply_buffer(IoBuf::new(64)?)
        .with_reply_payload(vec![IoBuf::new(64)?]);
    assert!(matches!(
        pair.client.submit_request(conflicting),
        Err(TransportError::ConflictingChunks)
    ));
    assert!(pair.client.is_connected());

    let idle = Transport::new(&pair.ctx, client_opts(24011), Recorder::new(Answer::Silent).0)?;
    assert!(matches!(
        idle.submit_request(call(3, b"x")?),
        Err(TransportError::NotConnected)
    ));
    assert!(matches!(
        pair.client.connect(None),
        Err(TransportError::AlreadyConnected)
    ));

    let stats = pair.ctx.device_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].name, "soft0");
    assert_eq!(stats[0].peers, 2);
    Ok(())
}

#[test]
fn test_unknown_device_rejected() -> Result<()> {
    let ctx = RdmaCtx::new(Arc::new(SoftFabric::new()))?;
    let opts = TransportOptions {
        device_name: Some("mlx5_.*".to_owned()),
        ..client_opts(24012)
    };
    let res = Transport::new(&ctx, opts, Recorder::new(Answer::Silent).0);
    assert!(matches!(
        res,
        Err(TransportError::Device(DeviceError::NotFound(_)))
    ));
    ctx.shutdown();
    Ok(())
}

fn expect_cm(ch: &Arc<dyn CmChannel>, kind: CmEventKind) -> Result<()> {
    let ev = ch.get_cm_event()?;
    if ev.kind != kind {
        bail!("expected {:?}, got {:?}", kind, ev);
    }
    Ok(())
}

#[test]
fn test_version_mismatch_answered_with_error() -> Result<()> {
    let fabric = SoftFabric::new();
    let ctx = RdmaCtx::new(Arc::new(fabric.clone()))?;
    let (handler, server_rx) = Recorder::new(Answer::Echo);
    let listener = Transport::new(&ctx, server_opts(24013), handler)?;
    listener.listen()?;

    // A bare verbs peer speaking a future protocol version.
    let ch = fabric.create_event_channel()?;
    let id = ch.create_id()?;
    id.resolve_addr(None, &SockAddr::Inet("127.0.0.1:24013".parse()?), WAIT)?;
    expect_cm(&ch, CmEventKind::AddressResolved)?;
    id.resolve_route(WAIT)?;
    expect_cm(&ch, CmEventKind::RouteResolved)?;

    let dev = id.context().ok_or_else(|| anyhow!("no device"))?;
    let pd = dev.alloc_pd()?;
    let comp = dev.create_comp_channel()?;
    let cq = dev.create_cq(16, &comp)?;
    let srq = pd.create_srq(16, 1)?;
    let qp = id.create_qp(
        &pd,
        &QpInitAttr {
            send_cq: cq.clone(),
            recv_cq: cq.clone(),
            srq: Some(srq.clone()),
            caps: QpCaps::default(),
            mtu: Mtu::default(),
        },
    )?;

    let mut buf = vec![0u8; 4096];
    let mr = unsafe { pd.reg_mr(buf.as_mut_ptr(), buf.len(), Permission::LOCAL_WRITE) }?;
    let recv_sge = Sge::from_mr(&*mr, mr.addr() + 2048, 2048).ok_or_else(|| anyhow!("bad sge"))?;
    srq.post_recv(&RecvWr::new(vec![recv_sge], 1))?;

    let mut private = 1u32.to_be_bytes().to_vec();
    private.extend_from_slice(&4u32.to_be_bytes());
    id.connect(&ConnParam {
        private_data: private,
        ..Default::default()
    })?;
    expect_cm(&ch, CmEventKind::Established)?;
    assert!(matches!(next(&server_rx)?, Event::Accepted(_)));

    let msg: Vec<u8> = [0x77u32, 2, 4, MsgType::Msg as u32, 0, 0, 0, 0x77, 0]
        .iter()
        .flat_map(|w| w.to_be_bytes())
        .collect();
    buf[..msg.len()].copy_from_slice(&msg);
    let send_sge = Sge::from_mr(&*mr, mr.addr(), msg.len()).ok_or_else(|| anyhow!("bad sge"))?;
    qp.post_send(&SendWr::new(vec![send_sge], 2, true, SendWrDetails::Send))?;

    let mut received = None;
    let polled = eventually(|| {
        let mut wc = [Wc::default(); 4];
        let n = cq.poll_into(&mut wc).unwrap_or(0) as usize;
        for wc in &wc[..n] {
            if wc.opcode() == WcOpcode::Recv {
                received = Some(*wc);
            }
        }
        received.is_some()
    });
    assert!(polled);
    let wc = received.ok_or_else(|| anyhow!("no reply"))?;
    let len = wc.ok().map_err(|s| anyhow!("receive failed: {:?}", s))?;

    match decode_message(&buf[2048..2048 + len])? {
        Decoded::Error { header, code } => {
            assert_eq!(header.xid, 0x77);
            assert_eq!(code, ErrorCode::Vers { low: 1, high: 1 });
        }
        other => bail!("expected an error message, got {:?}", other),
    }
    quiet(&server_rx, Duration::from_millis(100))?;

    id.destroy();
    ctx.shutdown();
    Ok(())
}

fn small_buffers(opts: TransportOptions) -> TransportOptions {
    TransportOptions {
        send_size: 1024,
        recv_size: 1024,
        ..opts
    }
}

fn send_posts(ctx: &RdmaCtx) -> usize {
    let posts = ctx.device_stats()[0].send_posts;
    posts.active + posts.passive
}

#[test]
fn test_small_receive_buffers_move_requests_to_chunks() -> Result<()> {
    let pair = Pair::connect_with(small_buffers(server_opts(24014)), small_buffers(client_opts(24014)))?;
    let filled = send_posts(&pair.ctx);

    for xid in 1..=20 {
        let payload = pattern(1500, xid as u8);
        let req = call(xid, &payload)?.with_reply_buffer(IoBuf::new(4096)?);
        pair.client.submit_request(req)?;

        let req = next_message(&pair.server_rx)?;
        assert_eq!(req.to_vec(), [rpc_header(xid, 0), payload.clone()].concat());
        let rsp = next_message(&pair.client_rx)?;
        assert_eq!(rsp.to_vec(), reply_body(xid, &payload));
    }

    assert!(pair.client.is_connected());
    assert_eq!(pair.server.stats().rdma_reads, 20);
    assert!(eventually(|| send_posts(&pair.ctx) == filled));
    Ok(())
}

#[test]
fn test_reply_beyond_receive_buffers_disconnects() -> Result<()> {
    let pair = Pair::connect_with(small_buffers(server_opts(24015)), small_buffers(client_opts(24015)))?;

    // Echoed inline, the reply outgrows the client's receive buffers and
    // the server answers with a chunk error instead.
    pair.client.submit_request(call(1, &pattern(1100, 7))?)?;
    assert_eq!(next_message(&pair.server_rx)?.xid, 1);
    match next(&pair.client_rx)? {
        Event::Disconnected(x) => assert_eq!(x, pair.client),
        ev => bail!("unexpected {:?}", ev),
    }
    match next(&pair.server_rx)? {
        Event::Disconnected(x) => assert_eq!(x, pair.server),
        ev => bail!("unexpected {:?}", ev),
    }
    Ok(())
}

#[test]
fn test_server_request_before_first_message_is_dropped() -> Result<()> {
    let pair = Pair::connect(24016)?;
    pair.server.submit_request(call(1, b"early")?)?;
    quiet(&pair.client_rx, Duration::from_millis(200))?;
    assert_eq!(pair.server.stats().msgs_sent, 0);
    assert!(pair.server.is_connected());

    pair.client.submit_request(call(2, b"hello")?)?;
    assert_eq!(next_message(&pair.server_rx)?.xid, 2);
    assert_eq!(next_message(&pair.client_rx)?.xid, 2);

    pair.server.submit_request(call(3, b"callback")?)?;
    let callback = next_message(&pair.client_rx)?;
    assert!(!callback.is_reply);
    assert_eq!(callback.xid, 3);
    assert_eq!(callback.to_vec(), [rpc_header(3, 0), b"callback".to_vec()].concat());
    Ok(())
}

const BARE_RECV: usize = 2048;

/// A bare verbs server speaking the wire protocol by hand.
struct BareServer {
    ch: Arc<dyn CmChannel>,
    listen_id: Arc<dyn CmId>,
    id: Option<Arc<dyn CmId>>,
    _pd: Option<Arc<dyn Pd>>,
    cq: Option<Arc<dyn Cq>>,
    srq: Option<Arc<dyn Srq>>,
    qp: Option<Arc<dyn Qp>>,
    mr: Option<Arc<dyn Mr>>,
    buf: Vec<u8>,
}

impl BareServer {
    fn listen(fabric: &SoftFabric, port: u16) -> Result<Self> {
        let ch = fabric.create_event_channel()?;
        let listen_id = ch.create_id()?;
        listen_id.bind_addr(&SockAddr::Inet(format!("127.0.0.1:{}", port).parse()?))?;
        listen_id.listen(4)?;
        Ok(Self {
            ch,
            listen_id,
            id: None,
            _pd: None,
            cq: None,
            srq: None,
            qp: None,
            mr: None,
            buf: vec![0u8; 2 * BARE_RECV],
        })
    }

    /// Accept one connection, offering 4 credits and `BARE_RECV`-byte buffers.
    fn accept(&mut self) -> Result<()> {
        let ev = self.ch.get_cm_event()?;
        if ev.kind != CmEventKind::ConnectionRequest {
            bail!("expected a connection request, got {:?}", ev);
        }
        let id = ev.id;
        let dev = id.context().ok_or_else(|| anyhow!("no device"))?;
        let pd = dev.alloc_pd()?;
        let comp = dev.create_comp_channel()?;
        let cq = dev.create_cq(16, &comp)?;
        let srq = pd.create_srq(16, 1)?;
        let qp = id.create_qp(
            &pd,
            &QpInitAttr {
                send_cq: cq.clone(),
                recv_cq: cq.clone(),
                srq: Some(srq.clone()),
                caps: QpCaps::default(),
                mtu: Mtu::default(),
            },
        )?;
        let mr = unsafe { pd.reg_mr(self.buf.as_mut_ptr(), self.buf.len(), Permission::LOCAL_WRITE) }?;

        self.id = Some(id.clone());
        self._pd = Some(pd);
        self.cq = Some(cq);
        self.srq = Some(srq);
        self.qp = Some(qp);
        self.mr = Some(mr);
        self.post_recv()?;

        let private = [RDMA_VERSION, 4, BARE_RECV as u32, BARE_RECV as u32]
            .iter()
            .flat_map(|w| w.to_be_bytes())
            .collect();
        id.accept(&ConnParam {
            private_data: private,
            ..Default::default()
        })?;
        expect_cm(&self.ch, CmEventKind::Established)
    }

    fn post_recv(&self) -> Result<()> {
        let (mr, srq) = self.mr.as_ref().zip(self.srq.as_ref()).ok_or_else(|| anyhow!("not accepted"))?;
        let sge = Sge::from_mr(&**mr, mr.addr() + BARE_RECV as u64, BARE_RECV).ok_or_else(|| anyhow!("bad sge"))?;
        srq.post_recv(&RecvWr::new(vec![sge], 1))?;
        Ok(())
    }

    /// Wait for the next message and return its transport header xid.
    fn recv_xid(&self) -> Result<u32> {
        let cq = self.cq.as_ref().ok_or_else(|| anyhow!("not accepted"))?;
        let mut received = None;
        let polled = eventually(|| {
            let mut wc = [Wc::default(); 4];
            let n = cq.poll_into(&mut wc).unwrap_or(0) as usize;
            for wc in &wc[..n] {
                if wc.opcode() == WcOpcode::Recv {
                    received = Some(*wc);
                }
            }
            received.is_some()
        });
        assert!(polled);
        let wc = received.ok_or_else(|| anyhow!("nothing received"))?;
        let len = wc.ok().map_err(|s| anyhow!("receive failed: {:?}", s))?;

        let xid = match decode_message(&self.buf[BARE_RECV..BARE_RECV + len])? {
            Decoded::Chunks { header, .. } => header.xid,
            other => bail!("expected a call, got {:?}", other),
        };
        self.post_recv()?;
        Ok(xid)
    }

    fn send(&mut self, msg: &[u8]) -> Result<()> {
        self.buf[..msg.len()].copy_from_slice(msg);
        let (mr, qp) = self.mr.as_ref().zip(self.qp.as_ref()).ok_or_else(|| anyhow!("not accepted"))?;
        let sge = Sge::from_mr(&**mr, mr.addr(), msg.len()).ok_or_else(|| anyhow!("bad sge"))?;
        qp.post_send(&SendWr::new(vec![sge], 2, true, SendWrDetails::Send))?;
        Ok(())
    }
}

impl Drop for BareServer {
    fn drop(&mut self) {
        if let Some(id) = &self.id {
            id.destroy();
        }
        self.listen_id.destroy();
    }
}

/// A client transport connected to a `BareServer` on `port`.
fn bare_connect(port: u16) -> Result<(RdmaCtx, Transport, mpsc::Receiver<Event>, BareServer)> {
    let fabric = SoftFabric::new();
    let ctx = RdmaCtx::new(Arc::new(fabric.clone()))?;
    let mut bare = BareServer::listen(&fabric, port)?;

    let (handler, rx) = Recorder::new(Answer::Silent);
    let client = Transport::new(&ctx, client_opts(port), handler)?;
    client.connect(None)?;
    bare.accept()?;
    match next(&rx)? {
        Event::Connected(x) if x == client => {}
        ev => bail!("expected the client to connect, got {:?}", ev),
    }
    Ok((ctx, client, rx, bare))
}

#[test]
fn test_version_error_delivered_as_denied_reply() -> Result<()> {
    let (ctx, client, rx, mut bare) = bare_connect(24017)?;
    client.submit_request(call(9, b"hello")?)?;
    let xid = bare.recv_xid()?;
    assert_eq!(xid, 9);

    let mut out = [0u8; 64];
    let n = encode_error(&mut out, xid, 4, ErrorCode::Vers { low: 2, high: 3 })?;
    bare.send(&out[..n])?;

    let rsp = next_message(&rx)?;
    assert!(rsp.is_reply);
    assert_eq!(rsp.xid, 9);
    assert_eq!(rsp.request, Some(9));
    let denied: Vec<u8> = [9u32, 1, 1, 0, 2, 3].iter().flat_map(|w| w.to_be_bytes()).collect();
    assert_eq!(rsp.to_vec(), denied);
    assert!(client.is_connected());

    drop(bare);
    ctx.shutdown();
    Ok(())
}

#[test]
fn test_oversized_reply_chunk_disconnects() -> Result<()> {
    let (ctx, client, rx, mut bare) = bare_connect(24018)?;
    let req = call(10, b"hello")?.with_reply_buffer(IoBuf::new(4096)?);
    client.submit_request(req)?;
    let xid = bare.recv_xid()?;

    // Two segments whose lengths add up past any 32-bit length.
    let huge = Segment {
        handle: 1,
        length: u32::MAX,
        offset: 0,
    };
    let lists = ChunkLists {
        reply: Some(vec![huge; 2]),
        ..Default::default()
    };
    let mut out = [0u8; 128];
    let n = encode_message(&mut out, &Header::new(xid, 4, MsgType::NoMsg), &lists)?;
    bare.send(&out[..n])?;

    loop {
        match next(&rx)? {
            Event::Disconnected(x) => {
                assert_eq!(x, client);
                break;
            }
            Event::Flushed(_) => {}
            ev => bail!("unexpected {:?}", ev),
        }
    }
    assert_eq!(client.state(), ConnState::Disconnected);

    drop(bare);
    ctx.shutdown();
    Ok(())
}
