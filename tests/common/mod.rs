#![allow(dead_code)]

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use rpcrdma::prelude::*;
use rpcrdma::rdma::soft::SoftFabric;

pub const WAIT: Duration = Duration::from_secs(10);

const RPC_CALL: u32 = 0;
const RPC_REPLY: u32 = 1;

/// What a handler saw.
#[derive(Debug)]
pub enum Event {
    Connected(Transport),
    Accepted(Transport),
    Disconnected(Transport),
    Message(Transport, InboundMsg),
    Flushed(FlushedEntry),
}

/// How the server side answers requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Answer {
    /// Do not answer.
    Silent,
    /// Send back the request body after the RPC header, if the reply can get
    /// there; a length summary otherwise.
    Echo,
}

/// Handler forwarding every callback to a channel.
pub struct Recorder {
    tx: Mutex<Sender<Event>>,
    answer: Answer,
    /// Requests larger than this wait on `gate` before being answered.
    gate_len: AtomicUsize,
    gate: Mutex<Option<Receiver<()>>>,
}

impl Recorder {
    pub fn new(answer: Answer) -> (Arc<Self>, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        let me = Arc::new(Self {
            tx: Mutex::new(tx),
            answer,
            gate_len: AtomicUsize::new(usize::MAX),
            gate: Mutex::new(None),
        });
        (me, rx)
    }

    /// Hold requests longer than `min_len` in `on_message` until the returned
    /// sender fires or is dropped.
    pub fn gate(&self, min_len: usize) -> Sender<()> {
        let (tx, rx) = mpsc::channel();
        *self.gate.lock().unwrap() = Some(rx);
        self.gate_len.store(min_len, Ordering::SeqCst);
        tx
    }

    fn record(&self, event: Event) {
        let _ = self.tx.lock().unwrap().send(event);
    }

    fn wait_gate(&self, len: usize) {
        if len <= self.gate_len.load(Ordering::SeqCst) {
            return;
        }
        if let Some(rx) = self.gate.lock().unwrap().as_ref() {
            let _ = rx.recv_timeout(WAIT);
        }
    }

    fn answer(&self, xprt: &Transport, msg: &InboundMsg) {
        let body = msg.to_vec();
        let hdr = IoBuf::from_slice(&rpc_header(msg.xid, RPC_REPLY)).unwrap();
        let info = msg.reply_info.clone();
        let fits_inline = body.len() <= 1536;
        let payload = match info.as_ref().map(|i| &i.chunk) {
            Some(ReplyChunk::Inline) | None if !fits_inline => (body.len() as u64).to_be_bytes().to_vec(),
            _ => body[8..].to_vec(),
        };
        let mut reply = RpcReply::new(vec![hdr], info);
        if !payload.is_empty() {
            reply = reply.with_payload(vec![IoBuf::from_slice(&payload).unwrap()]);
        }
        let _ = xprt.submit_reply(reply);
    }
}

impl RpcHandler for Recorder {
    fn on_connect(&self, xprt: &Transport) {
        self.record(Event::Connected(xprt.clone()));
    }

    fn on_accept(&self, _listener: &Transport, xprt: &Transport) {
        self.record(Event::Accepted(xprt.clone()));
    }

    fn on_disconnect(&self, xprt: &Transport) {
        self.record(Event::Disconnected(xprt.clone()));
    }

    fn on_message(&self, xprt: &Transport, msg: InboundMsg) {
        let answer = !msg.is_reply && self.answer == Answer::Echo;
        let len = msg.len();
        self.record(Event::Message(xprt.clone(), msg.clone()));
        if answer {
            self.wait_gate(len);
            self.answer(xprt, &msg);
        }
    }

    fn on_flush(&self, _xprt: &Transport, entry: FlushedEntry) {
        self.record(Event::Flushed(entry));
    }
}

pub fn rpc_header(xid: u32, direction: u32) -> Vec<u8> {
    let mut hdr = xid.to_be_bytes().to_vec();
    hdr.extend_from_slice(&direction.to_be_bytes());
    hdr
}

/// A call with an 8-byte RPC header and `payload`.
pub fn call(xid: u32, payload: &[u8]) -> Result<RpcRequest> {
    let hdr = IoBuf::from_slice(&rpc_header(xid, RPC_CALL))?;
    let mut req = RpcRequest::new(vec![hdr]);
    if !payload.is_empty() {
        req = req.with_payload(vec![IoBuf::from_slice(payload)?]);
    }
    Ok(req)
}

/// `len` bytes of a recognizable pattern.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

pub fn server_opts(port: u16) -> TransportOptions {
    TransportOptions {
        listen_port: Some(port),
        send_count: 32,
        recv_count: 64,
        ..Default::default()
    }
}

pub fn client_opts(port: u16) -> TransportOptions {
    TransportOptions {
        remote_host: Some("127.0.0.1".to_owned()),
        remote_port: Some(port),
        send_count: 32,
        recv_count: 64,
        ..Default::default()
    }
}

pub fn next(rx: &Receiver<Event>) -> Result<Event> {
    rx.recv_timeout(WAIT).map_err(|e| anyhow!("no event: {}", e))
}

/// Assert nothing arrives for a while.
pub fn quiet(rx: &Receiver<Event>, wait: Duration) -> Result<()> {
    match rx.recv_timeout(wait) {
        Err(RecvTimeoutError::Timeout) => Ok(()),
        Err(e) => bail!("handler gone: {}", e),
        Ok(ev) => bail!("unexpected event {:?}", ev),
    }
}

pub fn next_message(rx: &Receiver<Event>) -> Result<InboundMsg> {
    loop {
        match next(rx)? {
            Event::Message(_, msg) => return Ok(msg),
            Event::Flushed(_) => continue,
            ev => bail!("expected a message, got {:?}", ev),
        }
    }
}

pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < WAIT {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// A connected client/server pair on one fabric.
pub struct Pair {
    pub fabric: SoftFabric,
    pub ctx: RdmaCtx,
    pub listener: Transport,
    pub client: Transport,
    pub server: Transport,
    pub client_rx: Receiver<Event>,
    pub server_rx: Receiver<Event>,
    pub server_handler: Arc<Recorder>,
}

impl Pair {
    pub fn connect(port: u16) -> Result<Self> {
        Self::connect_with(server_opts(port), client_opts(port))
    }

    pub fn connect_with(sopts: TransportOptions, copts: TransportOptions) -> Result<Self> {
        let fabric = SoftFabric::new();
        let ctx = RdmaCtx::new(Arc::new(fabric.clone()))?;

        let (server_handler, server_rx) = Recorder::new(Answer::Echo);
        let listener = Transport::new(&ctx, sopts, server_handler.clone())?;
        listener.listen()?;

        let (client_handler, client_rx) = Recorder::new(Answer::Silent);
        let client = Transport::new(&ctx, copts, client_handler)?;
        client.connect(None)?;

        match next(&client_rx)? {
            Event::Connected(x) if x == client => {}
            ev => bail!("expected the client to connect, got {:?}", ev),
        }
        let server = match next(&server_rx)? {
            Event::Accepted(x) => x,
            ev => bail!("expected an accepted connection, got {:?}", ev),
        };

        Ok(Self {
            fabric,
            ctx,
            listener,
            client,
            server,
            client_rx,
            server_rx,
            server_handler,
        })
    }
}

impl Drop for Pair {
    fn drop(&mut self) {
        self.ctx.shutdown();
    }
}
