//! Messages exchanged with the RPC layer.

use super::error::TransportError;
use crate::mem::{iov_len, IoBuf};
use crate::proto::Segment;

/// ONC RPC message direction of a call.
pub(crate) const RPC_CALL: u32 = 0;
/// ONC RPC message direction of a reply.
pub(crate) const RPC_REPLY: u32 = 1;

/// Where the reply to a received request must go.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ReplyChunk {
    /// The requester supplied no reply buffers; reply inline.
    #[default]
    Inline,
    /// RDMA-write the reply payload into these segments, send headers inline.
    Write(Vec<Segment>),
    /// RDMA-write the whole reply into these segments.
    Reply(Vec<Segment>),
}

/// Reply routing of a received request.
///
/// Handed to the RPC layer with every incoming request and passed back with
/// the matching [`RpcReply`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplyInfo {
    pub xid: u32,
    pub chunk: ReplyChunk,
}

/// An outgoing RPC call.
#[derive(Clone, Debug, Default)]
pub struct RpcRequest {
    pub rpchdr: Vec<IoBuf>,
    pub proghdr: Vec<IoBuf>,
    pub payload: Vec<IoBuf>,
    /// Buffer receiving the whole reply through a reply chunk.
    pub rsphdr: Vec<IoBuf>,
    /// Buffers receiving the reply payload through a write list.
    pub rsp_payload: Vec<IoBuf>,
}

impl RpcRequest {
    pub fn new(rpchdr: Vec<IoBuf>) -> Self {
        Self {
            rpchdr,
            ..Default::default()
        }
    }

    pub fn with_proghdr(mut self, proghdr: Vec<IoBuf>) -> Self {
        self.proghdr = proghdr;
        self
    }

    pub fn with_payload(mut self, payload: Vec<IoBuf>) -> Self {
        self.payload = payload;
        self
    }

    /// Ask for the whole reply to be RDMA-written into `buf`.
    pub fn with_reply_buffer(mut self, buf: IoBuf) -> Self {
        self.rsphdr = vec![buf];
        self
    }

    /// Ask for the reply payload to be RDMA-written into `bufs`.
    pub fn with_reply_payload(mut self, bufs: Vec<IoBuf>) -> Self {
        self.rsp_payload = bufs;
        self
    }

    /// Transaction id, the first word of the RPC header.
    pub fn xid(&self) -> Result<u32, TransportError> {
        rpc_xid(&self.rpchdr)
    }

    pub(crate) fn header_len(&self) -> usize {
        iov_len(&self.rpchdr) + iov_len(&self.proghdr)
    }
}

/// An outgoing RPC reply.
#[derive(Clone, Debug, Default)]
pub struct RpcReply {
    pub rpchdr: Vec<IoBuf>,
    pub proghdr: Vec<IoBuf>,
    pub payload: Vec<IoBuf>,
    /// Routing of the request being answered.
    pub reply_info: Option<ReplyInfo>,
}

impl RpcReply {
    pub fn new(rpchdr: Vec<IoBuf>, reply_info: Option<ReplyInfo>) -> Self {
        Self {
            rpchdr,
            reply_info,
            ..Default::default()
        }
    }

    pub fn with_proghdr(mut self, proghdr: Vec<IoBuf>) -> Self {
        self.proghdr = proghdr;
        self
    }

    pub fn with_payload(mut self, payload: Vec<IoBuf>) -> Self {
        self.payload = payload;
        self
    }

    pub(crate) fn xid(&self) -> Result<u32, TransportError> {
        match &self.reply_info {
            Some(info) => Ok(info.xid),
            None => rpc_xid(&self.rpchdr),
        }
    }
}

/// A message delivered to the RPC layer.
#[derive(Clone, Debug)]
pub struct InboundMsg {
    pub xid: u32,
    pub vectors: Vec<IoBuf>,
    pub is_reply: bool,
    /// Set for requests: pass it back with the reply.
    pub reply_info: Option<ReplyInfo>,
    /// For replies, the RPC layer's handle of the matching request.
    pub request: Option<u64>,
}

impl InboundMsg {
    /// Total length of all vectors.
    pub fn len(&self) -> usize {
        iov_len(&self.vectors)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Concatenate all vectors.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for v in &self.vectors {
            out.extend_from_slice(v.as_slice());
        }
        out
    }
}

/// A queued message failed by connection teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlushedEntry {
    pub xid: u32,
    pub is_reply: bool,
}

pub(crate) fn rpc_xid(rpchdr: &[IoBuf]) -> Result<u32, TransportError> {
    let first = rpchdr
        .first()
        .filter(|b| b.len() >= 4)
        .ok_or(TransportError::BadRpc("RPC header shorter than an xid"))?;
    let s = first.as_slice();
    Ok(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
}

/// Direction word of an inline RPC message, if present.
pub(crate) fn rpc_direction(body: &[u8]) -> Option<u32> {
    body.get(4..8).map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
}

/// An RPC reply denying the call for a transport version mismatch.
pub(crate) fn reply_denied_vers(xid: u32, low: u32, high: u32) -> Vec<u8> {
    const MSG_DENIED: u32 = 1;
    const RPC_MISMATCH: u32 = 0;
    [xid, RPC_REPLY, MSG_DENIED, RPC_MISMATCH, low, high]
        .iter()
        .flat_map(|w| w.to_be_bytes())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xid_and_direction() {
        let hdr = IoBuf::from_slice(&[0, 0, 1, 2, 0, 0, 0, 1]).unwrap();
        assert_eq!(rpc_xid(&[hdr.clone()]).unwrap(), 0x102);
        assert_eq!(rpc_direction(hdr.as_slice()), Some(RPC_REPLY));
        assert!(rpc_xid(&[]).is_err());
        assert!(rpc_xid(&[IoBuf::from_slice(&[1, 2]).unwrap()]).is_err());

        let denied = reply_denied_vers(9, 1, 1);
        assert_eq!(denied.len(), 24);
        assert_eq!(rpc_direction(&denied), Some(RPC_REPLY));
        assert_eq!(&denied[..4], &9u32.to_be_bytes());
    }
}
