//! The transport prelude.
//!
//! The purpose of this module is to alleviate imports of the types an RPC
//! layer needs to drive a transport.

pub use crate::mem::{IoBuf, IoBufPool};
pub use crate::xprt::{
    ConnState, FlushedEntry, InboundMsg, RdmaCtx, ReplyChunk, ReplyInfo, Role, RpcHandler, RpcReply, RpcRequest,
    Transport, TransportError, TransportOptions, TransportStats,
};
