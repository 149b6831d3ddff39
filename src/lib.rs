//! An RPC-over-RDMA transport.
//!
//! Carries RPC calls and replies between a client and a server over reliable
//! RDMA connections. Small messages travel inline in SEND operations; large
//! arguments and results are placed directly in remote memory through the
//! chunk lists of the [RPC-over-RDMA header](proto): read chunks pulled by
//! the server, write chunks and reply chunks pushed by it. Sends are paced by
//! the credit each side advertises.
//!
//! The crate is layered as follows:
//!
//! - [`rdma`]: provider-agnostic verbs and connection manager traits, with
//!   [`rdma::soft`], an in-process fabric implementing them.
//! - [`proto`]: the wire codec.
//! - [`mem`]: the general-purpose buffer pool and memory registration.
//! - [`xprt`]: transports, devices and the process-level [`RdmaCtx`].
//!
//! Like the verbs objects they wrap, transports and contexts are `Arc`-based
//! handles: clone them to share.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rpcrdma::prelude::*;
//! use rpcrdma::rdma::soft::SoftFabric;
//!
//! struct Discard;
//!
//! impl RpcHandler for Discard {
//!     fn on_message(&self, _xprt: &Transport, _msg: InboundMsg) {}
//! }
//!
//! fn main() -> Result<(), TransportError> {
//!     let ctx = RdmaCtx::new(Arc::new(SoftFabric::new()))?;
//!     let opts = TransportOptions::from_toml_str("listen-port = 20049")?;
//!
//!     let listener = Transport::new(&ctx, opts, Arc::new(Discard))?;
//!     listener.listen()?;
//!     assert_eq!(listener.role(), Role::Listener);
//!
//!     ctx.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Warning
//!
//! **The interfaces are unstable and up to change!**

pub mod mem;
pub mod proto;
pub mod rdma;
pub mod xprt;

pub mod prelude;

mod utils;

pub use xprt::{RdmaCtx, RpcHandler, Transport, TransportError, TransportOptions};
