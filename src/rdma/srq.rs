//! Shared Receive Queues.

use std::any::Any;
use std::io;

use super::wr::RecvWr;

/// Shared receive queue.
///
/// Receive buffers posted here are consumed by SENDs arriving on any queue
/// pair created against it.
pub trait Srq: Send + Sync {
    /// Post a receive work request to the SRQ.
    fn post_recv(&self, wr: &RecvWr) -> io::Result<()>;

    /// Number of receive work requests currently posted.
    fn posted(&self) -> usize;

    fn as_any(&self) -> &dyn Any;
}
