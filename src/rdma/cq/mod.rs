//! Completion queue and Work completion.

mod wc;

use std::any::Any;
use std::io;

pub use self::wc::*;

/// Completion event channel.
///
/// A blocking wait point for every CQ created against it. Completion
/// processors sleep in [`CompChannel::get_cq_event`] until an armed CQ
/// receives a new entry.
pub trait CompChannel: Send + Sync {
    /// Block until a CQ bound to this channel raises an event.
    ///
    /// Returns an error once the channel has been shut down.
    fn get_cq_event(&self) -> io::Result<()>;

    /// Wake every waiter and make further waits fail.
    fn shutdown(&self);

    fn as_any(&self) -> &dyn Any;
}

/// Completion queue.
pub trait Cq: Send + Sync {
    /// Get the capacity of the completion queue.
    fn capacity(&self) -> u32;

    /// Arm the CQ so that the next completion raises an event on its channel.
    fn req_notify(&self) -> io::Result<()>;

    /// Acknowledge events obtained from the channel.
    fn ack_events(&self, num: u32);

    /// Non-blockingly poll into the given buffer. Return the number of work
    /// completions polled.
    ///
    /// It is the caller's responsibility to check the status codes of the
    /// returned work completion entries.
    ///
    /// **NOTE:** It is possible that the number of polled work completions is
    /// less than `wc.len()` or even zero.
    fn poll_into(&self, wc: &mut [Wc]) -> io::Result<u32>;

    fn as_any(&self) -> &dyn Any;
}
