//! Completion channels and completion queues.

use std::any::Any;
use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::rdma::cq::{CompChannel, Cq, Wc};

#[derive(Default)]
struct CompState {
    pending: usize,
    shutdown: bool,
}

struct CompInner {
    state: Mutex<CompState>,
    cv: Condvar,
}

/// A software completion channel.
#[derive(Clone)]
pub struct SoftComp {
    inner: Arc<CompInner>,
}

impl SoftComp {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(CompInner {
                state: Mutex::new(CompState::default()),
                cv: Condvar::new(),
            }),
        }
    }

    fn notify(&self) {
        self.inner.state.lock().pending += 1;
        self.inner.cv.notify_one();
    }
}

impl CompChannel for SoftComp {
    fn get_cq_event(&self) -> io::Result<()> {
        let mut state = self.inner.state.lock();
        loop {
            if state.shutdown {
                return Err(io::Error::new(ErrorKind::BrokenPipe, "completion channel shut down"));
            }
            if state.pending > 0 {
                state.pending -= 1;
                return Ok(());
            }
            self.inner.cv.wait(&mut state);
        }
    }

    fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.cv.notify_all();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct CqState {
    entries: VecDeque<Wc>,
    armed: bool,
    unacked: u32,
}

struct CqInner {
    capacity: u32,
    state: Mutex<CqState>,
    channel: SoftComp,
}

/// A software completion queue.
///
/// Entries beyond the capacity are still queued; the overrun is reported in
/// the log rather than by dropping completions.
#[derive(Clone)]
pub struct SoftCq {
    inner: Arc<CqInner>,
}

impl SoftCq {
    pub(crate) fn new(capacity: u32, channel: SoftComp) -> Self {
        Self {
            inner: Arc::new(CqInner {
                capacity,
                state: Mutex::new(CqState::default()),
                channel,
            }),
        }
    }

    /// Queue a completion, raising an event if the CQ is armed.
    pub(crate) fn push(&self, wc: Wc) {
        let notify = {
            let mut state = self.inner.state.lock();
            if state.entries.len() >= self.inner.capacity as usize {
                log::error!("soft CQ overrun (capacity {})", self.inner.capacity);
            }
            state.entries.push_back(wc);
            let armed = std::mem::replace(&mut state.armed, false);
            if armed {
                state.unacked += 1;
            }
            armed
        };
        if notify {
            self.inner.channel.notify();
        }
    }
}

impl Cq for SoftCq {
    fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    fn req_notify(&self) -> io::Result<()> {
        self.inner.state.lock().armed = true;
        Ok(())
    }

    fn ack_events(&self, num: u32) {
        let mut state = self.inner.state.lock();
        state.unacked = state.unacked.saturating_sub(num);
    }

    fn poll_into(&self, wc: &mut [Wc]) -> io::Result<u32> {
        let mut state = self.inner.state.lock();
        let n = wc.len().min(state.entries.len());
        for (slot, entry) in wc.iter_mut().zip(state.entries.drain(..n)) {
            *slot = entry;
        }
        Ok(n as u32)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::cq::{WcOpcode, WcStatus};

    #[test]
    fn test_armed_cq_notifies_once() {
        let comp = SoftComp::new();
        let cq = SoftCq::new(16, comp.clone());

        // Not armed: no event.
        cq.push(Wc::new(1, WcStatus::Success, WcOpcode::Send, 0, 7));
        assert_eq!(comp.inner.state.lock().pending, 0);

        cq.req_notify().unwrap();
        cq.push(Wc::new(2, WcStatus::Success, WcOpcode::Send, 0, 7));
        cq.push(Wc::new(3, WcStatus::Success, WcOpcode::Send, 0, 7));
        comp.get_cq_event().unwrap();
        assert_eq!(comp.inner.state.lock().pending, 0);

        let mut wc = [Wc::default(); 8];
        assert_eq!(cq.poll_into(&mut wc).unwrap(), 3);
        assert_eq!(wc[2].wr_id(), 3);
        assert_eq!(cq.poll_into(&mut wc).unwrap(), 0);
    }

    #[test]
    fn test_shutdown_wakes_waiter() {
        let comp = SoftComp::new();
        let waiter = {
            let comp = comp.clone();
            std::thread::spawn(move || comp.get_cq_event())
        };
        comp.shutdown();
        assert!(waiter.join().unwrap().is_err());
    }
}
