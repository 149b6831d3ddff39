use std::any::Any;
use std::fmt;
use std::io;
use std::sync::Arc;

use super::cq::{CompChannel, Cq};
use super::pd::Pd;
use super::type_alias::{PortNum, Qpn};

/// Device attributes relevant to sizing transport resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceAttr {
    pub max_cqe: u32,
    pub max_qp_wr: u32,
    pub max_sge: u32,
    pub max_srq_wr: u32,
    pub phys_port_cnt: PortNum,
}

/// Asynchronous (non-completion) events reported by a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsyncEvent {
    /// A QP hit an error it cannot recover from.
    QpFatal(Qpn),
    /// The last WQE of a QP associated with an SRQ has been consumed.
    QpLastWqeReached(Qpn),
    /// A CQ overran or hit a protection error.
    CqError,
    /// The SRQ dropped below its limit.
    SrqLimitReached,
    PortActive(PortNum),
    PortError(PortNum),
    /// The device is no longer usable.
    DeviceFatal,
}

impl fmt::Display for AsyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncEvent::QpFatal(qpn) => write!(f, "QP {} fatal", qpn),
            AsyncEvent::QpLastWqeReached(qpn) => write!(f, "QP {} last WQE reached", qpn),
            AsyncEvent::CqError => f.write_str("CQ error"),
            AsyncEvent::SrqLimitReached => f.write_str("SRQ limit reached"),
            AsyncEvent::PortActive(port) => write!(f, "port {} active", port),
            AsyncEvent::PortError(port) => write!(f, "port {} error", port),
            AsyncEvent::DeviceFatal => f.write_str("device fatal"),
        }
    }
}

/// Device context.
///
/// An opened RDMA device. All other resources of the device are created
/// through it or through the protection domains it allocates.
pub trait Context: Send + Sync {
    /// Name of the underlying device.
    fn name(&self) -> &str;

    /// Device capabilities.
    fn attr(&self) -> DeviceAttr;

    /// Allocate a protection domain.
    fn alloc_pd(&self) -> io::Result<Arc<dyn Pd>>;

    /// Create a completion event channel.
    fn create_comp_channel(&self) -> io::Result<Arc<dyn CompChannel>>;

    /// Create a completion queue reporting to `channel`.
    fn create_cq(&self, capacity: u32, channel: &Arc<dyn CompChannel>) -> io::Result<Arc<dyn Cq>>;

    /// Block until the device reports an asynchronous event.
    ///
    /// Returns an error once the context has been shut down.
    fn get_async_event(&self) -> io::Result<AsyncEvent>;

    /// Wake the async-event waiter and make further waits fail.
    fn shutdown(&self);

    fn as_any(&self) -> &dyn Any;
}

impl fmt::Debug for dyn Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").field("name", &self.name()).finish()
    }
}
