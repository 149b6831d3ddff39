//! Connection manager.
//!
//! Identifiers and event channels in the style of `librdmacm`: every
//! identifier belongs to one event channel, and all state changes of the
//! identifier (address and route resolution, incoming connection requests,
//! establishment, disconnection) are reported as [`CmEvent`]s on it.

use std::any::Any;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::context::Context;
use super::pd::Pd;
use super::qp::{Qp, QpInitAttr};

/// Socket-style address understood by the connection manager.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SockAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl SockAddr {
    /// Port of an inet address.
    pub fn port(&self) -> Option<u16> {
        match self {
            SockAddr::Inet(addr) => Some(addr.port()),
            SockAddr::Unix(_) => None,
        }
    }

    /// Copy of this address with the port replaced. Unix addresses are
    /// returned unchanged.
    pub fn with_port(&self, port: u16) -> Self {
        match self {
            SockAddr::Inet(addr) => {
                let mut addr = *addr;
                addr.set_port(port);
                SockAddr::Inet(addr)
            }
            SockAddr::Unix(path) => SockAddr::Unix(path.clone()),
        }
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockAddr::Inet(addr) => write!(f, "{}", addr),
            SockAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Connection manager event types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CmEventKind {
    AddressResolved,
    AddressError,
    RouteResolved,
    RouteError,
    ConnectionRequest,
    ConnectionResponse,
    ConnectionError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    TimewaitExit,
}

/// Connection parameters exchanged by `connect` and `accept`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnParam {
    pub private_data: Vec<u8>,
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
}

/// An event delivered on a [`CmChannel`].
#[derive(Clone)]
pub struct CmEvent {
    /// The identifier the event is about. For connection requests this is a
    /// freshly created identifier for the incoming connection.
    pub id: Arc<dyn CmId>,

    /// The listening identifier, for connection requests only.
    pub listen_id: Option<Arc<dyn CmId>>,

    pub kind: CmEventKind,

    /// Errno-style status; zero unless the event reports a failure.
    pub status: i32,

    /// Private data sent by the remote side with `connect` or `accept`.
    pub private_data: Vec<u8>,
}

impl fmt::Debug for CmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmEvent")
            .field("id", &self.id.handle())
            .field("listen_id", &self.listen_id.as_ref().map(|id| id.handle()))
            .field("kind", &self.kind)
            .field("status", &self.status)
            .finish()
    }
}

/// Connection manager identifier.
pub trait CmId: Send + Sync {
    /// A process-unique handle for the identifier.
    fn handle(&self) -> u64;

    /// Bind to a local address. Fails with `AddrInUse` or `PermissionDenied`
    /// as a socket bind would.
    fn bind_addr(&self, addr: &SockAddr) -> io::Result<()>;

    /// Start resolving `dst` to a local RDMA device. Completes with an
    /// `AddressResolved` or `AddressError` event.
    fn resolve_addr(&self, src: Option<&SockAddr>, dst: &SockAddr, timeout: Duration) -> io::Result<()>;

    /// Start resolving the route to the resolved address. Completes with a
    /// `RouteResolved` or `RouteError` event.
    fn resolve_route(&self, timeout: Duration) -> io::Result<()>;

    /// Listen for connection requests on the bound address.
    fn listen(&self, backlog: u32) -> io::Result<()>;

    /// The device context this identifier is bound to, once known.
    fn context(&self) -> Option<Arc<dyn Context>>;

    /// Create the queue pair of this identifier.
    fn create_qp(&self, pd: &Arc<dyn Pd>, attr: &QpInitAttr) -> io::Result<Arc<dyn Qp>>;

    /// Destroy the queue pair of this identifier, if any.
    fn destroy_qp(&self);

    fn connect(&self, param: &ConnParam) -> io::Result<()>;

    fn accept(&self, param: &ConnParam) -> io::Result<()>;

    fn reject(&self, private_data: &[u8]) -> io::Result<()>;

    /// Initiate disconnection. Both sides receive a `Disconnected` event.
    fn disconnect(&self) -> io::Result<()>;

    /// Release the identifier's address binding and listener. Idempotent.
    fn destroy(&self);

    fn local_addr(&self) -> Option<SockAddr>;

    fn peer_addr(&self) -> Option<SockAddr>;

    fn as_any(&self) -> &dyn Any;
}

/// Connection manager event channel.
pub trait CmChannel: Send + Sync {
    /// Create an identifier reporting to this channel.
    fn create_id(&self) -> io::Result<Arc<dyn CmId>>;

    /// Block until the next event arrives.
    ///
    /// Returns an error once the channel has been shut down.
    fn get_cm_event(&self) -> io::Result<CmEvent>;

    /// Wake every waiter and make further waits fail.
    fn shutdown(&self);
}
