//! Queue pairs.

use std::any::Any;
use std::io;
use std::sync::Arc;

use super::cq::Cq;
use super::srq::Srq;
use super::type_alias::Qpn;
use super::wr::SendWr;

/// Path MTU of a connected QP.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Mtu {
    Mtu256,
    Mtu512,
    Mtu1024,
    #[default]
    Mtu2048,
    Mtu4096,
}

impl Mtu {
    /// Parse an MTU from its size in bytes.
    pub fn from_bytes(bytes: u32) -> Option<Self> {
        match bytes {
            256 => Some(Mtu::Mtu256),
            512 => Some(Mtu::Mtu512),
            1024 => Some(Mtu::Mtu1024),
            2048 => Some(Mtu::Mtu2048),
            4096 => Some(Mtu::Mtu4096),
            _ => None,
        }
    }

    /// Size of the MTU in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            Mtu::Mtu256 => 256,
            Mtu::Mtu512 => 512,
            Mtu::Mtu1024 => 1024,
            Mtu::Mtu2048 => 2048,
            Mtu::Mtu4096 => 4096,
        }
    }
}

/// Queue pair capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

impl Default for QpCaps {
    fn default() -> Self {
        Self {
            max_send_wr: 128,
            max_recv_wr: 128,
            max_send_sge: 2,
            max_recv_sge: 1,
        }
    }
}

/// Initial attributes of a reliable-connected queue pair.
#[derive(Clone)]
pub struct QpInitAttr {
    pub send_cq: Arc<dyn Cq>,
    pub recv_cq: Arc<dyn Cq>,
    pub srq: Option<Arc<dyn Srq>>,
    pub caps: QpCaps,
    pub mtu: Mtu,
}

/// Reliable-connected queue pair.
///
/// Queue pairs are created and connected through a CM identifier; once the
/// identifier is destroyed the QP moves to the error state.
pub trait Qp: Send + Sync {
    /// Get the queue pair number.
    fn qp_num(&self) -> Qpn;

    /// Post a work request to the send queue.
    fn post_send(&self, wr: &SendWr) -> io::Result<()>;

    /// Return `true` if the QP has moved to the error state.
    fn is_error(&self) -> bool;

    fn as_any(&self) -> &dyn Any;
}
