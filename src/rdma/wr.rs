//! Work requests.

use super::mr::{Mr, MrRemote};
use super::type_alias::{LKey, WrId};

/// Scatter/gather element.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: LKey,
}

impl Sge {
    /// Build a scatter/gather element over a part of a registered region.
    ///
    /// Return `None` if the range falls outside the region.
    pub fn from_mr(mr: &dyn Mr, addr: u64, len: usize) -> Option<Self> {
        if !mr.covers(addr, len) || len > u32::MAX as usize {
            return None;
        }
        Some(Self {
            addr,
            length: len as u32,
            lkey: mr.lkey(),
        })
    }
}

/// Send work request details.
///
/// This type holds the remaining parameters for each type of send work
/// request, aside from the scatter/gather list, work request ID and signal
/// flag shared by all of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendWrDetails {
    /// Two-sided send, consuming a receive work request on the remote side.
    Send,

    /// Read requires a remote memory area to read from.
    Read(MrRemote),

    /// Write requires a remote memory area to write to.
    Write(MrRemote),
}

/// Send work request.
#[derive(Clone, Debug)]
pub struct SendWr {
    pub wr_id: WrId,
    pub sgl: Vec<Sge>,
    pub signal: bool,
    pub details: SendWrDetails,
}

impl SendWr {
    /// Create a new send work request with basic parameters and the details
    /// that specifies its concrete type.
    pub fn new(sgl: Vec<Sge>, wr_id: WrId, signal: bool, details: SendWrDetails) -> Self {
        Self {
            wr_id,
            sgl,
            signal,
            details,
        }
    }

    /// Total number of bytes described by the scatter/gather list.
    pub fn total_len(&self) -> usize {
        self.sgl.iter().map(|sge| sge.length as usize).sum()
    }
}

/// Receive work request.
#[derive(Clone, Debug)]
pub struct RecvWr {
    pub wr_id: WrId,
    pub sgl: Vec<Sge>,
}

impl RecvWr {
    pub fn new(sgl: Vec<Sge>, wr_id: WrId) -> Self {
        Self { wr_id, sgl }
    }
}
