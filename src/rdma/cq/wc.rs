use std::fmt;

use thiserror::Error;

use crate::rdma::type_alias::{Qpn, WrId};

/// Opcode of a completion queue entry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WcOpcode {
    /// Send request.
    #[default]
    Send,
    /// RDMA write request.
    RdmaWrite,
    /// RDMA read request.
    RdmaRead,
    /// Receive request.
    Recv,
}

/// Status of a completion queue entry.
///
/// Descriptions follow the verbs semantics of `ibv_poll_cq`; only the
/// statuses an RC transport can observe are listed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Error)]
pub enum WcStatus {
    /// **Operation completed successfully:** the buffers that this work
    /// request refers to are ready to be (re)used.
    #[default]
    #[error("success")]
    Success,

    /// **Local Length Error:** a posted receive buffer was too small for the
    /// incoming message, or the message exceeds the port's maximum size.
    #[error("local length error")]
    LocLenErr,

    /// **Local QP Operation Error:** an internal QP consistency error was
    /// detected while processing this work request.
    #[error("local QP operation error")]
    LocQpOpErr,

    /// **Local Protection Error:** a local scatter/gather entry does not
    /// reference a memory region that is valid for the requested operation.
    #[error("local protection error")]
    LocProtErr,

    /// **Work Request Flushed Error:** the work request was outstanding when
    /// the QP transitioned into the error state.
    #[error("WR flush error")]
    WrFlushErr,

    /// **Bad Response Error:** an unexpected transport layer opcode was
    /// returned by the responder.
    #[error("bad response error")]
    BadRespErr,

    /// **Local Access Error:** a protection error occurred on a local data
    /// buffer written by the remote node.
    #[error("local access error")]
    LocAccessErr,

    /// **Remote Invalid Request Error:** the responder detected an invalid
    /// message on the channel.
    #[error("remote invalid request error")]
    RemInvReqErr,

    /// **Remote Access Error:** a protection error occurred on a remote data
    /// buffer to be read by an RDMA read or written by an RDMA write.
    #[error("remote access error")]
    RemAccessErr,

    /// **Remote Operation Error:** the responder could not complete the
    /// operation.
    #[error("remote operation error")]
    RemOpErr,

    /// **Transport Retry Counter Exceeded:** the remote side did not send any
    /// Ack or Nack, usually because the remote QP is gone.
    #[error("transport retry counter exceeded")]
    RetryExcErr,

    /// **RNR Retry Counter Exceeded:** the remote side did not have any
    /// receive work request posted.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr,

    /// **Fatal error:** a fatal error that may not be recoverable.
    #[error("fatal error")]
    FatalErr,

    /// **General Error:** other error which isn't one of the above errors.
    #[error("general error")]
    GeneralErr,
}

/// Work completion entry.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Wc {
    pub(crate) wr_id: WrId,
    pub(crate) status: WcStatus,
    pub(crate) opcode: WcOpcode,
    pub(crate) byte_len: u32,
    pub(crate) qp_num: Qpn,
}

impl Wc {
    /// Create a work completion entry.
    pub fn new(wr_id: WrId, status: WcStatus, opcode: WcOpcode, byte_len: u32, qp_num: Qpn) -> Self {
        Self {
            wr_id,
            status,
            opcode,
            byte_len,
            qp_num,
        }
    }

    /// Get the work request ID.
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.wr_id
    }

    /// Get the completion status.
    #[inline]
    pub fn status(&self) -> WcStatus {
        self.status
    }

    /// Get the completion status as a `Result`.
    ///
    /// - If the status is `Success`, return the number of bytes processed or transferred.
    /// - Otherwise, return an error.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self.bytes()),
            status => Err(status),
        }
    }

    /// Get the opcode of the work request.
    #[inline]
    pub fn opcode(&self) -> WcOpcode {
        self.opcode
    }

    /// Get the number of bytes processed or transferred.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.byte_len as usize
    }

    /// Get the number of the local QP that the work request was posted on.
    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.qp_num
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id)
            .field("status", &self.status)
            .field("opcode", &self.opcode)
            .field("qp_num", &self.qp_num)
            .finish()
    }
}
