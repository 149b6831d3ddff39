use std::io;

use thiserror::Error;

use super::options::ConfigError;
use crate::proto::ProtoError;
use crate::rdma::nic::NicFinderError;
use crate::rdma::type_alias::WrId;

/// Errors of device creation and lookup.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No device matches the configured name.
    #[error("no RDMA device matches `{0}`")]
    NotFound(String),

    /// The CM identifier is not bound to any device.
    #[error("connection identifier has no device")]
    Unbound,

    /// The device a connection resolved to differs from the configured one.
    #[error("connection resolved to device `{got}`, but `{want}` is configured")]
    Mismatch { want: String, got: String },

    /// Creating a device resource failed.
    #[error("cannot create {what}: {source}")]
    Create {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("bad device name pattern: {0}")]
    Finder(#[from] NicFinderError),

    #[error("cannot pre-allocate posts: {0}")]
    Post(#[from] PostError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DeviceError {
    pub(crate) fn create(what: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| DeviceError::Create { what, source }
    }
}

/// Errors of the post pools.
#[derive(Debug, Error)]
pub enum PostError {
    /// Allocating or registering a fresh post failed.
    #[error("cannot allocate post: {0}")]
    Alloc(#[from] io::Error),

    /// A work completion names a post that does not exist.
    #[error("unknown work request id {0:#x}")]
    UnknownWrId(WrId),

    /// A post was released more often than it was referenced.
    #[error("post {0:#x} released with no references held")]
    RefUnderflow(WrId),
}

/// Errors returned by transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("a connection is already in progress or established")]
    AlreadyConnected,

    #[error("operation is not supported on a listening transport")]
    Listener,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),

    #[error("malformed RPC message: {0}")]
    BadRpc(&'static str),

    #[error("request has {0} chunk segments, at most 8 are allowed")]
    TooManyChunks(usize),

    #[error("request supplies both reply-header and reply-payload buffers")]
    ConflictingChunks,

    #[error("cannot resolve address: {0}")]
    Resolve(String),

    #[error("{0} resolution timed out")]
    Timeout(&'static str),

    #[error("connection private data carries protocol version {0}")]
    PrivateData(u32),

    #[error("peer receive buffers of {0} bytes cannot hold a header")]
    PeerRecvSize(usize),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("post error: {0}")]
    Post(#[from] PostError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("transport context is shut down")]
    Shutdown,
}
