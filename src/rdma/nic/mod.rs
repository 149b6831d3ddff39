//! RDMA hardware resource discovery.

use std::io::{self, ErrorKind};
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use super::cm::CmChannel;
use super::context::Context;

/// A provider of RDMA devices and connection management.
///
/// Everything above this trait is provider-agnostic; the crate ships the
/// in-process [`SoftFabric`](crate::rdma::soft::SoftFabric).
pub trait Fabric: Send + Sync {
    /// Names of all devices the provider exposes.
    fn device_names(&self) -> Vec<String>;

    /// Open a device by its exact name.
    fn open_device(&self, name: &str) -> io::Result<Arc<dyn Context>>;

    /// Create a connection manager event channel.
    fn create_event_channel(&self) -> io::Result<Arc<dyn CmChannel>>;
}

/// Error type for device discovery.
#[derive(Debug, Error)]
pub enum NicFinderError {
    #[error("invalid device name pattern: {0}")]
    BadPattern(#[from] regex::Error),

    #[error("no device matches the given filters")]
    NoMatch,

    #[error("I/O error from the provider")]
    IoError(#[from] io::Error),
}

/// RDMA device finder.
#[derive(Debug, Default)]
pub struct NicFinder {
    /// Device name filters (match any).
    dev_names: Vec<Regex>,
}

impl NicFinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device name filter. The pattern is anchored at both ends, so a
    /// plain device name only matches itself.
    pub fn dev_name(mut self, pattern: &str) -> Result<Self, NicFinderError> {
        self.dev_names.push(Regex::new(&format!("^(?:{})$", pattern))?);
        Ok(self)
    }

    /// Determine whether the current filter matches the specified device.
    fn is_device_eligible(&self, name: &str) -> bool {
        self.dev_names.is_empty() || self.dev_names.iter().any(|re| re.is_match(name))
    }

    /// Find the first eligible device name.
    pub fn probe_name(&self, fabric: &dyn Fabric) -> Result<String, NicFinderError> {
        fabric
            .device_names()
            .into_iter()
            .find(|name| self.is_device_eligible(name))
            .ok_or(NicFinderError::NoMatch)
    }

    /// Open the first eligible device.
    pub fn probe(&self, fabric: &dyn Fabric) -> Result<Arc<dyn Context>, NicFinderError> {
        let name = self.probe_name(fabric)?;
        fabric.open_device(&name).map_err(|e| match e.kind() {
            ErrorKind::NotFound => NicFinderError::NoMatch,
            _ => NicFinderError::IoError(e),
        })
    }
}
