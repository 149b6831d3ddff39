//! Process-level transport state.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use super::cm;
use super::device::Device;
use super::error::{DeviceError, TransportError};
use super::options::TransportOptions;
use super::stats::DeviceStats;
use super::Transport;
use crate::mem::IoBufPool;
use crate::rdma::cm::{CmChannel, CmId};
use crate::rdma::nic::{Fabric, NicFinder};

pub(crate) struct CtxInner {
    pub fabric: Arc<dyn Fabric>,
    pub channel: Arc<dyn CmChannel>,
    pool: Arc<IoBufPool>,
    devices: Mutex<HashMap<String, Arc<Device>>>,
    /// Endpoints by CM identifier handle.
    endpoints: Mutex<HashMap<u64, Transport>>,
    cm_thread: Mutex<Option<JoinHandle<()>>>,
}

impl CtxInner {
    pub fn pool(&self) -> &Arc<IoBufPool> {
        &self.pool
    }

    pub fn endpoint(&self, handle: u64) -> Option<Transport> {
        self.endpoints.lock().get(&handle).cloned()
    }

    /// Route CM events of the transport's current identifier to it.
    pub fn add_endpoint(&self, xprt: &Transport) {
        if let Some(handle) = xprt.cm_handle() {
            self.endpoints.lock().insert(handle, xprt.clone());
        }
    }

    pub fn remove_endpoint(&self, handle: u64) -> Option<Transport> {
        self.endpoints.lock().remove(&handle)
    }

    /// The device `id` is bound to, opened on first use.
    pub fn device_for(&self, id: &dyn CmId, opts: &TransportOptions) -> Result<Arc<Device>, DeviceError> {
        let context = id.context().ok_or(DeviceError::Unbound)?;
        if let Some(pattern) = &opts.device_name {
            let want = NicFinder::new()
                .dev_name(pattern)?
                .probe_name(&*self.fabric)
                .map_err(|_| DeviceError::NotFound(pattern.clone()))?;
            if want != context.name() {
                return Err(DeviceError::Mismatch {
                    want,
                    got: context.name().to_owned(),
                });
            }
        }

        let mut devices = self.devices.lock();
        if let Some(device) = devices.get(context.name()) {
            device.check_options(opts);
            return Ok(device.clone());
        }
        let name = context.name().to_owned();
        let device = Device::create(context, opts, self.pool.clone())?;
        devices.insert(name, device.clone());
        Ok(device)
    }

    fn shutdown(&self) {
        self.channel.shutdown();
        let cm_thread = self.cm_thread.lock().take();
        if let Some(handle) = cm_thread {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::error!("CM thread panicked");
            }
        }

        let endpoints: Vec<Transport> = self.endpoints.lock().drain().map(|(_, x)| x).collect();
        for xprt in endpoints {
            xprt.teardown();
        }

        let devices: Vec<Arc<Device>> = self.devices.lock().drain().map(|(_, d)| d).collect();
        for device in devices {
            device.shutdown();
        }
    }
}

impl Drop for CtxInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Process-level transport context.
///
/// Owns the fabric, the device registry, the buffer pool shared by every
/// device, and the connection manager thread. Transports are created against
/// a context and keep it alive.
#[derive(Clone)]
pub struct RdmaCtx {
    pub(crate) inner: Arc<CtxInner>,
}

impl RdmaCtx {
    /// Create a context with the default buffer pool geometry.
    pub fn new(fabric: Arc<dyn Fabric>) -> Result<Self, TransportError> {
        Self::with_options(fabric, &TransportOptions::default())
    }

    /// Create a context sizing its buffer pool after `opts`.
    pub fn with_options(fabric: Arc<dyn Fabric>, opts: &TransportOptions) -> Result<Self, TransportError> {
        let channel = fabric.create_event_channel()?;
        let inner = Arc::new(CtxInner {
            fabric,
            channel: channel.clone(),
            pool: Arc::new(IoBufPool::new(opts.page_size, opts.arena_pages)),
            devices: Mutex::new(HashMap::new()),
            endpoints: Mutex::new(HashMap::new()),
            cm_thread: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let handle = thread::Builder::new()
            .name("rpcrdma-cm".to_owned())
            .spawn(move || cm::run(channel, weak))?;
        *inner.cm_thread.lock() = Some(handle);
        Ok(Self { inner })
    }

    /// The buffer pool. Buffers taken from it are pre-registered on every
    /// device of this context.
    pub fn pool(&self) -> &Arc<IoBufPool> {
        self.inner.pool()
    }

    /// Statistics of every opened device.
    pub fn device_stats(&self) -> Vec<DeviceStats> {
        let mut stats: Vec<DeviceStats> = self.inner.devices.lock().values().map(|d| d.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Stop the CM thread, tear down every endpoint and stop every device.
    pub fn shutdown(&self) {
        self.inner.shutdown();
        log::debug!("transport context shut down");
    }
}

impl fmt::Debug for RdmaCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmaCtx")
            .field("devices", &self.inner.devices.lock().len())
            .field("endpoints", &self.inner.endpoints.lock().len())
            .finish()
    }
}
