//! In-process software RDMA provider.
//!
//! `SoftFabric` implements the verbs and connection-manager traits entirely
//! in memory. Queue pairs behave like reliable-connected QPs: SENDs consume
//! receive work requests posted on the remote SRQ, RDMA reads and writes are
//! plain memory copies, and every scatter/gather entry and remote segment is
//! validated against the registration tables of the owning device before any
//! byte moves. Completions are delivered through armed CQs and blocking
//! completion channels, exactly as the transport expects from hardware.
//!
//! Connection management is loopback-only: every bound address belongs to
//! the same fabric instance, so a client can only reach listeners created on
//! it.

mod cm;
mod cq;
mod qp;

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

pub use self::cm::{SoftCmChannel, SoftCmId};
pub use self::cq::{SoftComp, SoftCq};
pub use self::qp::{SoftQp, SoftSrq};
use super::cm::{CmChannel, SockAddr};
use super::context::{AsyncEvent, Context, DeviceAttr};
use super::cq::{CompChannel, Cq};
use super::mr::{Mr, Permission};
use super::nic::Fabric;
use super::pd::Pd;
use super::srq::Srq;
use super::type_alias::{LKey, Qpn, RKey};

/// Lowest port handed out for implicit (ephemeral) binds.
const EPHEMERAL_PORT_BASE: u16 = 50000;

/// Builder of [`SoftFabric`].
#[derive(Debug, Clone)]
pub struct SoftFabricBuilder {
    devices: usize,
    deny_privileged: bool,
    attr: DeviceAttr,
}

impl Default for SoftFabricBuilder {
    fn default() -> Self {
        Self {
            devices: 1,
            deny_privileged: false,
            attr: DeviceAttr {
                max_cqe: 1 << 20,
                max_qp_wr: 1 << 15,
                max_sge: 16,
                max_srq_wr: 1 << 15,
                phys_port_cnt: 1,
            },
        }
    }
}

impl SoftFabricBuilder {
    /// Number of devices, named `soft0`, `soft1`, ...
    pub fn devices(mut self, n: usize) -> Self {
        self.devices = n.max(1);
        self
    }

    /// Refuse binds to ports below 1024 with `PermissionDenied`, as an
    /// unprivileged process would see.
    pub fn deny_privileged_ports(mut self, deny: bool) -> Self {
        self.deny_privileged = deny;
        self
    }

    /// Override the reported device attributes.
    pub fn attr(mut self, attr: DeviceAttr) -> Self {
        self.attr = attr;
        self
    }

    pub fn build(self) -> SoftFabric {
        let devices = (0..self.devices)
            .map(|i| SoftContext {
                inner: Arc::new(ContextInner {
                    name: format!("soft{}", i),
                    attr: self.attr,
                    mrs: Mutex::new(MrTable::default()),
                    events: Mutex::new(AsyncState::default()),
                    events_cv: Condvar::new(),
                }),
            })
            .collect();
        let inner = Arc::new(FabricInner {
            devices,
            deny_privileged: AtomicBool::new(self.deny_privileged),
            bindings: Mutex::new(Bindings::default()),
            unreachable: Mutex::new(HashSet::new()),
            qps: Mutex::new(HashMap::new()),
            next_qpn: AtomicU32::new(0x100),
            next_handle: AtomicU64::new(1),
        });
        SoftFabric { inner }
    }
}

/// Address bindings of the connection manager.
#[derive(Default)]
struct Bindings {
    /// Bound addresses, keyed by port (inet) or path (unix).
    bound: HashMap<BindKey, u64>,
    listeners: HashMap<BindKey, (u64, Weak<SoftCmId>)>,
    next_ephemeral: u16,
}

/// Inet bindings collide on port alone: every address of the fabric is local.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum BindKey {
    Port(u16),
    Path(std::path::PathBuf),
}

impl BindKey {
    fn of(addr: &SockAddr) -> Self {
        match addr {
            SockAddr::Inet(a) => BindKey::Port(a.port()),
            SockAddr::Unix(p) => BindKey::Path(p.clone()),
        }
    }
}

pub(crate) struct FabricInner {
    devices: Vec<SoftContext>,
    deny_privileged: AtomicBool,
    bindings: Mutex<Bindings>,
    unreachable: Mutex<HashSet<SockAddr>>,
    qps: Mutex<HashMap<Qpn, Weak<qp::QpInner>>>,
    next_qpn: AtomicU32,
    next_handle: AtomicU64,
}

impl FabricInner {
    fn default_device(&self) -> Option<SoftContext> {
        self.devices.first().cloned()
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn is_unreachable(&self, addr: &SockAddr) -> bool {
        self.unreachable.lock().contains(addr)
    }

    /// Bind `addr` for the identifier `handle`. Port 0 picks an ephemeral
    /// port. Return the address actually bound.
    fn bind(&self, addr: &SockAddr, handle: u64) -> io::Result<SockAddr> {
        let mut bindings = self.bindings.lock();
        let addr = match addr.port() {
            Some(0) => {
                let start = bindings.next_ephemeral.max(EPHEMERAL_PORT_BASE);
                let port = (start..=u16::MAX)
                    .chain(EPHEMERAL_PORT_BASE..start)
                    .find(|p| !bindings.bound.contains_key(&BindKey::Port(*p)))
                    .ok_or_else(|| io::Error::from(ErrorKind::AddrInUse))?;
                bindings.next_ephemeral = port.wrapping_add(1);
                addr.with_port(port)
            }
            Some(port) if port < 1024 && self.deny_privileged.load(Ordering::Relaxed) => {
                return Err(io::Error::from(ErrorKind::PermissionDenied));
            }
            _ => addr.clone(),
        };

        let key = BindKey::of(&addr);
        if bindings.bound.contains_key(&key) {
            return Err(io::Error::from(ErrorKind::AddrInUse));
        }
        bindings.bound.insert(key, handle);
        Ok(addr)
    }

    fn unbind(&self, addr: &SockAddr, handle: u64) {
        let key = BindKey::of(addr);
        let mut bindings = self.bindings.lock();
        if bindings.bound.get(&key) == Some(&handle) {
            bindings.bound.remove(&key);
        }
        if bindings.listeners.get(&key).is_some_and(|(h, _)| *h == handle) {
            bindings.listeners.remove(&key);
        }
    }

    fn add_listener(&self, addr: &SockAddr, handle: u64, id: Weak<SoftCmId>) {
        self.bindings.lock().listeners.insert(BindKey::of(addr), (handle, id));
    }

    /// Look up the listener of `addr`. Upgraded outside the bindings lock.
    fn listener(&self, addr: &SockAddr) -> Option<Arc<SoftCmId>> {
        let weak = self
            .bindings
            .lock()
            .listeners
            .get(&BindKey::of(addr))
            .map(|(_, w)| w.clone());
        weak.and_then(|w| w.upgrade())
    }

    fn register_qp(&self, qpn: Qpn, qp: Weak<qp::QpInner>) {
        self.qps.lock().insert(qpn, qp);
    }

    fn unregister_qp(&self, qpn: Qpn) {
        self.qps.lock().remove(&qpn);
    }

    fn alloc_qpn(&self) -> Qpn {
        self.next_qpn.fetch_add(1, Ordering::Relaxed)
    }
}

/// The software fabric.
#[derive(Clone)]
pub struct SoftFabric {
    inner: Arc<FabricInner>,
}

impl Default for SoftFabric {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SoftFabric {
    /// Create a fabric with a single device.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> SoftFabricBuilder {
        SoftFabricBuilder::default()
    }

    /// Make address resolution towards `addr` fail, as if the resolution
    /// timed out.
    pub fn set_unreachable(&self, addr: SockAddr, unreachable: bool) {
        let mut set = self.inner.unreachable.lock();
        if unreachable {
            set.insert(addr);
        } else {
            set.remove(&addr);
        }
    }

    /// Toggle the privileged-port policy.
    pub fn deny_privileged_ports(&self, deny: bool) {
        self.inner.deny_privileged.store(deny, Ordering::Relaxed);
    }

    /// Reserve an inet port as if another process had bound it.
    pub fn occupy_port(&self, port: u16) -> io::Result<()> {
        let addr = SockAddr::Inet(([0, 0, 0, 0], port).into());
        self.inner.bind(&addr, 0).map(|_| ())
    }

    /// Deliver an asynchronous event on a device.
    pub fn inject_async_event(&self, device: &str, event: AsyncEvent) -> io::Result<()> {
        let dev = self
            .inner
            .devices
            .iter()
            .find(|d| d.inner.name == device)
            .ok_or_else(|| io::Error::from(ErrorKind::NotFound))?;
        dev.push_async_event(event);
        Ok(())
    }

    /// Move the QP with number `qpn` to the error state, failing every later
    /// work request posted on it.
    pub fn break_qp(&self, qpn: Qpn) -> bool {
        let qp = self.inner.qps.lock().get(&qpn).cloned();
        match qp.and_then(|w| w.upgrade()) {
            Some(qp) => {
                qp.set_error();
                true
            }
            None => false,
        }
    }

    /// Number of live memory registrations on a device.
    pub fn registrations(&self, device: &str) -> usize {
        self.inner
            .devices
            .iter()
            .find(|d| d.inner.name == device)
            .map_or(0, |d| d.inner.mrs.lock().regions.len())
    }
}

impl Fabric for SoftFabric {
    fn device_names(&self) -> Vec<String> {
        self.inner.devices.iter().map(|d| d.inner.name.clone()).collect()
    }

    fn open_device(&self, name: &str) -> io::Result<Arc<dyn Context>> {
        self.inner
            .devices
            .iter()
            .find(|d| d.inner.name == name)
            .map(|d| Arc::new(d.clone()) as Arc<dyn Context>)
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("no device named `{}`", name)))
    }

    fn create_event_channel(&self) -> io::Result<Arc<dyn CmChannel>> {
        Ok(Arc::new(SoftCmChannel::new(Arc::downgrade(&self.inner))))
    }
}

/// A registration record.
#[derive(Clone, Copy, Debug)]
struct MrRecord {
    addr: u64,
    len: usize,
    perm: Permission,
}

#[derive(Default)]
struct MrTable {
    next_key: u32,
    regions: HashMap<u32, MrRecord>,
}

#[derive(Default)]
struct AsyncState {
    events: VecDeque<AsyncEvent>,
    shutdown: bool,
}

pub(crate) struct ContextInner {
    name: String,
    attr: DeviceAttr,
    mrs: Mutex<MrTable>,
    events: Mutex<AsyncState>,
    events_cv: Condvar,
}

/// A software RDMA device.
#[derive(Clone)]
pub struct SoftContext {
    inner: Arc<ContextInner>,
}

impl SoftContext {
    fn push_async_event(&self, event: AsyncEvent) {
        self.inner.events.lock().events.push_back(event);
        self.inner.events_cv.notify_all();
    }

    fn same_device(&self, other: &SoftContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Validate that `[addr, addr + len)` is covered by the registration
    /// `key` with permission `need`.
    fn check_access(&self, key: u32, addr: u64, len: usize, need: Permission) -> bool {
        let mrs = self.inner.mrs.lock();
        mrs.regions.get(&key).is_some_and(|rec| {
            rec.perm.contains(need)
                && addr >= rec.addr
                && addr
                    .checked_add(len as u64)
                    .is_some_and(|end| end <= rec.addr + rec.len as u64)
        })
    }
}

impl Context for SoftContext {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn attr(&self) -> DeviceAttr {
        self.inner.attr
    }

    fn alloc_pd(&self) -> io::Result<Arc<dyn Pd>> {
        Ok(Arc::new(SoftPd { ctx: self.clone() }))
    }

    fn create_comp_channel(&self) -> io::Result<Arc<dyn CompChannel>> {
        Ok(Arc::new(SoftComp::new()))
    }

    fn create_cq(&self, capacity: u32, channel: &Arc<dyn CompChannel>) -> io::Result<Arc<dyn Cq>> {
        if capacity > self.inner.attr.max_cqe {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("CQ capacity {} exceeds device maximum {}", capacity, self.inner.attr.max_cqe),
            ));
        }
        let channel = channel
            .as_any()
            .downcast_ref::<SoftComp>()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "foreign completion channel"))?;
        Ok(Arc::new(SoftCq::new(capacity, channel.clone())))
    }

    fn get_async_event(&self) -> io::Result<AsyncEvent> {
        let mut state = self.inner.events.lock();
        loop {
            if state.shutdown {
                return Err(io::Error::new(ErrorKind::BrokenPipe, "device context shut down"));
            }
            if let Some(event) = state.events.pop_front() {
                return Ok(event);
            }
            self.inner.events_cv.wait(&mut state);
        }
    }

    fn shutdown(&self) {
        self.inner.events.lock().shutdown = true;
        self.inner.events_cv.notify_all();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A software protection domain.
#[derive(Clone)]
pub struct SoftPd {
    ctx: SoftContext,
}

impl Pd for SoftPd {
    unsafe fn reg_mr(&self, addr: *mut u8, len: usize, perm: Permission) -> io::Result<Arc<dyn Mr>> {
        if addr.is_null() || len == 0 {
            return Err(io::Error::from(ErrorKind::InvalidInput));
        }
        let mut mrs = self.ctx.inner.mrs.lock();
        mrs.next_key = mrs.next_key.wrapping_add(1).max(1);
        let key = mrs.next_key;
        mrs.regions.insert(
            key,
            MrRecord {
                addr: addr as u64,
                len,
                perm,
            },
        );
        Ok(Arc::new(SoftMr {
            ctx: self.ctx.clone(),
            key,
            rec: MrRecord {
                addr: addr as u64,
                len,
                perm,
            },
        }))
    }

    fn create_srq(&self, max_wr: u32, max_sge: u32) -> io::Result<Arc<dyn Srq>> {
        if max_wr > self.ctx.inner.attr.max_srq_wr || max_sge > self.ctx.inner.attr.max_sge {
            return Err(io::Error::from(ErrorKind::InvalidInput));
        }
        Ok(Arc::new(SoftSrq::new(self.ctx.clone(), max_wr)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A software memory registration. Deregistered on drop.
pub struct SoftMr {
    ctx: SoftContext,
    key: u32,
    rec: MrRecord,
}

impl Drop for SoftMr {
    fn drop(&mut self) {
        self.ctx.inner.mrs.lock().regions.remove(&self.key);
    }
}

impl Mr for SoftMr {
    fn addr(&self) -> u64 {
        self.rec.addr
    }

    fn len(&self) -> usize {
        self.rec.len
    }

    fn lkey(&self) -> LKey {
        self.key
    }

    fn rkey(&self) -> RKey {
        self.key
    }

    fn perm(&self) -> Permission {
        self.rec.perm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_register() {
        let fabric = SoftFabric::builder().devices(2).build();
        assert_eq!(fabric.device_names(), vec!["soft0", "soft1"]);
        assert!(fabric.open_device("mlx5_0").is_err());

        let ctx = fabric.open_device("soft1").unwrap();
        let pd = ctx.alloc_pd().unwrap();
        let mut buf = vec![0u8; 64];
        let mr = unsafe { pd.reg_mr(buf.as_mut_ptr(), buf.len(), Permission::LOCAL_WRITE) }.unwrap();
        assert_eq!(fabric.registrations("soft1"), 1);
        assert!(mr.covers(mr.addr() + 8, 56));
        assert!(!mr.covers(mr.addr() + 8, 57));
        drop(mr);
        assert_eq!(fabric.registrations("soft1"), 0);
    }

    #[test]
    fn test_bind_rules() {
        let fabric = SoftFabric::builder().deny_privileged_ports(true).build();
        let addr = |port| SockAddr::Inet(([127, 0, 0, 1], port).into());

        let err = fabric.inner.bind(&addr(1000), 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        fabric.inner.bind(&addr(24008), 1).unwrap();
        let err = fabric.inner.bind(&addr(24008), 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddrInUse);

        let eph = fabric.inner.bind(&addr(0), 3).unwrap();
        assert!(eph.port().unwrap() >= EPHEMERAL_PORT_BASE);

        fabric.inner.unbind(&addr(24008), 1);
        fabric.inner.bind(&addr(24008), 2).unwrap();
    }

    #[test]
    fn test_async_event_and_shutdown() {
        let fabric = SoftFabric::new();
        let ctx = fabric.open_device("soft0").unwrap();
        fabric.inject_async_event("soft0", AsyncEvent::PortActive(1)).unwrap();
        assert_eq!(ctx.get_async_event().unwrap(), AsyncEvent::PortActive(1));
        ctx.shutdown();
        assert!(ctx.get_async_event().is_err());
    }
}
