//! Address resolution for connecting, listening and client binds.

use std::io::ErrorKind;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use super::error::TransportError;
use super::options::{AddressFamily, ConfigError, TransportOptions, DEFAULT_PORT};
use crate::rdma::cm::{CmId, SockAddr};

/// Client source ports below this need privileges.
const PRIVILEGED_CEILING: u16 = 1024;

/// Highest port of the unprivileged fallback range.
const UNPRIVILEGED_MAX: u16 = 49151;

fn resolve_host(host: &str, port: u16, family: AddressFamily) -> Result<SockAddr, TransportError> {
    let want_v6 = family == AddressFamily::Inet6;
    (host, port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Resolve(format!("{}: {}", host, e)))?
        .find(|addr| addr.is_ipv6() == want_v6)
        .map(SockAddr::Inet)
        .ok_or_else(|| {
            TransportError::Resolve(format!(
                "{} has no {} address",
                host,
                if want_v6 { "IPv6" } else { "IPv4" }
            ))
        })
}

/// Address to connect to. The port is `remote-port`, then `port`, then the
/// default port.
pub(crate) fn remote_addr(opts: &TransportOptions, port: Option<u16>) -> Result<SockAddr, TransportError> {
    let family = opts.family().ok_or(ConfigError::Missing("address-family"))?;
    match family {
        AddressFamily::Unix => {
            let path = opts.connect_path.clone().ok_or(ConfigError::Missing("connect-path"))?;
            Ok(SockAddr::Unix(path))
        }
        AddressFamily::Inet | AddressFamily::InetSdp | AddressFamily::Inet6 => {
            let host = opts.remote_host.as_deref().ok_or(ConfigError::Missing("remote-host"))?;
            let port = opts.remote_port.or(port).unwrap_or(DEFAULT_PORT);
            resolve_host(host, port, family)
        }
    }
}

/// Address to listen on.
pub(crate) fn listen_addr(opts: &TransportOptions) -> Result<SockAddr, TransportError> {
    let family = opts.address_family.unwrap_or(if opts.listen_path.is_some() {
        AddressFamily::Unix
    } else {
        AddressFamily::Inet
    });
    let port = opts.listen_port.unwrap_or(DEFAULT_PORT);
    match family {
        AddressFamily::Unix => {
            let path = opts.listen_path.clone().ok_or(ConfigError::Missing("listen-path"))?;
            Ok(SockAddr::Unix(path))
        }
        AddressFamily::Inet | AddressFamily::InetSdp => match opts.listen_host.as_deref() {
            Some(host) => resolve_host(host, port, family),
            None => Ok(SockAddr::Inet(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))),
        },
        AddressFamily::Inet6 => match opts.listen_host.as_deref() {
            Some(host) => resolve_host(host, port, family),
            None => Ok(SockAddr::Inet(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)))),
        },
    }
}

enum Scan {
    Bound(u16),
    Exhausted,
    Denied,
}

fn scan_ports(
    id: &dyn CmId,
    any: &SocketAddr,
    ports: impl Iterator<Item = u16>,
    reserved: &[u16],
) -> Result<Scan, TransportError> {
    for port in ports.filter(|p| !reserved.contains(p)) {
        let mut addr = *any;
        addr.set_port(port);
        match id.bind_addr(&SockAddr::Inet(addr)) {
            Ok(()) => return Ok(Scan::Bound(port)),
            Err(e) if e.kind() == ErrorKind::AddrInUse => continue,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => return Ok(Scan::Denied),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Scan::Exhausted)
}

/// Bind the client identifier before connecting to `remote`.
///
/// Inet clients take the highest free privileged port unless
/// `bind-insecure` is set, then the highest free unprivileged port. If both
/// ranges are refused the identifier stays unbound and gets an ephemeral
/// port. Return the bound address, if any.
pub(crate) fn bind_client(
    id: &dyn CmId,
    opts: &TransportOptions,
    remote: &SockAddr,
) -> Result<Option<SockAddr>, TransportError> {
    let dst = match remote {
        SockAddr::Unix(_) => {
            let Some(path) = &opts.bind_path else {
                return Ok(None);
            };
            let addr = SockAddr::Unix(path.clone());
            id.bind_addr(&addr)?;
            return Ok(Some(addr));
        }
        SockAddr::Inet(dst) => dst,
    };

    let any = match dst {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    };
    let reserved = &opts.reserved_ports;

    if !opts.bind_insecure {
        match scan_ports(id, &any, (1..PRIVILEGED_CEILING).rev(), reserved)? {
            Scan::Bound(port) => return Ok(Some(SockAddr::Inet(any).with_port(port))),
            Scan::Denied => log::warn!("privileged source ports are not permitted, trying unprivileged ones"),
            Scan::Exhausted => log::warn!("privileged source ports exhausted, trying unprivileged ones"),
        }
    }
    match scan_ports(id, &any, (PRIVILEGED_CEILING..=UNPRIVILEGED_MAX).rev(), reserved)? {
        Scan::Bound(port) => Ok(Some(SockAddr::Inet(any).with_port(port))),
        Scan::Denied | Scan::Exhausted => {
            log::warn!("no source port available, connecting from an ephemeral port");
            Ok(None)
        }
    }
}
