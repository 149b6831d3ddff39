use std::path::{Path, PathBuf};
use std::{fs, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proto::{HEADER_SIZE, INLINE_THRESHOLD, MAX_HEADER_SIZE};
use crate::rdma::qp::Mtu;

/// Longest Unix-domain socket path, terminator excluded.
pub const UNIX_PATH_MAX: usize = 108;

/// Smallest send or receive buffer: room for a header with full chunk
/// lists.
pub const MIN_BUFFER_SIZE: usize = HEADER_SIZE + MAX_HEADER_SIZE;

/// Default port of the RDMA transport.
pub const DEFAULT_PORT: u16 = 24008;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] io::Error),

    #[error("malformed configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("`{key}` is out of range: {value}")]
    OutOfRange { key: &'static str, value: String },

    #[error("`{key}` path is longer than 108 bytes")]
    PathTooLong { key: &'static str },

    #[error("`{0}` is required for this address family")]
    Missing(&'static str),
}

/// Address family of the transport endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressFamily {
    Inet,
    Inet6,
    Unix,
    /// Sockets Direct Protocol; addressed like `inet`.
    InetSdp,
}

/// Options of one transport endpoint.
///
/// Every key is optional. Keys may sit at the top level of a TOML document or
/// inside a `[transport]` table:
///
/// ```toml
/// [transport]
/// remote-host = "10.0.0.2"
/// send-count = 128
/// mtu = 4096
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TransportOptions {
    pub address_family: Option<AddressFamily>,

    /// Device name, or a regular expression matched against device names.
    pub device_name: Option<String>,

    /// Device port, 1-based.
    pub port: u8,

    pub mtu: u32,
    pub send_count: u32,
    pub recv_count: u32,
    pub send_size: usize,
    pub recv_size: usize,

    pub attr_timeout: u8,
    pub attr_retry_cnt: u8,
    pub attr_rnr_retry: u8,

    /// Timeout of address and route resolution.
    pub resolve_timeout_ms: u64,

    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    pub listen_host: Option<String>,
    pub listen_port: Option<u16>,

    pub connect_path: Option<PathBuf>,
    pub bind_path: Option<PathBuf>,
    pub listen_path: Option<PathBuf>,

    /// Bind client connections to unprivileged source ports only.
    pub bind_insecure: bool,

    /// Source ports never used by client connections.
    pub reserved_ports: Vec<u16>,

    /// Pages per arena of the buffer pool.
    pub arena_pages: usize,

    /// Page size of the buffer pool.
    pub page_size: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            address_family: None,
            device_name: None,
            port: 1,
            mtu: 2048,
            send_count: 4096,
            recv_count: 4096,
            send_size: INLINE_THRESHOLD,
            recv_size: INLINE_THRESHOLD,
            attr_timeout: 14,
            attr_retry_cnt: 7,
            attr_rnr_retry: 7,
            resolve_timeout_ms: 2000,
            remote_host: None,
            remote_port: None,
            listen_host: None,
            listen_port: None,
            connect_path: None,
            bind_path: None,
            listen_path: None,
            bind_insecure: false,
            reserved_ports: Vec::new(),
            arena_pages: 64,
            page_size: 4096,
        }
    }
}

#[derive(Deserialize)]
struct Document {
    transport: Option<TransportOptions>,
}

impl TransportOptions {
    /// Parse options from a TOML string and validate them.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(s)?;
        let opts = if table.contains_key("transport") {
            let doc: Document = table.try_into()?;
            doc.transport.unwrap_or_default()
        } else {
            table.try_into()?
        };
        opts.validate()?;
        Ok(opts)
    }

    /// Load options from a TOML file and validate them.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Check every value is within range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn out_of_range(key: &'static str, value: impl ToString) -> ConfigError {
            ConfigError::OutOfRange {
                key,
                value: value.to_string(),
            }
        }

        if !(1..=4).contains(&self.port) {
            return Err(out_of_range("port", self.port));
        }
        if self.send_count == 0 {
            return Err(out_of_range("send-count", self.send_count));
        }
        if self.recv_count == 0 {
            return Err(out_of_range("recv-count", self.recv_count));
        }
        if self.send_size < MIN_BUFFER_SIZE {
            return Err(out_of_range("send-size", self.send_size));
        }
        if self.recv_size < MIN_BUFFER_SIZE {
            return Err(out_of_range("recv-size", self.recv_size));
        }
        if self.resolve_timeout_ms == 0 {
            return Err(out_of_range("resolve-timeout-ms", self.resolve_timeout_ms));
        }
        if self.arena_pages == 0 {
            return Err(out_of_range("arena-pages", self.arena_pages));
        }
        if self.page_size < 64 || !self.page_size.is_power_of_two() {
            return Err(out_of_range("page-size", self.page_size));
        }
        for (key, path) in [
            ("connect-path", &self.connect_path),
            ("bind-path", &self.bind_path),
            ("listen-path", &self.listen_path),
        ] {
            if path.as_ref().is_some_and(|p| p.as_os_str().len() > UNIX_PATH_MAX) {
                return Err(ConfigError::PathTooLong { key });
            }
        }
        Ok(())
    }

    /// The configured address family, or a guess from the other options.
    pub fn family(&self) -> Option<AddressFamily> {
        self.address_family.or_else(|| {
            if self.remote_host.is_some() {
                Some(AddressFamily::Inet)
            } else if self.connect_path.is_some() {
                Some(AddressFamily::Unix)
            } else {
                None
            }
        })
    }

    /// Path MTU, falling back to 2048 if the configured value is invalid.
    pub fn effective_mtu(&self) -> Mtu {
        Mtu::from_bytes(self.mtu).unwrap_or_else(|| {
            log::warn!("invalid mtu {}, using {}", self.mtu, Mtu::default().bytes());
            Mtu::default()
        })
    }

    /// Send buffer size, at most the inline threshold.
    pub fn effective_send_size(&self) -> usize {
        self.send_size.min(INLINE_THRESHOLD)
    }

    /// Receive buffer size, at most the inline threshold.
    pub fn effective_recv_size(&self) -> usize {
        self.recv_size.min(INLINE_THRESHOLD)
    }
}
