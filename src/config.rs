//! Typed configuration surface for [`crate::middleware::ProxyMiddleware`],
//! mirroring the flat key/effect table in the configuration-options design.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Where the root CA's PEM material is persisted.
#[derive(Debug, Clone)]
pub enum CaFileCache {
    /// Persisted to a file on disk; generated there if absent.
    Path(PathBuf),
    /// Kept only in memory; the PEM bytes are written into the given sink
    /// instead of a `root_ca_file` path.
    Memory(std::sync::Arc<std::sync::Mutex<Vec<u8>>>),
}

impl Default for CaFileCache {
    fn default() -> Self {
        Self::Path(PathBuf::from("proxytap-ca.pem"))
    }
}

/// Proxy configuration, defaults matching the configuration-options table.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the proxy listens on.
    pub bind_addr: SocketAddr,
    /// Subject/issuer CN of the root CA when newly generated.
    pub ca_name: String,
    /// Filesystem path or in-memory container for the root PEM.
    pub ca_file_cache: CaFileCache,
    /// Leaf certificate lifetime from mint time.
    pub leaf_cert_lifetime: std::time::Duration,
    /// Bounded capacity of the leaf-certificate LRU.
    pub leaf_cert_cache_capacity: usize,
    /// Enable parent-domain wildcard minting.
    pub use_wildcard_certs: bool,
    /// Enable the WebSocket upgrade path inside tunnels.
    pub enable_websockets: bool,
    /// Enable the `/download/pem` and `/download/p12` aux app.
    pub enable_cert_download: bool,
    /// Virtual host name the proxy itself (and cert downloader) answers to.
    pub proxy_host: String,
    /// `< 0` disables keep-alive, `0` is unbounded, otherwise the max
    /// number of concurrently open tunnels under which keep-alive continues.
    pub keepalive_max: i64,
    /// `SO_KEEPALIVE` / `TCP_KEEPIDLE` seconds, if set.
    pub tcp_keepidle: Option<std::time::Duration>,
    /// `TCP_KEEPINTVL` seconds, if set.
    pub tcp_keepintvl: Option<std::time::Duration>,
    /// `TCP_KEEPCNT`, if set.
    pub tcp_keepcnt: Option<u32>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9080),
            ca_name: "proxytap-ca".to_owned(),
            ca_file_cache: CaFileCache::default(),
            leaf_cert_lifetime: std::time::Duration::from_secs(3 * 24 * 3600),
            leaf_cert_cache_capacity: 1024,
            use_wildcard_certs: true,
            enable_websockets: true,
            enable_cert_download: true,
            proxy_host: "wsgiprox".to_owned(),
            keepalive_max: 50,
            tcp_keepidle: None,
            tcp_keepintvl: None,
            tcp_keepcnt: None,
        }
    }
}

impl ProxyConfig {
    /// Whether a tunnel may serve another request given `open_tunnels`
    /// currently live, per the keep-alive policy.
    pub fn keepalive_allowed(&self, open_tunnels: i64) -> bool {
        match self.keepalive_max {
            n if n < 0 => false,
            0 => true,
            max => open_tunnels <= max,
        }
    }
}
