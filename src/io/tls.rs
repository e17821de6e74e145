//! SNI-aware TLS server setup: one `rustls::ServerConfig` built per CONNECT
//! tunnel (the tunnel already knows the CONNECT host before the handshake
//! starts), resolving leaf certs from the shared [`LeafCertCache`] and
//! reporting the actual SNI seen back to the caller. Grounded on the
//! `RustlsAcceptorService`/`RustlsAcceptorLayer` shape in
//! `old-src/tls/server/rustls.rs`, simplified to a single non-generic
//! acceptor, and on `cloudillo-proxy`'s per-host `CertifiedKey` resolution.

use crate::ca::{LeafCertCache, RootCa};
use crate::error::ProxyError;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::sync::{Arc, Mutex, Once};

static INSTALL_CRYPTO_PROVIDER: Once = Once::new();

/// Install the `ring` default crypto provider exactly once. Must run
/// before any `ServerConfig`/`CertifiedKey` construction.
pub fn ensure_crypto_provider_installed() {
    INSTALL_CRYPTO_PROVIDER.call_once(|| {
        // Ignore the error: a previous, equivalent install from another
        // part of the process (e.g. a test running in parallel) is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Resolves the leaf certificate for a single CONNECT tunnel's TLS
/// handshake, minting on first use via the shared leaf cache, and
/// recording whatever SNI hostname the client actually sent so the
/// Connect Handler can apply the SNI-override tie-break afterward.
pub struct SniAwareResolver {
    root_ca: Arc<RootCa>,
    cache: Arc<LeafCertCache>,
    default_host: String,
    observed_sni: Arc<Mutex<Option<String>>>,
}

impl SniAwareResolver {
    pub fn new(root_ca: Arc<RootCa>, cache: Arc<LeafCertCache>, default_host: impl Into<String>) -> Self {
        Self {
            root_ca,
            cache,
            default_host: default_host.into(),
            observed_sni: Arc::new(Mutex::new(None)),
        }
    }

    /// A handle to read back the SNI hostname observed during the
    /// handshake, once it has completed.
    pub fn observed_sni_handle(&self) -> Arc<Mutex<Option<String>>> {
        Arc::clone(&self.observed_sni)
    }

    fn hostname_for(&self, hello: &ClientHello<'_>) -> String {
        match hello.server_name() {
            Some(sni) => {
                if let Ok(mut guard) = self.observed_sni.lock() {
                    *guard = Some(sni.to_owned());
                }
                sni.to_owned()
            }
            None => self.default_host.clone(),
        }
    }
}

impl std::fmt::Debug for SniAwareResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniAwareResolver")
            .field("default_host", &self.default_host)
            .finish()
    }
}

impl ResolvesServerCert for SniAwareResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let hostname = self.hostname_for(&client_hello);
        self.cache
            .get_or_mint(&self.root_ca, &hostname)
            .map(|leaf| leaf.certified_key)
            .ok()
    }
}

/// Build a per-tunnel `ServerConfig` for terminating TLS toward the client,
/// with no client-cert auth and ALPN left to the caller.
pub fn server_config_for(resolver: Arc<SniAwareResolver>) -> Result<ServerConfig, ProxyError> {
    ensure_crypto_provider_installed();
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}
