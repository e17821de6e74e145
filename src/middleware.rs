//! Top-level proxy dispatcher: owns the root CA, leaf cache, resolver, aux
//! app table, and open-tunnel counter, and routes each inbound connection
//! to either the CONNECT tunnel state machine or the plain-HTTP-proxy
//! handler. Grounded on `examples/http_mitm_proxy.rs`'s `main()` wiring
//! (`TcpListener` -> per-connection task -> CONNECT vs. plain-HTTP branch).

use crate::ca::{LeafCertCache, RootCa};
use crate::config::ProxyConfig;
use crate::connect::handle_connect_tunnel;
use crate::error::ProxyError;
use crate::gateway::App;
use crate::http_proxy::handle_http_proxy_request;
use crate::io::hijack::{DirectAcceptHijacker, SocketHijacker};
use crate::io::reader::RequestReader;
use crate::resolver::Resolver;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;

/// Maps a virtual proxy host name to an app that answers for it directly,
/// bypassing the configured inner `app` entirely. The cert-downloader app
/// is installed here under `config.proxy_host` when enabled.
#[derive(Default)]
pub struct AuxAppTable {
    apps: Vec<(String, Arc<dyn App>)>,
}

impl AuxAppTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: impl Into<String>, app: Arc<dyn App>) {
        self.apps.push((host.into(), app));
    }

    pub fn match_host(&self, host: &str) -> Option<Arc<dyn App>> {
        self.apps
            .iter()
            .find(|(h, _)| h.eq_ignore_ascii_case(host))
            .map(|(_, app)| Arc::clone(app))
    }
}

pub struct ProxyMiddleware {
    pub config: Arc<ProxyConfig>,
    pub root_ca: Arc<RootCa>,
    pub leaf_cache: Arc<LeafCertCache>,
    pub resolver: Arc<dyn Resolver>,
    pub app: Arc<dyn App>,
    pub aux_apps: Arc<AuxAppTable>,
    open_tunnels: Arc<AtomicI64>,
}

impl ProxyMiddleware {
    pub fn new(
        config: ProxyConfig,
        resolver: Arc<dyn Resolver>,
        app: Arc<dyn App>,
        mut aux_apps: AuxAppTable,
    ) -> Result<Self, ProxyError> {
        let root_ca = Arc::new(RootCa::load_or_generate(&config.ca_file_cache, &config.ca_name)?);

        if config.enable_cert_download {
            let downloader = Arc::new(crate::cert_downloader::CertDownloaderApp::new(Arc::clone(&root_ca)));
            aux_apps.insert(config.proxy_host.clone(), downloader);
        }

        let leaf_cache = Arc::new(LeafCertCache::new(
            config.leaf_cert_cache_capacity,
            config.use_wildcard_certs,
            config.use_wildcard_certs,
            config.leaf_cert_lifetime,
        ));

        Ok(Self {
            config: Arc::new(config),
            root_ca,
            leaf_cache,
            resolver,
            app,
            aux_apps: Arc::new(aux_apps),
            open_tunnels: Arc::new(AtomicI64::new(0)),
        })
    }

    /// Bind and serve forever, accepting connections via a
    /// [`DirectAcceptHijacker`]. Embedders wanting a different socket
    /// source should drive [`Self::serve_one`] themselves instead.
    pub async fn run(self: Arc<Self>) -> Result<(), ProxyError> {
        let hijacker = DirectAcceptHijacker::bind(self.config.bind_addr)
            .await
            .map_err(ProxyError::setup)?;

        tracing::info!(addr = %self.config.bind_addr, "proxytap listening");

        loop {
            let (stream, peer_addr) = hijacker.accept().await.map_err(ProxyError::setup)?;
            apply_tcp_keepalive(&stream, &self.config);

            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = this.serve_one(stream).await {
                    tracing::warn!(%peer_addr, error = %err, "connection ended with error");
                }
            });
        }
    }

    /// Serve a single accepted connection: dispatch on whether the first
    /// request is a CONNECT or an absolute-URL plain-HTTP-proxy request.
    pub async fn serve_one(&self, stream: TcpStream) -> Result<(), ProxyError> {
        let mut reader = RequestReader::new(stream);
        let head = match reader.read_head().await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(err) => return Err(ProxyError::protocol(err)),
        };

        if head.method == http::Method::CONNECT {
            self.open_tunnels.fetch_add(1, Ordering::SeqCst);
            let result = handle_connect_tunnel(self, reader, head).await;
            self.open_tunnels.fetch_sub(1, Ordering::SeqCst);
            return result;
        }

        let target = head.target.clone();
        let body_len = head.content_length().unwrap_or(0) as usize;
        let body_bytes = if body_len > 0 {
            reader.read_body_exact(body_len).await.map_err(ProxyError::protocol)?
        } else {
            bytes::Bytes::new()
        };
        let body: crate::gateway::BodyStream = Box::pin(futures_util::stream::once(async move {
            Ok(body_bytes) as crate::gateway::BodyChunk
        }));

        let resp = if target.starts_with("http://") || target.starts_with("https://") {
            handle_http_proxy_request(
                head.method,
                &target,
                head.headers,
                body,
                &self.config.proxy_host,
                self.resolver.as_ref(),
                &self.app,
                &self.aux_apps,
            )
            .await?
        } else {
            // Not a proxy-form request (no absolute-URL target): forward
            // straight to the inner app, bypassing resolver rewriting.
            let header_pairs: Vec<(String, String)> = head
                .headers
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_owned(), v.to_owned())))
                .collect();
            let content_type = header_pairs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                .map(|(_, v)| v.clone());
            let host = header_pairs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("host"))
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            let aux_match = self.aux_apps.match_host(&host).filter(|app| app.handles_path(&target));
            let matched_proxy_host = aux_match.is_some().then(|| host.clone());
            let app = aux_match.unwrap_or_else(|| Arc::clone(&self.app));
            let env = crate::env::ProxyEnv {
                method: head.method,
                request_uri: target,
                query_string: head.target.find('?').map(|i| head.target[i + 1..].to_owned()).unwrap_or_default(),
                protocol: "HTTP/1.1",
                url_scheme: crate::env::UrlScheme::Http,
                headers: header_pairs,
                content_length: head.content_length(),
                content_type,
                connect_host: host,
                connect_port: None,
                proxy_host: self.config.proxy_host.clone(),
                matched_proxy_host,
            };
            match app.call(env, body).await {
                Ok(resp) => resp,
                Err(err) => {
                    tracing::warn!(error = %err, "inner app failed; emitting 500");
                    crate::gateway::GatewayResponse::new(http::StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        };

        let (mut stream, _) = reader.into_inner();
        let _ = crate::connect::write_response(&mut stream, resp, "HTTP/1.1").await?;
        Ok(())
    }

    pub(crate) fn open_tunnels(&self) -> i64 {
        self.open_tunnels.load(Ordering::SeqCst)
    }

    pub(crate) fn keepalive_allowed(&self) -> bool {
        self.config.keepalive_allowed(self.open_tunnels())
    }
}

fn apply_tcp_keepalive(stream: &TcpStream, config: &ProxyConfig) {
    if config.tcp_keepidle.is_none() && config.tcp_keepintvl.is_none() && config.tcp_keepcnt.is_none() {
        return;
    }
    let socket = socket2::SockRef::from(stream);
    let mut keepalive = socket2::TcpKeepalive::new();
    if let Some(idle) = config.tcp_keepidle {
        keepalive = keepalive.with_time(idle);
    }
    if let Some(intvl) = config.tcp_keepintvl {
        keepalive = keepalive.with_interval(intvl);
    }
    if let Some(cnt) = config.tcp_keepcnt {
        keepalive = keepalive.with_retries(cnt);
    }
    if let Err(err) = socket.set_tcp_keepalive(&keepalive) {
        tracing::debug!(error = %err, "failed to set tcp keepalive options");
    }
}
