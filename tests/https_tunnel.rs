//! End-to-end loopback tests driving a real TLS-terminated CONNECT tunnel:
//! the client trusts the proxy's freshly generated root CA and performs a
//! genuine TLS handshake against the on-demand leaf certificate, covering
//! the MITM path that `connect_tunnel.rs` (port-80, no-TLS) does not.

use proxytap::config::{CaFileCache, ProxyConfig};
use proxytap::middleware::{AuxAppTable, ProxyMiddleware};
use proxytap::resolver::IdentityResolver;
use proxytap::testing::FixtureApp;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::{CertificateDer, ServerName};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{client::TlsStream, TlsConnector};

async fn spawn_middleware() -> (std::net::SocketAddr, Arc<ProxyMiddleware>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = ProxyConfig {
        bind_addr: addr,
        ca_file_cache: CaFileCache::Memory(Arc::new(Mutex::new(Vec::new()))),
        ..ProxyConfig::default()
    };
    let middleware = Arc::new(
        ProxyMiddleware::new(config, Arc::new(IdentityResolver), Arc::new(FixtureApp), AuxAppTable::new()).unwrap(),
    );

    let serving = Arc::clone(&middleware);
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let middleware = Arc::clone(&serving);
            tokio::spawn(async move {
                let _ = middleware.serve_one(stream).await;
            });
        }
    });

    (addr, middleware)
}

fn client_config_trusting(root_pem: &str) -> Arc<ClientConfig> {
    proxytap::io::tls::ensure_crypto_provider_installed();
    let mut roots = RootCertStore::empty();
    let root_der = CertificateDer::from_pem_slice(root_pem.as_bytes())
        .unwrap()
        .into_owned();
    roots.add(root_der).unwrap();
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}

/// Issue `CONNECT host:port`, read the `200 Connection Established` reply,
/// then perform a real TLS handshake over the hijacked socket with SNI set
/// to `sni_host` (which may differ from the CONNECT host, for the SNI
/// override scenario).
async fn connect_and_handshake(
    addr: std::net::SocketAddr,
    connect_target: &str,
    sni_host: &str,
    root_pem: &str,
) -> TlsStream<TcpStream> {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(format!("CONNECT {connect_target} HTTP/1.1\r\nHost: {connect_target}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut buf = [0u8; 128];
    let n = client.read(&mut buf).await.unwrap();
    let resp = String::from_utf8_lossy(&buf[..n]);
    assert!(resp.starts_with("HTTP/1.1 200"), "unexpected CONNECT reply: {resp}");

    let connector = TlsConnector::from(client_config_trusting(root_pem));
    let server_name = ServerName::try_from(sni_host.to_owned()).unwrap();
    connector.connect(server_name, client).await.unwrap()
}

async fn read_until_headers_end<S: AsyncReadExt + Unpin>(stream: &mut S) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        buf.extend_from_slice(&chunk[..n]);
        if let Ok(text) = std::str::from_utf8(&buf) {
            if text.contains("\r\n\r\n") {
                return text.to_owned();
            }
        }
        if n == 0 {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn https_tunnel_terminates_tls_with_minted_leaf_and_roundtrips() {
    let (addr, middleware) = spawn_middleware().await;
    let root_pem = middleware.root_ca.get_root_pem();

    let mut tls = connect_and_handshake(addr, "example.com:443", "example.com", &root_pem).await;

    tls.write_all(b"GET /secure?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let resp = read_until_headers_end(&mut tls).await;
    assert!(resp.contains("Requested Url: https://example.com/secure?x=1"), "{resp}");
}

#[tokio::test]
async fn sni_hostname_overrides_connect_host_when_they_differ() {
    let (addr, middleware) = spawn_middleware().await;
    let root_pem = middleware.root_ca.get_root_pem();

    // CONNECT asks for a bare IP (as a client behind a DNS-less forward
    // proxy might); the TLS ClientHello's SNI names the real host. The
    // inner app must see the SNI host, not the CONNECT target.
    let mut tls = connect_and_handshake(addr, "203.0.113.7:443", "example.com", &root_pem).await;

    tls.write_all(b"GET /y HTTP/1.1\r\nHost: example.com\r\n\r\n").await.unwrap();
    let resp = read_until_headers_end(&mut tls).await;
    assert!(resp.contains("Requested Url: https://example.com/y"), "{resp}");
}

#[tokio::test]
async fn cert_download_endpoint_serves_pem_over_the_tls_tunnel() {
    let (addr, middleware) = spawn_middleware().await;
    let root_pem = middleware.root_ca.get_root_pem();

    let mut tls = connect_and_handshake(addr, "wsgiprox:443", "wsgiprox", &root_pem).await;

    tls.write_all(b"GET /download/pem HTTP/1.1\r\nHost: wsgiprox\r\n\r\n")
        .await
        .unwrap();
    let resp = read_until_headers_end(&mut tls).await;
    assert!(resp.starts_with("HTTP/1.1 200"), "{resp}");
    assert!(resp.contains("Content-Type: application/x-x509-ca-cert"), "{resp}");

    let body_start = resp.find("\r\n\r\n").unwrap() + 4;
    assert!(resp[body_start..].starts_with("-----BEGIN CERTIFICATE-----"));
}

#[tokio::test]
async fn websocket_upgrade_echoes_message_with_rewritten_url() {
    let (addr, middleware) = spawn_middleware().await;
    let root_pem = middleware.root_ca.get_root_pem();

    let mut tls = connect_and_handshake(addr, "example.com:443", "example.com", &root_pem).await;

    tls.write_all(
        b"GET /ws?q=1 HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\n\
          Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
          Sec-WebSocket-Version: 13\r\n\r\n",
    )
    .await
    .unwrap();

    let upgrade_resp = read_until_headers_end(&mut tls).await;
    assert!(upgrade_resp.starts_with("HTTP/1.1 101"), "{upgrade_resp}");
    assert!(upgrade_resp.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    proxytap::ws::write_frame(
        &mut tls,
        &proxytap::ws::Frame {
            opcode: proxytap::ws::Opcode::Text,
            payload: b"M".to_vec(),
        },
    )
    .await
    .unwrap();

    let frame = proxytap::ws::read_frame(&mut tls).await.unwrap();
    assert_eq!(frame.opcode, proxytap::ws::Opcode::Text);
    assert_eq!(
        String::from_utf8(frame.payload).unwrap(),
        "https://example.com/ws?q=1 M"
    );
}
