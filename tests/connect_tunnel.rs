//! End-to-end loopback test driving a real `TcpListener` through
//! `ProxyMiddleware`, covering the plain-HTTP-over-CONNECT tunnel path
//! (port 80, so no TLS termination is involved) and its keep-alive
//! behavior across two requests on the same tunnel.

use proxytap::config::ProxyConfig;
use proxytap::middleware::{AuxAppTable, ProxyMiddleware};
use proxytap::resolver::IdentityResolver;
use proxytap::testing::FixtureApp;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_middleware() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = ProxyConfig {
        bind_addr: addr,
        ..ProxyConfig::default()
    };
    let middleware = Arc::new(
        ProxyMiddleware::new(config, Arc::new(IdentityResolver), Arc::new(FixtureApp), AuxAppTable::new()).unwrap(),
    );

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let middleware = Arc::clone(&middleware);
            tokio::spawn(async move {
                let _ = middleware.serve_one(stream).await;
            });
        }
    });

    addr
}

async fn read_until_headers_end(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        buf.extend_from_slice(&chunk[..n]);
        if let Ok(text) = std::str::from_utf8(&buf) {
            if text.contains("\r\n\r\n") || n == 0 {
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
async fn plain_http_tunnel_roundtrips_through_fixture_app() {
    let addr = spawn_middleware().await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    client
        .write_all(b"CONNECT example.com:80 HTTP/1.1\r\nHost: example.com:80\r\n\r\n")
        .await
        .unwrap();

    let mut connect_resp = [0u8; 64];
    let n = client.read(&mut connect_resp).await.unwrap();
    let connect_resp = String::from_utf8_lossy(&connect_resp[..n]);
    assert!(connect_resp.starts_with("HTTP/1.1 200"));

    client
        .write_all(b"GET /a/b?addproxyhost=true HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\n\r\n")
        .await
        .unwrap();

    let resp = read_until_headers_end(&mut client).await;
    assert!(resp.contains("Requested Url: http://example.com/a/b?addproxyhost=true Proxy Host: wsgiprox"));
}

#[tokio::test]
async fn second_request_on_same_tunnel_reuses_connection() {
    let addr = spawn_middleware().await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    client
        .write_all(b"CONNECT example.com:80 HTTP/1.1\r\nHost: example.com:80\r\n\r\n")
        .await
        .unwrap();
    let mut connect_resp = [0u8; 64];
    let n = client.read(&mut connect_resp).await.unwrap();
    assert!(String::from_utf8_lossy(&connect_resp[..n]).starts_with("HTTP/1.1 200"));

    client
        .write_all(b"GET /first HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\n\r\n")
        .await
        .unwrap();
    let first = read_until_headers_end(&mut client).await;
    assert!(first.contains("Requested Url: http://example.com/first"));

    client
        .write_all(b"GET /second HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\n\r\n")
        .await
        .unwrap();
    let second = read_until_headers_end(&mut client).await;
    assert!(second.contains("Requested Url: http://example.com/second"));
}

#[tokio::test]
async fn proxy_auth_resolver_challenges_then_rewrites_by_username() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = ProxyConfig {
        bind_addr: addr,
        ..ProxyConfig::default()
    };
    let resolver = Arc::new(proxytap::resolver::ProxyAuthResolver::new("proxytap"));
    let middleware = Arc::new(
        ProxyMiddleware::new(config, resolver, Arc::new(FixtureApp), AuxAppTable::new()).unwrap(),
    );
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let middleware = Arc::clone(&middleware);
            tokio::spawn(async move {
                let _ = middleware.serve_one(stream).await;
            });
        }
    });

    // No Proxy-Authorization: challenged with 407, tunnel ends.
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"CONNECT example.com:80 HTTP/1.1\r\nHost: example.com:80\r\n\r\n")
        .await
        .unwrap();
    let resp = read_until_headers_end(&mut client).await;
    assert!(resp.starts_with("HTTP/1.1 407"));
    assert!(resp.contains("Proxy-Authenticate: Basic realm=\"proxytap\""));

    // With Proxy-Authorization: tunnel proceeds and the rewrite is username-prefixed.
    use base64::Engine;
    let token = base64::engine::general_purpose::STANDARD.encode("alice:whatever");
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(
            format!("CONNECT example.com:80 HTTP/1.1\r\nHost: example.com:80\r\nProxy-Authorization: Basic {token}\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();
    let mut connect_resp = [0u8; 64];
    let n = client.read(&mut connect_resp).await.unwrap();
    assert!(String::from_utf8_lossy(&connect_resp[..n]).starts_with("HTTP/1.1 200"));

    client
        .write_all(b"GET /a/b HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();
    let resp = read_until_headers_end(&mut client).await;
    assert!(resp.contains("Requested Url: /alice/http://example.com/a/b"));
}
