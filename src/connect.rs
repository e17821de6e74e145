//! The CONNECT tunnel state machine: accept the tunnel, decide TLS vs.
//! plain framing, terminate TLS with an on-demand leaf cert when needed,
//! then loop reading requests and dispatching them to the inner app (or a
//! matched aux app) until keep-alive ends or a WebSocket upgrade takes
//! over the connection. Grounded directly on the Connect Handler design,
//! with the accept-then-reenter-HTTP-server control flow modeled on
//! `examples/http_mitm_proxy.rs`'s `http_connect_accept`/`UpgradeLayer`.

use crate::env::{ProxyEnv, UrlScheme};
use crate::error::ProxyError;
use crate::gateway::{BodyChunk, BodyStream, GatewayResponse, ResponseBody};
use crate::io::reader::{ReadRequestError, RequestHead, RequestReader};
use crate::io::tls::{server_config_for, SniAwareResolver};
use crate::io::RetryingIo;
use crate::middleware::ProxyMiddleware;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

/// How many bytes to peek on a non-standard CONNECT port before deciding
/// whether the tunnel carries TLS or plaintext HTTP.
const TLS_SNIFF_LEN: usize = 16;

/// A best-effort [`ProxyEnv`] built from the CONNECT request line alone,
/// used only to ask the resolver whether this tunnel requires proxy auth
/// before any TLS wrap or inner-app dispatch happens.
fn connect_auth_env(head: &RequestHead, connect_host: &str, connect_port: u16, proxy_host: &str) -> ProxyEnv {
    let headers: Vec<(String, String)> = head
        .headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_owned(), v.to_owned())))
        .collect();
    ProxyEnv {
        method: head.method.clone(),
        request_uri: head.target.clone(),
        query_string: String::new(),
        protocol: if head.version_minor == 0 { "HTTP/1.0" } else { "HTTP/1.1" },
        url_scheme: UrlScheme::Https,
        headers,
        content_length: None,
        content_type: None,
        connect_host: connect_host.to_owned(),
        connect_port: Some(connect_port),
        proxy_host: proxy_host.to_owned(),
        matched_proxy_host: None,
    }
}

/// Write a `407 Proxy Authentication` challenge directly to the raw socket,
/// for a CONNECT request the resolver rejected before any wrap happened.
async fn write_407<S: AsyncWrite + Unpin>(stream: &mut S, protocol: &str, realm: &str) -> Result<(), ProxyError> {
    let resp = format!(
        "{protocol} 407 Proxy Authentication Required\r\n\
         Proxy-Authenticate: Basic realm=\"{realm}\"\r\n\
         Proxy-Connection: close\r\n\
         Content-Length: 0\r\n\r\n"
    );
    stream.write_all(resp.as_bytes()).await.map_err(ProxyError::transport)
}

fn parse_connect_target(target: &str) -> Result<(String, u16), ProxyError> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::protocol(format!("CONNECT target missing port: {target}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ProxyError::protocol(format!("invalid port in CONNECT target: {target}")))?;
    if host.is_empty() {
        return Err(ProxyError::protocol(format!("CONNECT target missing host: {target}")));
    }
    Ok((host.to_owned(), port))
}

/// Drive one CONNECT tunnel end to end.
pub async fn handle_connect_tunnel(
    middleware: &ProxyMiddleware,
    reader: RequestReader<TcpStream>,
    head: RequestHead,
) -> Result<(), ProxyError> {
    let (connect_host, connect_port) = parse_connect_target(&head.target)?;
    let connect_protocol = if head.version_minor == 0 { "HTTP/1.0" } else { "HTTP/1.1" };

    let (mut stream, leftover) = reader.into_inner();

    let auth_env = connect_auth_env(&head, &connect_host, connect_port, &middleware.config.proxy_host);
    if let Some(realm) = middleware.resolver.require_auth(&auth_env) {
        write_407(&mut stream, connect_protocol, &realm).await?;
        return Ok(());
    }
    // The resolver only ever sees `Proxy-Authorization` once, on this
    // CONNECT request; carry it forward so every request inside the tunnel
    // still resolves as the authenticated user (e.g. `ProxyAuthResolver`'s
    // per-username path prefix).
    let tunnel_proxy_auth = auth_env.header("proxy-authorization").map(|v| v.to_owned());

    stream
        .write_all(format!("{connect_protocol} 200 Connection Established\r\n\r\n").as_bytes())
        .await
        .map_err(ProxyError::transport)?;

    let is_tls = match connect_port {
        443 => true,
        80 => false,
        _ => sniff_is_tls(&mut stream, &leftover).await?,
    };

    if is_tls {
        let leaf_cache = Arc::clone(&middleware.leaf_cache);
        let root_ca = Arc::clone(&middleware.root_ca);
        let resolver = Arc::new(SniAwareResolver::new(root_ca, leaf_cache, connect_host.clone()));
        let observed_sni = resolver.observed_sni_handle();
        let server_config = server_config_for(resolver)?;
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let prefixed = LeftoverPrefixed::new(stream, leftover);
        let tls_stream = crate::io::TokioRetryingIo
            .retrying(|| acceptor.accept(prefixed))
            .await
            .map_err(ProxyError::transport)?;

        let connect_host = observed_sni
            .lock()
            .map_err(|_| ProxyError::setup("observed sni lock poisoned"))?
            .clone()
            .unwrap_or(connect_host);

        serve_tunnel_requests(
            middleware,
            tls_stream,
            connect_host,
            connect_port,
            UrlScheme::Https,
            Bytes::new(),
            tunnel_proxy_auth,
        )
        .await
    } else {
        serve_tunnel_requests(
            middleware,
            stream,
            connect_host,
            connect_port,
            UrlScheme::Http,
            leftover,
            tunnel_proxy_auth,
        )
        .await
    }
}

async fn sniff_is_tls(stream: &mut TcpStream, leftover: &Bytes) -> Result<bool, ProxyError> {
    if !leftover.is_empty() {
        return Ok(!looks_like_plaintext_http(leftover));
    }
    let mut buf = [0u8; TLS_SNIFF_LEN];
    let n = stream.peek(&mut buf).await.map_err(ProxyError::transport)?;
    Ok(!looks_like_plaintext_http(&buf[..n]))
}

fn looks_like_plaintext_http(buf: &[u8]) -> bool {
    buf.starts_with(b"GET ")
        || buf.starts_with(b"POST ")
        || buf.starts_with(b"HEAD ")
        || buf.starts_with(b"PUT ")
        || buf.starts_with(b"OPTIONS ")
}

/// Wraps a [`TcpStream`] so the bytes already read off it (before we knew
/// we needed a TLS handshake) are replayed before further reads.
struct LeftoverPrefixed {
    stream: TcpStream,
    leftover: Bytes,
}

impl LeftoverPrefixed {
    fn new(stream: TcpStream, leftover: Bytes) -> Self {
        Self { stream, leftover }
    }
}

impl AsyncRead for LeftoverPrefixed {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        if !self.leftover.is_empty() {
            let take = self.leftover.len().min(buf.remaining());
            let chunk = self.leftover.split_to(take);
            buf.put_slice(&chunk);
            return std::task::Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for LeftoverPrefixed {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

async fn serve_tunnel_requests<S>(
    middleware: &ProxyMiddleware,
    stream: S,
    mut connect_host: String,
    connect_port: u16,
    scheme: UrlScheme,
    preloaded: Bytes,
    tunnel_proxy_auth: Option<String>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = RequestReader::new(stream);
    if !preloaded.is_empty() {
        reader.prime(preloaded);
    }

    loop {
        let head = match reader.read_head().await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(ReadRequestError::UnexpectedEof) => return Ok(()),
            Err(err) => return Err(ProxyError::protocol(err)),
        };

        let body_len = head.content_length().unwrap_or(0) as usize;
        let body_bytes = if body_len > 0 {
            reader
                .read_body_exact(body_len)
                .await
                .map_err(ProxyError::protocol)?
        } else {
            Bytes::new()
        };

        let request_path = head.target.as_str();
        let aux_match = middleware
            .aux_apps
            .match_host(&connect_host)
            .filter(|app| app.handles_path(request_path));
        let matched_proxy_host = aux_match.is_some().then(|| connect_host.clone());
        let app = aux_match.unwrap_or_else(|| Arc::clone(&middleware.app));

        let mut header_pairs: Vec<(String, String)> = head
            .headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_owned(), v.to_owned())))
            .collect();
        let content_type = header_pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.clone());
        // Carried forward for the resolver's benefit only (e.g. a username
        // prefix per request), never shown to the inner app.
        let effective_proxy_auth = header_pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("proxy-authorization"))
            .map(|(_, v)| v.clone())
            .or_else(|| tunnel_proxy_auth.clone());
        // FILTER_REQ_HEADERS: proxy-only framing headers never reach the inner app.
        header_pairs.retain(|(k, _)| {
            !k.eq_ignore_ascii_case("proxy-connection") && !k.eq_ignore_ascii_case("proxy-authorization")
        });

        let protocol: &'static str = if head.version_minor == 0 { "HTTP/1.0" } else { "HTTP/1.1" };

        let reflected_port = if (connect_port == 443 && scheme == UrlScheme::Https)
            || (connect_port == 80 && scheme == UrlScheme::Http)
        {
            None
        } else {
            Some(connect_port)
        };

        let mut env = ProxyEnv {
            method: head.method.clone(),
            request_uri: head.target.clone(),
            query_string: head.target.find('?').map(|i| head.target[i + 1..].to_owned()).unwrap_or_default(),
            protocol,
            url_scheme: scheme,
            headers: header_pairs,
            content_length: head.content_length(),
            content_type,
            connect_host: connect_host.clone(),
            connect_port: reflected_port,
            proxy_host: middleware.config.proxy_host.clone(),
            matched_proxy_host,
        };

        // The resolver contract operates on the full absolute URL the
        // client asked for (scheme://host[:port]path), not the bare
        // path+query the embedded HTTP/1.x request line carries. An
        // auxiliary-host match bypasses the resolver entirely: REQUEST_URI
        // becomes just the path+query, already what `head.target` is.
        if env.matched_proxy_host.is_none() {
            if let Some(auth) = &effective_proxy_auth {
                env.headers.push(("Proxy-Authorization".to_owned(), auth.clone()));
            }
            let full_uri = full_request_uri(scheme, &connect_host, reflected_port, &head.target);
            env.request_uri = middleware.resolver.resolve(&full_uri, &env);
            env.headers.retain(|(k, _)| !k.eq_ignore_ascii_case("proxy-authorization"));
        }

        if middleware.config.enable_websockets && env.is_websocket_upgrade() {
            let client_key = env.header("sec-websocket-key").map(|s| s.to_owned());
            if let Some(client_key) = client_key {
                let protocol = env.header("sec-websocket-protocol").map(|s| s.to_owned());
                crate::ws::write_handshake_response(reader.stream_mut(), &client_key, protocol.as_deref())
                    .await
                    .map_err(ProxyError::transport)?;
                let (stream, _leftover) = reader.into_inner();
                let ws_stream: crate::gateway::WebSocketStream = Box::pin(stream);
                app.call_websocket(env, ws_stream).await?;
                return Ok(());
            }
        }

        let body: BodyStream = Box::pin(futures_util::stream::once(async move { Ok(body_bytes) as BodyChunk }));
        let resp = match app.call(env.clone(), body).await {
            Ok(resp) => resp,
            Err(err) => {
                // Nothing has gone out on the wire yet, so a plain 500 is a
                // valid, complete response rather than just dropping the tunnel.
                tracing::warn!(error = %err, "inner app failed; emitting 500");
                GatewayResponse::new(http::StatusCode::INTERNAL_SERVER_ERROR)
            }
        };

        let reusable = write_response(reader.stream_mut(), resp, protocol).await?;

        connect_host = env.connect_host;

        let keep_alive =
            reusable && env.is_keep_alive() && protocol == "HTTP/1.1" && middleware.keepalive_allowed();
        if !keep_alive {
            return Ok(());
        }
    }
}

/// Reconstruct the absolute URL the client believes it is requesting, from
/// the CONNECT-established scheme/host/port and the embedded request's
/// path+query. The port is reflected only when non-default for `scheme`
/// (mirrors `ProxyEnv::connect_port`'s "present only when non-default").
fn full_request_uri(scheme: UrlScheme, host: &str, port: Option<u16>, request_target: &str) -> String {
    match port {
        Some(port) => format!("{}://{host}:{port}{request_target}", scheme.as_str()),
        None => format!("{}://{host}{request_target}", scheme.as_str()),
    }
}

/// Write `resp` to `stream`, choosing framing per the response-writer
/// design: `Content-Length` passthrough for a fixed body, chunked
/// encoding for a streamed body on HTTP/1.1, and a fully-buffered spool
/// (so headers including a computed `Content-Length` can be written
/// first) for a streamed body on HTTP/1.0. A response whose headers
/// already declare `Content-Length` disables both chunking and buffering
/// regardless of body shape (spec's "response whose headers already
/// include Content-Length disables both chunking and buffering" rule):
/// the body is streamed as-is, truncated to the declared length if it
/// runs long. Returns whether the connection is still framed correctly
/// and may be kept alive — `false` if the body came up short of a
/// declared `Content-Length`, per the matching Open Question decision.
pub async fn write_response<S: AsyncWrite + Unpin>(
    stream: &mut S,
    resp: GatewayResponse,
    protocol: &str,
) -> Result<bool, ProxyError> {
    let GatewayResponse {
        status,
        headers,
        body,
        on_close,
    } = resp;

    // `on_close` must run exactly once no matter how `write_response_body`
    // below exits — including a transport error partway through streaming
    // (spec's "iterator close is always invoked... including on error
    // paths") — so the call is made here, after the body write attempt,
    // regardless of whether it succeeded, rather than inline at the tail
    // of the success path.
    let result = write_response_body(stream, status, headers, body, protocol).await;
    if let Some(on_close) = on_close {
        on_close();
    }
    result
}

async fn write_response_body<S: AsyncWrite + Unpin>(
    stream: &mut S,
    status: http::StatusCode,
    mut headers: Vec<(String, String)>,
    body: ResponseBody,
    protocol: &str,
) -> Result<bool, ProxyError> {
    let status_line = format!(
        "{protocol} {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );

    let declared_length: Option<u64> = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse().ok());

    let reusable = if let Some(declared_length) = declared_length {
        write_head(stream, &status_line, &headers).await?;
        write_body_truncated(stream, body, declared_length).await?
    } else {
        // No declared length parsed as valid, but a garbage Content-Length
        // header may still be sitting in `headers` (e.g. non-numeric) — drop
        // it before computing the real one, so we never emit it twice.
        headers.retain(|(k, _)| !k.eq_ignore_ascii_case("content-length"));
        match body {
            ResponseBody::Fixed(bytes) => {
                headers.push(("Content-Length".to_owned(), bytes.len().to_string()));
                write_head(stream, &status_line, &headers).await?;
                stream.write_all(&bytes).await.map_err(ProxyError::transport)?;
                true
            }
            ResponseBody::Streamed(mut body) if protocol == "HTTP/1.1" => {
                headers.push(("Transfer-Encoding".to_owned(), "chunked".to_owned()));
                write_head(stream, &status_line, &headers).await?;

                while let Some(chunk) = body.next().await {
                    let chunk = chunk?;
                    if chunk.is_empty() {
                        continue;
                    }
                    let framed = format!("{:x}\r\n", chunk.len());
                    stream.write_all(framed.as_bytes()).await.map_err(ProxyError::transport)?;
                    stream.write_all(&chunk).await.map_err(ProxyError::transport)?;
                    stream.write_all(b"\r\n").await.map_err(ProxyError::transport)?;
                }
                stream.write_all(b"0\r\n\r\n").await.map_err(ProxyError::transport)?;
                true
            }
            ResponseBody::Streamed(mut body) => {
                // HTTP/1.0: no chunked encoding available. Spool the full
                // body to a tempfile first so a correct Content-Length can
                // be written before any bytes of the response go out.
                let mut spool = tokio::fs::File::from_std(
                    tempfile::tempfile().map_err(ProxyError::transport)?,
                );
                let mut total = 0u64;
                while let Some(chunk) = body.next().await {
                    let chunk = chunk?;
                    spool.write_all(&chunk).await.map_err(ProxyError::transport)?;
                    total += chunk.len() as u64;
                }
                spool.seek(SeekFrom::Start(0)).await.map_err(ProxyError::transport)?;

                headers.push(("Content-Length".to_owned(), total.to_string()));
                write_head(stream, &status_line, &headers).await?;

                let mut buf = BytesMut::with_capacity(64 * 1024);
                buf.resize(64 * 1024, 0);
                loop {
                    let n = spool.read(&mut buf).await.map_err(ProxyError::transport)?;
                    if n == 0 {
                        break;
                    }
                    stream.write_all(&buf[..n]).await.map_err(ProxyError::transport)?;
                }
                true
            }
        }
    };

    stream.flush().await.map_err(ProxyError::transport)?;
    Ok(reusable)
}

/// Write at most `declared_length` bytes of `body` to `stream`, whatever
/// its actual shape. Returns `true` if exactly `declared_length` bytes
/// were available (the framing is exact, so the connection can be kept
/// alive), `false` if the body ran out early (the client is left waiting
/// on bytes that will never come, so the connection must be closed).
async fn write_body_truncated<S: AsyncWrite + Unpin>(
    stream: &mut S,
    body: ResponseBody,
    declared_length: u64,
) -> Result<bool, ProxyError> {
    let mut written = 0u64;
    match body {
        ResponseBody::Fixed(bytes) => {
            let take = (bytes.len() as u64).min(declared_length) as usize;
            stream.write_all(&bytes[..take]).await.map_err(ProxyError::transport)?;
            written = take as u64;
        }
        ResponseBody::Streamed(mut chunks) => {
            while written < declared_length {
                let Some(chunk) = chunks.next().await else { break };
                let chunk = chunk?;
                let remaining = (declared_length - written) as usize;
                let take = chunk.len().min(remaining);
                stream.write_all(&chunk[..take]).await.map_err(ProxyError::transport)?;
                written += take as u64;
            }
        }
    }
    Ok(written == declared_length)
}

async fn write_head<S: AsyncWrite + Unpin>(
    stream: &mut S,
    status_line: &str,
    headers: &[(String, String)],
) -> Result<(), ProxyError> {
    let mut out = String::with_capacity(status_line.len() + headers.len() * 32 + 2);
    out.push_str(status_line);
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    stream.write_all(out.as_bytes()).await.map_err(ProxyError::transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let (host, port) = parse_connect_target("example.com:443").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn rejects_missing_port() {
        assert!(parse_connect_target("example.com").is_err());
    }

    #[test]
    fn sniffs_plaintext_get() {
        assert!(looks_like_plaintext_http(b"GET / HTTP/1.1\r\n"));
        assert!(!looks_like_plaintext_http(&[0x16, 0x03, 0x01, 0x00, 0x05]));
    }
}
