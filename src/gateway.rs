//! The gateway interface the inner application conforms to: `app(env,
//! start_response) -> iterable of byte chunks`, reshaped here into a typed
//! `App` trait plus a `GatewayResponse`, per the response-writer redesign
//! note. Grounded on `rama-core`'s `Service<S, Request>` trait shape
//! (`fn serve(&self, ctx, req) -> impl Future<Output = Result<...>>`),
//! narrowed to the one request/response pair this proxy needs.

use crate::env::ProxyEnv;
use crate::error::ProxyError;
use bytes::Bytes;
use futures_core::Stream;
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// A chunk of request or response body.
pub type BodyChunk = Result<Bytes, ProxyError>;

/// A streamed body, boxed for dynamic dispatch across the aux-app table.
pub type BodyStream = Pin<Box<dyn Stream<Item = BodyChunk> + Send>>;

/// An empty body stream, for requests/responses with nothing to send.
pub fn empty_body() -> BodyStream {
    Box::pin(futures_util::stream::empty())
}

/// A body made of exactly one chunk.
pub fn fixed_body(bytes: impl Into<Bytes>) -> BodyStream {
    Box::pin(futures_util::stream::once(async move { Ok(bytes.into()) }))
}

/// The response body framing the Connect Handler chooses between: fixed
/// size (drives `Content-Length`), or streamed (drives chunked encoding
/// on HTTP/1.1, or full buffering on HTTP/1.0).
pub enum ResponseBody {
    Fixed(Bytes),
    Streamed(BodyStream),
}

/// What `start_response` plus the returned iterable become here: a
/// status, headers, and a body. `on_close`, if set, is invoked exactly
/// once after the body has been fully drained or the tunnel aborts,
/// satisfying the "iterator close is always invoked" invariant.
pub struct GatewayResponse {
    pub status: http::StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
    pub on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl GatewayResponse {
    pub fn new(status: http::StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ResponseBody::Fixed(Bytes::new()),
            on_close: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: ResponseBody) -> Self {
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Blanket trait so a duplex tunnel stream can be handed to an [`App`] as a
/// single trait object, regardless of whether it's a raw `TcpStream` or a
/// `rustls` `TlsStream` underneath.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

/// What `env["wsgi.websocket"]` becomes here: the raw decrypted duplex
/// stream, post-101-response, for the app to read/write RFC 6455 frames
/// over directly (see [`crate::ws`]).
pub type WebSocketStream = Pin<Box<dyn AsyncReadWrite>>;

/// The inner request-handling application. One call per request; the
/// Connect Handler and HTTP Proxy Handler are both clients of this trait.
pub trait App: Send + Sync + 'static {
    fn call(
        &self,
        env: ProxyEnv,
        body: BodyStream,
    ) -> Pin<Box<dyn Future<Output = Result<GatewayResponse, ProxyError>> + Send + '_>>;

    /// Whether this app actually answers for `path` (the REQUEST_URI's
    /// path, without query) once it has already been selected by a
    /// virtual-host match. The default always matches; an aux app with
    /// only a handful of recognized routes (e.g. the cert downloader)
    /// overrides this so the dispatcher falls through to the configured
    /// inner app for anything else, per the "any other path returns null
    /// so the dispatcher falls through" rule.
    fn handles_path(&self, _path: &str) -> bool {
        true
    }

    /// Invoked instead of [`Self::call`] once a WebSocket upgrade has
    /// completed (the `101` response has already gone out): the app owns
    /// `ws` until it returns. The default drops the connection immediately,
    /// for apps that never opt into WebSocket handling.
    fn call_websocket<'a>(
        &'a self,
        _env: ProxyEnv,
        _ws: WebSocketStream,
    ) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

impl<F, Fut> App for F
where
    F: Fn(ProxyEnv, BodyStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<GatewayResponse, ProxyError>> + Send + 'static,
{
    fn call(
        &self,
        env: ProxyEnv,
        body: BodyStream,
    ) -> Pin<Box<dyn Future<Output = Result<GatewayResponse, ProxyError>> + Send + '_>> {
        Box::pin(self(env, body))
    }
}
