//! Buffered reader for HTTP/1.x request lines and headers off a tunnel
//! stream, leaving any body bytes already read available for the caller.
//! Grounded on the manual header-framing loop in `rust_http_proxy`'s proxy
//! handler (`proxy.rs`) and the line-buffered read idiom `old-src`'s rustls
//! stream wrapper uses before handing off to an HTTP parser.

use bytes::{Bytes, BytesMut};
use http::{HeaderName, HeaderValue, Method};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Headers + buffer large enough for the vast majority of real requests;
/// a request exceeding it is rejected rather than growing unbounded.
const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

#[derive(Debug)]
pub enum ReadRequestError {
    /// The peer closed the connection before sending any bytes of a new
    /// request. Not fatal on a keep-alive boundary.
    ConnectionClosed,
    /// The peer closed mid-request, after some bytes were already read.
    UnexpectedEof,
    HeadTooLarge,
    Malformed(String),
    Io(std::io::Error),
}

impl fmt::Display for ReadRequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionClosed => write!(f, "connection closed before a request"),
            Self::UnexpectedEof => write!(f, "connection closed mid-request"),
            Self::HeadTooLarge => write!(f, "request head exceeded the size limit"),
            Self::Malformed(msg) => write!(f, "malformed request: {msg}"),
            Self::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for ReadRequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ReadRequestError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// A parsed request line plus headers, in order of arrival.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version_minor: u8,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers
            .iter()
            .find(|(k, _)| k.as_str().eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }
}

/// Reads request heads off `S`, buffering any body bytes read along with
/// the head so they aren't lost to the next parse.
pub struct RequestReader<S> {
    stream: S,
    buf: BytesMut,
}

impl<S: AsyncRead + Unpin> RequestReader<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(MAX_HEAD_BYTES),
        }
    }

    pub fn into_inner(self) -> (S, Bytes) {
        (self.stream, self.buf.freeze())
    }

    /// Seed the internal buffer with bytes already read off the stream
    /// elsewhere (e.g. the TLS-vs-plaintext sniff peek), so the next
    /// `read_head` sees them before issuing a fresh socket read.
    pub fn prime(&mut self, bytes: Bytes) {
        self.buf.extend_from_slice(&bytes);
    }

    /// Read and parse the next request head. Returns `Ok(None)` only when
    /// zero bytes had been buffered or read before EOF (a clean keep-alive
    /// boundary); any EOF after that is `UnexpectedEof`.
    pub async fn read_head(&mut self) -> Result<Option<RequestHead>, ReadRequestError> {
        loop {
            if let Some((head, consumed)) = try_parse(&self.buf)? {
                let _ = self.buf.split_to(consumed);
                return Ok(Some(head));
            }

            if self.buf.len() >= MAX_HEAD_BYTES {
                return Err(ReadRequestError::HeadTooLarge);
            }

            let had_bytes = !self.buf.is_empty();
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return if had_bytes {
                    Err(ReadRequestError::UnexpectedEof)
                } else {
                    Ok(None)
                };
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read exactly `len` more bytes of body, preferring whatever is
    /// already buffered from the head read.
    pub async fn read_body_exact(&mut self, len: usize) -> Result<Bytes, ReadRequestError> {
        while self.buf.len() < len {
            let mut chunk = [0u8; 8192];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(ReadRequestError::UnexpectedEof);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(self.buf.split_to(len).freeze())
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

fn try_parse(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, ReadRequestError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_storage);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => {
            let method = req
                .method
                .ok_or_else(|| ReadRequestError::Malformed("missing method".to_owned()))?;
            let method = Method::from_bytes(method.as_bytes())
                .map_err(|_| ReadRequestError::Malformed("invalid method".to_owned()))?;
            let target = req
                .path
                .ok_or_else(|| ReadRequestError::Malformed("missing request target".to_owned()))?
                .to_owned();
            let version_minor = req.version.unwrap_or(1);

            let mut headers = Vec::with_capacity(req.headers.len());
            for h in req.headers.iter() {
                let name = HeaderName::from_bytes(h.name.as_bytes())
                    .map_err(|_| ReadRequestError::Malformed(format!("invalid header name {:?}", h.name)))?;
                let value = HeaderValue::from_bytes(h.value)
                    .map_err(|_| ReadRequestError::Malformed(format!("invalid header value for {name}")))?;
                headers.push((name, value));
            }

            Ok(Some((
                RequestHead {
                    method,
                    target,
                    version_minor,
                    headers,
                },
                consumed,
            )))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(err) => Err(ReadRequestError::Malformed(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_simple_get_head() {
        let raw = b"GET /hello HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec();
        let mut reader = RequestReader::new(std::io::Cursor::new(raw));
        let head = reader.read_head().await.unwrap().unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "/hello");
        assert_eq!(head.header("host").unwrap(), "example.com");
    }

    #[tokio::test]
    async fn clean_eof_before_any_bytes_is_none() {
        let mut reader = RequestReader::new(std::io::Cursor::new(Vec::new()));
        let head = reader.read_head().await.unwrap();
        assert!(head.is_none());
    }

    #[tokio::test]
    async fn eof_mid_head_is_unexpected() {
        let raw = b"GET /hello HTTP/1.1\r\nHost: exa".to_vec();
        let mut reader = RequestReader::new(std::io::Cursor::new(raw));
        let err = reader.read_head().await.unwrap_err();
        assert!(matches!(err, ReadRequestError::UnexpectedEof));
    }

    #[tokio::test]
    async fn body_bytes_already_buffered_are_reused() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello".to_vec();
        let mut reader = RequestReader::new(std::io::Cursor::new(raw));
        let head = reader.read_head().await.unwrap().unwrap();
        let len = head.content_length().unwrap() as usize;
        let body = reader.read_body_exact(len).await.unwrap();
        assert_eq!(&body[..], b"hello");
    }
}
