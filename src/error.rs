//! Error kinds for the proxy, per the error-handling design: setup,
//! protocol, transport, and inner-app failures are distinguished so
//! callers can map each to the right wire response without re-deriving it.
//! The fifth kind in that design, auth, never reaches this type: a
//! resolver's [`crate::resolver::Resolver::require_auth`] rejection is
//! handled inline by the Connect Handler / HTTP Proxy Handler as an
//! ordinary `407` response, not as a thrown error, since it isn't fatal to
//! the proxy or (for HTTP-proxy requests) even to the connection.

use proxytap_error::BoxError;

/// Classifies a failure the proxy can hit, mirroring the error kinds in
/// the error-handling design.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// CA load/generation failed, or no socket hijacker matched.
    #[error("setup error: {0}")]
    Setup(#[source] BoxError),

    /// Malformed request line, header block, or chunked framing from the client.
    #[error("protocol error: {0}")]
    Protocol(#[source] BoxError),

    /// Socket read/write or TLS failure.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    /// The inner gateway app returned an error.
    #[error("inner app error: {0}")]
    InnerApp(#[source] BoxError),
}

impl ProxyError {
    pub fn setup(err: impl Into<BoxError>) -> Self {
        Self::Setup(err.into())
    }

    pub fn protocol(err: impl Into<BoxError>) -> Self {
        Self::Protocol(err.into())
    }

    pub fn transport(err: impl Into<BoxError>) -> Self {
        Self::Transport(err.into())
    }

    pub fn inner_app(err: impl Into<BoxError>) -> Self {
        Self::InnerApp(err.into())
    }
}
