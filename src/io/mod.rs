//! Low-level I/O seams the Connect Handler is built on: buffered
//! request-line/header reading, the SNI-aware TLS acceptor, and pluggable
//! raw-socket hijacking.

pub mod hijack;
pub mod reader;
pub mod retry;
pub mod tls;

pub use hijack::SocketHijacker;
pub use reader::{ReadRequestError, RequestHead};
pub use retry::{RetryingIo, TokioRetryingIo};
pub use tls::SniAwareResolver;
