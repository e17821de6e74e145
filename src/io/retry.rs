//! Would-block retry seam for TLS I/O. Spec's design note: "on a
//! would-block condition in any TLS operation, yield to the scheduler until
//! the underlying fd is ready, then retry." Under Tokio this collapses to a
//! plain `.await`, since the reactor already parks the task until the fd is
//! ready and wakes it for the retry — but the seam stays a named trait so a
//! deployment embedding this crate over a non-Tokio reactor has somewhere to
//! plug in its own wait/retry loop, mirroring `io::hijack::SocketHijacker`.

use std::future::Future;

/// Runs a fallible I/O operation, retrying internally on a would-block
/// condition until it completes or fails for another reason.
pub trait RetryingIo: Send + Sync + 'static {
    fn retrying<F, Fut, T>(&self, op: F) -> impl Future<Output = T> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send;
}

/// The default implementation: a direct pass-through, since Tokio's reactor
/// already parks the calling task on `Poll::Pending` and wakes it once the
/// fd is readable/writable again.
pub struct TokioRetryingIo;

impl RetryingIo for TokioRetryingIo {
    async fn retrying<F, Fut, T>(&self, op: F) -> T
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
    {
        op().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pass_through_returns_the_operation_result() {
        let retrying = TokioRetryingIo;
        let result = retrying.retrying(|| async { 7 }).await;
        assert_eq!(result, 7);
    }
}
