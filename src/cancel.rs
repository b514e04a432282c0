//! Cooperative Cancellation
//!
//! A request for cancellation is itself a protocol message referencing the
//! target request's id; the dispatcher trips the token associated with that
//! in-flight handler. Handlers poll the token at safe points and abort with
//! the reserved error instead of returning a partial result. Cancellation
//! is advisory only: nothing preempts a running handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use crate::protocol::RpcError;

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation token shared between the dispatcher and one
/// handler invocation. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<TokenState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token. Idempotent; wakes any `cancelled()` waiters.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::Release);
        self.state.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Poll point for handlers: returns the reserved cancellation error
    /// once the token is tripped, so the original request resolves with
    /// `"<feature> cancelled (inside <phase>)"` and never a partial result.
    pub fn checkpoint(&self, feature: &str, phase: &str) -> Result<(), RpcError> {
        if self.is_cancelled() {
            tracing::debug!("{} observed cancellation inside {}", feature, phase);
            Err(RpcError::cancelled(feature, phase))
        } else {
            Ok(())
        }
    }

    /// Wait until the token is tripped.
    pub async fn cancelled(&self) {
        let notified = self.state.notify.notified();
        tokio::pin!(notified);
        // Register interest before checking the flag so a concurrent
        // cancel() between the check and the await cannot be missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_checkpoint_passes_until_cancelled() {
        let token = CancelToken::new();
        assert!(token.checkpoint("host/sleep", "wait loop").is_ok());

        token.cancel();
        let err = token.checkpoint("host/sleep", "wait loop").unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.message, "host/sleep cancelled (inside wait loop)");
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_tripped() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(50), token.cancelled())
            .await
            .expect("already-cancelled token should not block");
    }
}
