//! Cooperative cancellation for blocking proxy round-trips.
//!
//! Each logical unit owns one token/handle pair. The handle is fired exactly
//! once at teardown; every blocking protocol call races against the token so
//! that an in-flight round-trip returns promptly instead of holding the
//! worker hostage while the remote side is unresponsive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

struct Shared {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A lightweight, cloneable cancellation token.
/// Multiple recipients can observe and wait for cancellation.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    /// Check if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until the token is cancelled. Returns immediately if it already
    /// was. Safe to call from any number of tasks concurrently.
    pub async fn cancelled(&self) {
        loop {
            if self.shared.cancelled.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.shared.notify.notified();
            // Re-check after registering so a cancel between the first load
            // and `notified()` cannot be missed.
            if self.shared.cancelled.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// The handle that triggers cancellation.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    /// Trigger cancellation. Idempotent.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Check if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

/// Create a new cancellation token/handle pair.
pub fn cancel_pair() -> (CancelToken, CancelHandle) {
    let shared = Arc::new(Shared {
        cancelled: AtomicBool::new(false),
        notify: Notify::new(),
    });
    (
        CancelToken {
            shared: shared.clone(),
        },
        CancelHandle { shared },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_pair_not_cancelled() {
        let (token, handle) = cancel_pair();
        assert!(!token.is_cancelled());
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn test_cancel_sets_token() {
        let (token, handle) = cancel_pair();
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_clone_observes_cancel() {
        let (token, handle) = cancel_pair();
        let token2 = token.clone();
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(token2.is_cancelled());
    }

    #[test]
    fn test_double_cancel() {
        let (token, handle) = cancel_pair();
        handle.cancel();
        handle.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_returns_after_cancel() {
        let (token, handle) = cancel_pair();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        handle.cancel();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_already_cancelled() {
        let (token, handle) = cancel_pair();
        handle.cancel();
        token.cancelled().await;
    }

    #[tokio::test]
    async fn test_many_waiters() {
        let (token, handle) = cancel_pair();
        let mut waiters = Vec::new();
        for _ in 0..8 {
            let t = token.clone();
            waiters.push(tokio::spawn(async move { t.cancelled().await }));
        }
        handle.cancel();
        for w in waiters {
            w.await.unwrap();
        }
    }
}
