// Run-wide cancellation signal

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Observer side of the cancellation signal, cloned into every worker
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Token that never fires (tests, one-off operations)
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation fires (immediately if it already has)
    pub async fn cancelled(&mut self) {
        if self.is_cancelled() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
        // Sender dropped without firing: never resolve
        std::future::pending::<()>().await;
    }

    /// Drive `fut` unless cancellation fires first; `None` when cancelled
    pub async fn run_until_cancelled<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let mut token = self.clone();
        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            out = fut => Some(out),
        }
    }
}

/// Firing side of the cancellation signal
#[derive(Clone)]
pub struct CancelSender {
    tx: watch::Sender<bool>,
}

impl CancelSender {
    /// Signal cancellation to every token (idempotent)
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Fire after `after` elapses (run-level deadline)
    pub fn cancel_after(&self, after: Duration) -> tokio::task::JoinHandle<()> {
        let sender = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            tracing::warn!(after_secs = after.as_secs(), "Run deadline reached, cancelling");
            sender.cancel();
        })
    }
}

/// Create a cancellation channel
pub fn cancel_channel() -> (CancelSender, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelSender { tx }, CancelToken { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let (sender, token) = cancel_channel();
        let mut waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        sender.cancel();
        handle.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_until_cancelled_returns_value() {
        let (_sender, token) = cancel_channel();
        assert_eq!(token.run_until_cancelled(async { 7 }).await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_cancelled_aborts_pending_work() {
        let (sender, token) = cancel_channel();
        sender.cancel_after(Duration::from_secs(1));
        let out = token
            .run_until_cancelled(tokio::time::sleep(Duration::from_secs(3600)))
            .await;
        assert!(out.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_token_does_not_fire() {
        let token = CancelToken::never();
        let out = tokio::time::timeout(Duration::from_secs(5), token.clone().cancelled()).await;
        assert!(out.is_err());
        assert!(!token.is_cancelled());
    }
}
