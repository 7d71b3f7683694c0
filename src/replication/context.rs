//! Request context
//!
//! Carries an optional deadline and an optional cancellation signal through
//! every replication and write operation. Cancelling a context is observed
//! both by polling (`check`) and by racing a future against it (`race`).

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use super::errors::{ReplicationError, ReplicationResult};

/// Deadline + cancellation signal
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels every context derived from it. Dropping the handle does not cancel.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context that also expires after `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
        }
    }

    /// Derive a context cancelled by an existing watch signal (e.g. shutdown)
    pub fn with_signal(&self, signal: watch::Receiver<bool>) -> Self {
        Self {
            deadline: self.deadline,
            cancel: Some(signal),
        }
    }

    /// Create a fresh cancellable context and its handle
    pub fn cancellable() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                deadline: None,
                cancel: Some(rx),
            },
            CancelHandle { tx },
        )
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once cancelled or past the deadline
    pub fn is_cancelled(&self) -> bool {
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Fail with [`ReplicationError::Cancelled`] if the context is done
    pub fn check(&self) -> ReplicationResult<()> {
        if self.is_cancelled() {
            Err(ReplicationError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    ///
    /// Never resolves for a background context.
    pub async fn done(&self) {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        let cancelled = async {
            match self.cancel.clone() {
                Some(mut rx) => loop {
                    if *rx.borrow_and_update() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        // Sender gone without cancelling
                        std::future::pending::<()>().await;
                    }
                },
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = deadline => {}
            _ = cancelled => {}
        }
    }

    /// Run `fut` unless the context finishes first; `None` means it was cut off.
    pub async fn race<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            out = fut => Some(out),
            _ = self.done() => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_never_cancels() {
        let ctx = Context::background();
        assert!(!ctx.is_cancelled());
        assert!(ctx.check().is_ok());
        assert_eq!(ctx.race(async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn test_cancel_handle() {
        let (ctx, handle) = Context::cancellable();
        let child = ctx.with_timeout(Duration::from_secs(60));
        handle.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(child.check(), Err(ReplicationError::Cancelled)));

        let out = child.race(std::future::pending::<()>()).await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_deadline_cuts_off_slow_future() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let out = ctx
            .race(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert!(out.is_none());
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_cancel() {
        let (ctx, handle) = Context::cancellable();
        drop(handle);
        assert!(!ctx.is_cancelled());
        let out = ctx
            .race(tokio::time::sleep(Duration::from_millis(5)))
            .await;
        assert!(out.is_some());
    }

    #[test]
    fn test_with_timeout_keeps_earlier_deadline() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let short = Context::background().with_timeout(Duration::from_millis(10));
            let longer = short.with_timeout(Duration::from_secs(10));
            assert_eq!(short.deadline(), longer.deadline());
        });
    }
}
