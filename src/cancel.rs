//! Cooperative cancellation for in-flight generations.

use async_channel::{Receiver, Sender};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cloneable stop signal. Cancelling closes the internal channel, which
/// wakes every task waiting in [`CancellationToken::cancelled`].
#[derive(Debug, Clone)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::bounded(1);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            tx,
            rx,
        }
    }

    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            tracing::debug!("Cancellation requested");
            self.tx.close();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        // Nothing is ever sent, so recv only returns once the channel closes.
        let _ = self.rx.recv().await;
    }

    /// Runs `fut` until it completes or the token is cancelled.
    /// Returns `None` when cancelled; the future is dropped at its current
    /// suspension point.
    pub async fn run_until_cancelled<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        if self.is_cancelled() {
            return None;
        }
        smol::future::or(async { Some(fut.await) }, async {
            self.cancelled().await;
            None
        })
        .await
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_run_until_cancelled_completes() {
        let token = CancellationToken::new();
        let out = smol::block_on(token.run_until_cancelled(async { 7 }));
        assert_eq!(out, Some(7));
    }

    #[test]
    fn test_cancel_interrupts_pending_future() {
        smol::block_on(async {
            let token = CancellationToken::new();
            let canceller = token.clone();
            smol::spawn(async move {
                smol::Timer::after(Duration::from_millis(20)).await;
                canceller.cancel();
            })
            .detach();

            let out = token
                .run_until_cancelled(async {
                    smol::Timer::after(Duration::from_secs(30)).await;
                    1
                })
                .await;
            assert_eq!(out, None);
            assert!(token.is_cancelled());
        });
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(smol::block_on(token.run_until_cancelled(async { 1 })), None);
    }
}
