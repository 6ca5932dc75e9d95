//! Credit-based flow control.
//!
//! `BufferedAmount` counts bytes handed to the channel that the transport has
//! not written yet. Producers wait for it to fall to a low-water mark before
//! queuing more, so application-level buffering stays bounded.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct BufferedAmount {
    bytes: AtomicU64,
    drained: Notify,
}

impl BufferedAmount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn add(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::SeqCst);
    }

    /// Transport wrote `n` bytes; wake anyone waiting for credit.
    pub fn release(&self, n: u64) {
        let _ = self
            .bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(n))
            });
        self.drained.notify_waiters();
    }

    /// Suspend until at most `mark` bytes are outstanding.
    pub async fn wait_at_most(&self, mark: u64) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();
            if self.get() <= mark {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_immediately_below_mark() {
        let buffered = BufferedAmount::new();
        buffered.add(10);
        tokio::time::timeout(Duration::from_millis(50), buffered.wait_at_most(10))
            .await
            .expect("should not block at the mark");
    }

    #[tokio::test]
    async fn test_wait_resumes_after_release() {
        let buffered = Arc::new(BufferedAmount::new());
        buffered.add(1000);

        let waiter = {
            let buffered = buffered.clone();
            tokio::spawn(async move { buffered.wait_at_most(100).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "producer must stay suspended above the mark");

        buffered.release(500);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "500 outstanding is still above the mark");

        buffered.release(450);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("producer should resume")
            .unwrap();
        assert_eq!(buffered.get(), 50);
    }

    #[test]
    fn test_release_saturates_at_zero() {
        let buffered = BufferedAmount::new();
        buffered.add(5);
        buffered.release(10);
        assert_eq!(buffered.get(), 0);
    }
}
