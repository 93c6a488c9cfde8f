//! Countdown latch used by the receive side to wait for every expected delivery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Blocks waiters until it has been counted down to zero.
///
/// Counting down past zero is a no-op. Waiting never polls: waiters park on a
/// [`Notify`] that is woken once, when the count reaches zero.
#[derive(Debug)]
pub struct CountdownLatch {
    remaining: AtomicUsize,
    released: Notify,
}

impl CountdownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            released: Notify::new(),
        }
    }

    /// Decrement the count, releasing all waiters when it reaches zero.
    ///
    /// Returns the count after this call.
    pub fn count_down(&self) -> usize {
        match self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => {
                self.released.notify_waiters();
                0
            }
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }

    pub fn count(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Wait until the count reaches zero
    pub async fn wait(&self) {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and the
            // await cannot be missed.
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait until the count reaches zero or `limit` elapses.
    ///
    /// Returns `true` if the latch was released in time.
    pub async fn wait_timeout(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.wait()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn test_zero_count_is_released() {
        let latch = CountdownLatch::new(0);
        assert!(latch.wait_timeout(Duration::from_millis(10)).await);
        assert_eq!(latch.count_down(), 0);
    }

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        let latch = Arc::new(CountdownLatch::new(3));
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait_timeout(Duration::from_secs(5)).await })
        };

        for expected in [2, 1, 0] {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(latch.count_down(), expected);
        }

        assert!(waiter.await.unwrap());
        assert_eq!(latch.count(), 0);
    }

    #[tokio::test]
    async fn test_deadline_elapses() {
        let latch = CountdownLatch::new(2);
        latch.count_down();

        let started = Instant::now();
        let released = latch.wait_timeout(Duration::from_millis(100)).await;
        assert!(!released);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(latch.count(), 1);
    }

    #[test]
    fn test_count_down_saturates() {
        let latch = CountdownLatch::new(1);
        assert_eq!(latch.count_down(), 0);
        assert_eq!(latch.count_down(), 0);
        assert_eq!(latch.count(), 0);
    }
}
