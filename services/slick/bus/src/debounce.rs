//! Trailing-edge debounce over tokio tasks

use parking_lot::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// Coalesces bursts of calls into one invocation after a quiet period.
///
/// A zero delay defers the call to the next scheduler tick so the caller's
/// synchronous work completes first.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    /// Create a debouncer with the given quiet period
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    /// Schedule `f`, cancelling any invocation that has not run yet
    pub fn call<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let delay = self.delay;
        let task = tokio::spawn(async move {
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            f();
        });

        if let Some(previous) = self.pending.lock().replace(task) {
            if !previous.is_finished() {
                trace!("Debounced call superseded");
            }
            previous.abort();
        }
    }

    /// Drop the pending invocation, if any
    pub fn cancel(&self) {
        if let Some(task) = self.pending.lock().take() {
            task.abort();
        }
    }

    /// Whether an invocation is scheduled and has not completed
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_last_call() {
        let debouncer = Debouncer::new(Duration::from_secs(5));
        let last = Arc::new(AtomicU32::new(0));
        let calls = Arc::new(AtomicU32::new(0));

        for i in 1..=3 {
            let last = last.clone();
            let calls = calls.clone();
            debouncer.call(move || {
                last.store(i, Ordering::SeqCst);
                calls.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        assert!(debouncer.is_pending());
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 3);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test]
    async fn test_zero_delay_runs_after_current_work() {
        let debouncer = Debouncer::new(Duration::ZERO);
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        debouncer.call(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let debouncer = Debouncer::new(Duration::from_millis(100));
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        debouncer.call(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        debouncer.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
