//! Delayed send scheduling.
//!
//! Each delayed send becomes a spawned task sleeping out its delay; the
//! scheduler keeps abort handles keyed by send id so a `cancel` action
//! (or interpreter termination) can drop pending deliveries.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Default)]
pub struct SendScheduler {
    pending: Arc<Mutex<HashMap<String, AbortHandle>>>,
    settled: Arc<Notify>,
}

impl SendScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `job` after `delay`, cancellable under `id`. Scheduling a
    /// second job under the same id replaces (and aborts) the first.
    pub fn schedule<F>(&self, id: String, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let pending = Arc::clone(&self.pending);
        let settled = Arc::clone(&self.settled);
        let key = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Stay in the map until the job has run, so a pending count of
            // zero means every fired delivery is already observable.
            job.await;
            pending.lock().remove(&key);
            settled.notify_one();
        });
        if let Some(previous) = self.pending.lock().insert(id, handle.abort_handle()) {
            previous.abort();
        }
    }

    /// Cancels a pending delayed send. Unknown or already-fired ids are a
    /// no-op, and report `false`.
    pub fn cancel(&self, id: &str) -> bool {
        match self.pending.lock().remove(id) {
            Some(handle) => {
                handle.abort();
                self.settled.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Resolves once some scheduled job has finished or been cancelled
    /// since the last wait; callers re-check [`Self::pending_count`].
    pub async fn settled(&self) {
        self.settled.notified().await;
    }

    /// Aborts all pending deliveries; called when the machine terminates.
    pub fn shutdown(&self) {
        for (_, handle) in self.pending.lock().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_delayed_job_fires() {
        let scheduler = SendScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        scheduler.schedule("s1".to_string(), Duration::from_millis(50), async move {
            let _ = tx.send("fired");
        });
        assert_eq!(scheduler.pending_count(), 1);

        assert_eq!(rx.recv().await, Some("fired"));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_job() {
        let scheduler = SendScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<&str>();

        scheduler.schedule("s1".to_string(), Duration::from_secs(60), async move {
            let _ = tx.send("fired");
        });
        assert!(scheduler.cancel("s1"));
        assert!(!scheduler.cancel("s1"));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_same_id_replaces() {
        let scheduler = SendScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tx1 = tx.clone();
        scheduler.schedule("s1".to_string(), Duration::from_millis(10), async move {
            let _ = tx1.send("first");
        });
        scheduler.schedule("s1".to_string(), Duration::from_millis(20), async move {
            let _ = tx.send("second");
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rx.try_recv(), Ok("second"));
        assert!(rx.try_recv().is_err());
    }
}
