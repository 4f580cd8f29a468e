//! Per-swap ordered work queue
//!
//! Work submitted under one key runs one item at a time in submission order;
//! different keys run in parallel. A worker task exists only while its key
//! has queued work.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::error;

type Work = BoxFuture<'static, ()>;

// `Mutex` makes the queued (Send-only) futures Sync so the shared map is Send.
type Slot = Mutex<Work>;

#[derive(Clone, Default)]
pub struct SwapQueue {
    queues: Arc<DashMap<String, VecDeque<Slot>>>,
}

impl SwapQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `work` behind everything already submitted for `key`.
    ///
    /// The work runs even if the receiver is dropped.
    pub fn submit<F, T>(&self, key: &str, work: F) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Work = Box::pin(async move {
            let _ = tx.send(work.await);
        });

        let start_worker = match self.queues.entry(key.to_string()) {
            Entry::Occupied(mut queue) => {
                queue.get_mut().push_back(Mutex::new(job));
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::from([Mutex::new(job)]));
                true
            }
        };

        if start_worker {
            tokio::spawn(self.clone().drain(key.to_string()));
        }
        rx
    }

    /// Keys with queued or running work
    pub fn active(&self) -> usize {
        self.queues.len()
    }

    async fn drain(self, key: String) {
        loop {
            // The entry stays in the map while a job runs so new submissions
            // queue behind it instead of starting a second worker.
            let job = match self.queues.entry(key.clone()) {
                Entry::Occupied(mut queue) => match queue.get_mut().pop_front() {
                    Some(job) => job.into_inner().unwrap_or_else(|e| e.into_inner()),
                    None => {
                        queue.remove();
                        return;
                    }
                },
                Entry::Vacant(_) => return,
            };

            if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                error!("Work for swap {} panicked", key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_work_for_one_key_runs_in_order() {
        let queue = SwapQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut receivers = Vec::new();
        for i in 0..5u64 {
            let log = log.clone();
            receivers.push(queue.submit("swap-1", async move {
                // Earlier items sleep longer; order must still hold
                tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                log.lock().unwrap().push(i);
                i
            }));
        }

        for (i, rx) in receivers.into_iter().enumerate() {
            assert_eq!(rx.await.unwrap(), i as u64);
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_different_keys_run_concurrently() {
        let queue = SwapQueue::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // Blocks until released by the other key's work
        let blocked = queue.submit("a", async move {
            release_rx.await.unwrap();
            "a"
        });
        let releaser = queue.submit("b", async move {
            release_tx.send(()).unwrap();
            "b"
        });

        let result = tokio::time::timeout(Duration::from_secs(1), async {
            (blocked.await.unwrap(), releaser.await.unwrap())
        })
        .await
        .unwrap();
        assert_eq!(result, ("a", "b"));
    }

    #[tokio::test]
    async fn test_worker_exits_when_idle_and_survives_panics() {
        let queue = SwapQueue::new();

        let panicked = queue.submit("s", async {
            if true {
                panic!("boom");
            }
            1
        });
        let after = queue.submit("s", async { 2 });

        assert!(panicked.await.is_err());
        assert_eq!(after.await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.active(), 0);
    }
}
