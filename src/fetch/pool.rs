//! Fixed-size set of download workers draining a [`FetchQueue`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::fetch::http::Fetch;
use crate::fetch::progress::Completion;
use crate::fetch::queue::FetchQueue;

/// Cooperative cancellation shared by every worker.
///
/// Workers look at it before taking a task; a transfer that has started
/// always runs to completion.
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`Self::cancel`] has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Running workers. Dropping the pool does not stop them; call
/// [`FetchWorkerPool::join`] to wait until every worker has exited.
pub struct FetchWorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl FetchWorkerPool {
    /// Spawn `workers` tasks that drain `queue` until it is closed and empty
    /// or `cancel` is raised.
    pub fn start<F>(
        workers: usize,
        queue: Arc<FetchQueue>,
        fetcher: Arc<F>,
        events: mpsc::UnboundedSender<Completion>,
        cancel: Arc<CancelFlag>,
    ) -> Self
    where
        F: Fetch + 'static,
    {
        let workers = (0..workers.max(1))
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    queue.clone(),
                    fetcher.clone(),
                    events.clone(),
                    cancel.clone(),
                ))
            })
            .collect();
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait until every worker has exited. Returns how many panicked.
    pub async fn join(self) -> usize {
        let mut panicked = 0;
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!("fetch worker aborted: {e}");
                panicked += 1;
            }
        }
        panicked
    }
}

async fn worker_loop<F: Fetch>(
    id: usize,
    queue: Arc<FetchQueue>,
    fetcher: Arc<F>,
    events: mpsc::UnboundedSender<Completion>,
    cancel: Arc<CancelFlag>,
) {
    loop {
        if cancel.is_cancelled() {
            info!("fetch worker #{id} cancelled");
            break;
        }
        let task = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("fetch worker #{id} cancelled");
                break;
            }
            task = queue.dequeue() => task,
        };
        let Some(task) = task else {
            break;
        };

        debug!(worker = id, url = %task.source_url, "fetching");
        let outcome = fetcher.fetch(&task).await;
        // A closed channel only means nobody is reporting; the download stands.
        let _ = events.send(Completion {
            url: task.source_url,
            outcome,
        });
    }
    debug!("fetch worker #{id} exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::progress::{FetchOutcome, ProgressCounters};
    use crate::fetch::queue::FetchTask;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct SlowFetcher {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Fetch for SlowFetcher {
        async fn fetch(&self, _task: &FetchTask) -> FetchOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            FetchOutcome::Downloaded { bytes: 1 }
        }
    }

    fn fetcher(delay_ms: u64) -> Arc<SlowFetcher> {
        Arc::new(SlowFetcher {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(delay_ms),
        })
    }

    #[tokio::test]
    async fn drains_queue_and_reports_monotonic_progress() {
        let queue = Arc::new(FetchQueue::new(4));
        let fetcher = fetcher(5);
        let cancel = Arc::new(CancelFlag::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let total = 25;
        let reporter = tokio::spawn(async move {
            let mut seen = Vec::new();
            let counters = ProgressCounters::new(total)
                .run(rx, |update| seen.push(update.completed))
                .await;
            (counters, seen)
        });

        let pool = FetchWorkerPool::start(3, queue.clone(), fetcher.clone(), tx, cancel);
        for n in 0..total {
            queue
                .enqueue(FetchTask::new(format!("https://example.org/{n}.iso"), "/tmp"))
                .await
                .unwrap();
        }
        queue.close();
        assert_eq!(pool.join().await, 0);

        let (counters, seen) = reporter.await.unwrap();
        assert_eq!(counters.completed, total);
        assert_eq!(seen, (1..=total).collect::<Vec<_>>());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), total);
    }

    #[tokio::test]
    async fn cancellation_lets_in_flight_tasks_finish() {
        let queue = Arc::new(FetchQueue::new(16));
        for n in 0..10 {
            queue
                .try_enqueue(FetchTask::new(format!("https://example.org/{n}.iso"), "/tmp"))
                .unwrap();
        }
        queue.close();

        let fetcher = fetcher(100);
        let cancel = Arc::new(CancelFlag::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = FetchWorkerPool::start(2, queue.clone(), fetcher.clone(), tx, cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        pool.join().await;

        let started = fetcher.calls.load(Ordering::SeqCst);
        let mut finished = 0;
        while rx.recv().await.is_some() {
            finished += 1;
        }
        assert_eq!(started, 2);
        assert_eq!(finished, started);
        assert_eq!(queue.len(), 8);
    }

    #[tokio::test]
    async fn idle_workers_exit_on_cancel() {
        let queue = Arc::new(FetchQueue::new(1));
        let cancel = Arc::new(CancelFlag::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = FetchWorkerPool::start(4, queue, fetcher(0), tx, cancel.clone());
        assert_eq!(pool.len(), 4);

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), pool.join())
            .await
            .unwrap();
    }
}
