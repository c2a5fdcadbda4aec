/// Bounded background queue for cache write-backs and evictions
///
/// Under saturation the newest job is dropped and counted. Store jobs carry
/// the invalidation epoch observed when the lookup started; a `fence` bumps
/// the epoch and waits for any in-flight store, so a write-back can never
/// land after an invalidation that completed later.
use crate::error::CacheError;
use crate::metrics::CacheMetrics;
use crate::protocol::Command;
use crate::router::ReadWriteRouter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub enum WritebackJob {
    Store {
        key: String,
        commands: Vec<Command>,
        ticket: u64,
    },
    Evict {
        key: String,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct WritebackQueue {
    tx: mpsc::Sender<WritebackJob>,
    epoch: Arc<AtomicU64>,
    gate: Arc<RwLock<()>>,
    metrics: Arc<CacheMetrics>,
}

impl WritebackQueue {
    /// Start the worker. It runs until `shutdown` is cancelled or every
    /// queue handle is dropped.
    pub fn spawn(
        router: Arc<ReadWriteRouter>,
        capacity: usize,
        operation_timeout: Duration,
        metrics: Arc<CacheMetrics>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = Self {
            tx,
            epoch: Arc::new(AtomicU64::new(0)),
            gate: Arc::new(RwLock::new(())),
            metrics,
        };

        let worker = Worker {
            router,
            operation_timeout,
            epoch: Arc::clone(&queue.epoch),
            gate: Arc::clone(&queue.gate),
            metrics: Arc::clone(&queue.metrics),
        };
        let handle = tokio::spawn(worker.run(rx, shutdown));
        (queue, handle)
    }

    /// Current invalidation epoch, taken before a source lookup
    pub fn ticket(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn enqueue_store(&self, key: String, commands: Vec<Command>, ticket: u64) -> bool {
        self.try_enqueue(WritebackJob::Store { key, commands, ticket })
    }

    pub fn enqueue_evict(&self, key: String) -> bool {
        self.try_enqueue(WritebackJob::Evict { key })
    }

    fn try_enqueue(&self, job: WritebackJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.metrics.record_writeback_dropped();
                warn!("write-back queue full, dropping job");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("write-back queue closed, dropping job");
                false
            }
        }
    }

    /// Invalidate every store job issued before now and wait for an
    /// in-flight one to finish
    pub async fn fence(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        drop(self.gate.write().await);
    }

    /// Wait until every job queued so far has been processed. Returns false
    /// if the worker is gone.
    pub async fn flush(&self) -> bool {
        let (done, wait) = oneshot::channel();
        if self.tx.send(WritebackJob::Flush(done)).await.is_err() {
            return false;
        }
        wait.await.is_ok()
    }
}

struct Worker {
    router: Arc<ReadWriteRouter>,
    operation_timeout: Duration,
    epoch: Arc<AtomicU64>,
    gate: Arc<RwLock<()>>,
    metrics: Arc<CacheMetrics>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<WritebackJob>, shutdown: CancellationToken) {
        loop {
            let job = tokio::select! {
                _ = shutdown.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            self.process(job).await;
        }
        debug!("write-back worker stopped");
    }

    async fn process(&self, job: WritebackJob) {
        match job {
            WritebackJob::Store { key, commands, ticket } => {
                let _gate = self.gate.read().await;
                if ticket < self.epoch.load(Ordering::Acquire) {
                    debug!(key = %key, "skipping write-back issued before an invalidation");
                    return;
                }
                match self.router.write_batch(&commands, self.operation_timeout).await {
                    Ok(_) => self.metrics.record_writeback(),
                    Err(e) => self.failed("write-back", &key, e),
                }
            }
            WritebackJob::Evict { key } => {
                if let Err(e) = self.router.delete(&[key.as_str()], self.operation_timeout).await {
                    self.failed("eviction", &key, e);
                }
            }
            WritebackJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    fn failed(&self, what: &str, key: &str, error: CacheError) {
        self.metrics.record_error();
        match error {
            CacheError::CircuitOpen { .. } | CacheError::PoolExhausted { .. } => {
                debug!(key = %key, error = %error, "{} skipped", what)
            }
            _ => warn!(key = %key, error = %error, "{} failed", what),
        }
    }
}
