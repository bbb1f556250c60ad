use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tracing::{debug, warn};

use crate::kms::KmsClient;

use super::batch::ReencryptBatch;
use super::tracker::{BatchOutcome, TaskHandle};

struct PoolTask {
    batch: ReencryptBatch,
    cancel: CancellationToken,
    done: oneshot::Sender<BatchOutcome>,
}

type SharedQueue = Arc<Mutex<mpsc::UnboundedReceiver<PoolTask>>>;

/// Fixed-size pool executing KMS calls for submitted batches.
///
/// Tasks queue FIFO and unbounded; the coordinator's throttle is what keeps
/// the queue shallow. Workers never touch the namespace: records are owned
/// by the task while in flight and results travel back to the updater over
/// the task's oneshot.
pub struct EdekWorkerPool {
    queue_tx: mpsc::UnboundedSender<PoolTask>,
    queued: Arc<AtomicUsize>,
    kms: Arc<dyn KmsClient>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for EdekWorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdekWorkerPool")
            .field("queued", &self.queued.load(Ordering::Relaxed))
            .field(
                "workers",
                &self.workers.lock().map(|w| w.len()).unwrap_or_default(),
            )
            .finish()
    }
}

impl EdekWorkerPool {
    pub fn new(
        kms: Arc<dyn KmsClient>,
        threads: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let queue_rx: SharedQueue = Arc::new(Mutex::new(queue_rx));
        let queued = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let queue_rx = Arc::clone(&queue_rx);
            let queued = Arc::clone(&queued);
            let kms = Arc::clone(&kms);
            let shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let task = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        task = Self::next_task(&queue_rx) => match task {
                            Some(task) => task,
                            None => break,
                        },
                    };
                    queued.fetch_sub(1, Ordering::Relaxed);
                    Self::execute(&kms, task).await;
                }
                debug!(target: "reencrypt::pool", worker = i, "worker exiting");
            }));
        }

        Self {
            queue_tx,
            queued,
            kms,
            workers: std::sync::Mutex::new(workers),
        }
    }

    async fn next_task(queue_rx: &SharedQueue) -> Option<PoolTask> {
        queue_rx.lock().await.recv().await
    }

    /// Tasks waiting in the queue, not counting ones a worker has picked up.
    pub fn queued_len(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// Submit a batch; the returned handle goes onto the zone's tracker.
    ///
    /// If the pool has already shut down the task runs inline on the caller
    /// instead of being dropped, so every submission still produces exactly
    /// one outcome.
    pub async fn submit(&self, batch: ReencryptBatch) -> TaskHandle {
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let handle = TaskHandle::new(
            batch.first_file_path(),
            done_rx,
            cancel.clone(),
        );
        let task = PoolTask {
            batch,
            cancel,
            done: done_tx,
        };
        self.queued.fetch_add(1, Ordering::Relaxed);
        if let Err(rejected) = self.queue_tx.send(task) {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            warn!(
                target: "reencrypt::pool",
                "pool queue closed, running task on the caller"
            );
            Self::execute(&self.kms, rejected.0).await;
        }
        handle
    }

    async fn execute(kms: &Arc<dyn KmsClient>, task: PoolTask) {
        let PoolTask {
            mut batch,
            cancel,
            done,
        } = task;

        let outcome = if cancel.is_cancelled() {
            debug!(
                target: "reencrypt::pool",
                zone = %batch.zone(),
                first_file = batch.first_file_path().as_deref().unwrap_or(""),
                "skipping canceled batch"
            );
            BatchOutcome::canceled(batch)
        } else if batch.is_empty() {
            // Zero-file task; exists so empty zones still reach the updater.
            BatchOutcome::success(batch)
        } else {
            let edeks = batch
                .records()
                .iter()
                .map(|record| record.existing.encrypted_key_version())
                .collect::<Vec<_>>();
            match kms.reencrypt_encrypted_keys(edeks).await {
                Ok(rewrapped) if rewrapped.len() == batch.len() => {
                    for (record, key) in
                        batch.records_mut().iter_mut().zip(rewrapped)
                    {
                        record.new_edek = Some(key);
                    }
                    BatchOutcome::success(batch)
                }
                Ok(rewrapped) => {
                    warn!(
                        target: "reencrypt::pool",
                        zone = %batch.zone(),
                        expected = batch.len(),
                        got = rewrapped.len(),
                        "KMS returned a short batch, counting all entries failed"
                    );
                    BatchOutcome::failed(batch)
                }
                Err(err) => {
                    warn!(
                        target: "reencrypt::pool",
                        zone = %batch.zone(),
                        first_file =
                            batch.first_file_path().as_deref().unwrap_or(""),
                        error = %err,
                        "KMS re-encryption failed for batch"
                    );
                    BatchOutcome::failed(batch)
                }
            }
        };

        // The updater may already be gone during shutdown.
        let _ = done.send(outcome);
    }

    /// Await worker exit after the shutdown token has fired.
    pub async fn join(&self) {
        let handles = {
            let mut guard =
                self.workers.lock().expect("worker handle mutex poisoned");
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}
