use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use keywheel_model::{InodeId, ZoneId, ZoneStatus};

use crate::error::{ReencryptError, Result};
use crate::kms::KmsClient;
use crate::namespace::{NamespaceTree, SharedNamespace};

use super::config::ReencryptConfig;
use super::handler::{HandlerShared, ReencryptionHandler};
use super::pool::EdekWorkerPool;
use super::status::ZoneStatusStore;
use super::updater::ReencryptionUpdater;

/// Depth of the coordinator → updater completion feed. Bounded so a slow
/// updater back-pressures submission on top of the explicit throttle.
const COMPLETION_FEED_DEPTH: usize = 64;

/// Owns the coordinator, updater, and worker pool for one namespace, and
/// exposes the inbound re-encryption operations.
pub struct ReencryptRuntime<N: NamespaceTree + 'static> {
    namespace: SharedNamespace<N>,
    kms: Arc<dyn KmsClient>,
    config: ReencryptConfig,
    status: ZoneStatusStore,
    handler: Arc<ReencryptionHandler<N>>,
    updater: Arc<ReencryptionUpdater<N>>,
    pool: Arc<EdekWorkerPool>,
    completions_rx: std::sync::Mutex<Option<mpsc::Receiver<ZoneId>>>,
    shutdown: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<N: NamespaceTree + 'static> std::fmt::Debug for ReencryptRuntime<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReencryptRuntime")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<N: NamespaceTree + 'static> ReencryptRuntime<N> {
    /// Wire up the subsystem. Must run inside a Tokio runtime: the worker
    /// pool spawns its tasks eagerly.
    pub fn new(
        namespace: SharedNamespace<N>,
        kms: Arc<dyn KmsClient>,
        config: ReencryptConfig,
    ) -> Result<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let status = ZoneStatusStore::new();
        let shared = Arc::new(Mutex::new(HandlerShared::default()));
        let pool = Arc::new(EdekWorkerPool::new(
            Arc::clone(&kms),
            config.edek_threads,
            shutdown.child_token(),
        ));
        let (completions_tx, completions_rx) =
            mpsc::channel(COMPLETION_FEED_DEPTH);

        let handler = Arc::new(ReencryptionHandler::new(
            Arc::clone(&namespace),
            Arc::clone(&pool),
            status.clone(),
            config.clone(),
            Arc::clone(&shared),
            completions_tx,
            shutdown.child_token(),
        ));
        let updater = Arc::new(ReencryptionUpdater::new(
            Arc::clone(&namespace),
            status.clone(),
            shared,
            config.clone(),
            shutdown.child_token(),
        ));

        Ok(Self {
            namespace,
            kms,
            config,
            status,
            handler,
            updater,
            pool,
            completions_rx: std::sync::Mutex::new(Some(completions_rx)),
            shutdown,
            worker_handles: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &ReencryptConfig {
        &self.config
    }

    /// Coordinator handle, mainly for the testing pause hooks.
    pub fn handler(&self) -> Arc<ReencryptionHandler<N>> {
        Arc::clone(&self.handler)
    }

    /// Recover persisted zone statuses and spawn the coordinator and
    /// updater tasks.
    pub async fn start(&self) -> Result<()> {
        let completions_rx = self
            .completions_rx
            .lock()
            .expect("completion feed mutex poisoned")
            .take()
            .ok_or_else(|| {
                ReencryptError::Internal(
                    "runtime already started".to_string(),
                )
            })?;

        let recovered = self.recover_zones().await;

        let mut handles = self.worker_handles.lock().await;
        handles.push(tokio::spawn(Arc::clone(&self.handler).run()));
        handles
            .push(tokio::spawn(Arc::clone(&self.updater).run(completions_rx)));

        if recovered > 0 {
            self.handler.notify_new_submission();
        }
        info!(
            target: "reencrypt::runtime",
            recovered,
            "re-encryption runtime started"
        );
        Ok(())
    }

    /// Reload every persisted status; zones interrupted mid-run resume from
    /// their last checkpoint.
    async fn recover_zones(&self) -> usize {
        let persisted: Vec<(ZoneId, ZoneStatus)> =
            { self.namespace.read().await.reencryption_statuses() };
        let mut live = 0;
        for (zone, status) in persisted {
            if !status.is_terminal() {
                info!(
                    target: "reencrypt::runtime",
                    zone = %zone,
                    resume_from = status
                        .last_checkpoint_file
                        .as_deref()
                        .unwrap_or("<zone root>"),
                    "recovering interrupted zone re-encryption"
                );
                live += 1;
            }
            self.status.restore(zone, status).await;
        }
        live
    }

    /// Queue a zone for re-encryption to `key_version`. Submitting a zone
    /// that is already active is an idempotent no-op.
    pub async fn submit(&self, zone: ZoneId, key_version: &str) -> Result<()> {
        let key_name = {
            let ns = self.namespace.read().await;
            ns.check_safe_mode()?;
            if !ns.is_encryption_zone_root(InodeId::from(zone)) {
                return Err(ReencryptError::NotFound(format!(
                    "inode {zone} is not an encryption zone root"
                )));
            }
            ns.ez_key_name(zone).ok_or_else(|| {
                ReencryptError::Internal(format!(
                    "zone {zone} has no key name"
                ))
            })?
        };

        let Some(status) = self.status.submit(zone, key_version).await else {
            info!(
                target: "reencrypt::runtime",
                zone = %zone,
                "zone already under re-encryption, ignoring resubmission"
            );
            return Ok(());
        };

        {
            let mut ns = self.namespace.write().await;
            ns.update_zone_status(zone, &status)?;
        }

        // Stale cached EDEKs would be wrapped under the old key version.
        if let Err(err) = self.kms.drain_encrypted_keys(&key_name).await {
            warn!(
                target: "reencrypt::runtime",
                zone = %zone,
                key = %key_name,
                error = %err,
                "failed to drain cached EDEKs"
            );
        }

        self.handler.notify_new_submission();
        info!(
            target: "reencrypt::runtime",
            zone = %zone,
            key_version,
            "zone submitted for re-encryption"
        );
        Ok(())
    }

    pub async fn cancel(&self, zone: ZoneId) -> Result<()> {
        self.handler.cancel_zone(zone).await
    }

    pub async fn remove(&self, zone: ZoneId) -> Result<()> {
        self.handler.remove_zone(zone).await
    }

    /// Status of every tracked zone, ordered by zone id.
    pub async fn list_status(&self) -> Vec<(ZoneId, ZoneStatus)> {
        self.status.list().await
    }

    /// Stop the coordinator and updater, cancel queued tasks, and wait for
    /// everything to wind down. In-flight KMS calls complete or fail as the
    /// client dictates.
    pub async fn shutdown(&self) {
        info!(target: "reencrypt::runtime", "shutting down re-encryption runtime");
        self.shutdown.cancel();
        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        futures::future::join_all(handles).await;
        self.pool.join().await;
        info!(target: "reencrypt::runtime", "re-encryption runtime stopped");
    }
}
