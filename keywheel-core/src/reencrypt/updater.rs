use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use keywheel_model::{ZoneId, ZonePhase};

use crate::error::{ReencryptError, Result};
use crate::namespace::{NamespaceTree, SharedNamespace};

use super::config::ReencryptConfig;
use super::handler::HandlerShared;
use super::status::ZoneStatusStore;
use super::tracker::BatchOutcome;

/// Sleep slice while the namespace journal is backlogged.
const JOURNAL_PRESSURE_SLICE: Duration = Duration::from_millis(500);

/// The updater: drains batch completions in per-zone submission order and
/// applies the re-wrapped EDEKs back into the namespace under the write
/// lock, checkpointing as it goes. The only component that mutates
/// persistent state.
pub struct ReencryptionUpdater<N: NamespaceTree> {
    namespace: SharedNamespace<N>,
    status: ZoneStatusStore,
    shared: Arc<Mutex<HandlerShared>>,
    config: ReencryptConfig,
    shutdown: CancellationToken,
}

impl<N: NamespaceTree> std::fmt::Debug for ReencryptionUpdater<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReencryptionUpdater")
            .field("config", &self.config)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<N: NamespaceTree> ReencryptionUpdater<N> {
    pub(crate) fn new(
        namespace: SharedNamespace<N>,
        status: ZoneStatusStore,
        shared: Arc<Mutex<HandlerShared>>,
        config: ReencryptConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            namespace,
            status,
            shared,
            config,
            shutdown,
        }
    }

    /// Consume the completion feed. Each entry names the zone whose tracker
    /// head completes next; draining head-first is what upholds per-zone
    /// submission order.
    pub async fn run(self: Arc<Self>, mut completions: mpsc::Receiver<ZoneId>) {
        info!(target: "reencrypt::updater", "re-encryption updater started");
        loop {
            let zone = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = completions.recv() => match next {
                    Some(zone) => zone,
                    None => break,
                },
            };
            self.process_completion(zone).await;
        }
        info!(target: "reencrypt::updater", "re-encryption updater stopped");
    }

    async fn process_completion(&self, zone: ZoneId) {
        let task = {
            let mut shared = self.shared.lock().await;
            shared
                .submissions
                .get_mut(&zone)
                .and_then(|tracker| tracker.pop_task())
        };
        let Some(task) = task else {
            // The zone was removed between submission and completion.
            warn!(
                target: "reencrypt::updater",
                zone = %zone,
                "no tracked task for completion"
            );
            return;
        };

        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            outcome = task.completion => match outcome {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(
                        target: "reencrypt::updater",
                        zone = %zone,
                        first_file =
                            task.first_file_path.as_deref().unwrap_or(""),
                        "worker dropped a batch completion"
                    );
                    self.maybe_finalize(zone).await;
                    return;
                }
            },
        };

        if let Err(err) = self.apply(outcome).await {
            error!(
                target: "reencrypt::updater",
                zone = %zone,
                error = %err,
                "failed to apply batch, marking zone failed"
            );
            let _ = self
                .status
                .update(zone, |status| status.mark_failed())
                .await;
        }
        self.maybe_finalize(zone).await;
    }

    async fn apply(&self, outcome: BatchOutcome) -> Result<()> {
        let zone = outcome.zone;
        self.yield_for_journal().await;

        let current = self.status.get(zone).await;
        let mut ns = self.namespace.write().await;

        let Some(status) = current else {
            debug!(
                target: "reencrypt::updater",
                zone = %zone,
                "zone no longer tracked, discarding batch"
            );
            return Ok(());
        };

        if ns.zone_root_path(zone).is_none() {
            warn!(
                target: "reencrypt::updater",
                zone = %zone,
                "zone deleted, discarding batch"
            );
            return Ok(());
        }

        if status.canceled || outcome.canceled {
            let failures = outcome.batch.len() as u64;
            if failures > 0 {
                self.status
                    .update(zone, |status| status.num_failures += failures)
                    .await?;
            }
            debug!(
                target: "reencrypt::updater",
                zone = %zone,
                discarded = failures,
                "discarding batch for canceled zone"
            );
            return Ok(());
        }

        let target = status.ez_key_version_name.clone();
        let mut applied: u64 = 0;
        let mut flushed: u64 = 0;
        let mut skipped: u64 = 0;
        let mut since_checkpoint = 0usize;
        let mut last_applied: Option<String> = None;

        for record in outcome.batch.records() {
            let Some(new_edek) = &record.new_edek else {
                continue;
            };
            match ns.file_encryption_info(record.inode) {
                None => {
                    // Deleted or moved since discovery.
                    skipped += 1;
                }
                Some(info) if info.ez_key_version_name == target => {
                    // Already re-wrapped; applying twice is a no-op.
                    skipped += 1;
                }
                Some(info) => {
                    ns.set_file_encryption_info(
                        record.inode,
                        info.rewrapped(new_edek),
                    )?;
                    applied += 1;
                    last_applied = Some(record.file_path());
                    since_checkpoint += 1;
                    if since_checkpoint >= self.config.updater_checkpoint_every
                    {
                        let snapshot = self
                            .status
                            .update(zone, |status| {
                                status.files_reencrypted += applied - flushed;
                                status.last_checkpoint_file =
                                    last_applied.clone();
                            })
                            .await?;
                        ns.update_zone_status(zone, &snapshot)?;
                        flushed = applied;
                        since_checkpoint = 0;
                    }
                }
            }
        }

        // A fully consumed batch moves the checkpoint past its last record,
        // even when every record failed or was skipped: those files are
        // accounted for and must not be revisited on resume.
        let final_checkpoint = outcome
            .batch
            .records()
            .last()
            .map(super::batch::EdekRecord::file_path);
        let snapshot = self
            .status
            .update(zone, |status| {
                status.files_reencrypted += applied - flushed;
                status.num_failures += outcome.failures;
                if final_checkpoint.is_some() {
                    status.last_checkpoint_file = final_checkpoint.clone();
                }
            })
            .await?;
        ns.update_zone_status(zone, &snapshot)?;

        debug!(
            target: "reencrypt::updater",
            zone = %zone,
            applied,
            skipped,
            failures = outcome.failures,
            "applied batch"
        );
        Ok(())
    }

    /// Voluntary back-off before taking the write lock while the journal is
    /// backlogged.
    async fn yield_for_journal(&self) {
        loop {
            let pressured =
                { self.namespace.read().await.journal_pressure() };
            if !pressured || self.shutdown.is_cancelled() {
                return;
            }
            debug!(
                target: "reencrypt::updater",
                "journal pressure, delaying apply"
            );
            tokio::time::sleep(JOURNAL_PRESSURE_SLICE).await;
        }
    }

    /// Once the tracker is drained after its final submission, publish the
    /// terminal status and retire the zone from the working set.
    async fn maybe_finalize(&self, zone: ZoneId) {
        {
            let mut shared = self.shared.lock().await;
            let drained = shared
                .submissions
                .get(&zone)
                .is_some_and(|tracker| {
                    tracker.submission_done() && tracker.is_empty()
                });
            if !drained {
                return;
            }
            shared.submissions.remove(&zone);
        }

        let finalized = self
            .status
            .update(zone, |status| {
                if status.canceled {
                    status.mark_canceled();
                } else if status.phase != ZonePhase::Failed {
                    status.mark_completed();
                }
            })
            .await;
        let status = match finalized {
            Ok(status) => status,
            Err(ReencryptError::NotFound(_)) => return,
            Err(err) => {
                error!(
                    target: "reencrypt::updater",
                    zone = %zone,
                    error = %err,
                    "failed to finalize zone status"
                );
                return;
            }
        };

        {
            let mut ns = self.namespace.write().await;
            if let Err(err) = ns.update_zone_status(zone, &status) {
                error!(
                    target: "reencrypt::updater",
                    zone = %zone,
                    error = %err,
                    "failed to persist final zone status"
                );
            }
        }
        let elapsed_ms = status
            .completion_time
            .map(|done| (done - status.submission_time).num_milliseconds())
            .unwrap_or_default();
        info!(
            target: "reencrypt::updater",
            zone = %zone,
            phase = %status.phase,
            files_reencrypted = status.files_reencrypted,
            failures = status.num_failures,
            elapsed_ms,
            "zone re-encryption finished"
        );
    }
}
