use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use keywheel_model::{InodeId, ZoneId, ZonePhase, ZoneStatus};

use crate::error::{ReencryptError, Result};
use crate::namespace::{
    ChildKind, NamespaceTree, SharedNamespace, join_path, next_child_index,
};

use super::batch::{EdekRecord, ReencryptBatch};
use super::config::ReencryptConfig;
use super::pool::EdekWorkerPool;
use super::status::ZoneStatusStore;
use super::throttle::ThrottleGate;
use super::tracker::ZoneSubmissionTracker;

/// Sleep slice while the pool queue is saturated.
const POOL_SATURATION_SLICE: Duration = Duration::from_millis(100);
/// Sleep slice while the updater backlog is over its watermark.
const BACKLOG_SLICE: Duration = Duration::from_millis(500);

/// State behind the single handler mutex: the per-zone trackers and the
/// pause hooks. Shared with the updater, which drains tracker heads.
#[derive(Debug, Default)]
pub(crate) struct HandlerShared {
    pub(crate) submissions: HashMap<ZoneId, ZoneSubmissionTracker>,
    paused: bool,
    pause_after_submissions: Option<u64>,
}

impl HandlerShared {
    fn outstanding_tasks(&self) -> usize {
        self.submissions.values().map(ZoneSubmissionTracker::len).sum()
    }

    /// Count one submission against a pending `pause_after_nth_submission`
    /// request; returns true when this submission armed the pause.
    fn note_submission(&mut self) -> bool {
        match self.pause_after_submissions.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    self.pause_after_submissions = None;
                    self.paused = true;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }
}

enum Stride {
    /// The accumulating batch reached the configured size.
    BatchReady,
    /// The walk popped past the zone root; nothing left to discover.
    Finished,
}

#[derive(Debug)]
struct DirFrame {
    path: String,
    inode: InodeId,
    /// Last child name fully handled in this directory; listing resumes
    /// strictly after it.
    cursor: Option<String>,
}

impl DirFrame {
    fn local_name(&self) -> String {
        self.path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

/// Depth-first walk position: one frame per depth from the zone root down
/// to the directory currently being listed. Holding cursors instead of
/// directory snapshots keeps memory bounded and survives lock gaps.
#[derive(Debug)]
struct WalkState {
    zone: ZoneId,
    target_key_version: String,
    stack: Vec<DirFrame>,
    /// Set after every lock gap; the next stride must re-resolve the stack
    /// before trusting its inode ids.
    needs_reresolve: bool,
}

impl WalkState {
    fn new(zone: ZoneId, target_key_version: String, root_path: String) -> Self {
        Self {
            zone,
            target_key_version,
            stack: vec![DirFrame {
                path: root_path,
                inode: zone.into(),
                cursor: None,
            }],
            needs_reresolve: false,
        }
    }

    /// Rebuild the stack for a checkpointed file path. Directory components
    /// that no longer resolve truncate the stack, leaving the cursor at the
    /// vanished name so traversal continues from the next sibling of the
    /// lowest surviving ancestor.
    fn restore_from_checkpoint<N: NamespaceTree>(
        &mut self,
        ns: &N,
        checkpoint: &str,
    ) {
        let root_path = self.stack[0].path.clone();
        let Some(relative) = checkpoint.strip_prefix(root_path.as_str()) else {
            warn!(
                target: "reencrypt::handler",
                zone = %self.zone,
                checkpoint,
                "checkpoint is outside the zone root, restarting from scratch"
            );
            return;
        };
        let components: Vec<&str> =
            relative.split('/').filter(|c| !c.is_empty()).collect();
        let Some((file_name, dirs)) = components.split_last() else {
            return;
        };

        for name in dirs {
            let parent = self.stack.last().expect("stack starts non-empty");
            match ns.lookup(parent.inode, name) {
                Some(entry)
                    if matches!(
                        entry.kind,
                        ChildKind::Directory { ez_root: false }
                    ) =>
                {
                    let path = join_path(&parent.path, name);
                    self.stack.push(DirFrame {
                        path,
                        inode: entry.inode,
                        cursor: None,
                    });
                }
                _ => {
                    debug!(
                        target: "reencrypt::handler",
                        zone = %self.zone,
                        missing = name,
                        "checkpoint ancestor vanished, resuming from its next sibling"
                    );
                    self.stack
                        .last_mut()
                        .expect("stack starts non-empty")
                        .cursor = Some((*name).to_string());
                    return;
                }
            }
        }
        self.stack
            .last_mut()
            .expect("stack starts non-empty")
            .cursor = Some((*file_name).to_string());
    }

    /// Re-anchor the stack after a lock gap. Each frame below the root must
    /// still resolve to the same directory inode; at the first mismatch the
    /// stack truncates and that subtree is treated as exhausted.
    fn reresolve<N: NamespaceTree>(&mut self, ns: &N) {
        let mut depth = 1;
        while depth < self.stack.len() {
            let parent_inode = self.stack[depth - 1].inode;
            let name = self.stack[depth].local_name();
            let survives = matches!(
                ns.lookup(parent_inode, &name),
                Some(entry)
                    if entry.inode == self.stack[depth].inode
                        && matches!(
                            entry.kind,
                            ChildKind::Directory { ez_root: false }
                        )
            );
            if survives {
                depth += 1;
            } else {
                debug!(
                    target: "reencrypt::handler",
                    zone = %self.zone,
                    subtree = %self.stack[depth].path,
                    "directory vanished during lock gap, abandoning subtree"
                );
                self.stack.truncate(depth);
                self.stack[depth - 1].cursor = Some(name);
                break;
            }
        }
        self.needs_reresolve = false;
    }

    /// Advance the walk until the batch fills or the zone is exhausted.
    /// Runs entirely under one read guard.
    fn stride<N: NamespaceTree>(
        &mut self,
        ns: &N,
        batch: &mut ReencryptBatch,
        batch_size: usize,
    ) -> Result<Stride> {
        loop {
            let (frame_path, frame_inode, frame_cursor) = {
                let Some(frame) = self.stack.last() else {
                    return Ok(Stride::Finished);
                };
                (frame.path.clone(), frame.inode, frame.cursor.clone())
            };

            let children = match ns.list_children(frame_inode) {
                Ok(children) => children,
                Err(ReencryptError::NotFound(_)) => {
                    self.pop_frame();
                    continue;
                }
                Err(err) => return Err(err),
            };

            let start = next_child_index(&children, frame_cursor.as_deref());
            let mut descended = false;
            for child in children.into_iter().skip(start) {
                match child.kind {
                    ChildKind::File {
                        encryption: Some(info),
                    } if info.ez_key_version_name
                        != self.target_key_version =>
                    {
                        batch.push(EdekRecord::new(
                            child.inode,
                            frame_path.clone(),
                            child.name.clone(),
                            info,
                        ));
                        self.set_cursor(child.name);
                        if batch.len() >= batch_size {
                            return Ok(Stride::BatchReady);
                        }
                    }
                    ChildKind::File {
                        encryption: Some(_),
                    } => {
                        // Already wrapped under the target version.
                        self.set_cursor(child.name);
                    }
                    ChildKind::File { encryption: None } => {
                        warn!(
                            target: "reencrypt::handler",
                            zone = %self.zone,
                            file = %join_path(&frame_path, &child.name),
                            "file has no encryption metadata, skipping"
                        );
                        self.set_cursor(child.name);
                    }
                    ChildKind::Directory { ez_root: true } => {
                        debug!(
                            target: "reencrypt::handler",
                            zone = %self.zone,
                            nested = %join_path(&frame_path, &child.name),
                            "skipping nested encryption zone"
                        );
                        self.set_cursor(child.name);
                    }
                    ChildKind::Directory { ez_root: false } => {
                        // Parent cursor advances when this frame pops.
                        self.stack.push(DirFrame {
                            path: join_path(&frame_path, &child.name),
                            inode: child.inode,
                            cursor: None,
                        });
                        descended = true;
                        break;
                    }
                }
            }
            if descended {
                continue;
            }
            if !self.pop_frame() {
                return Ok(Stride::Finished);
            }
        }
    }

    fn set_cursor(&mut self, name: String) {
        self.stack
            .last_mut()
            .expect("cursor set while a frame is current")
            .cursor = Some(name);
    }

    /// Pop the deepest frame, carrying its name into the parent's cursor.
    /// Returns false once the zone root itself popped.
    fn pop_frame(&mut self) -> bool {
        let Some(frame) = self.stack.pop() else {
            return false;
        };
        match self.stack.last_mut() {
            Some(parent) => {
                parent.cursor = Some(frame.local_name());
                true
            }
            None => false,
        }
    }
}

/// The coordinator: picks zones off the status store, walks them under the
/// read lock, and feeds bounded batches to the worker pool while staying a
/// polite reader.
pub struct ReencryptionHandler<N: NamespaceTree> {
    namespace: SharedNamespace<N>,
    pool: Arc<EdekWorkerPool>,
    status: ZoneStatusStore,
    config: ReencryptConfig,
    shared: Arc<Mutex<HandlerShared>>,
    /// Inter-zone wake; `submit` stores a permit here.
    wake: Notify,
    /// Signalled by `resume_for_testing`.
    pause_wake: Notify,
    /// One entry per submitted task, in global submission order; the
    /// updater pops the named zone's tracker head per entry.
    completions: mpsc::Sender<ZoneId>,
    shutdown: CancellationToken,
}

impl<N: NamespaceTree> std::fmt::Debug for ReencryptionHandler<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReencryptionHandler")
            .field("config", &self.config)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<N: NamespaceTree> ReencryptionHandler<N> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        namespace: SharedNamespace<N>,
        pool: Arc<EdekWorkerPool>,
        status: ZoneStatusStore,
        config: ReencryptConfig,
        shared: Arc<Mutex<HandlerShared>>,
        completions: mpsc::Sender<ZoneId>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            namespace,
            pool,
            status,
            config,
            shared,
            wake: Notify::new(),
            pause_wake: Notify::new(),
            completions,
            shutdown,
        }
    }

    /// Wake the inter-zone wait early; called on every new submission.
    pub fn notify_new_submission(&self) {
        self.wake.notify_one();
    }

    /// Mark a zone canceled and cancel its outstanding tasks. In-flight
    /// batches complete but the updater discards their results.
    pub async fn cancel_zone(&self, zone: ZoneId) -> Result<()> {
        let Some(current) = self.status.get(zone).await else {
            return Err(ReencryptError::NotFound(format!(
                "zone {zone} is not under re-encryption"
            )));
        };
        if current.is_terminal() {
            return Err(ReencryptError::NotFound(format!(
                "zone {zone} re-encryption already finished"
            )));
        }

        let in_flight = {
            let shared = self.shared.lock().await;
            match shared.submissions.get(&zone) {
                Some(tracker) => {
                    tracker.cancel_all();
                    true
                }
                None => false,
            }
        };

        if in_flight || current.phase == ZonePhase::Processing {
            // Sticky flag; the coordinator aborts between batches and the
            // updater finalises the zone as canceled.
            self.status.update(zone, |status| status.canceled = true).await?;
        } else {
            // Never picked up; finalise directly.
            let status = self
                .status
                .update(zone, |status| status.mark_canceled())
                .await?;
            self.status.unqueue(zone).await;
            let mut ns = self.namespace.write().await;
            ns.update_zone_status(zone, &status)?;
        }
        info!(target: "reencrypt::handler", zone = %zone, "zone re-encryption canceled");
        Ok(())
    }

    /// Cancel any in-flight work and drop the zone from the working set.
    pub async fn remove_zone(&self, zone: ZoneId) -> Result<()> {
        {
            let mut shared = self.shared.lock().await;
            if let Some(tracker) = shared.submissions.remove(&zone) {
                tracker.cancel_all();
            }
        }
        self.status.remove(zone).await?;
        info!(target: "reencrypt::handler", zone = %zone, "zone removed from re-encryption");
        Ok(())
    }

    /// Submit a zero-file task so a zone with no eligible files still flows
    /// through the updater and finalises.
    pub async fn add_dummy_tracker(&self, zone: ZoneId) -> Result<()> {
        self.finish_zone_submission(zone, ReencryptBatch::new(zone)).await
    }

    /// Halt the coordinator before its next namespace re-entry.
    pub async fn pause_for_testing(&self) {
        self.shared.lock().await.paused = true;
    }

    pub async fn resume_for_testing(&self) {
        {
            let mut shared = self.shared.lock().await;
            shared.paused = false;
            shared.pause_after_submissions = None;
        }
        self.pause_wake.notify_one();
    }

    /// Arm a pause that trips once `n` more batches have been submitted.
    /// The pause is honored after the throttle sleep that follows the nth
    /// submission.
    pub async fn pause_after_nth_submission(&self, n: u64) {
        self.shared.lock().await.pause_after_submissions = Some(n.max(1));
    }

    /// Main loop: wait out the inter-zone interval (or a wake), then pick
    /// and traverse one zone.
    pub async fn run(self: Arc<Self>) {
        info!(target: "reencrypt::handler", "re-encryption coordinator started");
        let mut gate = ThrottleGate::new(self.config.throttle_ratio);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.sleep_interval()) => {}
            }
            self.wait_if_paused().await;
            if self.shutdown.is_cancelled() {
                break;
            }

            let Some(zone) = self.status.next_pending().await else {
                continue;
            };
            gate.reset();
            match self.process_zone(zone, &mut gate).await {
                Ok(()) => {}
                Err(err) => self.handle_zone_error(zone, err).await,
            }
        }
        self.cancel_all_tasks().await;
        info!(target: "reencrypt::handler", "re-encryption coordinator stopped");
    }

    async fn wait_if_paused(&self) {
        loop {
            {
                let shared = self.shared.lock().await;
                if !shared.paused {
                    return;
                }
            }
            debug!(target: "reencrypt::handler", "paused");
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = self.pause_wake.notified() => {}
            }
        }
    }

    async fn process_zone(
        &self,
        zone: ZoneId,
        gate: &mut ThrottleGate,
    ) -> Result<()> {
        let status = self.status.get(zone).await.ok_or_else(|| {
            ReencryptError::NotFound(format!("zone {zone} has no status"))
        })?;
        if status.canceled {
            return Err(ReencryptError::Canceled(format!(
                "zone {zone} canceled before traversal"
            )));
        }

        let walk = {
            let ns = self.namespace.read().await;
            let held = Instant::now();
            let begun = self.begin_zone(&*ns, zone, &status);
            let held = held.elapsed();
            drop(ns);
            gate.observe_lock(held);
            begun?
        };

        self.status.mark_processing(zone).await?;
        info!(
            target: "reencrypt::handler",
            zone = %zone,
            key_version = %status.ez_key_version_name,
            resume_from = status
                .last_checkpoint_file
                .as_deref()
                .unwrap_or("<zone root>"),
            "re-encrypting zone"
        );
        self.traverse_zone(walk, gate).await
    }

    fn begin_zone(
        &self,
        ns: &N,
        zone: ZoneId,
        status: &ZoneStatus,
    ) -> Result<WalkState> {
        ns.check_safe_mode()?;
        ns.check_writable(zone)?;
        let root_path = ns.zone_root_path(zone).ok_or_else(|| {
            ReencryptError::NotFound(format!("zone {zone} no longer exists"))
        })?;
        let mut walk = WalkState::new(
            zone,
            status.ez_key_version_name.clone(),
            root_path,
        );
        if let Some(checkpoint) = &status.last_checkpoint_file {
            walk.restore_from_checkpoint(ns, checkpoint);
        }
        Ok(walk)
    }

    async fn traverse_zone(
        &self,
        mut walk: WalkState,
        gate: &mut ThrottleGate,
    ) -> Result<()> {
        let zone = walk.zone;
        let mut batch = ReencryptBatch::new(zone);
        loop {
            if self.shutdown.is_cancelled() {
                return Err(ReencryptError::Canceled(
                    "coordinator shutting down".to_string(),
                ));
            }
            let status = self.status.get(zone).await.ok_or_else(|| {
                ReencryptError::NotFound(format!(
                    "zone {zone} removed mid-traversal"
                ))
            })?;
            if status.canceled {
                return Err(ReencryptError::Canceled(format!(
                    "zone {zone} canceled mid-traversal"
                )));
            }

            let stride = {
                let ns = self.namespace.read().await;
                let held = Instant::now();
                let stride = (|| {
                    ns.check_safe_mode()?;
                    ns.check_writable(zone)?;
                    if ns.zone_root_path(zone).is_none() {
                        return Err(ReencryptError::NotFound(format!(
                            "zone {zone} deleted mid-traversal"
                        )));
                    }
                    if walk.needs_reresolve {
                        walk.reresolve(&*ns);
                    }
                    walk.stride(&*ns, &mut batch, self.config.batch_size)
                })();
                let held = held.elapsed();
                drop(ns);
                gate.observe_lock(held);
                stride?
            };

            match stride {
                Stride::BatchReady => {
                    self.submit_batch(zone, batch.take()).await?;
                    walk.needs_reresolve = true;
                    self.throttle(gate).await;
                    self.wait_if_paused().await;
                }
                Stride::Finished => break,
            }
        }
        // Residual batch doubles as the zone's final task; the updater
        // finalises after applying it, even when it carries zero files.
        self.finish_zone_submission(zone, batch).await
    }

    async fn submit_batch(
        &self,
        zone: ZoneId,
        batch: ReencryptBatch,
    ) -> Result<()> {
        let size = batch.len();
        let first_file = batch.first_file_path();
        let handle = self.pool.submit(batch).await;
        {
            let mut shared = self.shared.lock().await;
            shared.submissions.entry(zone).or_default().push_task(handle);
            if shared.note_submission() {
                debug!(
                    target: "reencrypt::handler",
                    zone = %zone,
                    "pausing after nth submission"
                );
            }
        }
        debug!(
            target: "reencrypt::handler",
            zone = %zone,
            size,
            first_file = first_file.as_deref().unwrap_or(""),
            "submitted batch"
        );
        self.completions.send(zone).await.map_err(|_| {
            ReencryptError::Canceled("updater has shut down".to_string())
        })
    }

    /// Submit the zone's final task with `submission_done` raised in the
    /// same tracker update, so the updater can never observe a drained
    /// tracker that is about to receive more work.
    async fn finish_zone_submission(
        &self,
        zone: ZoneId,
        batch: ReencryptBatch,
    ) -> Result<()> {
        let size = batch.len();
        let handle = self.pool.submit(batch).await;
        {
            let mut shared = self.shared.lock().await;
            let tracker = shared.submissions.entry(zone).or_default();
            tracker.mark_submission_done();
            tracker.push_task(handle);
            shared.note_submission();
        }
        debug!(
            target: "reencrypt::handler",
            zone = %zone,
            size,
            "zone submission done"
        );
        self.completions.send(zone).await.map_err(|_| {
            ReencryptError::Canceled("updater has shut down".to_string())
        })
    }

    /// Three-axis pacing, run after every batch submission.
    async fn throttle(&self, gate: &mut ThrottleGate) {
        while self.pool.queued_len() >= gate.cores() {
            if self.shutdown.is_cancelled() {
                return;
            }
            tokio::time::sleep(POOL_SATURATION_SLICE).await;
        }
        loop {
            let outstanding =
                self.shared.lock().await.outstanding_tasks();
            if outstanding < 2 * gate.cores() || self.shutdown.is_cancelled()
            {
                break;
            }
            debug!(
                target: "reencrypt::handler",
                outstanding,
                "updater backlog over watermark"
            );
            tokio::time::sleep(BACKLOG_SLICE).await;
        }
        let excess = gate.lock_share_excess();
        if !excess.is_zero() {
            debug!(
                target: "reencrypt::handler",
                sleep_ms = excess.as_millis() as u64,
                "read-lock share over ratio"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(excess) => {}
            }
        }
        gate.reset();
    }

    async fn handle_zone_error(&self, zone: ZoneId, err: ReencryptError) {
        match err {
            ReencryptError::Canceled(reason) => {
                if self.shutdown.is_cancelled() {
                    // Leave the persisted state alone; the zone resumes
                    // from its checkpoint on restart.
                    return;
                }
                info!(
                    target: "reencrypt::handler",
                    zone = %zone,
                    reason,
                    "zone traversal aborted"
                );
                self.abort_canceled_zone(zone).await;
            }
            ReencryptError::RetryLater(reason) => {
                info!(
                    target: "reencrypt::handler",
                    zone = %zone,
                    reason,
                    "requeueing zone"
                );
                self.status.requeue(zone).await;
            }
            ReencryptError::SafeMode => {
                info!(
                    target: "reencrypt::handler",
                    zone = %zone,
                    "namespace in safe mode, requeueing zone"
                );
                self.status.requeue(zone).await;
            }
            ReencryptError::NotFound(reason) => {
                warn!(
                    target: "reencrypt::handler",
                    zone = %zone,
                    reason,
                    "dropping zone"
                );
                {
                    let mut shared = self.shared.lock().await;
                    if let Some(tracker) = shared.submissions.remove(&zone) {
                        tracker.cancel_all();
                    }
                }
                let _ = self.status.remove(zone).await;
            }
            other => {
                error!(
                    target: "reencrypt::handler",
                    zone = %zone,
                    error = %other,
                    "zone re-encryption failed"
                );
                let _ = self
                    .status
                    .update(zone, |status| status.mark_failed())
                    .await;
                // Route the terminal status through the updater so the
                // failure is persisted and the tracker cleaned up.
                let _ = self
                    .finish_zone_submission(zone, ReencryptBatch::new(zone))
                    .await;
            }
        }
    }

    /// A canceled zone still finalises through the updater: cancel whatever
    /// is queued, then push the final zero-file task.
    async fn abort_canceled_zone(&self, zone: ZoneId) {
        {
            let shared = self.shared.lock().await;
            if let Some(tracker) = shared.submissions.get(&zone) {
                tracker.cancel_all();
            }
        }
        let _ = self
            .finish_zone_submission(zone, ReencryptBatch::new(zone))
            .await;
    }

    async fn cancel_all_tasks(&self) {
        let shared = self.shared.lock().await;
        for tracker in shared.submissions.values() {
            tracker.cancel_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::MemoryNamespace;
    use keywheel_model::FileEncryptionInfo;

    fn info(version: &str) -> FileEncryptionInfo {
        FileEncryptionInfo::new("key", version, vec![0xed], vec![0x1f])
    }

    /// /zone/{a, b, d1/{c, d}, d2/e, nested-ez/x}
    fn fixture() -> (MemoryNamespace, ZoneId) {
        let mut ns = MemoryNamespace::new();
        let zone = ns.make_zone("/zone", "key").expect("zone");
        ns.add_encrypted_file("/zone/a", info("key@1")).unwrap();
        ns.add_encrypted_file("/zone/b", info("key@1")).unwrap();
        ns.mkdir("/zone/d1").unwrap();
        ns.add_encrypted_file("/zone/d1/c", info("key@1")).unwrap();
        ns.add_encrypted_file("/zone/d1/d", info("key@1")).unwrap();
        ns.mkdir("/zone/d2").unwrap();
        ns.add_encrypted_file("/zone/d2/e", info("key@1")).unwrap();
        ns.make_zone("/zone/nested", "other-key").unwrap();
        ns.add_encrypted_file("/zone/nested/x", info("other@1"))
            .unwrap();
        (ns, zone)
    }

    fn walk_all(
        ns: &MemoryNamespace,
        walk: &mut WalkState,
        batch_size: usize,
    ) -> Vec<Vec<String>> {
        let mut batches = Vec::new();
        let mut batch = ReencryptBatch::new(walk.zone);
        loop {
            match walk.stride(ns, &mut batch, batch_size).expect("stride") {
                Stride::BatchReady => {
                    batches.push(
                        batch
                            .take()
                            .records()
                            .iter()
                            .map(|r| r.file_path())
                            .collect(),
                    );
                }
                Stride::Finished => {
                    if !batch.is_empty() {
                        batches.push(
                            batch
                                .records()
                                .iter()
                                .map(|r| r.file_path())
                                .collect(),
                        );
                    }
                    return batches;
                }
            }
        }
    }

    #[test]
    fn walk_visits_files_in_lexicographic_depth_first_order() {
        let (ns, zone) = fixture();
        let mut walk =
            WalkState::new(zone, "key@2".to_string(), "/zone".to_string());
        let batches = walk_all(&ns, &mut walk, 2);
        let all: Vec<String> = batches.into_iter().flatten().collect();
        assert_eq!(
            all,
            vec![
                "/zone/a",
                "/zone/b",
                "/zone/d1/c",
                "/zone/d1/d",
                "/zone/d2/e",
            ]
        );
    }

    #[test]
    fn walk_skips_files_already_at_target_version() {
        let (mut ns, zone) = fixture();
        ns.set_file_encryption_info(
            ns.resolve("/zone/b").unwrap(),
            info("key@2"),
        )
        .unwrap();
        let mut walk =
            WalkState::new(zone, "key@2".to_string(), "/zone".to_string());
        let all: Vec<String> =
            walk_all(&ns, &mut walk, 10).into_iter().flatten().collect();
        assert!(!all.contains(&"/zone/b".to_string()));
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn walk_skips_unencrypted_files_and_nested_zones() {
        let (mut ns, zone) = fixture();
        ns.add_plain_file("/zone/plain").unwrap();
        let mut walk =
            WalkState::new(zone, "key@2".to_string(), "/zone".to_string());
        let all: Vec<String> =
            walk_all(&ns, &mut walk, 10).into_iter().flatten().collect();
        assert!(all.iter().all(|p| !p.starts_with("/zone/nested")));
        assert!(!all.contains(&"/zone/plain".to_string()));
    }

    #[test]
    fn exact_batch_size_yields_single_batch() {
        let mut ns = MemoryNamespace::new();
        let zone = ns.make_zone("/zone", "key").unwrap();
        ns.add_encrypted_file("/zone/a", info("key@1")).unwrap();
        ns.add_encrypted_file("/zone/b", info("key@1")).unwrap();
        let mut walk =
            WalkState::new(zone, "key@2".to_string(), "/zone".to_string());
        let batches = walk_all(&ns, &mut walk, 2);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec!["/zone/a", "/zone/b"]);
    }

    #[test]
    fn restore_from_checkpoint_resumes_after_the_file() {
        let (ns, zone) = fixture();
        let mut walk =
            WalkState::new(zone, "key@2".to_string(), "/zone".to_string());
        walk.restore_from_checkpoint(&ns, "/zone/d1/c");
        let all: Vec<String> =
            walk_all(&ns, &mut walk, 10).into_iter().flatten().collect();
        assert_eq!(all, vec!["/zone/d1/d", "/zone/d2/e"]);
    }

    #[test]
    fn restore_with_vanished_ancestor_truncates_to_sibling() {
        let (mut ns, zone) = fixture();
        ns.remove("/zone/d1").unwrap();
        let mut walk =
            WalkState::new(zone, "key@2".to_string(), "/zone".to_string());
        walk.restore_from_checkpoint(&ns, "/zone/d1/c");
        let all: Vec<String> =
            walk_all(&ns, &mut walk, 10).into_iter().flatten().collect();
        // d1 is gone; traversal continues from its next sibling.
        assert_eq!(all, vec!["/zone/d2/e"]);
    }

    #[test]
    fn reresolve_abandons_deleted_subtree() {
        let (mut ns, zone) = fixture();
        let mut walk =
            WalkState::new(zone, "key@2".to_string(), "/zone".to_string());
        // Fill a batch of 3: a, b, d1/c — the walk is now inside /zone/d1.
        let mut batch = ReencryptBatch::new(zone);
        assert!(matches!(
            walk.stride(&ns, &mut batch, 3).unwrap(),
            Stride::BatchReady
        ));
        ns.remove("/zone/d1").unwrap();
        walk.needs_reresolve = true;
        walk.reresolve(&ns);
        let all: Vec<String> =
            walk_all(&ns, &mut walk, 10).into_iter().flatten().collect();
        assert_eq!(all, vec!["/zone/d2/e"]);
    }

    #[test]
    fn pause_counter_trips_after_nth_submission() {
        let mut shared = HandlerShared::default();
        shared.pause_after_submissions = Some(2);
        assert!(!shared.note_submission());
        assert!(shared.note_submission());
        assert!(shared.paused);
        assert!(shared.pause_after_submissions.is_none());
    }
}
