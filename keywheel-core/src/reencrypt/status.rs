use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;

use keywheel_model::{ZoneId, ZonePhase, ZoneStatus};

use crate::error::{ReencryptError, Result};

#[derive(Debug, Default)]
struct StoreState {
    zones: BTreeMap<ZoneId, ZoneStatus>,
    pending: VecDeque<ZoneId>,
}

/// Process-wide working set of zone statuses plus the queue of zones the
/// coordinator has not picked up yet.
///
/// This is the in-memory view; the durable copy lives on each zone root and
/// is written through the namespace by the updater (checkpoints, finalise)
/// and the runtime (submission).
#[derive(Clone, Debug, Default)]
pub struct ZoneStatusStore {
    inner: Arc<Mutex<StoreState>>,
}

impl ZoneStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a zone for re-encryption. Returns the fresh status, or `None`
    /// when the zone is already active (resubmission is an idempotent
    /// no-op). A zone in a terminal phase may be submitted again.
    pub async fn submit(
        &self,
        zone: ZoneId,
        key_version: &str,
    ) -> Option<ZoneStatus> {
        let mut state = self.inner.lock().await;
        if let Some(existing) = state.zones.get(&zone)
            && !existing.is_terminal()
        {
            return None;
        }
        let status = ZoneStatus::submitted(key_version);
        state.zones.insert(zone, status.clone());
        state.pending.push_back(zone);
        Some(status)
    }

    /// Re-insert a previously known status, queueing it for (re)traversal
    /// when it is still live. Used for crash recovery at startup.
    pub async fn restore(&self, zone: ZoneId, status: ZoneStatus) {
        let mut state = self.inner.lock().await;
        let live = !status.is_terminal();
        state.zones.insert(zone, status);
        if live {
            state.pending.push_back(zone);
        }
    }

    /// Next zone awaiting traversal.
    pub async fn next_pending(&self) -> Option<ZoneId> {
        self.inner.lock().await.pending.pop_front()
    }

    /// Put a zone back at the end of the queue after a transient failure.
    pub async fn requeue(&self, zone: ZoneId) {
        let mut state = self.inner.lock().await;
        if !state.pending.contains(&zone) {
            state.pending.push_back(zone);
        }
    }

    /// Drop a zone from the pending queue without touching its status.
    pub async fn unqueue(&self, zone: ZoneId) {
        let mut state = self.inner.lock().await;
        state.pending.retain(|pending| *pending != zone);
    }

    pub async fn has_pending(&self) -> bool {
        !self.inner.lock().await.pending.is_empty()
    }

    pub async fn get(&self, zone: ZoneId) -> Option<ZoneStatus> {
        self.inner.lock().await.zones.get(&zone).cloned()
    }

    /// Apply `mutate` to the zone's status and return the updated copy.
    pub async fn update<F>(&self, zone: ZoneId, mutate: F) -> Result<ZoneStatus>
    where
        F: FnOnce(&mut ZoneStatus),
    {
        let mut state = self.inner.lock().await;
        let status = state.zones.get_mut(&zone).ok_or_else(|| {
            ReencryptError::NotFound(format!("zone {zone} has no status"))
        })?;
        mutate(status);
        Ok(status.clone())
    }

    pub async fn mark_processing(&self, zone: ZoneId) -> Result<ZoneStatus> {
        self.update(zone, |status| status.phase = ZonePhase::Processing)
            .await
    }

    /// Drop a zone from the working set entirely.
    pub async fn remove(&self, zone: ZoneId) -> Result<ZoneStatus> {
        let mut state = self.inner.lock().await;
        state.pending.retain(|pending| *pending != zone);
        state.zones.remove(&zone).ok_or_else(|| {
            ReencryptError::NotFound(format!("zone {zone} has no status"))
        })
    }

    /// Snapshot of every tracked zone, ordered by zone id.
    pub async fn list(&self) -> Vec<(ZoneId, ZoneStatus)> {
        self.inner
            .lock()
            .await
            .zones
            .iter()
            .map(|(zone, status)| (*zone, status.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submission_is_idempotent_while_active() {
        let store = ZoneStatusStore::new();
        assert!(store.submit(ZoneId(1), "key@2").await.is_some());
        assert!(
            store.submit(ZoneId(1), "key@2").await.is_none(),
            "active zone resubmission is a no-op"
        );
        assert_eq!(store.next_pending().await, Some(ZoneId(1)));
        assert_eq!(store.next_pending().await, None);
    }

    #[tokio::test]
    async fn terminal_zones_may_be_resubmitted() {
        let store = ZoneStatusStore::new();
        store.submit(ZoneId(1), "key@2").await;
        store.next_pending().await;
        store
            .update(ZoneId(1), |status| status.mark_completed())
            .await
            .expect("update");
        let fresh = store.submit(ZoneId(1), "key@3").await.expect("resubmit");
        assert_eq!(fresh.phase, ZonePhase::Submitted);
        assert_eq!(fresh.ez_key_version_name, "key@3");
    }

    #[tokio::test]
    async fn pending_queue_preserves_submission_order() {
        let store = ZoneStatusStore::new();
        store.submit(ZoneId(3), "a@1").await;
        store.submit(ZoneId(1), "b@1").await;
        assert_eq!(store.next_pending().await, Some(ZoneId(3)));
        store.requeue(ZoneId(3)).await;
        assert_eq!(store.next_pending().await, Some(ZoneId(1)));
        assert_eq!(store.next_pending().await, Some(ZoneId(3)));
        assert!(!store.has_pending().await);
    }

    #[tokio::test]
    async fn remove_clears_pending_entries() {
        let store = ZoneStatusStore::new();
        store.submit(ZoneId(1), "key@2").await;
        store.remove(ZoneId(1)).await.expect("remove");
        assert_eq!(store.next_pending().await, None);
        assert!(store.get(ZoneId(1)).await.is_none());
        assert!(store.remove(ZoneId(1)).await.is_err());
    }
}
