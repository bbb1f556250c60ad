//! Shared fixtures for the re-encryption integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use keywheel_core::error::{ReencryptError, Result};
use keywheel_core::namespace::{MemoryNamespace, SharedNamespace};
use keywheel_core::reencrypt::{ReencryptConfig, ReencryptRuntime};
use keywheel_core::KmsClient;
use keywheel_model::{
    EncryptedKeyVersion, FileEncryptionInfo, ZoneId, ZonePhase, ZoneStatus,
};

/// Scripted KMS: re-wraps every EDEK to a fixed version name, records what
/// it saw, and can be told to fail its next N calls.
pub struct MockKms {
    new_version: String,
    calls: AtomicUsize,
    fail_next: AtomicUsize,
    drains: AtomicUsize,
    materials: std::sync::Mutex<Vec<Vec<u8>>>,
}

impl MockKms {
    pub fn new(new_version: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            new_version: new_version.into(),
            calls: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            drains: AtomicUsize::new(0),
            materials: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn fail_next_calls(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn drains(&self) -> usize {
        self.drains.load(Ordering::SeqCst)
    }

    /// Every EDEK material successfully re-wrapped, in call order.
    pub fn materials(&self) -> Vec<Vec<u8>> {
        self.materials.lock().expect("materials mutex").clone()
    }
}

#[async_trait]
impl KmsClient for MockKms {
    async fn reencrypt_encrypted_keys(
        &self,
        edeks: Vec<EncryptedKeyVersion>,
    ) -> Result<Vec<EncryptedKeyVersion>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok();
        if failing {
            return Err(ReencryptError::Kms(
                "injected KMS failure".to_string(),
            ));
        }
        {
            let mut seen = self.materials.lock().expect("materials mutex");
            seen.extend(edeks.iter().map(|edek| edek.material.clone()));
        }
        Ok(edeks
            .into_iter()
            .map(|edek| {
                EncryptedKeyVersion::new(
                    edek.key_name,
                    self.new_version.clone(),
                    edek.iv,
                    edek.material,
                )
            })
            .collect())
    }

    async fn drain_encrypted_keys(&self, _key_name: &str) -> Result<()> {
        self.drains.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Per-file encryption metadata with a distinguishable material byte, so
/// tests can assert exactly which files reached the KMS.
pub fn enc(version: &str, material: u8) -> FileEncryptionInfo {
    FileEncryptionInfo::new("key", version, vec![material], vec![0x1f])
}

/// Fast-cadence config for tests; scenario tests override batch sizing.
pub fn test_config() -> ReencryptConfig {
    ReencryptConfig {
        sleep_interval_ms: 20,
        batch_size: 2,
        throttle_ratio: 1.0,
        edek_threads: 2,
        updater_checkpoint_every: 10,
    }
}

pub struct Cluster {
    pub namespace: SharedNamespace<MemoryNamespace>,
    pub kms: Arc<MockKms>,
    pub runtime: ReencryptRuntime<MemoryNamespace>,
}

/// Wire a runtime over the given namespace and start it.
pub async fn start_cluster(
    ns: MemoryNamespace,
    kms: Arc<MockKms>,
    config: ReencryptConfig,
) -> Cluster {
    let namespace: SharedNamespace<MemoryNamespace> =
        Arc::new(RwLock::new(ns));
    let runtime = ReencryptRuntime::new(
        Arc::clone(&namespace),
        kms.clone() as Arc<dyn KmsClient>,
        config,
    )
    .expect("config validates");
    runtime.start().await.expect("runtime starts");
    Cluster {
        namespace,
        kms,
        runtime,
    }
}

/// Poll until the zone reaches `phase`.
pub async fn wait_for_phase(
    runtime: &ReencryptRuntime<MemoryNamespace>,
    zone: ZoneId,
    phase: ZonePhase,
    timeout: Duration,
) -> ZoneStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let current = runtime
            .list_status()
            .await
            .into_iter()
            .find(|(id, _)| *id == zone)
            .map(|(_, status)| status);
        if let Some(status) = current {
            if status.phase == phase {
                return status;
            }
            assert!(
                !(status.is_terminal() && status.phase != phase),
                "zone {zone} ended {} while waiting for {phase}",
                status.phase
            );
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for zone {zone} to reach {phase}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll an arbitrary condition.
pub async fn wait_until<F>(timeout: Duration, what: &str, mut check: F)
where
    F: AsyncFnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
