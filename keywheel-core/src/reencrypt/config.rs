use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReencryptError, Result};

/// Batch sizes past this point hold the write lock long enough per apply to
/// be felt by foreground traffic.
const BATCH_SIZE_WARN_THRESHOLD: usize = 2000;

/// Tuning knobs for the re-encryption subsystem.
///
/// All fields carry defaults so deployments only supply the knobs they want
/// to move.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReencryptConfig {
    /// Inter-zone wait (milliseconds) when the coordinator is idle.
    pub sleep_interval_ms: u64,
    /// EDEKs per batch, i.e. per KMS call and per updater apply step.
    pub batch_size: usize,
    /// Maximum share of wall time the coordinator may hold the read lock,
    /// in (0, 1].
    pub throttle_ratio: f64,
    /// Worker pool size for KMS calls.
    pub edek_threads: usize,
    /// Files applied between durable checkpoints.
    pub updater_checkpoint_every: usize,
}

impl Default for ReencryptConfig {
    fn default() -> Self {
        Self {
            sleep_interval_ms: 1_000,
            batch_size: 1_000,
            throttle_ratio: 1.0,
            edek_threads: 10,
            updater_checkpoint_every: 10,
        }
    }
}

impl ReencryptConfig {
    pub fn sleep_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_interval_ms)
    }

    /// Reject out-of-range knobs; oversized batches pass with a warning.
    pub fn validate(&self) -> Result<()> {
        if self.sleep_interval_ms == 0 {
            return Err(ReencryptError::InvalidConfig(
                "sleep_interval_ms must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ReencryptError::InvalidConfig(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.batch_size > BATCH_SIZE_WARN_THRESHOLD {
            tracing::warn!(
                target: "reencrypt::config",
                batch_size = self.batch_size,
                threshold = BATCH_SIZE_WARN_THRESHOLD,
                "batch size is unusually large; applies will hold the write \
                 lock for extended periods"
            );
        }
        if !(self.throttle_ratio > 0.0 && self.throttle_ratio <= 1.0) {
            return Err(ReencryptError::InvalidConfig(format!(
                "throttle_ratio must be in (0, 1], got {}",
                self.throttle_ratio
            )));
        }
        if self.edek_threads == 0 {
            return Err(ReencryptError::InvalidConfig(
                "edek_threads must be positive".to_string(),
            ));
        }
        if self.updater_checkpoint_every == 0 {
            return Err(ReencryptError::InvalidConfig(
                "updater_checkpoint_every must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ReencryptConfig::default().validate().expect("defaults");
    }

    #[test]
    fn zero_knobs_are_rejected() {
        for mutate in [
            (|c: &mut ReencryptConfig| c.sleep_interval_ms = 0)
                as fn(&mut ReencryptConfig),
            |c| c.batch_size = 0,
            |c| c.edek_threads = 0,
            |c| c.updater_checkpoint_every = 0,
            |c| c.throttle_ratio = 0.0,
            |c| c.throttle_ratio = 1.5,
        ] {
            let mut config = ReencryptConfig::default();
            mutate(&mut config);
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = ReencryptConfig {
            batch_size: 50,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).expect("serialize");
        let back: ReencryptConfig =
            serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.batch_size, 50);
        assert_eq!(back.edek_threads, config.edek_threads);
    }
}
