use chrono::{DateTime, Utc};

use crate::error::ModelError;

/// Lifecycle phase of a zone re-encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ZonePhase {
    /// Accepted, waiting for the coordinator to pick the zone up.
    Submitted,
    /// The coordinator is walking the zone and batches are in flight.
    Processing,
    Completed,
    Canceled,
    Failed,
}

impl ZonePhase {
    /// Terminal phases never transition again; the zone only leaves the
    /// status store through explicit removal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ZonePhase::Completed | ZonePhase::Canceled | ZonePhase::Failed
        )
    }
}

impl std::fmt::Display for ZonePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ZonePhase::Submitted => "submitted",
            ZonePhase::Processing => "processing",
            ZonePhase::Completed => "completed",
            ZonePhase::Canceled => "canceled",
            ZonePhase::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for ZonePhase {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(ZonePhase::Submitted),
            "processing" => Ok(ZonePhase::Processing),
            "completed" => Ok(ZonePhase::Completed),
            "canceled" => Ok(ZonePhase::Canceled),
            "failed" => Ok(ZonePhase::Failed),
            other => Err(ModelError::UnknownPhase(other.to_string())),
        }
    }
}

/// Persisted per-zone re-encryption progress.
///
/// `last_checkpoint_file` is the full path of the last file whose new EDEK
/// has been durably recorded. It is monotone in the lexicographic traversal
/// order of the tree and is the sole basis for resuming an interrupted run.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ZoneStatus {
    pub phase: ZonePhase,
    pub ez_key_version_name: String,
    pub last_checkpoint_file: Option<String>,
    pub files_reencrypted: u64,
    pub num_failures: u64,
    pub canceled: bool,
    pub submission_time: DateTime<Utc>,
    pub completion_time: Option<DateTime<Utc>>,
}

impl ZoneStatus {
    /// A fresh submission targeting `ez_key_version_name`.
    pub fn submitted(ez_key_version_name: impl Into<String>) -> Self {
        Self {
            phase: ZonePhase::Submitted,
            ez_key_version_name: ez_key_version_name.into(),
            last_checkpoint_file: None,
            files_reencrypted: 0,
            num_failures: 0,
            canceled: false,
            submission_time: Utc::now(),
            completion_time: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Fold a finished batch into the counters.
    pub fn record_batch(&mut self, reencrypted: u64, failures: u64) {
        self.files_reencrypted += reencrypted;
        self.num_failures += failures;
    }

    pub fn mark_completed(&mut self) {
        self.phase = ZonePhase::Completed;
        self.completion_time = Some(Utc::now());
    }

    pub fn mark_canceled(&mut self) {
        self.canceled = true;
        self.phase = ZonePhase::Canceled;
        self.completion_time = Some(Utc::now());
    }

    pub fn mark_failed(&mut self) {
        self.phase = ZonePhase::Failed;
        self.completion_time = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_display() {
        for phase in [
            ZonePhase::Submitted,
            ZonePhase::Processing,
            ZonePhase::Completed,
            ZonePhase::Canceled,
            ZonePhase::Failed,
        ] {
            let parsed: ZonePhase = phase.to_string().parse().expect("parse");
            assert_eq!(parsed, phase);
        }
        assert!("unknown".parse::<ZonePhase>().is_err());
    }

    #[test]
    fn counters_are_monotone() {
        let mut status = ZoneStatus::submitted("k1@2");
        status.record_batch(10, 0);
        status.record_batch(5, 3);
        assert_eq!(status.files_reencrypted, 15);
        assert_eq!(status.num_failures, 3);
    }

    #[test]
    fn cancel_is_sticky_and_terminal() {
        let mut status = ZoneStatus::submitted("k1@2");
        status.phase = ZonePhase::Processing;
        status.mark_canceled();
        assert!(status.canceled);
        assert!(status.is_terminal());
        assert!(status.completion_time.is_some());
    }
}
