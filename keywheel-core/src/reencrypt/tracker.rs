use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use keywheel_model::ZoneId;

use super::batch::ReencryptBatch;

/// What came back from the pool for one submitted batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub zone: ZoneId,
    /// The batch, with `new_edek` filled in on every record when the KMS
    /// call succeeded.
    pub batch: ReencryptBatch,
    /// Whole-batch failure count reported by the worker (0 on success,
    /// `batch.len()` when the KMS call failed).
    pub failures: u64,
    /// The task was canceled before the KMS was called.
    pub canceled: bool,
}

impl BatchOutcome {
    pub fn success(batch: ReencryptBatch) -> Self {
        Self {
            zone: batch.zone(),
            failures: 0,
            canceled: false,
            batch,
        }
    }

    pub fn failed(batch: ReencryptBatch) -> Self {
        Self {
            zone: batch.zone(),
            failures: batch.len() as u64,
            canceled: false,
            batch,
        }
    }

    pub fn canceled(batch: ReencryptBatch) -> Self {
        Self {
            zone: batch.zone(),
            failures: 0,
            canceled: true,
            batch,
        }
    }
}

/// Handle to one in-flight batch, held by the zone's tracker until the
/// updater drains it.
#[derive(Debug)]
pub struct TaskHandle {
    pub first_file_path: Option<String>,
    pub completion: oneshot::Receiver<BatchOutcome>,
    cancel: CancellationToken,
}

impl TaskHandle {
    pub fn new(
        first_file_path: Option<String>,
        completion: oneshot::Receiver<BatchOutcome>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            first_file_path,
            completion,
            cancel,
        }
    }

    /// Ask the pool to skip this task if it has not started yet. Tasks
    /// already past the cancel check run to completion; the updater discards
    /// their results.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Per-zone record of outstanding batch tasks.
///
/// The coordinator appends strictly in submission order and the updater
/// drains from the head, which is what gives each zone completion-in-
/// submission-order semantics. Lives in the handler's `submissions` map,
/// behind the handler mutex.
#[derive(Debug, Default)]
pub struct ZoneSubmissionTracker {
    tasks: VecDeque<TaskHandle>,
    submission_done: bool,
}

impl ZoneSubmissionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_task(&mut self, task: TaskHandle) {
        self.tasks.push_back(task);
    }

    pub fn pop_task(&mut self) -> Option<TaskHandle> {
        self.tasks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The coordinator has submitted the zone's final batch.
    pub fn mark_submission_done(&mut self) {
        self.submission_done = true;
    }

    pub fn submission_done(&self) -> bool {
        self.submission_done
    }

    /// Cancel every task that has not started yet. Handles stay queued so
    /// the updater still drains one outcome per submission.
    pub fn cancel_all(&self) {
        for task in &self.tasks {
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(path: &str) -> (TaskHandle, oneshot::Sender<BatchOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            TaskHandle::new(
                Some(path.to_string()),
                rx,
                CancellationToken::new(),
            ),
            tx,
        )
    }

    #[test]
    fn tracker_drains_in_submission_order() {
        let mut tracker = ZoneSubmissionTracker::new();
        let (first, _tx1) = handle("/zone/a");
        let (second, _tx2) = handle("/zone/c");
        tracker.push_task(first);
        tracker.push_task(second);

        assert_eq!(tracker.len(), 2);
        let head = tracker.pop_task().expect("head");
        assert_eq!(head.first_file_path.as_deref(), Some("/zone/a"));
        let next = tracker.pop_task().expect("next");
        assert_eq!(next.first_file_path.as_deref(), Some("/zone/c"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn cancel_all_keeps_handles_queued() {
        let mut tracker = ZoneSubmissionTracker::new();
        let (task, _tx) = handle("/zone/a");
        tracker.push_task(task);
        tracker.cancel_all();
        assert_eq!(tracker.len(), 1, "draining still sees the handle");
    }

    #[test]
    fn submission_done_is_sticky() {
        let mut tracker = ZoneSubmissionTracker::new();
        assert!(!tracker.submission_done());
        tracker.mark_submission_done();
        assert!(tracker.submission_done());
    }
}
