//! Re-encryption of encryption zones after a zone key rotation.
//!
//! The subsystem pairs a coordinating handler with an applying updater. The
//! handler walks each submitted zone depth-first under the namespace read
//! lock, batching files whose EDEK is wrapped under a stale key version, and
//! hands batches to a worker pool that calls the KMS with no lock held. The
//! updater consumes completions in per-zone submission order and writes the
//! re-wrapped EDEKs back under the write lock, checkpointing progress so an
//! interrupted zone resumes where it stopped.

pub mod batch;
pub mod config;
pub mod handler;
pub mod pool;
pub mod runtime;
pub mod status;
pub mod throttle;
pub mod tracker;
pub mod updater;

pub use batch::{EdekRecord, ReencryptBatch};
pub use config::ReencryptConfig;
pub use handler::ReencryptionHandler;
pub use pool::EdekWorkerPool;
pub use runtime::ReencryptRuntime;
pub use status::ZoneStatusStore;
pub use tracker::{BatchOutcome, ZoneSubmissionTracker};
pub use updater::ReencryptionUpdater;
