//! The namespace collaborator: the inode tree the coordinator walks and the
//! updater writes back into.
//!
//! The real namespace lives outside this crate; what we model here is its
//! locking discipline. All operations are synchronous and are only reachable
//! through a [`tokio::sync::RwLock`] guard, so the types themselves enforce
//! that the coordinator (read guard, `&N`) can never mutate and the updater
//! (write guard, `&mut N`) serialises with every other writer. No implementor
//! may block inside these methods; anything slow (the KMS above all) happens
//! strictly outside the guard.

mod memory;

use std::sync::Arc;

use tokio::sync::RwLock;

use keywheel_model::{FileEncryptionInfo, InodeId, ZoneId, ZoneStatus};

use crate::error::Result;

pub use memory::MemoryNamespace;

/// Shared handle to the namespace behind its reader/writer lock.
pub type SharedNamespace<N> = Arc<RwLock<N>>;

/// One directory entry as seen by the tree walk.
#[derive(Debug, Clone)]
pub struct ChildEntry {
    /// Local name within the parent directory.
    pub name: String,
    pub inode: InodeId,
    pub kind: ChildKind,
}

/// What a child is, with exactly the detail the walk needs to classify it.
#[derive(Debug, Clone)]
pub enum ChildKind {
    File {
        /// `None` for files outside any encryption zone's key material.
        encryption: Option<FileEncryptionInfo>,
    },
    Directory {
        /// Roots of nested encryption zones are skipped whole; they have
        /// their own re-encryption lifecycle.
        ez_root: bool,
    },
}

impl ChildEntry {
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, ChildKind::Directory { .. })
    }
}

/// The inode tree and its extended-attribute storage.
///
/// Child listings are sorted by name in byte order; the walk's cursors and
/// checkpoints depend on that ordering being stable for a given tree state.
pub trait NamespaceTree: Send + Sync {
    /// Full path of the zone root directory, `None` if the zone is gone.
    fn zone_root_path(&self, zone: ZoneId) -> Option<String>;

    /// Name of the zone key for `zone`, from the zone root's metadata.
    fn ez_key_name(&self, zone: ZoneId) -> Option<String>;

    fn is_encryption_zone_root(&self, inode: InodeId) -> bool;

    /// Children of `dir` sorted by name. `NotFound` if `dir` no longer
    /// exists or is not a directory.
    fn list_children(&self, dir: InodeId) -> Result<Vec<ChildEntry>>;

    /// Resolve one child by name under `dir`.
    fn lookup(&self, dir: InodeId, name: &str) -> Option<ChildEntry>;

    /// Current encryption metadata of a file, `None` if the file is gone or
    /// carries none.
    fn file_encryption_info(&self, file: InodeId) -> Option<FileEncryptionInfo>;

    /// Atomically replace a file's encryption metadata.
    fn set_file_encryption_info(
        &mut self,
        file: InodeId,
        info: FileEncryptionInfo,
    ) -> Result<()>;

    /// Load the persisted re-encryption status from the zone root.
    fn zone_status(&self, zone: ZoneId) -> Option<ZoneStatus>;

    /// Durably record the re-encryption status on the zone root. Completes
    /// before the method returns; callers rely on this happening inside the
    /// write guard.
    fn update_zone_status(
        &mut self,
        zone: ZoneId,
        status: &ZoneStatus,
    ) -> Result<()>;

    /// Every persisted re-encryption status, for startup recovery.
    fn reencryption_statuses(&self) -> Vec<(ZoneId, ZoneStatus)>;

    /// `RetryLater` if the zone cannot currently accept writes.
    fn check_writable(&self, zone: ZoneId) -> Result<()>;

    /// `SafeMode` while the namespace only serves reads.
    fn check_safe_mode(&self) -> Result<()>;

    /// Whether the journal is backlogged; the updater voluntarily yields
    /// while this holds.
    fn journal_pressure(&self) -> bool;
}

/// Index of the first child strictly after `start_after`, for re-entering a
/// directory at a cursor. `None` starts from the beginning.
pub fn next_child_index(
    children: &[ChildEntry],
    start_after: Option<&str>,
) -> usize {
    match start_after {
        None => 0,
        Some(cursor) => {
            children.partition_point(|child| child.name.as_str() <= cursor)
        }
    }
}

/// Join a parent path and a local name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str) -> ChildEntry {
        ChildEntry {
            name: name.to_string(),
            inode: InodeId(0),
            kind: ChildKind::File { encryption: None },
        }
    }

    #[test]
    fn next_child_index_seeks_strictly_past_cursor() {
        let children =
            vec![entry("a"), entry("b"), entry("c"), entry("d")];
        assert_eq!(next_child_index(&children, None), 0);
        assert_eq!(next_child_index(&children, Some("a")), 1);
        assert_eq!(next_child_index(&children, Some("b")), 2);
        assert_eq!(next_child_index(&children, Some("d")), 4);
        // A deleted cursor entry still lands on its successor.
        assert_eq!(next_child_index(&children, Some("bb")), 2);
    }

    #[test]
    fn join_path_handles_root() {
        assert_eq!(join_path("/", "zone"), "/zone");
        assert_eq!(join_path("/zone", "a"), "/zone/a");
    }
}
