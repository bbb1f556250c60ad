use keywheel_model::{
    EncryptedKeyVersion, FileEncryptionInfo, InodeId, ZoneId,
};

use crate::namespace::join_path;

/// One file's worth of re-encryption work.
///
/// A record is written exactly twice: the existing EDEK is captured under
/// the read lock when the walk discovers the file, and `new_edek` is filled
/// in by a pool worker after the KMS call, before the updater consumes the
/// batch.
#[derive(Debug, Clone)]
pub struct EdekRecord {
    pub inode: InodeId,
    /// Parent directory path at discovery time. The file may move before the
    /// updater applies the record; application goes by inode, this path is
    /// for checkpoints and logs.
    pub parent_path: String,
    pub name: String,
    pub existing: FileEncryptionInfo,
    pub new_edek: Option<EncryptedKeyVersion>,
}

impl EdekRecord {
    pub fn new(
        inode: InodeId,
        parent_path: impl Into<String>,
        name: impl Into<String>,
        existing: FileEncryptionInfo,
    ) -> Self {
        Self {
            inode,
            parent_path: parent_path.into(),
            name: name.into(),
            existing,
            new_edek: None,
        }
    }

    /// Full path of the file as discovered.
    pub fn file_path(&self) -> String {
        join_path(&self.parent_path, &self.name)
    }
}

/// An ordered run of [`EdekRecord`]s submitted as one KMS call and one
/// updater apply step. Immutable once handed to the pool.
#[derive(Debug)]
pub struct ReencryptBatch {
    zone: ZoneId,
    records: Vec<EdekRecord>,
}

impl ReencryptBatch {
    pub fn new(zone: ZoneId) -> Self {
        Self {
            zone,
            records: Vec::new(),
        }
    }

    pub fn zone(&self) -> ZoneId {
        self.zone
    }

    pub fn push(&mut self, record: EdekRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Path of the first record, used to label the batch in logs.
    pub fn first_file_path(&self) -> Option<String> {
        self.records.first().map(EdekRecord::file_path)
    }

    pub fn records(&self) -> &[EdekRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [EdekRecord] {
        &mut self.records
    }

    /// Replace the accumulating batch with a fresh one for the same zone,
    /// returning what was accumulated so far.
    pub fn take(&mut self) -> ReencryptBatch {
        let zone = self.zone;
        std::mem::replace(self, ReencryptBatch::new(zone))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(parent: &str, name: &str) -> EdekRecord {
        EdekRecord::new(
            InodeId(7),
            parent,
            name,
            FileEncryptionInfo::new("key", "key@1", vec![1], vec![2]),
        )
    }

    #[test]
    fn first_file_path_labels_the_batch() {
        let mut batch = ReencryptBatch::new(ZoneId(1));
        assert_eq!(batch.first_file_path(), None);
        batch.push(record("/zone/sub", "a"));
        batch.push(record("/zone/sub", "b"));
        assert_eq!(
            batch.first_file_path().as_deref(),
            Some("/zone/sub/a")
        );
    }

    #[test]
    fn take_resets_the_accumulator() {
        let mut batch = ReencryptBatch::new(ZoneId(1));
        batch.push(record("/zone", "a"));
        let taken = batch.take();
        assert_eq!(taken.len(), 1);
        assert!(batch.is_empty());
        assert_eq!(batch.zone(), ZoneId(1));
    }
}
