/// Strongly typed identifier of an encryption zone, equal to the inode id of
/// the zone's root directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ZoneId(pub u64);

impl ZoneId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ZoneId {
    fn from(id: u64) -> Self {
        ZoneId(id)
    }
}

impl std::fmt::Display for ZoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly typed identifier for inodes in the namespace tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InodeId(pub u64);

impl InodeId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for InodeId {
    fn from(id: u64) -> Self {
        InodeId(id)
    }
}

impl std::fmt::Display for InodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ZoneId> for InodeId {
    fn from(zone: ZoneId) -> Self {
        InodeId(zone.0)
    }
}
