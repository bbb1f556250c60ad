use std::collections::{BTreeMap, HashMap, HashSet};

use keywheel_model::{FileEncryptionInfo, InodeId, ZoneId, ZoneStatus};

use crate::error::{ReencryptError, Result};

use super::{ChildEntry, ChildKind, NamespaceTree};

#[derive(Debug)]
struct Node {
    parent: Option<InodeId>,
    name: String,
    kind: NodeKind,
}

#[derive(Debug)]
enum NodeKind {
    Dir {
        children: BTreeMap<String, InodeId>,
        ez_key_name: Option<String>,
    },
    File {
        encryption: Option<FileEncryptionInfo>,
    },
}

/// In-process [`NamespaceTree`] backed by a plain inode map.
///
/// Stands in for the real namespace in tests and wiring experiments. Zone
/// statuses are kept in a side map keyed by zone id, playing the role of the
/// extended attributes on the zone root.
#[derive(Debug)]
pub struct MemoryNamespace {
    nodes: HashMap<InodeId, Node>,
    root: InodeId,
    statuses: HashMap<ZoneId, ZoneStatus>,
    safe_mode: bool,
    journal_pressure: bool,
    frozen_zones: HashSet<ZoneId>,
    next_id: u64,
}

impl Default for MemoryNamespace {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNamespace {
    pub fn new() -> Self {
        let root = InodeId(1);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                parent: None,
                name: String::new(),
                kind: NodeKind::Dir {
                    children: BTreeMap::new(),
                    ez_key_name: None,
                },
            },
        );
        Self {
            nodes,
            root,
            statuses: HashMap::new(),
            safe_mode: false,
            journal_pressure: false,
            frozen_zones: HashSet::new(),
            next_id: 2,
        }
    }

    fn alloc_id(&mut self) -> InodeId {
        let id = InodeId(self.next_id);
        self.next_id += 1;
        id
    }

    fn components(path: &str) -> impl Iterator<Item = &str> {
        path.split('/').filter(|c| !c.is_empty())
    }

    /// Resolve a full path to an inode id.
    pub fn resolve(&self, path: &str) -> Option<InodeId> {
        let mut current = self.root;
        for component in Self::components(path) {
            let NodeKind::Dir { children, .. } =
                &self.nodes.get(&current)?.kind
            else {
                return None;
            };
            current = *children.get(component)?;
        }
        Some(current)
    }

    /// Full path of an inode, built by climbing to the root.
    pub fn path_of(&self, inode: InodeId) -> Option<String> {
        let mut parts = Vec::new();
        let mut current = inode;
        loop {
            let node = self.nodes.get(&current)?;
            match node.parent {
                Some(parent) => {
                    parts.push(node.name.clone());
                    current = parent;
                }
                None => break,
            }
        }
        parts.reverse();
        Some(format!("/{}", parts.join("/")))
    }

    fn insert_child(
        &mut self,
        parent_path: &str,
        name: &str,
        kind: NodeKind,
    ) -> Result<InodeId> {
        let parent = self.resolve(parent_path).ok_or_else(|| {
            ReencryptError::NotFound(parent_path.to_string())
        })?;
        if !matches!(
            self.nodes.get(&parent),
            Some(Node {
                kind: NodeKind::Dir { .. },
                ..
            })
        ) {
            return Err(ReencryptError::Internal(format!(
                "{parent_path} is not a directory"
            )));
        }
        let id = self.alloc_id();
        self.nodes.insert(
            id,
            Node {
                parent: Some(parent),
                name: name.to_string(),
                kind,
            },
        );
        if let Some(Node {
            kind: NodeKind::Dir { children, .. },
            ..
        }) = self.nodes.get_mut(&parent)
        {
            children.insert(name.to_string(), id);
        }
        Ok(id)
    }

    fn split_parent(path: &str) -> Result<(&str, &str)> {
        let trimmed = path.trim_end_matches('/');
        let split = trimmed.rfind('/').ok_or_else(|| {
            ReencryptError::Internal(format!("relative path: {path}"))
        })?;
        let (parent, name) = trimmed.split_at(split);
        let parent = if parent.is_empty() { "/" } else { parent };
        Ok((parent, &name[1..]))
    }

    /// Create one directory. The parent must exist.
    pub fn mkdir(&mut self, path: &str) -> Result<InodeId> {
        let (parent, name) = Self::split_parent(path)?;
        self.insert_child(
            parent,
            name,
            NodeKind::Dir {
                children: BTreeMap::new(),
                ez_key_name: None,
            },
        )
    }

    /// Create a directory and mark it as an encryption zone root.
    pub fn make_zone(
        &mut self,
        path: &str,
        key_name: impl Into<String>,
    ) -> Result<ZoneId> {
        let (parent, name) = Self::split_parent(path)?;
        let id = self.insert_child(
            parent,
            name,
            NodeKind::Dir {
                children: BTreeMap::new(),
                ez_key_name: Some(key_name.into()),
            },
        )?;
        Ok(ZoneId(id.0))
    }

    /// Create a file carrying encryption metadata.
    pub fn add_encrypted_file(
        &mut self,
        path: &str,
        encryption: FileEncryptionInfo,
    ) -> Result<InodeId> {
        let (parent, name) = Self::split_parent(path)?;
        self.insert_child(
            parent,
            name,
            NodeKind::File {
                encryption: Some(encryption),
            },
        )
    }

    /// Create a file with no encryption metadata.
    pub fn add_plain_file(&mut self, path: &str) -> Result<InodeId> {
        let (parent, name) = Self::split_parent(path)?;
        self.insert_child(parent, name, NodeKind::File { encryption: None })
    }

    /// Remove a file or directory subtree.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let inode = self
            .resolve(path)
            .ok_or_else(|| ReencryptError::NotFound(path.to_string()))?;
        let parent = self
            .nodes
            .get(&inode)
            .and_then(|node| node.parent)
            .ok_or_else(|| {
                ReencryptError::Internal("cannot remove root".to_string())
            })?;
        let name = self.nodes[&inode].name.clone();
        if let NodeKind::Dir { children, .. } =
            &mut self.nodes.get_mut(&parent).expect("parent exists").kind
        {
            children.remove(&name);
        }
        self.drop_subtree(inode);
        Ok(())
    }

    fn drop_subtree(&mut self, inode: InodeId) {
        if let Some(node) = self.nodes.remove(&inode)
            && let NodeKind::Dir { children, .. } = node.kind
        {
            for child in children.into_values() {
                self.drop_subtree(child);
            }
        }
    }

    pub fn set_safe_mode(&mut self, on: bool) {
        self.safe_mode = on;
    }

    pub fn set_journal_pressure(&mut self, on: bool) {
        self.journal_pressure = on;
    }

    /// Freeze or unfreeze a zone for writes; frozen zones make the
    /// coordinator requeue.
    pub fn set_zone_frozen(&mut self, zone: ZoneId, frozen: bool) {
        if frozen {
            self.frozen_zones.insert(zone);
        } else {
            self.frozen_zones.remove(&zone);
        }
    }

    fn child_entry(&self, inode: InodeId) -> Option<ChildEntry> {
        let node = self.nodes.get(&inode)?;
        let kind = match &node.kind {
            NodeKind::Dir { ez_key_name, .. } => ChildKind::Directory {
                ez_root: ez_key_name.is_some(),
            },
            NodeKind::File { encryption } => ChildKind::File {
                encryption: encryption.clone(),
            },
        };
        Some(ChildEntry {
            name: node.name.clone(),
            inode,
            kind,
        })
    }
}

impl NamespaceTree for MemoryNamespace {
    fn zone_root_path(&self, zone: ZoneId) -> Option<String> {
        let inode = InodeId::from(zone);
        if self.is_encryption_zone_root(inode) {
            self.path_of(inode)
        } else {
            None
        }
    }

    fn ez_key_name(&self, zone: ZoneId) -> Option<String> {
        match &self.nodes.get(&InodeId::from(zone))?.kind {
            NodeKind::Dir { ez_key_name, .. } => ez_key_name.clone(),
            NodeKind::File { .. } => None,
        }
    }

    fn is_encryption_zone_root(&self, inode: InodeId) -> bool {
        matches!(
            self.nodes.get(&inode),
            Some(Node {
                kind: NodeKind::Dir {
                    ez_key_name: Some(_),
                    ..
                },
                ..
            })
        )
    }

    fn list_children(&self, dir: InodeId) -> Result<Vec<ChildEntry>> {
        match self.nodes.get(&dir) {
            Some(Node {
                kind: NodeKind::Dir { children, .. },
                ..
            }) => Ok(children
                .values()
                .filter_map(|child| self.child_entry(*child))
                .collect()),
            _ => Err(ReencryptError::NotFound(format!(
                "directory inode {dir}"
            ))),
        }
    }

    fn lookup(&self, dir: InodeId, name: &str) -> Option<ChildEntry> {
        match &self.nodes.get(&dir)?.kind {
            NodeKind::Dir { children, .. } => {
                self.child_entry(*children.get(name)?)
            }
            NodeKind::File { .. } => None,
        }
    }

    fn file_encryption_info(
        &self,
        file: InodeId,
    ) -> Option<FileEncryptionInfo> {
        match &self.nodes.get(&file)?.kind {
            NodeKind::File { encryption } => encryption.clone(),
            NodeKind::Dir { .. } => None,
        }
    }

    fn set_file_encryption_info(
        &mut self,
        file: InodeId,
        info: FileEncryptionInfo,
    ) -> Result<()> {
        match self.nodes.get_mut(&file) {
            Some(Node {
                kind: NodeKind::File { encryption },
                ..
            }) => {
                *encryption = Some(info);
                Ok(())
            }
            _ => Err(ReencryptError::NotFound(format!("file inode {file}"))),
        }
    }

    fn zone_status(&self, zone: ZoneId) -> Option<ZoneStatus> {
        self.statuses.get(&zone).cloned()
    }

    fn update_zone_status(
        &mut self,
        zone: ZoneId,
        status: &ZoneStatus,
    ) -> Result<()> {
        self.statuses.insert(zone, status.clone());
        Ok(())
    }

    fn reencryption_statuses(&self) -> Vec<(ZoneId, ZoneStatus)> {
        self.statuses
            .iter()
            .map(|(zone, status)| (*zone, status.clone()))
            .collect()
    }

    fn check_writable(&self, zone: ZoneId) -> Result<()> {
        if self.frozen_zones.contains(&zone) {
            Err(ReencryptError::RetryLater(format!(
                "zone {zone} is not writable"
            )))
        } else {
            Ok(())
        }
    }

    fn check_safe_mode(&self) -> Result<()> {
        if self.safe_mode {
            Err(ReencryptError::SafeMode)
        } else {
            Ok(())
        }
    }

    fn journal_pressure(&self) -> bool {
        self.journal_pressure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(version: &str) -> FileEncryptionInfo {
        FileEncryptionInfo::new("key", version, vec![1, 2, 3], vec![9])
    }

    fn tree() -> (MemoryNamespace, ZoneId) {
        let mut ns = MemoryNamespace::new();
        let zone = ns.make_zone("/zone", "key").expect("zone");
        ns.mkdir("/zone/sub").expect("dir");
        ns.add_encrypted_file("/zone/a", info("key@1")).expect("a");
        ns.add_encrypted_file("/zone/sub/b", info("key@1"))
            .expect("b");
        (ns, zone)
    }

    #[test]
    fn listing_is_sorted_by_name() {
        let (ns, zone) = tree();
        let names: Vec<_> = ns
            .list_children(InodeId::from(zone))
            .expect("list")
            .into_iter()
            .map(|child| child.name)
            .collect();
        assert_eq!(names, vec!["a".to_string(), "sub".to_string()]);
    }

    #[test]
    fn resolve_and_path_round_trip() {
        let (ns, _) = tree();
        let inode = ns.resolve("/zone/sub/b").expect("resolve");
        assert_eq!(ns.path_of(inode).as_deref(), Some("/zone/sub/b"));
    }

    #[test]
    fn remove_drops_the_subtree() {
        let (mut ns, _) = tree();
        ns.remove("/zone/sub").expect("remove");
        assert!(ns.resolve("/zone/sub/b").is_none());
        assert!(ns.resolve("/zone/a").is_some());
    }

    #[test]
    fn zone_accessors_require_ez_root() {
        let (ns, zone) = tree();
        assert_eq!(ns.zone_root_path(zone).as_deref(), Some("/zone"));
        assert_eq!(ns.ez_key_name(zone).as_deref(), Some("key"));
        let sub = ns.resolve("/zone/sub").expect("sub");
        assert!(!ns.is_encryption_zone_root(sub));
        assert!(ns.zone_root_path(ZoneId(sub.0)).is_none());
    }
}
