/// A wrapped (encrypted) data encryption key as handed to and returned from
/// the KMS. `version_name` names the zone key version the material was
/// wrapped under.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EncryptedKeyVersion {
    pub key_name: String,
    pub version_name: String,
    pub iv: Vec<u8>,
    pub material: Vec<u8>,
}

impl EncryptedKeyVersion {
    pub fn new(
        key_name: impl Into<String>,
        version_name: impl Into<String>,
        iv: Vec<u8>,
        material: Vec<u8>,
    ) -> Self {
        Self {
            key_name: key_name.into(),
            version_name: version_name.into(),
            iv,
            material,
        }
    }
}

/// Per-file encryption metadata stored alongside the inode.
///
/// `ez_key_version_name` records which zone key version the EDEK is wrapped
/// under; the re-encryption coordinator compares it against the zone's target
/// version to decide whether a file still needs re-wrapping.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileEncryptionInfo {
    pub key_name: String,
    pub ez_key_version_name: String,
    pub edek: Vec<u8>,
    pub iv: Vec<u8>,
}

impl FileEncryptionInfo {
    pub fn new(
        key_name: impl Into<String>,
        ez_key_version_name: impl Into<String>,
        edek: Vec<u8>,
        iv: Vec<u8>,
    ) -> Self {
        Self {
            key_name: key_name.into(),
            ez_key_version_name: ez_key_version_name.into(),
            edek,
            iv,
        }
    }

    /// The EDEK as an [`EncryptedKeyVersion`] suitable for a KMS call.
    pub fn encrypted_key_version(&self) -> EncryptedKeyVersion {
        EncryptedKeyVersion {
            key_name: self.key_name.clone(),
            version_name: self.ez_key_version_name.clone(),
            iv: self.iv.clone(),
            material: self.edek.clone(),
        }
    }

    /// Replace the wrapped key material with a freshly re-wrapped version.
    pub fn rewrapped(&self, new_edek: &EncryptedKeyVersion) -> Self {
        Self {
            key_name: self.key_name.clone(),
            ez_key_version_name: new_edek.version_name.clone(),
            edek: new_edek.material.clone(),
            iv: new_edek.iv.clone(),
        }
    }
}
