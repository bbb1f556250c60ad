//! Keywheel core: a re-encryption coordinator for hierarchical encrypted
//! namespaces.
//!
//! When an encryption zone's key is rotated, every file under the zone still
//! carries an EDEK wrapped by an old key version. [`reencrypt`] walks each
//! zone, re-wraps the EDEKs through an external KMS, and applies the results
//! back into the namespace with resumable, checkpointed progress.

pub mod error;
pub mod kms;
pub mod namespace;
pub mod reencrypt;

pub use error::{ReencryptError, Result};
pub use kms::KmsClient;
pub use namespace::{
    ChildEntry, ChildKind, MemoryNamespace, NamespaceTree, SharedNamespace,
};
pub use reencrypt::{ReencryptConfig, ReencryptRuntime};
