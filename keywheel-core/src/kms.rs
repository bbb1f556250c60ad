use async_trait::async_trait;

use keywheel_model::EncryptedKeyVersion;

use crate::error::Result;

/// Client for the external Key Management Service.
///
/// The client owns its transport, authentication, and retry policy; the
/// coordinator never retries on top of it. Implementations must be safe to
/// call concurrently from every pool worker.
#[async_trait]
pub trait KmsClient: Send + Sync {
    /// Re-wrap a batch of EDEKs under the current version of their zone key.
    ///
    /// All-or-nothing: on success the returned vector has exactly one entry
    /// per input, in order. Any shortfall or error counts the whole batch
    /// as failed.
    async fn reencrypt_encrypted_keys(
        &self,
        edeks: Vec<EncryptedKeyVersion>,
    ) -> Result<Vec<EncryptedKeyVersion>>;

    /// Drop cached EDEKs generated under older versions of `key_name`, so
    /// new files immediately pick up the rotated key.
    async fn drain_encrypted_keys(&self, key_name: &str) -> Result<()>;
}
