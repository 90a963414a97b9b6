//! Credential envelope contract.
//!
//! API secrets are stored encrypted with a per-user data-encryption key,
//! which is itself encrypted with the process master key. The engine only
//! depends on this trait; the concrete cipher lives with the key-management
//! service that owns the master key.

use crate::error::EngineError;

pub trait CredentialCipher: Send + Sync {
    /// Decrypts the user's DEK with the master key, then the API secret
    /// with the DEK.
    fn decrypt_secret(
        &self,
        encrypted_dek: &str,
        encrypted_secret: &str,
    ) -> Result<String, EngineError>;
}

/// Pass-through cipher for development and tests, where secrets are stored
/// unencrypted. Never wire this against a production credential store.
pub struct PassthroughCipher;

impl CredentialCipher for PassthroughCipher {
    fn decrypt_secret(
        &self,
        _encrypted_dek: &str,
        encrypted_secret: &str,
    ) -> Result<String, EngineError> {
        Ok(encrypted_secret.to_string())
    }
}
