use crate::CryptoError;

/// Secure key storage for private key material.
///
/// Each platform binding implements this over its own secure enclave
/// (Android Keystore, iOS Keychain, an encrypted vault on desktop). The
/// crypto crate only defines the trait.
pub trait Keychain: Send + Sync {
    /// Store a key under a vault/key pair.
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError>;

    /// Retrieve a key from a vault/key pair.
    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    /// Delete a key from a vault/key pair.
    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError>;

    /// Check if a key exists.
    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError>;
}

// Vault and key names shared by every platform binding.

/// Vault for identity keys.
pub const VAULT_IDENTITY: &str = "identity";
/// Ed25519 signing private key.
pub const KEY_ED25519_PRIVATE: &str = "ed25519_private";

/// Vault for pre-key material.
pub const VAULT_PREKEYS: &str = "prekeys";
/// Current signed pre-key (secret + signed public record).
pub const KEY_SIGNED_PREKEY: &str = "signed_prekey";
/// Signed pre-key that was replaced by the last rotation.
pub const KEY_PREVIOUS_SIGNED_PREKEY: &str = "previous_signed_prekey";
/// Pool of one-time pre-keys.
pub const KEY_PREKEY_BATCH: &str = "prekey_batch";

/// Vault for group keys.
pub const VAULT_GROUPS: &str = "groups";

/// Key name for the current group key of a group.
pub fn group_key_name(group_id: &str) -> String {
    format!("group_key_{group_id}")
}
