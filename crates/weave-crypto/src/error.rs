use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid DID: {0}")]
    InvalidDid(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Malformed input (wrong length, bad encoding). Indicates a caller or
    /// protocol bug, never an adversarial signature.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("untrusted pre-key: {0}")]
    UntrustedPreKey(String),

    /// The message references a group key version we never had or already
    /// discarded. The caller should request a key re-sync.
    #[error("group key v{version} for {group_id} is not available")]
    KeyNotAvailable { group_id: String, version: u64 },

    #[error("security policy violation: {0}")]
    SecurityPolicyViolation(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("decryption failed: {0}")]
    DecryptionError(String),

    #[error("session error: {0}")]
    SessionError(String),

    #[error("prekey error: {0}")]
    PreKeyError(String),

    #[error("group error: {0}")]
    GroupError(String),

    #[error("key storage error: {0}")]
    StorageError(String),
}
