use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::util::{now_millis, random_array};

const NONCE_LEN: usize = 12;
const WIRE_LEN: usize = 40;

/// Symmetric key for one version of a group.
///
/// Handed to members through their pairwise sessions and replaced whenever the
/// roster shrinks. The version is monotonic per group and bound into every
/// ciphertext as associated data.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct GroupKey {
    #[zeroize(skip)]
    group_id: String,
    #[zeroize(skip)]
    version: u64,
    key: [u8; 32],
    #[zeroize(skip)]
    created_at: u64,
    #[zeroize(skip)]
    creator: String,
}

impl GroupKey {
    /// Generate a fresh random key.
    pub fn generate(group_id: &str, version: u64, creator: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            group_id: group_id.to_string(),
            version,
            key: random_array::<32>()?,
            created_at: now_millis(),
            creator: creator.to_string(),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn creator(&self) -> &str {
        &self.creator
    }

    /// Serialize to the 40-byte distribution format: version (8 LE) + key (32).
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(WIRE_LEN);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf
    }

    /// Rebuild a key received from `creator`. Returns `None` unless exactly 40 bytes.
    pub fn from_wire_bytes(group_id: &str, bytes: &[u8], creator: &str, created_at: u64) -> Option<Self> {
        if bytes.len() != WIRE_LEN {
            return None;
        }
        let version = u64::from_le_bytes(bytes[..8].try_into().ok()?);
        let key: [u8; 32] = bytes[8..].try_into().ok()?;
        Some(Self {
            group_id: group_id.to_string(),
            version,
            key,
            created_at,
            creator: creator.to_string(),
        })
    }

    /// Encrypt with AES-256-GCM. `context` is authenticated alongside the
    /// group id and version.
    ///
    /// Output is `[12-byte nonce || ciphertext || tag]`.
    pub fn encrypt(&self, plaintext: &[u8], context: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        let nonce_bytes = random_array::<NONCE_LEN>()?;
        let aad = self.aad(context);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        let mut output = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    /// Decrypt data produced by [`GroupKey::encrypt`] with the same context.
    pub fn decrypt(&self, data: &[u8], context: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_LEN {
            return Err(CryptoError::DecryptionError("data too short".into()));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;

        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let aad = self.aad(context);
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))
    }

    fn aad(&self, context: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.group_id.len() + 9 + context.len());
        aad.extend_from_slice(self.group_id.as_bytes());
        aad.push(0);
        aad.extend_from_slice(&self.version.to_be_bytes());
        aad.extend_from_slice(context);
        aad
    }
}

impl std::fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupKey")
            .field("group_id", &self.group_id)
            .field("version", &self.version)
            .field("creator", &self.creator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt() {
        let key = GroupKey::generate("g1", 1, "did:key:zcreator").unwrap();
        let encrypted = key.encrypt(b"hello group", b"ctx").unwrap();
        assert_eq!(key.decrypt(&encrypted, b"ctx").unwrap(), b"hello group");
        assert!(key.decrypt(&encrypted, b"other").is_err());
    }

    #[test]
    fn version_is_authenticated() {
        let key = GroupKey::generate("g1", 1, "c").unwrap();
        let encrypted = key.encrypt(b"m", b"").unwrap();

        let wire = key.to_wire_bytes();
        let mut relabelled = wire.clone();
        relabelled[..8].copy_from_slice(&2u64.to_le_bytes());
        let same_bytes_v2 = GroupKey::from_wire_bytes("g1", &relabelled, "c", 0).unwrap();
        assert!(same_bytes_v2.decrypt(&encrypted, b"").is_err());

        let other_group = GroupKey::from_wire_bytes("g2", &wire, "c", 0).unwrap();
        assert!(other_group.decrypt(&encrypted, b"").is_err());
    }

    #[test]
    fn wire_bytes_restore_key() {
        let key = GroupKey::generate("g1", 42, "c").unwrap();
        let wire = key.to_wire_bytes();
        assert_eq!(wire.len(), 40);

        let restored = GroupKey::from_wire_bytes("g1", &wire, "c", key.created_at()).unwrap();
        assert_eq!(restored.version(), 42);
        let encrypted = key.encrypt(b"m", b"").unwrap();
        assert_eq!(restored.decrypt(&encrypted, b"").unwrap(), b"m");
    }

    #[test]
    fn wire_bytes_wrong_length() {
        assert!(GroupKey::from_wire_bytes("g", &[0u8; 39], "c", 0).is_none());
        assert!(GroupKey::from_wire_bytes("g", &[0u8; 41], "c", 0).is_none());
        assert!(GroupKey::from_wire_bytes("g", &[], "c", 0).is_none());
    }

    #[test]
    fn debug_hides_key() {
        let key = GroupKey::generate("g1", 1, "c").unwrap();
        let shown = format!("{key:?}");
        assert!(!shown.contains(&hex::encode(key.key)));
    }
}
