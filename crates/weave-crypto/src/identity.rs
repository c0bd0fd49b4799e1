use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::did;
use crate::error::CryptoError;
use crate::keychain::{Keychain, KEY_ED25519_PRIVATE, VAULT_IDENTITY};

pub const SIGNATURE_LEN: usize = 64;
pub const PUBLIC_KEY_LEN: usize = 32;

/// A device's cryptographic identity.
///
/// The Ed25519 keypair is the identity; the `did:key` string is derived from
/// the public half and never stored separately. Secret bytes only leave this
/// type on their way into a [`Keychain`].
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity from the OS entropy source.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| CryptoError::KeyGeneration(format!("entropy source failed: {e}")))?;
        let identity = Self::from_secret_bytes(&seed);
        seed.zeroize();
        Ok(identity)
    }

    /// Restore an identity from a 32-byte secret key.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// The `did:key` identifier for this identity.
    pub fn did(&self) -> String {
        did::did_from_public_key(&self.public_key_bytes())
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the secret key bytes (for the secure key storage).
    ///
    /// # Security
    /// Private key material; handle with care.
    pub fn secret_key_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    /// Sign raw bytes with Ed25519.
    pub fn sign(&self, payload: &[u8]) -> [u8; 64] {
        self.signing_key.sign(payload).to_bytes()
    }

    /// Verify an Ed25519 signature over raw bytes.
    ///
    /// Returns `Ok(false)` for a signature that does not verify. Lengths are
    /// checked before the primitive runs: a signature that is not 64 bytes or
    /// a key that is not 32 bytes (or not a curve point) is `InvalidArgument`.
    pub fn verify(payload: &[u8], signature: &[u8], public_key: &[u8]) -> Result<bool, CryptoError> {
        let sig_bytes: [u8; SIGNATURE_LEN] = signature.try_into().map_err(|_| {
            CryptoError::InvalidArgument(format!(
                "signature must be {SIGNATURE_LEN} bytes, got {}",
                signature.len()
            ))
        })?;
        let key_bytes: [u8; PUBLIC_KEY_LEN] = public_key.try_into().map_err(|_| {
            CryptoError::InvalidArgument(format!(
                "public key must be {PUBLIC_KEY_LEN} bytes, got {}",
                public_key.len()
            ))
        })?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| CryptoError::InvalidArgument(format!("invalid Ed25519 public key: {e}")))?;

        let signature = Signature::from_bytes(&sig_bytes);
        Ok(verifying_key.verify_strict(payload, &signature).is_ok())
    }

    /// Verify a signature made by the holder of `did`.
    pub fn verify_with_did(payload: &[u8], signature: &[u8], did: &str) -> Result<bool, CryptoError> {
        let public_key = did::resolve(did)?;
        Self::verify(payload, signature, &public_key)
    }

    /// Derive an X25519 static secret from this Ed25519 key for Diffie-Hellman.
    ///
    /// Uses the SHA-512-expanded scalar (same scalar that Ed25519 uses internally)
    /// so that `to_x25519_public()` matches `peer_ed25519_to_x25519()` via the
    /// standard Edwards→Montgomery map.
    pub fn to_x25519_secret(&self) -> x25519_dalek::StaticSecret {
        let scalar_bytes = self.signing_key.to_scalar_bytes();
        x25519_dalek::StaticSecret::from(scalar_bytes)
    }

    pub fn to_x25519_public(&self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(&self.to_x25519_secret())
    }

    /// Convert a peer's Ed25519 public key bytes to an X25519 public key.
    pub fn peer_ed25519_to_x25519(
        ed25519_public_bytes: &[u8; 32],
    ) -> Result<x25519_dalek::PublicKey, CryptoError> {
        let verifying_key = VerifyingKey::from_bytes(ed25519_public_bytes).map_err(|e| {
            CryptoError::InvalidArgument(format!("invalid Ed25519 public key: {e}"))
        })?;
        let montgomery = verifying_key.to_montgomery();
        Ok(x25519_dalek::PublicKey::from(montgomery.to_bytes()))
    }

    /// Write the secret key into the secure key storage.
    pub fn store_in(&self, keychain: &dyn Keychain) -> Result<(), CryptoError> {
        keychain.store_key(VAULT_IDENTITY, KEY_ED25519_PRIVATE, self.secret_key_bytes())
    }

    /// Load a previously stored identity. `Ok(None)` if none was stored yet.
    pub fn load_from(keychain: &dyn Keychain) -> Result<Option<Self>, CryptoError> {
        let Some(mut bytes) = keychain.load_key(VAULT_IDENTITY, KEY_ED25519_PRIVATE)? else {
            return Ok(None);
        };
        let secret: Result<[u8; 32], _> = bytes.as_slice().try_into();
        bytes.zeroize();
        let mut secret = secret
            .map_err(|_| CryptoError::StorageError("stored identity key is not 32 bytes".into()))?;
        let identity = Self::from_secret_bytes(&secret);
        secret.zeroize();
        Ok(Some(identity))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity").field("did", &self.did()).finish()
    }
}
