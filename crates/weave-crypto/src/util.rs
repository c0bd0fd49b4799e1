use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CryptoError;

/// Fill an array from the OS entropy source, surfacing entropy failure.
pub(crate) fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    let mut bytes = [0u8; N];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CryptoError::KeyGeneration(format!("entropy source failed: {e}")))?;
    Ok(bytes)
}

/// Fresh X25519 secret from the OS entropy source.
pub(crate) fn random_x25519_secret() -> Result<x25519_dalek::StaticSecret, CryptoError> {
    let mut bytes = random_array::<32>()?;
    let secret = x25519_dalek::StaticSecret::from(bytes);
    zeroize::Zeroize::zeroize(&mut bytes);
    Ok(secret)
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Serde adapter carrying binary fields as standard base64 strings in JSON.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
