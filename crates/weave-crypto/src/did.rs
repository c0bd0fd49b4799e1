//! `did:key` encoding for Ed25519 public keys.
//!
//! Layout: `did:key:z` + base58btc(`0xed 0x01` ‖ 32-byte public key). The byte
//! layout is shared with the Android and iOS clients and must not change.

use crate::error::CryptoError;

/// Method prefix including the multibase `z` (base58btc) marker.
pub const DID_KEY_PREFIX: &str = "did:key:z";

/// Multicodec varint for `ed25519-pub`.
pub const ED25519_MULTICODEC: [u8; 2] = [0xed, 0x01];

const PUBLIC_KEY_LEN: usize = 32;

/// Derive the `did:key` identifier for an Ed25519 public key.
pub fn did_from_public_key(public_key: &[u8; 32]) -> String {
    let mut bytes = Vec::with_capacity(ED25519_MULTICODEC.len() + PUBLIC_KEY_LEN);
    bytes.extend_from_slice(&ED25519_MULTICODEC);
    bytes.extend_from_slice(public_key);
    format!("{DID_KEY_PREFIX}{}", bs58::encode(bytes).into_string())
}

/// Resolve a `did:key` back to the raw Ed25519 public key, without network access.
///
/// Rejects a wrong method prefix, characters outside the base58btc alphabet,
/// a multicodec other than `ed25519-pub`, and any decoded key that is not
/// exactly 32 bytes.
pub fn resolve(did: &str) -> Result<[u8; 32], CryptoError> {
    let encoded = did
        .strip_prefix(DID_KEY_PREFIX)
        .ok_or_else(|| CryptoError::InvalidDid(format!("expected {DID_KEY_PREFIX} prefix")))?;
    if encoded.is_empty() {
        return Err(CryptoError::InvalidDid("empty method-specific id".into()));
    }

    let decoded = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| CryptoError::InvalidDid(format!("base58btc decode failed: {e}")))?;

    let Some(key_bytes) = decoded.strip_prefix(&ED25519_MULTICODEC) else {
        return Err(CryptoError::InvalidDid(
            "multicodec prefix is not ed25519-pub (0xed01)".into(),
        ));
    };

    <[u8; 32]>::try_from(key_bytes).map_err(|_| {
        CryptoError::InvalidDid(format!(
            "decoded key is {} bytes, expected {PUBLIC_KEY_LEN}",
            key_bytes.len()
        ))
    })
}

/// Whether `did` is a well-formed Ed25519 `did:key`.
pub fn is_valid(did: &str) -> bool {
    resolve(did).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed25519_dids_use_the_z6mk_prefix() {
        let did = did_from_public_key(&[7u8; 32]);
        assert!(did.starts_with("did:key:z6Mk"), "{did}");
    }

    #[test]
    fn resolve_returns_the_encoded_key() {
        let key = [0xabu8; 32];
        let did = did_from_public_key(&key);
        assert_eq!(resolve(&did).unwrap(), key);
        assert!(is_valid(&did));
    }

    #[test]
    fn rejects_other_methods() {
        assert!(matches!(
            resolve("did:web:example.com"),
            Err(CryptoError::InvalidDid(_))
        ));
        // base58 payload without the multibase marker
        let did = did_from_public_key(&[1u8; 32]);
        let no_marker = did.replacen("did:key:z", "did:key:", 1);
        assert!(resolve(&no_marker).is_err());
        assert!(resolve("did:key:z").is_err());
    }

    #[test]
    fn rejects_characters_outside_the_alphabet() {
        let did = did_from_public_key(&[2u8; 32]);
        // '0', 'O', 'I' and 'l' are not in the base58btc alphabet.
        let bad = format!("{}0", &did[..did.len() - 1]);
        assert!(matches!(resolve(&bad), Err(CryptoError::InvalidDid(_))));
    }

    #[test]
    fn rejects_wrong_length_without_truncating() {
        let mut long = ED25519_MULTICODEC.to_vec();
        long.extend_from_slice(&[9u8; 33]);
        let did = format!("{DID_KEY_PREFIX}{}", bs58::encode(&long).into_string());
        assert!(matches!(resolve(&did), Err(CryptoError::InvalidDid(_))));

        let mut short = ED25519_MULTICODEC.to_vec();
        short.extend_from_slice(&[9u8; 31]);
        let did = format!("{DID_KEY_PREFIX}{}", bs58::encode(&short).into_string());
        assert!(matches!(resolve(&did), Err(CryptoError::InvalidDid(_))));
    }

    #[test]
    fn rejects_non_ed25519_multicodec() {
        // 0xec01 is x25519-pub
        let mut bytes = vec![0xec, 0x01];
        bytes.extend_from_slice(&[3u8; 32]);
        let did = format!("{DID_KEY_PREFIX}{}", bs58::encode(&bytes).into_string());
        assert!(matches!(resolve(&did), Err(CryptoError::InvalidDid(_))));
    }
}
