//! Compact JWS (`EdDSA`) for carrying signed assertions over text channels.
//!
//! `base64url(header) "." base64url(payload) "." base64url(signature)`, with the
//! header fixed to `{"alg":"EdDSA","typ":"JWT"}` and the signature computed
//! over the ASCII signing input `base64url(header) "." base64url(payload)`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::identity::Identity;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct JwsHeader {
    alg: String,
    typ: String,
}

const ALG: &str = "EdDSA";
const TYP: &str = "JWT";

/// The fixed header, serialized exactly as the other platforms emit it.
const HEADER_JSON: &str = r#"{"alg":"EdDSA","typ":"JWT"}"#;

/// Produce a compact JWS over `payload`.
pub fn sign_jws(identity: &Identity, payload: &[u8]) -> String {
    let header = URL_SAFE_NO_PAD.encode(HEADER_JSON);
    let body = URL_SAFE_NO_PAD.encode(payload);
    let signing_input = format!("{header}.{body}");
    let signature = identity.sign(signing_input.as_bytes());
    format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature))
}

/// Verify a compact JWS against an Ed25519 public key.
///
/// Returns `Ok(Some(payload))` if the signature validates and `Ok(None)` if it
/// does not. Structural problems (not exactly three parts, bad base64, a header
/// other than `EdDSA`/`JWT`, wrong signature length) are `InvalidArgument`.
pub fn verify_jws(token: &str, public_key: &[u8]) -> Result<Option<Vec<u8>>, CryptoError> {
    let parts: Vec<&str> = token.split('.').collect();
    let [header_b64, payload_b64, signature_b64] = parts.as_slice() else {
        return Err(CryptoError::InvalidArgument(format!(
            "JWS must have 3 dot-separated parts, got {}",
            parts.len()
        )));
    };

    let header_bytes = decode_part(header_b64, "header")?;
    let header: JwsHeader = serde_json::from_slice(&header_bytes)
        .map_err(|e| CryptoError::InvalidArgument(format!("JWS header is not valid JSON: {e}")))?;
    if header.alg != ALG || header.typ != TYP {
        return Err(CryptoError::InvalidArgument(format!(
            "unsupported JWS header alg={} typ={}",
            header.alg, header.typ
        )));
    }

    let payload = decode_part(payload_b64, "payload")?;
    let signature = decode_part(signature_b64, "signature")?;

    let signing_input = format!("{header_b64}.{payload_b64}");
    if Identity::verify(signing_input.as_bytes(), &signature, public_key)? {
        Ok(Some(payload))
    } else {
        tracing::debug!("JWS signature did not verify");
        Ok(None)
    }
}

/// Verify a compact JWS issued by the holder of `did`.
pub fn verify_jws_with_did(token: &str, did: &str) -> Result<Option<Vec<u8>>, CryptoError> {
    let public_key = crate::did::resolve(did)?;
    verify_jws(token, &public_key)
}

fn decode_part(part: &str, name: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|e| CryptoError::InvalidArgument(format!("JWS {name} is not base64url: {e}")))
}
