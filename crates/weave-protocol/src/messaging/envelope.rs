use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use weave_crypto::{now_millis, Identity};

use crate::error::ProtocolError;

/// What a [`P2pMessage`] payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Ask a peer for a pre-key bundle (empty payload).
    PrekeyBundleRequest,
    PrekeyBundle,
    /// Initiator half of the session handshake.
    SessionInit,
    KeyDistribution,
    GroupMessage,
    FileTransfer,
    WebrtcSignaling,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrekeyBundleRequest => "PREKEY_BUNDLE_REQUEST",
            Self::PrekeyBundle => "PREKEY_BUNDLE",
            Self::SessionInit => "SESSION_INIT",
            Self::KeyDistribution => "KEY_DISTRIBUTION",
            Self::GroupMessage => "GROUP_MESSAGE",
            Self::FileTransfer => "FILE_TRANSFER",
            Self::WebrtcSignaling => "WEBRTC_SIGNALING",
        }
    }
}

/// Generic wrapper for everything sent over the transport.
///
/// `payload` is the JSON text of the type-specific body. The optional
/// signature is Ed25519 by the sender over `id || timestamp || type || payload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct P2pMessage {
    pub id: String,
    /// Sender DID.
    pub from_device_id: String,
    /// Recipient DID.
    pub to_device_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: String,
    /// Unix milliseconds.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl P2pMessage {
    /// Wrap a serializable body addressed from `from_did` to `to_did`.
    pub fn new<T: Serialize>(
        from_did: &str,
        to_did: &str,
        message_type: MessageType,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_string(body)
            .map_err(|e| ProtocolError::Serialization(format!("{} payload: {e}", message_type.as_str())))?;
        let mut id = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut id);
        Ok(Self {
            id: hex::encode(id),
            from_device_id: from_did.to_string(),
            to_device_id: to_did.to_string(),
            message_type,
            payload,
            timestamp: now_millis(),
            signature: None,
        })
    }

    /// Sign with the sender's identity. The identity must own `from_device_id`.
    pub fn sign(&mut self, identity: &Identity) -> Result<(), ProtocolError> {
        if identity.did() != self.from_device_id {
            return Err(ProtocolError::Verification(
                "signing identity does not match the sender".into(),
            ));
        }
        let signature = identity.sign(&self.signing_input());
        self.signature = Some(URL_SAFE_NO_PAD.encode(signature));
        Ok(())
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Check the signature against the key behind `from_device_id`.
    ///
    /// `Ok(false)` for an unsigned message or a signature that does not
    /// verify; malformed DIDs or encodings are errors.
    pub fn verify_signature(&self) -> Result<bool, ProtocolError> {
        let Some(encoded) = &self.signature else {
            return Ok(false);
        };
        let signature = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| ProtocolError::Verification(format!("signature is not base64url: {e}")))?;
        let public_key = weave_crypto::did::resolve(&self.from_device_id)?;
        Ok(Identity::verify(&self.signing_input(), &signature, &public_key)?)
    }

    /// `id || timestamp (8 BE) || type || payload`.
    fn signing_input(&self) -> Vec<u8> {
        let type_str = self.message_type.as_str();
        let mut input =
            Vec::with_capacity(self.id.len() + 8 + type_str.len() + self.payload.len());
        input.extend_from_slice(self.id.as_bytes());
        input.extend_from_slice(&self.timestamp.to_be_bytes());
        input.extend_from_slice(type_str.as_bytes());
        input.extend_from_slice(self.payload.as_bytes());
        input
    }

    /// Decode the type-specific body.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_str(&self.payload).map_err(|e| {
            ProtocolError::Deserialization(format!("{} payload: {e}", self.message_type.as_str()))
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(format!("message: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::Deserialization(format!("message: {e}")))
    }
}

/// Empty body of a `PREKEY_BUNDLE_REQUEST`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundleRequest {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Body {
        text: String,
    }

    fn body() -> Body {
        Body { text: "hello".into() }
    }

    #[test]
    fn wire_shape() {
        let message = P2pMessage::new("did:key:zA", "did:key:zB", MessageType::WebrtcSignaling, &body()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&message.to_bytes().unwrap()).unwrap();

        assert_eq!(json["type"], "WEBRTC_SIGNALING");
        assert_eq!(json["fromDeviceId"], "did:key:zA");
        assert_eq!(json["toDeviceId"], "did:key:zB");
        assert_eq!(json["payload"], r#"{"text":"hello"}"#);
        assert!(json.get("signature").is_none());
        assert_eq!(message.id.len(), 32);
    }

    #[test]
    fn signed_message_verifies() {
        let alice = Identity::generate().unwrap();
        let mut message = P2pMessage::new(&alice.did(), "did:key:zB", MessageType::GroupMessage, &body()).unwrap();
        assert!(!message.verify_signature().unwrap());

        message.sign(&alice).unwrap();
        let decoded = P2pMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();
        assert!(decoded.verify_signature().unwrap());
        assert_eq!(decoded.body::<Body>().unwrap(), body());
    }

    #[test]
    fn tampering_breaks_the_signature() {
        let alice = Identity::generate().unwrap();
        let mut message = P2pMessage::new(&alice.did(), "did:key:zB", MessageType::FileTransfer, &body()).unwrap();
        message.sign(&alice).unwrap();

        let mut payload_changed = message.clone();
        payload_changed.payload = r#"{"text":"bye"}"#.into();
        assert!(!payload_changed.verify_signature().unwrap());

        let mut type_changed = message.clone();
        type_changed.message_type = MessageType::GroupMessage;
        assert!(!type_changed.verify_signature().unwrap());

        let mut replayed = message;
        replayed.timestamp += 1;
        assert!(!replayed.verify_signature().unwrap());
    }

    #[test]
    fn cannot_sign_for_someone_else() {
        let alice = Identity::generate().unwrap();
        let mut message = P2pMessage::new("did:key:zOther", "did:key:zB", MessageType::GroupMessage, &body()).unwrap();
        assert!(matches!(message.sign(&alice), Err(ProtocolError::Verification(_))));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            P2pMessage::from_bytes(b"{not json"),
            Err(ProtocolError::Deserialization(_))
        ));
        let message = P2pMessage::new("a", "b", MessageType::SessionInit, &body()).unwrap();
        assert!(message.body::<Vec<u32>>().is_err());
    }
}
