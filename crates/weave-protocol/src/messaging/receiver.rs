use crate::error::ProtocolError;
use crate::messaging::envelope::P2pMessage;

/// Parse and authenticate raw bytes received from `from_did`.
///
/// The wrapper's sender must match the transport-level sender. A present
/// signature must verify; an absent one is rejected when `require_signature`
/// is set.
pub fn process_incoming(
    from_did: &str,
    raw: &[u8],
    require_signature: bool,
) -> Result<P2pMessage, ProtocolError> {
    let message = P2pMessage::from_bytes(raw)?;

    if message.from_device_id != from_did {
        return Err(ProtocolError::Verification(format!(
            "message claims sender {} but arrived from {from_did}",
            message.from_device_id
        )));
    }

    if message.is_signed() {
        if !message.verify_signature()? {
            tracing::warn!(from = from_did, id = %message.id, "signature verification failed");
            return Err(ProtocolError::Verification("invalid message signature".into()));
        }
        tracing::trace!(from = from_did, id = %message.id, "signature verified");
    } else if require_signature {
        return Err(ProtocolError::Verification("unsigned message".into()));
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use weave_crypto::Identity;

    use super::*;
    use crate::messaging::envelope::MessageType;
    use crate::messaging::sender::build_message;

    #[test]
    fn accepts_signed_message_from_its_sender() {
        let alice = Identity::generate().unwrap();
        let message = build_message(&alice, "did:key:zB", MessageType::GroupMessage, &"hi", true).unwrap();
        let raw = message.to_bytes().unwrap();

        let parsed = process_incoming(&alice.did(), &raw, true).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn rejects_spoofed_sender() {
        let alice = Identity::generate().unwrap();
        let message = build_message(&alice, "did:key:zB", MessageType::GroupMessage, &"hi", true).unwrap();
        let raw = message.to_bytes().unwrap();
        assert!(matches!(
            process_incoming("did:key:zMallory", &raw, false),
            Err(ProtocolError::Verification(_))
        ));
    }

    #[test]
    fn unsigned_policy() {
        let alice = Identity::generate().unwrap();
        let message = build_message(&alice, "did:key:zB", MessageType::FileTransfer, &1u8, false).unwrap();
        let raw = message.to_bytes().unwrap();
        assert!(process_incoming(&alice.did(), &raw, false).is_ok());
        assert!(matches!(
            process_incoming(&alice.did(), &raw, true),
            Err(ProtocolError::Verification(_))
        ));
    }

    #[test]
    fn bad_signature_is_rejected() {
        let alice = Identity::generate().unwrap();
        let mut message = build_message(&alice, "did:key:zB", MessageType::FileTransfer, &1u8, true).unwrap();
        message.payload = "2".into();
        let raw = message.to_bytes().unwrap();
        assert!(matches!(
            process_incoming(&alice.did(), &raw, false),
            Err(ProtocolError::Verification(_))
        ));
    }
}
