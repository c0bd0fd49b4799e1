use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use weave_crypto::Identity;

use crate::error::ProtocolError;
use crate::messaging::envelope::{MessageType, P2pMessage};
use crate::transport::Transport;

/// Upper bound on a single transport send.
///
/// Transports that queue internally can stall on a dead peer; failing fast lets
/// callers retry or surface the error.
const SEND_TIMEOUT: Duration = Duration::from_secs(8);

/// Build a message from the local identity, signed when `sign` is set.
pub fn build_message<T: Serialize>(
    identity: &Identity,
    to_did: &str,
    message_type: MessageType,
    body: &T,
    sign: bool,
) -> Result<P2pMessage, ProtocolError> {
    let mut message = P2pMessage::new(&identity.did(), to_did, message_type, body)?;
    if sign {
        message.sign(identity)?;
    }
    Ok(message)
}

/// Send a built message to its `to_device_id`.
pub async fn send_message(
    transport: &dyn Transport,
    message: &P2pMessage,
) -> Result<(), ProtocolError> {
    send_within(transport, message, SEND_TIMEOUT).await
}

async fn send_within(
    transport: &dyn Transport,
    message: &P2pMessage,
    limit: Duration,
) -> Result<(), ProtocolError> {
    let data = Bytes::from(message.to_bytes()?);
    let len = data.len();

    tokio::time::timeout(limit, transport.send(&message.to_device_id, data))
        .await
        .map_err(|_| ProtocolError::Timeout(format!("send to {}", message.to_device_id)))??;

    tracing::debug!(
        to = %message.to_device_id,
        kind = message.message_type.as_str(),
        id = %message.id,
        len,
        "message sent"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    /// A transport whose sends never complete.
    struct Stalled;

    #[async_trait]
    impl Transport for Stalled {
        async fn send(&self, _to_did: &str, _bytes: Bytes) -> Result<(), ProtocolError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stalled_send_is_a_timeout() {
        let identity = Identity::generate().unwrap();
        let body = serde_json::json!({});
        let message =
            build_message(&identity, "did:key:zPeer", MessageType::PrekeyBundleRequest, &body, true).unwrap();
        let result = send_within(&Stalled, &message, Duration::from_millis(20)).await;
        match result {
            Err(ProtocolError::Timeout(what)) => assert!(what.contains("did:key:zPeer")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
