//! The P2P send primitive everything in this crate rides on.
//!
//! NAT traversal and the actual socket/data-channel plumbing live behind
//! [`Transport`]. Inbound traffic arrives on an mpsc channel of
//! [`InboundMessage`]s that the node drains in its dispatch loop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::ProtocolError;

/// Capacity of each loopback inbox.
const INBOX_CAPACITY: usize = 256;

/// Raw bytes received from a peer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from_did: String,
    pub bytes: Bytes,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `bytes` to the peer identified by `to_did`.
    async fn send(&self, to_did: &str, bytes: Bytes) -> Result<(), ProtocolError>;
}

/// In-process hub connecting [`LoopbackTransport`]s by DID.
///
/// Used by tests and the demo binary in place of a real network.
#[derive(Default)]
pub struct LoopbackNetwork {
    inboxes: RwLock<HashMap<String, mpsc::Sender<InboundMessage>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a peer, returning its transport and inbound channel.
    ///
    /// Re-registering a DID replaces the previous inbox.
    pub fn register(self: &Arc<Self>, did: &str) -> (Arc<LoopbackTransport>, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.inboxes.write().insert(did.to_string(), tx);
        let transport = Arc::new(LoopbackTransport {
            local_did: did.to_string(),
            network: Arc::clone(self),
        });
        (transport, rx)
    }

    /// Detach a peer; sends to it fail with `TransportUnavailable`.
    pub fn disconnect(&self, did: &str) {
        self.inboxes.write().remove(did);
    }
}

pub struct LoopbackTransport {
    local_did: String,
    network: Arc<LoopbackNetwork>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, to_did: &str, bytes: Bytes) -> Result<(), ProtocolError> {
        let inbox = self
            .network
            .inboxes
            .read()
            .get(to_did)
            .cloned()
            .ok_or_else(|| ProtocolError::TransportUnavailable(format!("no route to {to_did}")))?;

        let len = bytes.len();
        inbox
            .send(InboundMessage {
                from_did: self.local_did.clone(),
                bytes,
            })
            .await
            .map_err(|_| ProtocolError::TransportUnavailable(format!("{to_did} went away")))?;
        tracing::trace!(to = to_did, len, "loopback delivery");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_with_sender_identity() {
        let network = LoopbackNetwork::new();
        let (alice, _alice_rx) = network.register("did:key:zA");
        let (_bob, mut bob_rx) = network.register("did:key:zB");

        alice.send("did:key:zB", Bytes::from_static(b"ping")).await.unwrap();
        let received = bob_rx.recv().await.unwrap();
        assert_eq!(received.from_did, "did:key:zA");
        assert_eq!(&received.bytes[..], b"ping");
    }

    #[tokio::test]
    async fn unknown_or_disconnected_peer_is_unavailable() {
        let network = LoopbackNetwork::new();
        let (alice, _rx) = network.register("did:key:zA");
        assert!(matches!(
            alice.send("did:key:zNobody", Bytes::new()).await,
            Err(ProtocolError::TransportUnavailable(_))
        ));

        let (_bob, _bob_rx) = network.register("did:key:zB");
        network.disconnect("did:key:zB");
        assert!(matches!(
            alice.send("did:key:zB", Bytes::new()).await,
            Err(ProtocolError::TransportUnavailable(_))
        ));
    }
}
