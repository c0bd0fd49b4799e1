use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use weave_crypto::Identity;

use super::{
    Hangup, IceCandidate, IceServer, IceServerConfig, PeerConnectionState, Reject,
    SessionDescription, SignalType, SignalingEnvelope,
};
use crate::error::ProtocolError;
use crate::messaging::{build_message, send_message, MessageType, P2pMessage};
use crate::transport::Transport;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignalingConfig {
    pub ice: IceServerConfig,
    /// How long a peer may stay `Connecting` before it fails with "timeout".
    pub connect_timeout_secs: u64,
    /// Candidates held per peer while waiting for the offer or answer.
    pub max_buffered_candidates: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            ice: IceServerConfig::default(),
            connect_timeout_secs: 30,
            max_buffered_candidates: 64,
        }
    }
}

impl SignalingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// What the media layer needs to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    OfferReceived {
        peer: String,
        description: SessionDescription,
    },
    AnswerReceived {
        peer: String,
        description: SessionDescription,
    },
    IceCandidate {
        peer: String,
        candidate: IceCandidate,
    },
    StateChanged {
        peer: String,
        state: PeerConnectionState,
    },
    /// Tear down media and data channels for this peer.
    ReleaseResources { peer: String },
}

struct PeerSignal {
    state: PeerConnectionState,
    /// We sent the offer.
    outbound: bool,
    /// Remote candidates that arrived before their offer/answer.
    buffered: VecDeque<IceCandidate>,
    /// Bumped on every transition so a stale timer cannot fire.
    generation: u64,
    timeout: Option<JoinHandle<()>>,
}

impl Default for PeerSignal {
    fn default() -> Self {
        Self {
            state: PeerConnectionState::Idle,
            outbound: false,
            buffered: VecDeque::new(),
            generation: 0,
            timeout: None,
        }
    }
}

struct Shared {
    peers: Mutex<HashMap<String, PeerSignal>>,
    events: mpsc::Sender<SignalingEvent>,
}

impl Shared {
    fn emit(&self, event: SignalingEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::warn!(error = %e, "signaling event dropped");
        }
    }

    /// Apply a transition if legal, cancelling any pending timer.
    fn transition(&self, peer: &str, entry: &mut PeerSignal, next: PeerConnectionState) -> bool {
        if !entry.state.can_transition_to(&next) {
            tracing::warn!(peer, from = ?entry.state, to = ?next, "illegal signaling transition ignored");
            return false;
        }
        if let Some(timer) = entry.timeout.take() {
            timer.abort();
        }
        entry.generation += 1;
        tracing::debug!(peer, from = ?entry.state, to = ?next, "peer connection state");
        entry.state = next.clone();

        let terminal = next.is_terminal();
        self.emit(SignalingEvent::StateChanged {
            peer: peer.to_string(),
            state: next,
        });
        if terminal {
            entry.buffered.clear();
            self.emit(SignalingEvent::ReleaseResources {
                peer: peer.to_string(),
            });
        }
        true
    }

    fn release_buffered(&self, peer: &str, entry: &mut PeerSignal) {
        for candidate in entry.buffered.drain(..) {
            self.emit(SignalingEvent::IceCandidate {
                peer: peer.to_string(),
                candidate,
            });
        }
    }
}

/// Relays WebRTC signaling and tracks per-peer connection state.
pub struct SignalingService {
    identity: Arc<Identity>,
    transport: Arc<dyn Transport>,
    ice: RwLock<IceServerConfig>,
    connect_timeout: Duration,
    max_buffered_candidates: usize,
    shared: Arc<Shared>,
}

impl SignalingService {
    pub fn new(
        identity: Arc<Identity>,
        transport: Arc<dyn Transport>,
        config: &SignalingConfig,
    ) -> (Arc<Self>, mpsc::Receiver<SignalingEvent>) {
        Self::with_connect_timeout(identity, transport, config, config.connect_timeout())
    }

    /// Like [`new`](Self::new) with an explicit connect timeout.
    pub fn with_connect_timeout(
        identity: Arc<Identity>,
        transport: Arc<dyn Transport>,
        config: &SignalingConfig,
        connect_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<SignalingEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let service = Arc::new(Self {
            identity,
            transport,
            ice: RwLock::new(config.ice.clone()),
            connect_timeout,
            max_buffered_candidates: config.max_buffered_candidates,
            shared: Arc::new(Shared {
                peers: Mutex::new(HashMap::new()),
                events,
            }),
        });
        (service, rx)
    }

    pub fn state(&self, peer: &str) -> PeerConnectionState {
        self.shared
            .peers
            .lock()
            .get(peer)
            .map_or(PeerConnectionState::Idle, |e| e.state.clone())
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.ice.read().servers()
    }

    pub fn candidate_pool_size(&self) -> u8 {
        self.ice.read().candidate_pool_size()
    }

    /// Edit the ICE server set in place.
    pub fn update_ice<R>(&self, f: impl FnOnce(&mut IceServerConfig) -> R) -> R {
        f(&mut self.ice.write())
    }

    pub async fn send_offer(&self, to: &str, sdp: &str) -> Result<(), ProtocolError> {
        {
            let mut peers = self.shared.peers.lock();
            let entry = peers.entry(to.to_string()).or_default();
            if !entry.state.can_transition_to(&PeerConnectionState::Connecting) {
                return Err(ProtocolError::InvalidState(format!(
                    "cannot offer to {to} while {:?}",
                    entry.state
                )));
            }
            self.shared.transition(to, entry, PeerConnectionState::Connecting);
            entry.outbound = true;
            self.arm_timeout(to, entry);
        }
        let description = SessionDescription {
            sdp_type: "offer".into(),
            sdp: sdp.to_string(),
        };
        self.send_or_fail(to, SignalType::Offer, &description).await
    }

    /// Answer a received offer. The local side is connected once the answer is out.
    pub async fn send_answer(&self, to: &str, sdp: &str) -> Result<(), ProtocolError> {
        {
            let mut peers = self.shared.peers.lock();
            let entry = peers
                .get_mut(to)
                .filter(|e| e.state == PeerConnectionState::Connecting && !e.outbound)
                .ok_or_else(|| ProtocolError::InvalidState(format!("no pending offer from {to}")))?;
            self.shared.transition(
                to,
                entry,
                PeerConnectionState::Connected {
                    peer: to.to_string(),
                },
            );
        }
        let description = SessionDescription {
            sdp_type: "answer".into(),
            sdp: sdp.to_string(),
        };
        self.send_or_fail(to, SignalType::Answer, &description).await
    }

    /// Relay a local candidate. Refused until an offer/answer context exists.
    pub async fn send_ice_candidate(
        &self,
        to: &str,
        candidate: &IceCandidate,
    ) -> Result<(), ProtocolError> {
        if !self.state(to).has_exchange_context() {
            return Err(ProtocolError::InvalidState(format!(
                "no offer/answer exchange with {to}"
            )));
        }
        self.send_envelope(to, SignalType::IceCandidate, candidate).await
    }

    pub async fn send_hangup(&self, to: &str, reason: Option<&str>) -> Result<(), ProtocolError> {
        {
            let mut peers = self.shared.peers.lock();
            let entry = peers
                .get_mut(to)
                .filter(|e| e.state.has_exchange_context())
                .ok_or_else(|| ProtocolError::InvalidState(format!("no call with {to}")))?;
            self.shared.transition(
                to,
                entry,
                PeerConnectionState::Disconnected {
                    reason: "local hangup".into(),
                },
            );
        }
        let body = Hangup {
            reason: reason.map(str::to_string),
        };
        self.send_envelope(to, SignalType::Hangup, &body).await
    }

    /// Decline a received offer.
    pub async fn send_reject(&self, to: &str, reason: &str) -> Result<(), ProtocolError> {
        {
            let mut peers = self.shared.peers.lock();
            let entry = peers
                .get_mut(to)
                .filter(|e| e.state == PeerConnectionState::Connecting && !e.outbound)
                .ok_or_else(|| ProtocolError::InvalidState(format!("no pending offer from {to}")))?;
            self.shared.transition(
                to,
                entry,
                PeerConnectionState::Disconnected {
                    reason: format!("rejected: {reason}"),
                },
            );
        }
        let body = Reject {
            reason: reason.to_string(),
        };
        self.send_envelope(to, SignalType::Reject, &body).await
    }

    /// The underlying transport to `peer` went away.
    pub fn transport_lost(&self, peer: &str) {
        let mut peers = self.shared.peers.lock();
        if let Some(entry) = peers.get_mut(peer).filter(|e| e.state.has_exchange_context()) {
            self.shared.transition(
                peer,
                entry,
                PeerConnectionState::Disconnected {
                    reason: "transport lost".into(),
                },
            );
        }
    }

    /// Forget a peer, returning it to `Idle`.
    pub fn reset(&self, peer: &str) {
        if let Some(mut entry) = self.shared.peers.lock().remove(peer) {
            if let Some(timer) = entry.timeout.take() {
                timer.abort();
            }
        }
    }

    /// Handle a `WEBRTC_SIGNALING` message. Malformed input is logged and dropped.
    pub fn handle_message(&self, from: &str, message: &P2pMessage) {
        match message.body::<SignalingEnvelope>() {
            Ok(envelope) => self.handle_envelope(from, envelope),
            Err(e) => tracing::warn!(peer = from, error = %e, "malformed signaling envelope dropped"),
        }
    }

    pub fn handle_envelope(&self, from: &str, envelope: SignalingEnvelope) {
        if envelope.from_did != from {
            tracing::warn!(peer = from, claimed = %envelope.from_did, "signaling sender mismatch, dropped");
            return;
        }
        let result = match envelope.signal_type {
            SignalType::Offer => decode(envelope.data).map(|d| self.on_offer(from, d)),
            SignalType::Answer => decode(envelope.data).map(|d| self.on_answer(from, d)),
            SignalType::IceCandidate => decode(envelope.data).map(|c| self.on_candidate(from, c)),
            SignalType::Hangup => decode::<Hangup>(envelope.data).map(|h| self.on_hangup(from, h)),
            SignalType::Reject => decode::<Reject>(envelope.data).map(|r| self.on_reject(from, r)),
        };
        if let Err(e) = result {
            tracing::warn!(peer = from, kind = ?envelope.signal_type, error = %e, "malformed signaling data dropped");
        }
    }

    /// Cancel every pending timer and forget all peers.
    pub fn shutdown(&self) {
        let mut peers = self.shared.peers.lock();
        for entry in peers.values_mut() {
            if let Some(timer) = entry.timeout.take() {
                timer.abort();
            }
        }
        peers.clear();
        tracing::debug!("signaling service stopped");
    }

    fn on_offer(&self, from: &str, description: SessionDescription) {
        let mut peers = self.shared.peers.lock();
        let entry = peers.entry(from.to_string()).or_default();
        if entry.state.has_exchange_context() {
            tracing::warn!(peer = from, state = ?entry.state, "offer during an active exchange dropped");
            return;
        }
        self.shared.transition(from, entry, PeerConnectionState::Connecting);
        entry.outbound = false;
        self.arm_timeout(from, entry);
        self.shared.emit(SignalingEvent::OfferReceived {
            peer: from.to_string(),
            description,
        });
        self.shared.release_buffered(from, entry);
    }

    fn on_answer(&self, from: &str, description: SessionDescription) {
        let mut peers = self.shared.peers.lock();
        let Some(entry) = peers
            .get_mut(from)
            .filter(|e| e.state == PeerConnectionState::Connecting && e.outbound)
        else {
            tracing::warn!(peer = from, "answer without a pending offer dropped");
            return;
        };
        self.shared.transition(
            from,
            entry,
            PeerConnectionState::Connected {
                peer: from.to_string(),
            },
        );
        self.shared.emit(SignalingEvent::AnswerReceived {
            peer: from.to_string(),
            description,
        });
        self.shared.release_buffered(from, entry);
    }

    fn on_candidate(&self, from: &str, candidate: IceCandidate) {
        let mut peers = self.shared.peers.lock();
        let entry = peers.entry(from.to_string()).or_default();
        if entry.state.has_exchange_context() {
            self.shared.emit(SignalingEvent::IceCandidate {
                peer: from.to_string(),
                candidate,
            });
        } else if self.max_buffered_candidates == 0 {
            tracing::debug!(peer = from, "early candidate dropped, buffering disabled");
        } else {
            if entry.buffered.len() >= self.max_buffered_candidates {
                tracing::warn!(peer = from, "candidate buffer full, dropping oldest");
                entry.buffered.pop_front();
            }
            entry.buffered.push_back(candidate);
        }
    }

    fn on_hangup(&self, from: &str, hangup: Hangup) {
        let mut peers = self.shared.peers.lock();
        if let Some(entry) = peers.get_mut(from).filter(|e| e.state.has_exchange_context()) {
            let reason = hangup.reason.unwrap_or_else(|| "remote hangup".into());
            self.shared
                .transition(from, entry, PeerConnectionState::Disconnected { reason });
        }
    }

    fn on_reject(&self, from: &str, reject: Reject) {
        let mut peers = self.shared.peers.lock();
        if let Some(entry) = peers
            .get_mut(from)
            .filter(|e| e.state == PeerConnectionState::Connecting)
        {
            self.shared.transition(
                from,
                entry,
                PeerConnectionState::Failed {
                    error: reject.reason,
                },
            );
        }
    }

    fn arm_timeout(&self, peer: &str, entry: &mut PeerSignal) {
        let shared = Arc::clone(&self.shared);
        let peer = peer.to_string();
        let generation = entry.generation;
        let timeout = self.connect_timeout;
        entry.timeout = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut peers = shared.peers.lock();
            if let Some(entry) = peers.get_mut(&peer) {
                if entry.generation == generation && entry.state == PeerConnectionState::Connecting {
                    entry.timeout = None;
                    tracing::warn!(peer = %peer, "connection attempt timed out");
                    shared.transition(
                        &peer,
                        entry,
                        PeerConnectionState::Failed {
                            error: "timeout".into(),
                        },
                    );
                }
            }
        }));
    }

    async fn send_or_fail<T: Serialize>(
        &self,
        to: &str,
        signal_type: SignalType,
        data: &T,
    ) -> Result<(), ProtocolError> {
        let result = self.send_envelope(to, signal_type, data).await;
        if let Err(e) = &result {
            let mut peers = self.shared.peers.lock();
            if let Some(entry) = peers.get_mut(to) {
                self.shared.transition(
                    to,
                    entry,
                    PeerConnectionState::Failed {
                        error: e.to_string(),
                    },
                );
            }
        }
        result
    }

    async fn send_envelope<T: Serialize>(
        &self,
        to: &str,
        signal_type: SignalType,
        data: &T,
    ) -> Result<(), ProtocolError> {
        let envelope = SignalingEnvelope {
            signal_type,
            data: serde_json::to_value(data)
                .map_err(|e| ProtocolError::Serialization(format!("signaling data: {e}")))?,
            from_did: self.identity.did(),
        };
        let message = build_message(&self.identity, to, MessageType::WebrtcSignaling, &envelope, true)?;
        send_message(self.transport.as_ref(), &message).await
    }
}

fn decode<T: DeserializeOwned>(data: serde_json::Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::process_incoming;
    use crate::transport::{InboundMessage, LoopbackNetwork};

    struct Side {
        did: String,
        service: Arc<SignalingService>,
        events: mpsc::Receiver<SignalingEvent>,
        inbox: mpsc::Receiver<InboundMessage>,
    }

    impl Side {
        /// Deliver the next inbound message to the service.
        async fn pump(&mut self) {
            let inbound = self.inbox.recv().await.unwrap();
            let message = process_incoming(&inbound.from_did, &inbound.bytes, true).unwrap();
            self.service.handle_message(&inbound.from_did, &message);
        }

        fn drain(&mut self) -> Vec<SignalingEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    fn pair(timeout: Duration) -> (Side, Side) {
        let network = LoopbackNetwork::new();
        let make = |network: &Arc<LoopbackNetwork>| {
            let identity = Arc::new(Identity::generate().unwrap());
            let did = identity.did();
            let (transport, inbox) = network.register(&did);
            let (service, events) = SignalingService::with_connect_timeout(
                identity,
                transport,
                &SignalingConfig::default(),
                timeout,
            );
            Side {
                did,
                service,
                events,
                inbox,
            }
        };
        (make(&network), make(&network))
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            sdp: format!("candidate:{n}"),
        }
    }

    #[tokio::test]
    async fn offer_answer_connects_both_sides() {
        let (mut alice, mut bob) = pair(Duration::from_secs(30));

        alice.service.send_offer(&bob.did, "v=0 offer").await.unwrap();
        assert_eq!(alice.service.state(&bob.did), PeerConnectionState::Connecting);

        bob.pump().await;
        assert_eq!(bob.service.state(&alice.did), PeerConnectionState::Connecting);
        assert!(bob.drain().iter().any(|e| matches!(
            e,
            SignalingEvent::OfferReceived { description, .. } if description.sdp == "v=0 offer"
        )));

        bob.service.send_answer(&alice.did, "v=0 answer").await.unwrap();
        alice.pump().await;

        let connected_to_bob = PeerConnectionState::Connected { peer: bob.did.clone() };
        assert_eq!(alice.service.state(&bob.did), connected_to_bob);
        assert_eq!(
            bob.service.state(&alice.did),
            PeerConnectionState::Connected { peer: alice.did.clone() }
        );
    }

    #[tokio::test]
    async fn early_candidates_are_buffered_until_the_offer() {
        let (alice, mut bob) = pair(Duration::from_secs(30));

        bob.service.handle_envelope(
            &alice.did,
            SignalingEnvelope {
                signal_type: SignalType::IceCandidate,
                data: serde_json::to_value(candidate(1)).unwrap(),
                from_did: alice.did.clone(),
            },
        );
        assert!(bob.drain().is_empty());

        bob.service.handle_envelope(
            &alice.did,
            SignalingEnvelope {
                signal_type: SignalType::Offer,
                data: serde_json::json!({"type": "offer", "sdp": "o"}),
                from_did: alice.did.clone(),
            },
        );
        let events = bob.drain();
        let offer_at = events
            .iter()
            .position(|e| matches!(e, SignalingEvent::OfferReceived { .. }))
            .unwrap();
        let candidate_at = events
            .iter()
            .position(|e| matches!(e, SignalingEvent::IceCandidate { candidate, .. } if candidate.sdp == "candidate:1"))
            .unwrap();
        assert!(offer_at < candidate_at);
    }

    #[tokio::test]
    async fn zero_candidate_buffer_drops_early_candidates() {
        let network = LoopbackNetwork::new();
        let identity = Arc::new(Identity::generate().unwrap());
        let (transport, _inbox) = network.register(&identity.did());
        let config = SignalingConfig {
            max_buffered_candidates: 0,
            ..SignalingConfig::default()
        };
        let (service, mut events) = SignalingService::new(identity, transport, &config);

        let remote = "did:key:zRemote";
        for n in 0..3 {
            service.handle_envelope(
                remote,
                SignalingEnvelope {
                    signal_type: SignalType::IceCandidate,
                    data: serde_json::to_value(candidate(n)).unwrap(),
                    from_did: remote.into(),
                },
            );
        }
        service.handle_envelope(
            remote,
            SignalingEnvelope {
                signal_type: SignalType::Offer,
                data: serde_json::json!({"type": "offer", "sdp": "o"}),
                from_did: remote.into(),
            },
        );
        let mut candidates = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SignalingEvent::IceCandidate { .. }) {
                candidates += 1;
            }
        }
        assert_eq!(candidates, 0);
        assert_eq!(service.state(remote), PeerConnectionState::Connecting);
    }

    #[tokio::test]
    async fn full_candidate_buffer_keeps_the_newest() {
        let network = LoopbackNetwork::new();
        let identity = Arc::new(Identity::generate().unwrap());
        let (transport, _inbox) = network.register(&identity.did());
        let config = SignalingConfig {
            max_buffered_candidates: 2,
            ..SignalingConfig::default()
        };
        let (service, mut events) = SignalingService::new(identity, transport, &config);

        let remote = "did:key:zRemote";
        for n in 0..4 {
            service.handle_envelope(
                remote,
                SignalingEnvelope {
                    signal_type: SignalType::IceCandidate,
                    data: serde_json::to_value(candidate(n)).unwrap(),
                    from_did: remote.into(),
                },
            );
        }
        service.handle_envelope(
            remote,
            SignalingEnvelope {
                signal_type: SignalType::Offer,
                data: serde_json::json!({"type": "offer", "sdp": "o"}),
                from_did: remote.into(),
            },
        );
        let mut released = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SignalingEvent::IceCandidate { candidate, .. } = event {
                released.push(candidate.sdp);
            }
        }
        assert_eq!(released, vec!["candidate:2", "candidate:3"]);
    }

    #[tokio::test]
    async fn candidates_refused_without_context() {
        let (alice, bob) = pair(Duration::from_secs(30));
        assert!(matches!(
            alice.service.send_ice_candidate(&bob.did, &candidate(1)).await,
            Err(ProtocolError::InvalidState(_))
        ));
        alice.service.send_offer(&bob.did, "o").await.unwrap();
        alice.service.send_ice_candidate(&bob.did, &candidate(2)).await.unwrap();
    }

    #[tokio::test]
    async fn hangup_disconnects_and_releases() {
        let (mut alice, mut bob) = pair(Duration::from_secs(30));
        alice.service.send_offer(&bob.did, "o").await.unwrap();
        bob.pump().await;
        bob.service.send_answer(&alice.did, "a").await.unwrap();
        alice.pump().await;
        bob.drain();

        alice.service.send_hangup(&bob.did, Some("bye")).await.unwrap();
        bob.pump().await;
        assert_eq!(
            bob.service.state(&alice.did),
            PeerConnectionState::Disconnected { reason: "bye".into() }
        );
        assert!(bob
            .drain()
            .contains(&SignalingEvent::ReleaseResources { peer: alice.did.clone() }));
    }

    #[tokio::test]
    async fn reject_fails_the_offerer() {
        let (mut alice, mut bob) = pair(Duration::from_secs(30));
        alice.service.send_offer(&bob.did, "o").await.unwrap();
        bob.pump().await;
        bob.service.send_reject(&alice.did, "busy").await.unwrap();
        alice.pump().await;

        assert_eq!(
            alice.service.state(&bob.did),
            PeerConnectionState::Failed { error: "busy".into() }
        );
        assert!(alice
            .drain()
            .contains(&SignalingEvent::ReleaseResources { peer: bob.did.clone() }));
    }

    #[tokio::test]
    async fn connecting_times_out() {
        let (mut alice, bob) = pair(Duration::from_millis(50));
        alice.service.send_offer(&bob.did, "o").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            alice.service.state(&bob.did),
            PeerConnectionState::Failed { error: "timeout".into() }
        );
        assert!(alice
            .drain()
            .contains(&SignalingEvent::ReleaseResources { peer: bob.did.clone() }));
    }

    #[tokio::test]
    async fn malformed_and_unexpected_input_is_dropped() {
        let (alice, mut bob) = pair(Duration::from_secs(30));
        bob.service.handle_envelope(
            &alice.did,
            SignalingEnvelope {
                signal_type: SignalType::Offer,
                data: serde_json::json!({"nonsense": true}),
                from_did: alice.did.clone(),
            },
        );
        bob.service.handle_envelope(
            &alice.did,
            SignalingEnvelope {
                signal_type: SignalType::Answer,
                data: serde_json::json!({"type": "answer", "sdp": "a"}),
                from_did: alice.did.clone(),
            },
        );
        bob.service.handle_envelope(
            &alice.did,
            SignalingEnvelope {
                signal_type: SignalType::Offer,
                data: serde_json::json!({"type": "offer", "sdp": "o"}),
                from_did: "did:key:zSomeoneElse".into(),
            },
        );
        assert_eq!(bob.service.state(&alice.did), PeerConnectionState::Idle);
        assert!(bob.drain().is_empty());
    }

    #[tokio::test]
    async fn ice_override_is_visible() {
        let (alice, _) = pair(Duration::from_secs(30));
        assert_eq!(alice.service.ice_servers().len(), crate::signaling::DEFAULT_STUN_SERVERS.len());
        alice.service.update_ice(|ice| ice.add_stun_server("stun:x"));
        assert_eq!(alice.service.ice_servers(), vec![IceServer::stun("stun:x")]);
    }
}
