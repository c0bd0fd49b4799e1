//! The peer runtime: wires identity, sessions, groups, signaling and file
//! transfer to one transport and drives them from a single dispatch loop.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use weave_crypto::{
    CryptoError, GroupInfo, GroupKeyManager, GroupMessage, GroupPolicy, GroupStore, Identity,
    InitiatorMessage, KeyDistributionPackage, Keychain, PreKeyBundle, PreKeyStore,
    SessionManager, SessionStore,
};

use crate::config::CoreConfig;
use crate::error::ProtocolError;
use crate::file_transfer::{
    FileSource, FileTransferEngine, IndexRequest, IndexResponse, MemoryFileSource, TransferHandle,
};
use crate::messaging::{
    build_message, process_incoming, send_message, MessageType, P2pMessage, PreKeyBundleRequest,
};
use crate::services::{group_maintenance_tick, prekey_maintenance_tick, PeriodicTask};
use crate::signaling::{SignalingEvent, SignalingService};
use crate::transport::{InboundMessage, Transport};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Where a node keeps state across restarts. Everything is optional except
/// the file source; missing stores mean in-memory only.
pub struct NodeStorage {
    pub keychain: Option<Arc<dyn Keychain>>,
    pub sessions: Option<Arc<dyn SessionStore>>,
    pub groups: Option<Arc<dyn GroupStore>>,
    pub files: Arc<dyn FileSource>,
}

impl Default for NodeStorage {
    fn default() -> Self {
        Self {
            keychain: None,
            sessions: None,
            groups: None,
            files: Arc::new(MemoryFileSource::default()),
        }
    }
}

/// Application-facing notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    SessionEstablished {
        peer: String,
    },
    GroupKeyInstalled {
        group_id: String,
        version: u64,
        from: String,
    },
    GroupMessage {
        group_id: String,
        sender: String,
        plaintext: Vec<u8>,
        timestamp: u64,
    },
    /// A group message arrived under a key version we do not hold. Shown to
    /// the user as "waiting for key sync".
    KeySyncNeeded {
        group_id: String,
        version: u64,
        sender: String,
    },
}

/// Event receivers handed out by [`PeerNode::start`].
pub struct NodeEvents {
    pub node: mpsc::Receiver<NodeEvent>,
    pub signaling: mpsc::Receiver<SignalingEvent>,
}

struct NodeInner {
    identity: Arc<Identity>,
    transport: Arc<dyn Transport>,
    config: CoreConfig,
    sessions: Arc<SessionManager>,
    groups: Arc<GroupKeyManager>,
    signaling: Arc<SignalingService>,
    files: Arc<FileTransferEngine>,
    /// Bundle requests waiting for a `PREKEY_BUNDLE`, by peer.
    pending_bundles: Mutex<HashMap<String, oneshot::Sender<PreKeyBundle>>>,
    events: mpsc::Sender<NodeEvent>,
}

/// A running peer.
pub struct PeerNode {
    inner: Arc<NodeInner>,
    dispatch_shutdown: mpsc::Sender<()>,
    dispatch: JoinHandle<()>,
    tasks: Vec<PeriodicTask>,
}

impl PeerNode {
    /// Build every component, spawn the dispatch loop and the maintenance
    /// tasks. Must be called inside a tokio runtime.
    pub fn start(
        identity: Arc<Identity>,
        transport: Arc<dyn Transport>,
        inbox: mpsc::Receiver<InboundMessage>,
        config: CoreConfig,
        storage: NodeStorage,
    ) -> Result<(Self, NodeEvents), ProtocolError> {
        let did = identity.did();
        tracing::info!(did = %did, "starting peer node");

        let prekeys = Arc::new(match &storage.keychain {
            Some(keychain) => {
                PreKeyStore::load(Arc::clone(&identity), config.prekeys.clone(), Arc::clone(keychain))?
            }
            None => PreKeyStore::new(Arc::clone(&identity), config.prekeys.clone())?,
        });
        let sessions = Arc::new(match storage.sessions {
            Some(store) => SessionManager::with_store(Arc::clone(&identity), prekeys, store)?,
            None => SessionManager::new(Arc::clone(&identity), prekeys),
        });
        let groups = Arc::new(match (storage.groups, storage.keychain) {
            (Some(store), Some(keychain)) => {
                GroupKeyManager::with_persistence(Arc::clone(&sessions), store, keychain)?
            }
            (Some(_), None) => {
                tracing::warn!("group store without a keychain, group keys stay in memory");
                GroupKeyManager::new(Arc::clone(&sessions))
            }
            _ => GroupKeyManager::new(Arc::clone(&sessions)),
        });
        let (signaling, signaling_events) =
            SignalingService::new(Arc::clone(&identity), Arc::clone(&transport), &config.signaling);
        let files = FileTransferEngine::new(
            Arc::clone(&identity),
            Arc::clone(&transport),
            storage.files,
            &config.file_transfer,
        );

        let (events, node_events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(NodeInner {
            identity,
            transport,
            config,
            sessions,
            groups,
            signaling,
            files,
            pending_bundles: Mutex::new(HashMap::new()),
            events,
        });

        let (dispatch_shutdown, shutdown_rx) = mpsc::channel(1);
        let dispatch = tokio::spawn(dispatch_loop(Arc::clone(&inner), inbox, shutdown_rx));
        let tasks = spawn_maintenance(&inner);

        tracing::info!(did = %did, "peer node started");
        Ok((
            Self {
                inner,
                dispatch_shutdown,
                dispatch,
                tasks,
            },
            NodeEvents {
                node: node_events,
                signaling: signaling_events,
            },
        ))
    }

    pub fn did(&self) -> String {
        self.inner.identity.did()
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.inner.identity
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.inner.sessions
    }

    pub fn groups(&self) -> &Arc<GroupKeyManager> {
        &self.inner.groups
    }

    pub fn signaling(&self) -> &Arc<SignalingService> {
        &self.inner.signaling
    }

    pub fn files(&self) -> &Arc<FileTransferEngine> {
        &self.inner.files
    }

    /// Make sure a session with `peer` exists, fetching its pre-key bundle
    /// and sending `SESSION_INIT` if not.
    pub async fn establish_session(&self, peer: &str) -> Result<(), ProtocolError> {
        self.inner.establish_session(peer).await
    }

    /// Create a group with the local identity as creator. Members without a
    /// reachable session are kept on the roster and keyed once one exists.
    pub async fn create_group(
        &self,
        group_id: &str,
        name: &str,
        members: &[String],
        policy: GroupPolicy,
    ) -> Result<GroupInfo, ProtocolError> {
        for member in members {
            if let Err(e) = self.inner.establish_session(member).await {
                tracing::warn!(peer = %member, group = group_id, error = %e, "member unreachable, key delivery deferred");
            }
        }
        let (info, _) = self.inner.groups.create_group(group_id, name, members, policy)?;
        self.inner.flush_outbox().await;
        Ok(info)
    }

    pub async fn add_group_member(&self, group_id: &str, member: &str) -> Result<(), ProtocolError> {
        self.inner.establish_session(member).await?;
        self.inner.groups.add_member(group_id, member)?;
        self.inner.flush_outbox().await;
        Ok(())
    }

    /// Remove a member and distribute the rotated key. Returns the new version.
    pub async fn remove_group_member(&self, group_id: &str, member: &str) -> Result<u64, ProtocolError> {
        let rotation = self.inner.groups.remove_member(group_id, member)?;
        self.inner.flush_outbox().await;
        Ok(rotation.version())
    }

    pub async fn rotate_group_key(&self, group_id: &str) -> Result<u64, ProtocolError> {
        let rotation = self.inner.groups.rotate_group_key(group_id)?;
        self.inner.flush_outbox().await;
        Ok(rotation.version())
    }

    /// Encrypt and send to the group. Returns how many peers accepted it.
    pub async fn send_group_message(&self, group_id: &str, plaintext: &[u8]) -> Result<usize, ProtocolError> {
        let message = self.inner.groups.encrypt_group_message(group_id, plaintext)?;
        let recipients = self.inner.groups.message_recipients(group_id);
        Ok(self.inner.fan_out(&recipients, &message).await)
    }

    pub async fn list_remote_files(
        &self,
        peer: &str,
        request: IndexRequest,
    ) -> Result<IndexResponse, ProtocolError> {
        self.inner.files.list_remote(peer, request).await
    }

    pub async fn request_file(&self, peer: &str, file_id: &str) -> Result<TransferHandle, ProtocolError> {
        self.inner.files.request_file(peer, file_id).await
    }

    /// Stop the dispatch loop and every background task, cancel pending
    /// transfers and signaling timers.
    pub async fn shutdown(self) {
        let did = self.did();
        tracing::info!(did = %did, "shutting down peer node");

        for task in self.tasks {
            task.stop().await;
        }
        let _ = self.dispatch_shutdown.send(()).await;
        if let Err(e) = self.dispatch.await {
            tracing::warn!(error = %e, "dispatch loop ended abnormally");
        }

        self.inner.signaling.shutdown();
        self.inner.files.shutdown();
        self.inner.pending_bundles.lock().clear();
        tracing::info!(did = %did, "peer node shut down");
    }
}

fn spawn_maintenance(inner: &Arc<NodeInner>) -> Vec<PeriodicTask> {
    let maintenance = &inner.config.maintenance;

    let prekey_node = Arc::clone(inner);
    let prekeys = PeriodicTask::spawn("prekey-maintenance", maintenance.prekey_interval(), move || {
        let node = Arc::clone(&prekey_node);
        async move { prekey_maintenance_tick(node.sessions.prekeys()) }
    });

    let group_node = Arc::clone(inner);
    let groups = PeriodicTask::spawn("group-maintenance", maintenance.group_interval(), move || {
        let node = Arc::clone(&group_node);
        async move {
            let packages = group_maintenance_tick(&node.groups);
            node.deliver_packages(packages).await;
            let dropped = node.files.expire_idle_outgoing();
            if dropped > 0 {
                tracing::debug!(dropped, "abandoned uploads dropped");
            }
        }
    });

    vec![prekeys, groups]
}

async fn dispatch_loop(
    node: Arc<NodeInner>,
    mut inbox: mpsc::Receiver<InboundMessage>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    tracing::debug!("dispatch loop started");
    loop {
        tokio::select! {
            Some(inbound) = inbox.recv() => node.dispatch(inbound).await,
            _ = shutdown_rx.recv() => {
                tracing::debug!("dispatch loop shutting down");
                break;
            }
        }
    }
}

impl NodeInner {
    fn emit(&self, event: NodeEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::warn!(error = %e, "node event dropped");
        }
    }

    async fn send<T: Serialize>(
        &self,
        to: &str,
        message_type: MessageType,
        body: &T,
    ) -> Result<(), ProtocolError> {
        let message = build_message(&self.identity, to, message_type, body, true)?;
        send_message(self.transport.as_ref(), &message).await
    }

    async fn establish_session(&self, peer: &str) -> Result<(), ProtocolError> {
        if self.sessions.has_session(peer) {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.pending_bundles.lock().insert(peer.to_string(), tx);

        if let Err(e) = self
            .send(peer, MessageType::PrekeyBundleRequest, &PreKeyBundleRequest {})
            .await
        {
            self.pending_bundles.lock().remove(peer);
            return Err(e);
        }
        let bundle = match tokio::time::timeout(self.config.handshake_timeout(), rx).await {
            Ok(Ok(bundle)) => bundle,
            Ok(Err(_)) => {
                return Err(ProtocolError::Cancelled(format!("session setup with {peer} abandoned")));
            }
            Err(_) => {
                self.pending_bundles.lock().remove(peer);
                return Err(ProtocolError::Timeout(format!("pre-key bundle from {peer}")));
            }
        };

        let (session, init) = self.sessions.initiate(&bundle)?;
        self.send(peer, MessageType::SessionInit, &init).await?;
        tracing::info!(peer, session_id = %session.session_id, "session initiated");
        self.emit(NodeEvent::SessionEstablished {
            peer: peer.to_string(),
        });

        self.groups.redistribute_pending(peer)?;
        self.flush_outbox().await;
        Ok(())
    }

    async fn flush_outbox(&self) {
        let packages = self.groups.drain_outbox();
        self.deliver_packages(packages).await;
    }

    async fn deliver_packages(&self, packages: Vec<KeyDistributionPackage>) {
        if packages.is_empty() {
            return;
        }
        let sends = packages.iter().map(|package| async move {
            let result = self
                .send(&package.target_member_id, MessageType::KeyDistribution, package)
                .await;
            (package, result)
        });
        for (package, result) in join_all(sends).await {
            if let Err(e) = result {
                tracing::warn!(
                    peer = %package.target_member_id,
                    group = %package.group_id,
                    version = package.key_version,
                    error = %e,
                    "key package delivery failed"
                );
            }
        }
    }

    /// Send one group message to several peers concurrently.
    async fn fan_out(&self, recipients: &[String], message: &GroupMessage) -> usize {
        let sends = recipients.iter().map(|peer| async move {
            (peer, self.send(peer, MessageType::GroupMessage, message).await)
        });
        let mut delivered = 0;
        for (peer, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(peer = %peer, group = %message.group_id, error = %e, "group message delivery failed"),
            }
        }
        delivered
    }

    async fn dispatch(&self, inbound: InboundMessage) {
        let from = inbound.from_did.as_str();
        let message = match process_incoming(from, &inbound.bytes, self.config.require_signatures) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(peer = from, error = %e, "inbound message rejected");
                return;
            }
        };
        tracing::debug!(peer = from, kind = message.message_type.as_str(), id = %message.id, "message received");

        let result = match message.message_type {
            MessageType::PrekeyBundleRequest => self.on_bundle_request(from).await,
            MessageType::PrekeyBundle => self.on_bundle(from, &message),
            MessageType::SessionInit => self.on_session_init(from, &message).await,
            MessageType::KeyDistribution => self.on_key_distribution(from, &message),
            MessageType::GroupMessage => self.on_group_message(from, &message).await,
            MessageType::FileTransfer => {
                self.files.handle_message(from, &message).await;
                Ok(())
            }
            MessageType::WebrtcSignaling => {
                self.signaling.handle_message(from, &message);
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(peer = from, kind = message.message_type.as_str(), error = %e, "message handling failed");
        }
    }

    async fn on_bundle_request(&self, from: &str) -> Result<(), ProtocolError> {
        let bundle = self.sessions.prekeys().bundle_for_session();
        self.send(from, MessageType::PrekeyBundle, &bundle).await
    }

    fn on_bundle(&self, from: &str, message: &P2pMessage) -> Result<(), ProtocolError> {
        let bundle: PreKeyBundle = message.body()?;
        if bundle.identity_did != from {
            return Err(ProtocolError::Verification(format!(
                "bundle for {} sent by {from}",
                bundle.identity_did
            )));
        }
        match self.pending_bundles.lock().remove(from) {
            Some(waiter) => {
                let _ = waiter.send(bundle);
            }
            None => tracing::debug!(peer = from, "unsolicited pre-key bundle dropped"),
        }
        Ok(())
    }

    async fn on_session_init(&self, from: &str, message: &P2pMessage) -> Result<(), ProtocolError> {
        let init: InitiatorMessage = message.body()?;
        if init.initiator_did != from {
            return Err(ProtocolError::Verification(format!(
                "session init for {} sent by {from}",
                init.initiator_did
            )));
        }
        let session = self.sessions.accept(&init)?;
        tracing::info!(peer = from, session_id = %session.session_id, "session accepted");
        self.emit(NodeEvent::SessionEstablished {
            peer: from.to_string(),
        });

        self.groups.redistribute_pending(from)?;
        self.flush_outbox().await;
        Ok(())
    }

    fn on_key_distribution(&self, from: &str, message: &P2pMessage) -> Result<(), ProtocolError> {
        let package: KeyDistributionPackage = message.body()?;
        let version = self.groups.accept_distribution(from, &package)?;
        tracing::info!(peer = from, group = %package.group_id, version, "group key received");
        self.emit(NodeEvent::GroupKeyInstalled {
            group_id: package.group_id,
            version,
            from: from.to_string(),
        });
        Ok(())
    }

    async fn on_group_message(&self, from: &str, message: &P2pMessage) -> Result<(), ProtocolError> {
        let group_message: GroupMessage = message.body()?;
        let plaintext = match self.groups.decrypt_group_message(&group_message) {
            Ok(plaintext) => plaintext,
            Err(CryptoError::KeyNotAvailable { group_id, version }) => {
                tracing::warn!(peer = from, group = %group_id, version, "cannot decrypt, waiting for key sync");
                self.emit(NodeEvent::KeySyncNeeded {
                    group_id,
                    version,
                    sender: group_message.sender_did,
                });
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // Members without a roster send to the key holder, who forwards to
        // the rest of the group.
        let relay = from == group_message.sender_did
            && self.groups.group_info(&group_message.group_id).is_some();
        self.emit(NodeEvent::GroupMessage {
            group_id: group_message.group_id.clone(),
            sender: group_message.sender_did.clone(),
            plaintext,
            timestamp: group_message.timestamp,
        });
        if relay {
            let recipients: Vec<String> = self
                .groups
                .message_recipients(&group_message.group_id)
                .into_iter()
                .filter(|peer| *peer != group_message.sender_did)
                .collect();
            if !recipients.is_empty() {
                let relayed = self.fan_out(&recipients, &group_message).await;
                tracing::debug!(group = %group_message.group_id, relayed, "group message relayed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::LoopbackNetwork;

    fn spawn_node(network: &Arc<LoopbackNetwork>) -> (PeerNode, NodeEvents) {
        let identity = Arc::new(Identity::generate().unwrap());
        let (transport, inbox) = network.register(&identity.did());
        PeerNode::start(identity, transport, inbox, CoreConfig::default(), NodeStorage::default())
            .unwrap()
    }

    #[tokio::test]
    async fn session_setup_over_the_wire() {
        let network = LoopbackNetwork::new();
        let (alice, mut alice_events) = spawn_node(&network);
        let (bob, mut bob_events) = spawn_node(&network);

        alice.establish_session(&bob.did()).await.unwrap();
        let expected = NodeEvent::SessionEstablished { peer: bob.did() };
        assert_eq!(alice_events.node.recv().await.unwrap(), expected);
        let accepted = tokio::time::timeout(Duration::from_secs(5), bob_events.node.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(accepted, NodeEvent::SessionEstablished { peer: alice.did() });

        let a = alice.sessions().session(&bob.did()).unwrap();
        let b = bob.sessions().session(&alice.did()).unwrap();
        assert_eq!(a.session_id, b.session_id);
        assert_eq!(a.shared_key(), b.shared_key());

        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_peer_fails_fast() {
        let network = LoopbackNetwork::new();
        let (alice, _events) = spawn_node(&network);
        let ghost = Identity::generate().unwrap().did();
        assert!(matches!(
            alice.establish_session(&ghost).await,
            Err(ProtocolError::TransportUnavailable(_))
        ));
        alice.shutdown().await;
    }
}
