use std::collections::HashMap;
use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::did;
use crate::error::CryptoError;
use crate::identity::Identity;
use crate::prekeys::{PreKeyBundle, PreKeyStore};
use crate::store::SessionStore;
use crate::util::{now_millis, random_array, random_x25519_secret};

const X3DH_INFO: &[u8] = b"WeaveX3DH-v1";
const SESSION_ID_DOMAIN: &[u8] = b"weave-session-id-v1";
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// A pairwise session with one remote peer.
///
/// Sessions are immutable once derived. Re-keying produces a new `Session`
/// that supersedes the old one; holders of the old value keep a consistent key.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub local_did: String,
    pub remote_did: String,
    shared_key: [u8; 32],
    /// Unix milliseconds.
    pub created_at: u64,
    pub used_one_time_pre_key_id: Option<u32>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared_key.zeroize();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("local_did", &self.local_did)
            .field("remote_did", &self.remote_did)
            .field("created_at", &self.created_at)
            .field("used_one_time_pre_key_id", &self.used_one_time_pre_key_id)
            .finish_non_exhaustive()
    }
}

/// Sent by the initiator so the responder can mirror the key agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatorMessage {
    pub initiator_did: String,
    pub responder_did: String,
    pub ephemeral_key: [u8; 32],
    pub signed_pre_key_id: u32,
    pub one_time_pre_key_id: Option<u32>,
}

impl Session {
    pub fn shared_key(&self) -> &[u8; 32] {
        &self.shared_key
    }

    /// Whether the handshake mixed in a one-time pre-key.
    pub fn has_one_time_material(&self) -> bool {
        self.used_one_time_pre_key_id.is_some()
    }

    /// Encrypt under the session key with XChaCha20-Poly1305.
    ///
    /// Returns `[24-byte nonce || ciphertext || 16-byte tag]`.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new_from_slice(&self.shared_key)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
        let nonce_bytes = random_array::<NONCE_LEN>()?;
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        let mut output = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    /// Decrypt data produced by [`Session::seal`] with the same associated data.
    pub fn open(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::InvalidArgument("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new_from_slice(&self.shared_key)
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;
        cipher
            .decrypt(
                XNonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))
    }
}

/// Initiator side of the X3DH-style handshake.
///
/// Verifies the remote signed pre-key against the key behind the remote DID,
/// then combines DH1 = DH(IK_a, SPK_b), DH2 = DH(EK_a, IK_b),
/// DH3 = DH(EK_a, SPK_b) and, when the bundle carries one, DH4 = DH(EK_a, OPK_b).
pub fn initiate(
    local: &Identity,
    bundle: &PreKeyBundle,
) -> Result<(Session, InitiatorMessage), CryptoError> {
    let remote_public = did::resolve(&bundle.identity_did)?;
    if !bundle.verify_signature()? {
        return Err(CryptoError::UntrustedPreKey(format!(
            "signed pre-key {} is not signed by {}",
            bundle.signed_pre_key.id, bundle.identity_did
        )));
    }

    let their_identity = Identity::peer_ed25519_to_x25519(&remote_public)?;
    let their_signed_prekey = X25519Public::from(bundle.signed_pre_key.public_key);
    let one_time = bundle.one_time_pre_keys.first();

    let ephemeral = random_x25519_secret()?;
    let ephemeral_public = X25519Public::from(&ephemeral);
    let our_identity = local.to_x25519_secret();

    let mut ikm = Zeroizing::new(Vec::with_capacity(128));
    ikm.extend_from_slice(our_identity.diffie_hellman(&their_signed_prekey).as_bytes());
    ikm.extend_from_slice(ephemeral.diffie_hellman(&their_identity).as_bytes());
    ikm.extend_from_slice(ephemeral.diffie_hellman(&their_signed_prekey).as_bytes());
    if let Some(otpk) = one_time {
        let their_otpk = X25519Public::from(otpk.public_key);
        ikm.extend_from_slice(ephemeral.diffie_hellman(&their_otpk).as_bytes());
    }

    let local_did = local.did();
    let message = InitiatorMessage {
        initiator_did: local_did.clone(),
        responder_did: bundle.identity_did.clone(),
        ephemeral_key: ephemeral_public.to_bytes(),
        signed_pre_key_id: bundle.signed_pre_key.id,
        one_time_pre_key_id: one_time.map(|k| k.id),
    };

    let session = Session {
        session_id: session_id(&message),
        local_did,
        remote_did: bundle.identity_did.clone(),
        shared_key: derive_shared_key(&ikm)?,
        created_at: now_millis(),
        used_one_time_pre_key_id: message.one_time_pre_key_id,
    };

    if session.has_one_time_material() {
        tracing::debug!(peer = %session.remote_did, session_id = %session.session_id, "session initiated");
    } else {
        tracing::warn!(
            peer = %session.remote_did,
            session_id = %session.session_id,
            "session initiated without a one-time pre-key (reduced security)"
        );
    }
    Ok((session, message))
}

/// Responder side: mirror the initiator's DH computation with our private keys.
///
/// The referenced one-time pre-key is removed from the pool, so replaying the
/// same initiator message fails.
pub fn accept(
    local: &Identity,
    store: &PreKeyStore,
    message: &InitiatorMessage,
) -> Result<Session, CryptoError> {
    let local_did = local.did();
    if message.responder_did != local_did {
        return Err(CryptoError::SessionError(format!(
            "initiator message is addressed to {}",
            message.responder_did
        )));
    }
    if store.identity_did() != local_did {
        return Err(CryptoError::SessionError(
            "pre-key store belongs to a different identity".into(),
        ));
    }

    let their_identity = Identity::peer_ed25519_to_x25519(&did::resolve(&message.initiator_did)?)?;
    let their_ephemeral = X25519Public::from(message.ephemeral_key);

    let signed_prekey = store
        .signed_pre_key_secret(message.signed_pre_key_id)
        .ok_or_else(|| {
            CryptoError::PreKeyError(format!(
                "signed pre-key {} not found",
                message.signed_pre_key_id
            ))
        })?;
    let our_identity = local.to_x25519_secret();

    let one_time: Option<StaticSecret> = match message.one_time_pre_key_id {
        Some(id) => Some(store.take_one_time_secret(id)?.ok_or_else(|| {
            CryptoError::PreKeyError(format!("one-time pre-key {id} unknown or already used"))
        })?),
        None => None,
    };

    let mut ikm = Zeroizing::new(Vec::with_capacity(128));
    ikm.extend_from_slice(signed_prekey.diffie_hellman(&their_identity).as_bytes());
    ikm.extend_from_slice(our_identity.diffie_hellman(&their_ephemeral).as_bytes());
    ikm.extend_from_slice(signed_prekey.diffie_hellman(&their_ephemeral).as_bytes());
    if let Some(otpk) = &one_time {
        ikm.extend_from_slice(otpk.diffie_hellman(&their_ephemeral).as_bytes());
    }

    let session = Session {
        session_id: session_id(message),
        local_did,
        remote_did: message.initiator_did.clone(),
        shared_key: derive_shared_key(&ikm)?,
        created_at: now_millis(),
        used_one_time_pre_key_id: message.one_time_pre_key_id,
    };
    tracing::debug!(peer = %session.remote_did, session_id = %session.session_id, "session accepted");
    Ok(session)
}

fn derive_shared_key(ikm: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut key = [0u8; 32];
    hk.expand(X3DH_INFO, &mut key)
        .map_err(|e| CryptoError::SessionError(format!("HKDF expand failed: {e}")))?;
    Ok(key)
}

/// Both peers derive the same id from the initiator message.
fn session_id(message: &InitiatorMessage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SESSION_ID_DOMAIN);
    hasher.update(message.initiator_did.as_bytes());
    hasher.update(message.responder_did.as_bytes());
    hasher.update(message.ephemeral_key);
    hex::encode(&hasher.finalize()[..16])
}

/// Live sessions of the local identity, keyed by remote DID.
pub struct SessionManager {
    identity: Arc<Identity>,
    prekeys: Arc<PreKeyStore>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    store: Option<Arc<dyn SessionStore>>,
}

impl SessionManager {
    pub fn new(identity: Arc<Identity>, prekeys: Arc<PreKeyStore>) -> Self {
        Self {
            identity,
            prekeys,
            sessions: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    /// Create a manager backed by a session store, loading existing sessions.
    pub fn with_store(
        identity: Arc<Identity>,
        prekeys: Arc<PreKeyStore>,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self, CryptoError> {
        let mut sessions = HashMap::new();
        for remote_did in store.list_sessions()? {
            if let Some(session) = store.load_session(&remote_did)? {
                sessions.insert(remote_did, Arc::new(session));
            }
        }
        tracing::debug!(count = sessions.len(), "sessions restored");
        Ok(Self {
            identity,
            prekeys,
            sessions: RwLock::new(sessions),
            store: Some(store),
        })
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    pub fn prekeys(&self) -> &Arc<PreKeyStore> {
        &self.prekeys
    }

    pub fn local_did(&self) -> String {
        self.identity.did()
    }

    /// Start a new session from a remote bundle, superseding any existing one.
    pub fn initiate(
        &self,
        bundle: &PreKeyBundle,
    ) -> Result<(Arc<Session>, InitiatorMessage), CryptoError> {
        let (session, message) = initiate(&self.identity, bundle)?;
        let session = self.install(session)?;
        Ok((session, message))
    }

    /// Reuse the live session with the bundle's owner, or initiate one.
    ///
    /// The initiator message is only returned when a new session was created.
    pub fn get_or_initiate(
        &self,
        bundle: &PreKeyBundle,
    ) -> Result<(Arc<Session>, Option<InitiatorMessage>), CryptoError> {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&bundle.identity_did) {
            return Ok((Arc::clone(existing), None));
        }
        let (session, message) = initiate(&self.identity, bundle)?;
        if let Some(store) = &self.store {
            store.store_session(&session)?;
        }
        let session = Arc::new(session);
        sessions.insert(session.remote_did.clone(), Arc::clone(&session));
        Ok((session, Some(message)))
    }

    /// Complete a session started by a remote initiator.
    pub fn accept(&self, message: &InitiatorMessage) -> Result<Arc<Session>, CryptoError> {
        let session = accept(&self.identity, &self.prekeys, message)?;
        self.install(session)
    }

    pub fn session(&self, remote_did: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(remote_did).cloned()
    }

    pub fn has_session(&self, remote_did: &str) -> bool {
        self.sessions.read().contains_key(remote_did)
    }

    /// Drop the session with a peer (re-key or compromise signal).
    pub fn remove_session(&self, remote_did: &str) -> Result<(), CryptoError> {
        self.sessions.write().remove(remote_did);
        if let Some(store) = &self.store {
            store.delete_session(remote_did)?;
        }
        Ok(())
    }

    pub fn peers(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    fn install(&self, session: Session) -> Result<Arc<Session>, CryptoError> {
        if let Some(store) = &self.store {
            store.store_session(&session)?;
        }
        let session = Arc::new(session);
        let previous = self
            .sessions
            .write()
            .insert(session.remote_did.clone(), Arc::clone(&session));
        if let Some(previous) = previous {
            tracing::info!(
                peer = %session.remote_did,
                old = %previous.session_id,
                new = %session.session_id,
                "session superseded"
            );
        }
        Ok(session)
    }
}
