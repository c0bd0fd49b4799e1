//! Signed and one-time pre-keys for asynchronous session bootstrap.
//!
//! A peer publishes a [`PreKeyBundle`] so others can start a session while it
//! is offline. The signed pre-key rotates on a schedule; one-time pre-keys are
//! handed out at most once and the pool is topped up when it runs low.
//!
//! All pool mutation happens under one lock so that two concurrent session
//! initiations can never be handed the same one-time key.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::identity::Identity;
use crate::keychain::{
    Keychain, KEY_PREKEY_BATCH, KEY_PREVIOUS_SIGNED_PREKEY, KEY_SIGNED_PREKEY, VAULT_PREKEYS,
};
use crate::util::{now_millis, random_x25519_secret};

const DAY_SECS: u64 = 24 * 60 * 60;

/// Pre-key pool parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreKeyConfig {
    /// Age after which the signed pre-key is rotated.
    pub signed_prekey_rotation_secs: u64,
    /// Replenish when fewer usable one-time keys than this remain.
    pub low_water_mark: usize,
    /// Pool size after a replenish.
    pub replenish_target: usize,
    /// Never-consumed one-time keys older than this are pruned.
    pub one_time_max_age_secs: u64,
    /// A handed-out key whose secret no session claimed within this window
    /// is dropped.
    pub consumed_grace_secs: u64,
}

impl Default for PreKeyConfig {
    fn default() -> Self {
        Self {
            signed_prekey_rotation_secs: 7 * DAY_SECS,
            low_water_mark: 5,
            replenish_target: 20,
            one_time_max_age_secs: 30 * DAY_SECS,
            consumed_grace_secs: 10 * 60,
        }
    }
}

impl PreKeyConfig {
    pub fn signed_prekey_rotation(&self) -> Duration {
        Duration::from_secs(self.signed_prekey_rotation_secs)
    }

    pub fn one_time_max_age(&self) -> Duration {
        Duration::from_secs(self.one_time_max_age_secs)
    }

    pub fn consumed_grace(&self) -> Duration {
        Duration::from_secs(self.consumed_grace_secs)
    }
}

/// Public half of a signed pre-key, as published in a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKey {
    pub id: u32,
    pub public_key: [u8; 32],
    /// Ed25519 signature by the identity key over `public_key`.
    pub signature: Vec<u8>,
    /// Unix milliseconds.
    pub created_at: u64,
}

/// Public half of a one-time pre-key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKey {
    pub id: u32,
    pub public_key: [u8; 32],
}

/// Everything a peer needs to start a session with us while we are offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    pub identity_did: String,
    pub signed_pre_key: SignedPreKey,
    pub one_time_pre_keys: Vec<OneTimePreKey>,
}

impl PreKeyBundle {
    /// Check the signed pre-key signature against the key behind `identity_did`.
    ///
    /// `Ok(false)` means the signature is wrong; malformed DIDs or signature
    /// lengths are errors.
    pub fn verify_signature(&self) -> Result<bool, CryptoError> {
        Identity::verify_with_did(
            &self.signed_pre_key.public_key,
            &self.signed_pre_key.signature,
            &self.identity_did,
        )
    }
}

#[derive(Serialize, Deserialize)]
struct SignedPreKeyRecord {
    public: SignedPreKey,
    secret: [u8; 32],
}

impl Drop for SignedPreKeyRecord {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

#[derive(Serialize, Deserialize)]
struct OneTimePreKeyRecord {
    id: u32,
    public_key: [u8; 32],
    secret: [u8; 32],
    created_at: u64,
    /// When the key was handed out to an initiator. The secret stays until
    /// the responder side takes it or the grace period runs out.
    consumed_at: Option<u64>,
}

impl Drop for OneTimePreKeyRecord {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl OneTimePreKeyRecord {
    fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    /// Still worth keeping at `now_ms`.
    fn is_live(&self, now_ms: u64, max_age_ms: u64, grace_ms: u64) -> bool {
        match self.consumed_at {
            Some(at) => now_ms.saturating_sub(at) < grace_ms,
            None => now_ms.saturating_sub(self.created_at) < max_age_ms,
        }
    }

    fn public(&self) -> OneTimePreKey {
        OneTimePreKey {
            id: self.id,
            public_key: self.public_key,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct OneTimeBatch {
    next_id: u32,
    keys: Vec<OneTimePreKeyRecord>,
}

struct PoolState {
    signed: SignedPreKeyRecord,
    /// Kept until the next rotation so initiations against the old bundle
    /// still complete.
    previous_signed: Option<SignedPreKeyRecord>,
    one_time: BTreeMap<u32, OneTimePreKeyRecord>,
    next_one_time_id: u32,
}

impl PoolState {
    fn usable_count(&self) -> usize {
        self.one_time.values().filter(|k| !k.is_consumed()).count()
    }
}

/// The local pre-key pool.
pub struct PreKeyStore {
    identity: Arc<Identity>,
    config: PreKeyConfig,
    state: Mutex<PoolState>,
    keychain: Option<Arc<dyn Keychain>>,
}

impl PreKeyStore {
    /// Create a fresh in-memory pool: one signed pre-key and a full batch of
    /// one-time pre-keys.
    pub fn new(identity: Arc<Identity>, config: PreKeyConfig) -> Result<Self, CryptoError> {
        Self::build_fresh(identity, config, None)
    }

    /// Restore the pool from the keychain, or create and persist a fresh one
    /// if nothing was stored yet.
    pub fn load(
        identity: Arc<Identity>,
        config: PreKeyConfig,
        keychain: Arc<dyn Keychain>,
    ) -> Result<Self, CryptoError> {
        let Some(signed_bytes) = keychain.load_key(VAULT_PREKEYS, KEY_SIGNED_PREKEY)? else {
            tracing::info!("no stored pre-keys, generating a fresh pool");
            return Self::build_fresh(identity, config, Some(keychain));
        };

        let signed: SignedPreKeyRecord = decode_record(&signed_bytes, "signed pre-key")?;
        let previous_signed = keychain
            .load_key(VAULT_PREKEYS, KEY_PREVIOUS_SIGNED_PREKEY)?
            .map(|bytes| decode_record::<SignedPreKeyRecord>(&bytes, "previous signed pre-key"))
            .transpose()?;
        let batch: OneTimeBatch = match keychain.load_key(VAULT_PREKEYS, KEY_PREKEY_BATCH)? {
            Some(bytes) => decode_record(&bytes, "one-time pre-key batch")?,
            None => OneTimeBatch {
                next_id: 1,
                keys: Vec::new(),
            },
        };

        let next_one_time_id = batch.next_id;
        let one_time = batch.keys.into_iter().map(|k| (k.id, k)).collect();

        let state = PoolState {
            signed,
            previous_signed,
            one_time,
            next_one_time_id,
        };
        tracing::info!(
            signed_prekey_id = state.signed.public.id,
            usable = state.usable_count(),
            "pre-key pool restored"
        );

        Ok(Self {
            identity,
            config,
            state: Mutex::new(state),
            keychain: Some(keychain),
        })
    }

    fn build_fresh(
        identity: Arc<Identity>,
        config: PreKeyConfig,
        keychain: Option<Arc<dyn Keychain>>,
    ) -> Result<Self, CryptoError> {
        let signed = generate_signed(&identity, 1)?;
        let mut state = PoolState {
            signed,
            previous_signed: None,
            one_time: BTreeMap::new(),
            next_one_time_id: 1,
        };
        generate_one_time(&mut state, config.replenish_target)?;

        let store = Self {
            identity,
            config,
            state: Mutex::new(state),
            keychain,
        };
        store.persist(&store.state.lock())?;
        Ok(store)
    }

    pub fn identity_did(&self) -> String {
        self.identity.did()
    }

    pub fn config(&self) -> &PreKeyConfig {
        &self.config
    }

    /// The current signed pre-key.
    pub fn signed_pre_key(&self) -> SignedPreKey {
        self.state.lock().signed.public.clone()
    }

    /// Replace the signed pre-key with a freshly generated and signed one.
    ///
    /// The replaced key remains usable for responding until the next rotation.
    pub fn rotate_signed_pre_key(&self) -> Result<SignedPreKey, CryptoError> {
        let mut state = self.state.lock();
        let next_id = state.signed.public.id.wrapping_add(1).max(1);
        let fresh = generate_signed(&self.identity, next_id)?;
        let public = fresh.public.clone();

        // The in-memory pool only moves once the keychain holds the new pair.
        self.persist_with(&fresh, Some(&state.signed), &state)?;
        let old = std::mem::replace(&mut state.signed, fresh);
        state.previous_signed = Some(old);

        tracing::info!(signed_prekey_id = public.id, "signed pre-key rotated");
        Ok(public)
    }

    /// Whether the signed pre-key is older than the rotation interval.
    pub fn needs_rotation(&self) -> bool {
        self.needs_rotation_at(now_millis())
    }

    pub fn needs_rotation_at(&self, now_ms: u64) -> bool {
        let created_at = self.state.lock().signed.public.created_at;
        now_ms.saturating_sub(created_at) >= duration_millis(self.config.signed_prekey_rotation())
    }

    /// Append `count` fresh one-time pre-keys to the pool.
    pub fn replenish_one_time_pre_keys(
        &self,
        count: usize,
    ) -> Result<Vec<OneTimePreKey>, CryptoError> {
        let mut state = self.state.lock();
        let added = generate_one_time(&mut state, count)?;
        self.persist(&state)?;
        tracing::debug!(added = added.len(), usable = state.usable_count(), "one-time pre-keys replenished");
        Ok(added)
    }

    /// Refill to the target when the usable count is below the low-water mark.
    ///
    /// Returns how many keys were added.
    pub fn replenish_if_needed(&self) -> Result<usize, CryptoError> {
        let mut state = self.state.lock();
        let usable = state.usable_count();
        if usable >= self.config.low_water_mark {
            return Ok(0);
        }
        let missing = self.config.replenish_target.saturating_sub(usable);
        let added = generate_one_time(&mut state, missing)?;
        self.persist(&state)?;
        tracing::info!(added = added.len(), "one-time pre-key pool below low-water mark, refilled");
        Ok(added.len())
    }

    /// Number of one-time keys not yet handed out.
    pub fn available_one_time_count(&self) -> usize {
        self.state.lock().usable_count()
    }

    /// Hand out one unused one-time pre-key.
    ///
    /// Check and mark happen under the pool lock: concurrent callers never
    /// receive the same key.
    pub fn consume_one_time_pre_key(&self) -> Option<OneTimePreKey> {
        let now_ms = now_millis();
        let grace_ms = duration_millis(self.config.consumed_grace());
        let mut state = self.state.lock();
        state
            .one_time
            .retain(|_, k| !k.consumed_at.is_some_and(|at| now_ms.saturating_sub(at) >= grace_ms));
        let record = state.one_time.values_mut().find(|k| !k.is_consumed())?;
        record.consumed_at = Some(now_ms);
        let public = record.public();

        if let Err(e) = self.persist(&state) {
            tracing::error!(error = %e, prekey_id = public.id, "failed to persist consumed one-time pre-key");
        }
        Some(public)
    }

    /// Discard never-consumed one-time keys older than `max_age`, and
    /// handed-out keys nobody claimed within the consumed grace period.
    pub fn prune_expired(&self, max_age: Duration) -> Result<usize, CryptoError> {
        self.prune_expired_at(max_age, now_millis())
    }

    pub fn prune_expired_at(&self, max_age: Duration, now_ms: u64) -> Result<usize, CryptoError> {
        let max_age_ms = duration_millis(max_age);
        let grace_ms = duration_millis(self.config.consumed_grace());
        let mut state = self.state.lock();
        let before = state.one_time.len();
        state
            .one_time
            .retain(|_, k| k.is_live(now_ms, max_age_ms, grace_ms));
        let pruned = before - state.one_time.len();
        if pruned > 0 {
            self.persist(&state)?;
            tracing::info!(pruned, "expired one-time pre-keys discarded");
        }
        Ok(pruned)
    }

    /// The bundle to publish: signed pre-key plus every usable one-time key.
    pub fn public_bundle(&self) -> PreKeyBundle {
        let state = self.state.lock();
        PreKeyBundle {
            identity_did: self.identity.did(),
            signed_pre_key: state.signed.public.clone(),
            one_time_pre_keys: state
                .one_time
                .values()
                .filter(|k| !k.is_consumed())
                .map(OneTimePreKeyRecord::public)
                .collect(),
        }
    }

    /// A bundle for one specific initiator, carrying a single freshly consumed
    /// one-time key (or none if the pool is empty).
    pub fn bundle_for_session(&self) -> PreKeyBundle {
        let one_time = self.consume_one_time_pre_key();
        if one_time.is_none() {
            tracing::warn!("one-time pre-key pool exhausted, bundle carries no one-time key");
        }
        PreKeyBundle {
            identity_did: self.identity.did(),
            signed_pre_key: self.signed_pre_key(),
            one_time_pre_keys: one_time.into_iter().collect(),
        }
    }

    /// Secret for the current or previous signed pre-key.
    pub(crate) fn signed_pre_key_secret(&self, id: u32) -> Option<StaticSecret> {
        let state = self.state.lock();
        if state.signed.public.id == id {
            return Some(StaticSecret::from(state.signed.secret));
        }
        state
            .previous_signed
            .as_ref()
            .filter(|p| p.public.id == id)
            .map(|p| StaticSecret::from(p.secret))
    }

    /// Remove and return a one-time secret. Single use: a second call for the
    /// same id returns `None`.
    pub(crate) fn take_one_time_secret(&self, id: u32) -> Result<Option<StaticSecret>, CryptoError> {
        let mut state = self.state.lock();
        let Some(record) = state.one_time.remove(&id) else {
            return Ok(None);
        };
        let secret = StaticSecret::from(record.secret);
        drop(record);
        self.persist(&state)?;
        Ok(Some(secret))
    }

    fn persist(&self, state: &PoolState) -> Result<(), CryptoError> {
        self.persist_with(&state.signed, state.previous_signed.as_ref(), state)
    }

    /// Store the given signed pair alongside the one-time batch of `state`.
    fn persist_with(
        &self,
        signed: &SignedPreKeyRecord,
        previous: Option<&SignedPreKeyRecord>,
        state: &PoolState,
    ) -> Result<(), CryptoError> {
        let Some(keychain) = &self.keychain else {
            return Ok(());
        };
        match previous {
            Some(previous) => keychain.store_key(
                VAULT_PREKEYS,
                KEY_PREVIOUS_SIGNED_PREKEY,
                &encode_record(previous)?,
            )?,
            None => keychain.delete_key(VAULT_PREKEYS, KEY_PREVIOUS_SIGNED_PREKEY)?,
        }
        keychain.store_key(VAULT_PREKEYS, KEY_SIGNED_PREKEY, &encode_record(signed)?)?;

        let batch = BatchRef {
            next_id: state.next_one_time_id,
            keys: state.one_time.values().collect(),
        };
        keychain.store_key(VAULT_PREKEYS, KEY_PREKEY_BATCH, &encode_record(&batch)?)
    }
}

/// Borrowing twin of [`OneTimeBatch`] for serialization.
#[derive(Serialize)]
struct BatchRef<'a> {
    next_id: u32,
    keys: Vec<&'a OneTimePreKeyRecord>,
}

fn generate_signed(identity: &Identity, id: u32) -> Result<SignedPreKeyRecord, CryptoError> {
    let secret = random_x25519_secret()?;
    let public = X25519Public::from(&secret);
    let signature = identity.sign(public.as_bytes());
    Ok(SignedPreKeyRecord {
        public: SignedPreKey {
            id,
            public_key: public.to_bytes(),
            signature: signature.to_vec(),
            created_at: now_millis(),
        },
        secret: secret.to_bytes(),
    })
}

fn generate_one_time(state: &mut PoolState, count: usize) -> Result<Vec<OneTimePreKey>, CryptoError> {
    let mut added = Vec::with_capacity(count);
    let created_at = now_millis();
    for _ in 0..count {
        let secret = random_x25519_secret()?;
        let id = state.next_one_time_id;
        state.next_one_time_id = state.next_one_time_id.wrapping_add(1).max(1);

        let record = OneTimePreKeyRecord {
            id,
            public_key: X25519Public::from(&secret).to_bytes(),
            secret: secret.to_bytes(),
            created_at,
            consumed_at: None,
        };
        added.push(record.public());
        state.one_time.insert(id, record);
    }
    Ok(added)
}

fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>, CryptoError> {
    serde_json::to_vec(record).map_err(|e| CryptoError::StorageError(format!("encode pre-key: {e}")))
}

fn decode_record<T: for<'de> Deserialize<'de>>(bytes: &[u8], what: &str) -> Result<T, CryptoError> {
    serde_json::from_slice(bytes).map_err(|e| CryptoError::StorageError(format!("decode {what}: {e}")))
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
