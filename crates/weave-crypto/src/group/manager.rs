use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{
    GroupInfo, GroupKey, GroupMember, GroupMessage, GroupPolicy, GroupRole,
    KeyDistributionPackage, KeyRotation,
};
use crate::did;
use crate::error::CryptoError;
use crate::keychain::{group_key_name, Keychain, VAULT_GROUPS};
use crate::session::SessionManager;
use crate::store::GroupStore;
use crate::util::now_millis;

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyEntry {
    key: GroupKey,
    /// Set when a newer version became current.
    retired_at: Option<u64>,
}

/// Every retained key version of one group.
#[derive(Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyRing {
    current: u64,
    keys: BTreeMap<u64, KeyEntry>,
    /// On a ring without a roster: the peer whose first package created it.
    /// Later packages must come from the same peer.
    #[serde(default)]
    distributor: Option<String>,
}

impl KeyRing {
    fn current_key(&self) -> Option<&GroupKey> {
        self.keys.get(&self.current).map(|e| &e.key)
    }

    /// Add a key version. A newer version becomes current and retires the old
    /// one; an older, unknown version is kept as already retired.
    fn install(&mut self, key: GroupKey, now: u64) -> bool {
        let version = key.version();
        if self.keys.contains_key(&version) {
            return false;
        }
        if version > self.current {
            if let Some(previous) = self.keys.get_mut(&self.current) {
                previous.retired_at = Some(now);
            }
            self.current = version;
            self.keys.insert(version, KeyEntry { key, retired_at: None });
        } else {
            self.keys.insert(
                version,
                KeyEntry {
                    key,
                    retired_at: Some(now),
                },
            );
        }
        true
    }

    fn usable(&self, version: u64, retention_ms: u64, now: u64) -> Option<&GroupKey> {
        let entry = self.keys.get(&version)?;
        match entry.retired_at {
            Some(retired) if now.saturating_sub(retired) > retention_ms => None,
            _ => Some(&entry.key),
        }
    }

    fn discard_expired(&mut self, retention_ms: u64, now: u64) -> usize {
        let before = self.keys.len();
        self.keys.retain(|_, entry| match entry.retired_at {
            Some(retired) => now.saturating_sub(retired) <= retention_ms,
            None => true,
        });
        before - self.keys.len()
    }
}

struct GroupState {
    /// Roster, present only where this peer created or administers the group.
    info: Option<GroupInfo>,
    policy: GroupPolicy,
    ring: KeyRing,
}

#[derive(Default)]
struct GroupTable {
    groups: HashMap<String, GroupState>,
    outbox: Vec<KeyDistributionPackage>,
    /// `(group_id, member_did)` pairs still owed the current key.
    pending: HashSet<(String, String)>,
}

/// Maintains group rosters and key rings for the local identity.
///
/// Rosters, key rings and the outgoing distribution queue share one lock, so a
/// rotation's packages are queued in the same critical section that makes the
/// new version current.
pub struct GroupKeyManager {
    sessions: Arc<SessionManager>,
    table: Mutex<GroupTable>,
    store: Option<Arc<dyn GroupStore>>,
    keychain: Option<Arc<dyn Keychain>>,
}

impl GroupKeyManager {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            table: Mutex::new(GroupTable::default()),
            store: None,
            keychain: None,
        }
    }

    /// Build a manager that persists rosters and key rings, restoring the
    /// groups already in `store`.
    pub fn with_persistence(
        sessions: Arc<SessionManager>,
        store: Arc<dyn GroupStore>,
        keychain: Arc<dyn Keychain>,
    ) -> Result<Self, CryptoError> {
        let mut table = GroupTable::default();
        for group_id in store.list_groups()? {
            let Some(info) = store.load_group(&group_id)? else {
                continue;
            };
            let ring = load_ring(keychain.as_ref(), &group_id)?.unwrap_or_default();
            table.groups.insert(
                group_id,
                GroupState {
                    policy: info.policy.clone(),
                    info: Some(info),
                    ring,
                },
            );
        }
        tracing::debug!(count = table.groups.len(), "groups restored");
        Ok(Self {
            sessions,
            table: Mutex::new(table),
            store: Some(store),
            keychain: Some(keychain),
        })
    }

    fn local_did(&self) -> String {
        self.sessions.local_did()
    }

    /// Create a group with the local identity as `CREATOR` and key version 1.
    ///
    /// Returns the roster and the key packages for the initial members that
    /// already have a session; the rest are queued until
    /// [`redistribute_pending`](Self::redistribute_pending).
    pub fn create_group(
        &self,
        group_id: &str,
        name: &str,
        initial_members: &[String],
        policy: GroupPolicy,
    ) -> Result<(GroupInfo, Vec<KeyDistributionPackage>), CryptoError> {
        if group_id.is_empty() {
            return Err(CryptoError::InvalidArgument("group id is empty".into()));
        }
        let local = self.local_did();
        let now = now_millis();

        let mut members = vec![GroupMember {
            member_id: local.clone(),
            public_key: self.sessions.identity().public_key_bytes(),
            joined_at: now,
            role: GroupRole::Creator,
            is_active: true,
        }];
        for member_id in initial_members {
            if members.iter().any(|m| &m.member_id == member_id) {
                continue;
            }
            members.push(GroupMember {
                member_id: member_id.clone(),
                public_key: did::resolve(member_id)?,
                joined_at: now,
                role: GroupRole::Member,
                is_active: true,
            });
        }
        if members.len() > policy.max_group_size {
            return Err(CryptoError::SecurityPolicyViolation(format!(
                "group of {} exceeds the limit of {}",
                members.len(),
                policy.max_group_size
            )));
        }

        let mut table = self.table.lock();
        let GroupTable {
            groups,
            outbox,
            pending,
        } = &mut *table;
        if groups.contains_key(group_id) {
            return Err(CryptoError::GroupError(format!(
                "group {group_id} already exists"
            )));
        }

        let info = GroupInfo {
            group_id: group_id.to_string(),
            name: name.to_string(),
            creator: local,
            members,
            policy: policy.clone(),
            created_at: now,
            key_version: 0,
        };
        let mut state = GroupState {
            info: Some(info),
            policy,
            ring: KeyRing::default(),
        };
        let rotation = self.rotate_locked(group_id, &mut state, outbox, pending)?;
        let info = administered(&mut state, group_id)?.clone();
        self.persist(group_id, &state);
        groups.insert(group_id.to_string(), state);

        tracing::info!(
            group = group_id,
            members = info.members.len(),
            undelivered = rotation.undelivered.len(),
            "group created"
        );
        Ok((info, rotation.packages))
    }

    /// Give a new member the current key. The key is not rotated, so the
    /// member cannot read earlier traffic.
    ///
    /// Re-admitting a removed member rotates instead when the policy says so.
    pub fn add_member(
        &self,
        group_id: &str,
        member_id: &str,
    ) -> Result<KeyDistributionPackage, CryptoError> {
        let public_key = did::resolve(member_id)?;
        if self.sessions.session(member_id).is_none() {
            return Err(CryptoError::SessionError(format!(
                "no session with {member_id}"
            )));
        }

        let local = self.local_did();
        let mut table = self.table.lock();
        let GroupTable {
            groups,
            outbox,
            pending,
        } = &mut *table;
        let state = groups.get_mut(group_id).ok_or_else(|| unknown_group(group_id))?;
        let max_group_size = state.policy.max_group_size;
        let rotate_on_readmission = state.policy.auto_rotate_on_member_change;
        let info = administered(state, group_id)?;
        if !info.can_manage_roster(&local) {
            return Err(CryptoError::SecurityPolicyViolation(format!(
                "{local} may not add members to {group_id}"
            )));
        }
        if info.active_count() + 1 > max_group_size {
            return Err(CryptoError::SecurityPolicyViolation(format!(
                "group {group_id} is full ({max_group_size} members)"
            )));
        }

        let readmitted = match info.member_mut(member_id) {
            Some(member) if member.is_active => {
                return Err(CryptoError::GroupError(format!(
                    "{member_id} is already a member of {group_id}"
                )));
            }
            Some(member) => {
                member.is_active = true;
                member.joined_at = now_millis();
                true
            }
            None => {
                info.members.push(GroupMember {
                    member_id: member_id.to_string(),
                    public_key,
                    joined_at: now_millis(),
                    role: GroupRole::Member,
                    is_active: true,
                });
                false
            }
        };

        let package = if readmitted && rotate_on_readmission {
            let rotation = self.rotate_locked(group_id, state, outbox, pending)?;
            rotation
                .packages
                .into_iter()
                .find(|p| p.target_member_id == member_id)
                .ok_or_else(|| CryptoError::SessionError(format!("no session with {member_id}")))?
        } else {
            let key = state
                .ring
                .current_key()
                .ok_or_else(|| CryptoError::KeyNotAvailable {
                    group_id: group_id.to_string(),
                    version: state.ring.current,
                })?;
            let package = self
                .wrap(key, member_id)?
                .ok_or_else(|| CryptoError::SessionError(format!("no session with {member_id}")))?;
            outbox.push(package.clone());
            package
        };

        self.persist(group_id, state);
        tracing::info!(group = group_id, member = member_id, readmitted, "member added");
        Ok(package)
    }

    /// Deactivate a member and replace the group key.
    ///
    /// The new key is wrapped for every remaining active member before it
    /// becomes current; the removed member never receives it.
    pub fn remove_member(&self, group_id: &str, member_id: &str) -> Result<KeyRotation, CryptoError> {
        let local = self.local_did();
        let mut table = self.table.lock();
        let GroupTable {
            groups,
            outbox,
            pending,
        } = &mut *table;
        let state = groups.get_mut(group_id).ok_or_else(|| unknown_group(group_id))?;
        let info = administered(state, group_id)?;

        let actor_role = info
            .member(&local)
            .filter(|m| m.is_active)
            .map(|m| m.role)
            .ok_or_else(|| {
                CryptoError::SecurityPolicyViolation(format!("{local} is not an active member"))
            })?;
        if !actor_role.can_manage_roster() {
            return Err(CryptoError::SecurityPolicyViolation(format!(
                "{local} may not remove members from {group_id}"
            )));
        }
        if member_id == local {
            return Err(CryptoError::GroupError("cannot remove yourself".into()));
        }
        let target = info
            .member_mut(member_id)
            .filter(|m| m.is_active)
            .ok_or_else(|| {
                CryptoError::GroupError(format!("{member_id} is not an active member of {group_id}"))
            })?;
        match target.role {
            GroupRole::Creator => {
                return Err(CryptoError::SecurityPolicyViolation(
                    "the group creator cannot be removed".into(),
                ));
            }
            GroupRole::Admin if actor_role != GroupRole::Creator => {
                return Err(CryptoError::SecurityPolicyViolation(
                    "only the creator can remove an admin".into(),
                ));
            }
            _ => {}
        }
        target.is_active = false;
        pending.retain(|(g, m)| !(g == group_id && m == member_id));

        let rotation = self.rotate_locked(group_id, state, outbox, pending)?;
        self.persist(group_id, state);
        tracing::info!(
            group = group_id,
            member = member_id,
            version = rotation.version(),
            "member removed, key rotated"
        );
        Ok(rotation)
    }

    /// Replace the group key on demand.
    pub fn rotate_group_key(&self, group_id: &str) -> Result<KeyRotation, CryptoError> {
        let local = self.local_did();
        let mut table = self.table.lock();
        let GroupTable {
            groups,
            outbox,
            pending,
        } = &mut *table;
        let state = groups.get_mut(group_id).ok_or_else(|| unknown_group(group_id))?;
        if !administered(state, group_id)?.can_manage_roster(&local) {
            return Err(CryptoError::SecurityPolicyViolation(format!(
                "{local} may not rotate the key of {group_id}"
            )));
        }
        let rotation = self.rotate_locked(group_id, state, outbox, pending)?;
        self.persist(group_id, state);
        Ok(rotation)
    }

    /// Rotate every group we created whose policy interval has elapsed.
    pub fn rotate_due_groups(&self) -> Vec<KeyRotation> {
        self.rotate_due_groups_at(now_millis())
    }

    pub fn rotate_due_groups_at(&self, now: u64) -> Vec<KeyRotation> {
        let local = self.local_did();
        let mut table = self.table.lock();
        let GroupTable {
            groups,
            outbox,
            pending,
        } = &mut *table;

        let mut rotations = Vec::new();
        for (group_id, state) in groups.iter_mut() {
            let Some(interval) = state.policy.key_rotation_interval() else {
                continue;
            };
            let created_by_us = state.info.as_ref().is_some_and(|i| i.creator == local);
            let current_created = state.ring.current_key().map(GroupKey::created_at);
            let due = current_created.is_some_and(|created| {
                now.saturating_sub(created) >= duration_ms(interval)
            });
            if !created_by_us || !due {
                continue;
            }
            match self.rotate_locked(group_id, state, outbox, pending) {
                Ok(rotation) => {
                    tracing::info!(group = %group_id, version = rotation.version(), "scheduled key rotation");
                    self.persist(group_id, state);
                    rotations.push(rotation);
                }
                Err(e) => {
                    tracing::warn!(group = %group_id, error = %e, "scheduled key rotation failed");
                }
            }
        }
        rotations
    }

    /// Drop superseded key versions older than each group's retention window.
    pub fn discard_expired_keys(&self) -> usize {
        self.discard_expired_keys_at(now_millis())
    }

    pub fn discard_expired_keys_at(&self, now: u64) -> usize {
        let mut table = self.table.lock();
        let mut discarded = 0;
        for (group_id, state) in table.groups.iter_mut() {
            let retention = duration_ms(state.policy.previous_key_retention());
            let dropped = state.ring.discard_expired(retention, now);
            if dropped > 0 {
                tracing::debug!(group = %group_id, dropped, "discarded old group keys");
                self.persist(group_id, state);
                discarded += dropped;
            }
        }
        discarded
    }

    /// Install a group key received from `from_did`. Returns its version.
    pub fn accept_distribution(
        &self,
        from_did: &str,
        package: &KeyDistributionPackage,
    ) -> Result<u64, CryptoError> {
        let local = self.local_did();
        if package.target_member_id != local {
            return Err(CryptoError::GroupError(format!(
                "package is addressed to {}",
                package.target_member_id
            )));
        }
        let session = self
            .sessions
            .session(from_did)
            .ok_or_else(|| CryptoError::SessionError(format!("no session with {from_did}")))?;
        let wire = session.open(
            &package.encrypted_group_key,
            &package_aad(&package.group_id, package.key_version, &local),
        )?;
        let key = GroupKey::from_wire_bytes(&package.group_id, &wire, from_did, package.timestamp)
            .ok_or_else(|| CryptoError::GroupError("malformed group key".into()))?;
        if key.version() != package.key_version {
            return Err(CryptoError::GroupError(format!(
                "package claims v{} but carries v{}",
                package.key_version,
                key.version()
            )));
        }

        let mut table = self.table.lock();
        if !table.groups.contains_key(&package.group_id) {
            let ring = self.restore_ring(&package.group_id).unwrap_or_default();
            table.groups.insert(
                package.group_id.clone(),
                GroupState {
                    info: None,
                    policy: GroupPolicy::default(),
                    ring,
                },
            );
        }
        let Some(state) = table.groups.get_mut(&package.group_id) else {
            return Err(unknown_group(&package.group_id));
        };
        if let Some(info) = &state.info {
            if !info.can_manage_roster(from_did) {
                return Err(CryptoError::SecurityPolicyViolation(format!(
                    "{from_did} may not distribute keys for {}",
                    package.group_id
                )));
            }
        } else {
            let distributor = state.ring.distributor.get_or_insert_with(|| from_did.to_string());
            if distributor.as_str() != from_did {
                tracing::warn!(group = %package.group_id, from = from_did, distributor = %distributor, "key package from a stranger rejected");
                return Err(CryptoError::SecurityPolicyViolation(format!(
                    "keys for {} come from {distributor}, not {from_did}",
                    package.group_id
                )));
            }
        }

        let version = key.version();
        if state.ring.install(key, now_millis()) {
            if let Some(info) = state.info.as_mut() {
                info.key_version = state.ring.current;
            }
            self.persist(&package.group_id, state);
            tracing::debug!(group = %package.group_id, version, from = from_did, "group key installed");
        }
        Ok(version)
    }

    /// Encrypt under the current key of a group.
    pub fn encrypt_group_message(
        &self,
        group_id: &str,
        plaintext: &[u8],
    ) -> Result<GroupMessage, CryptoError> {
        let local = self.local_did();
        let mut table = self.table.lock();
        let state = self
            .state_mut(&mut table.groups, group_id)
            .ok_or_else(|| unknown_group(group_id))?;
        if let Some(info) = &state.info {
            if !info.is_active_member(&local) {
                return Err(CryptoError::SecurityPolicyViolation(format!(
                    "{local} is not an active member of {group_id}"
                )));
            }
        }
        let key = state
            .ring
            .current_key()
            .ok_or_else(|| CryptoError::KeyNotAvailable {
                group_id: group_id.to_string(),
                version: state.ring.current,
            })?;

        let timestamp = now_millis();
        let ciphertext = key.encrypt(plaintext, &GroupMessage::context(&local, timestamp))?;
        Ok(GroupMessage {
            group_id: group_id.to_string(),
            key_version: key.version(),
            sender_did: local,
            ciphertext,
            timestamp,
        })
    }

    /// Decrypt a group message.
    ///
    /// A version we never had or already discarded is `KeyNotAvailable`; a
    /// failed tag is `DecryptionError`.
    pub fn decrypt_group_message(&self, message: &GroupMessage) -> Result<Vec<u8>, CryptoError> {
        self.decrypt_group_message_at(message, now_millis())
    }

    pub fn decrypt_group_message_at(
        &self,
        message: &GroupMessage,
        now: u64,
    ) -> Result<Vec<u8>, CryptoError> {
        let not_available = || CryptoError::KeyNotAvailable {
            group_id: message.group_id.clone(),
            version: message.key_version,
        };

        let mut table = self.table.lock();
        let state = self
            .state_mut(&mut table.groups, &message.group_id)
            .ok_or_else(not_available)?;
        if let Some(info) = &state.info {
            if !info.is_active_member(&message.sender_did) {
                return Err(CryptoError::SecurityPolicyViolation(format!(
                    "{} is not an active member of {}",
                    message.sender_did, message.group_id
                )));
            }
        }
        if let Some(expiry) = state.policy.message_expiration_time() {
            if now.saturating_sub(message.timestamp) > duration_ms(expiry) {
                return Err(CryptoError::SecurityPolicyViolation(format!(
                    "message from {} has expired",
                    message.sender_did
                )));
            }
        }

        let retention = duration_ms(state.policy.previous_key_retention());
        let key = state
            .ring
            .usable(message.key_version, retention, now)
            .ok_or_else(not_available)?;
        key.decrypt(
            &message.ciphertext,
            &GroupMessage::context(&message.sender_did, message.timestamp),
        )
    }

    /// Change a member's role. Only the creator may do this, and the creator
    /// role cannot be handed out.
    pub fn set_member_role(
        &self,
        group_id: &str,
        member_id: &str,
        role: GroupRole,
    ) -> Result<(), CryptoError> {
        let local = self.local_did();
        let mut table = self.table.lock();
        let state = table
            .groups
            .get_mut(group_id)
            .ok_or_else(|| unknown_group(group_id))?;
        let info = administered(state, group_id)?;
        if info.creator != local {
            return Err(CryptoError::SecurityPolicyViolation(
                "only the creator can change roles".into(),
            ));
        }
        if role == GroupRole::Creator {
            return Err(CryptoError::SecurityPolicyViolation(
                "the creator role cannot be assigned".into(),
            ));
        }
        let member = info
            .member_mut(member_id)
            .filter(|m| m.is_active && m.role != GroupRole::Creator)
            .ok_or_else(|| {
                CryptoError::GroupError(format!("{member_id} has no assignable role in {group_id}"))
            })?;
        member.role = role;
        self.persist(group_id, state);
        Ok(())
    }

    /// Wrap current keys for a peer that was owed them and now has a session.
    pub fn redistribute_pending(
        &self,
        member_id: &str,
    ) -> Result<Vec<KeyDistributionPackage>, CryptoError> {
        let mut table = self.table.lock();
        let GroupTable {
            groups,
            outbox,
            pending,
        } = &mut *table;

        let owed: Vec<String> = pending
            .iter()
            .filter(|(_, m)| m == member_id)
            .map(|(g, _)| g.clone())
            .collect();
        let mut packages = Vec::new();
        for group_id in owed {
            let Some(key) = groups.get(&group_id).and_then(|s| s.ring.current_key()) else {
                pending.remove(&(group_id, member_id.to_string()));
                continue;
            };
            if let Some(package) = self.wrap(key, member_id)? {
                pending.remove(&(group_id, member_id.to_string()));
                outbox.push(package.clone());
                packages.push(package);
            }
        }
        Ok(packages)
    }

    /// Take every package queued for delivery.
    pub fn drain_outbox(&self) -> Vec<KeyDistributionPackage> {
        std::mem::take(&mut self.table.lock().outbox)
    }

    pub fn group_info(&self, group_id: &str) -> Option<GroupInfo> {
        self.table
            .lock()
            .groups
            .get(group_id)
            .and_then(|s| s.info.clone())
    }

    pub fn current_version(&self, group_id: &str) -> Option<u64> {
        self.table
            .lock()
            .groups
            .get(group_id)
            .map(|s| s.ring.current)
            .filter(|v| *v > 0)
    }

    pub fn groups(&self) -> Vec<String> {
        self.table.lock().groups.keys().cloned().collect()
    }

    /// Peers a locally sent group message should go to.
    ///
    /// With a roster that is every other active member. Without one, the
    /// message goes to the peer that distributes this group's keys, who
    /// relays it.
    pub fn message_recipients(&self, group_id: &str) -> Vec<String> {
        let local = self.local_did();
        let table = self.table.lock();
        let Some(state) = table.groups.get(group_id) else {
            return Vec::new();
        };
        match &state.info {
            Some(info) => info
                .active_members()
                .map(|m| m.member_id.clone())
                .filter(|m| *m != local)
                .collect(),
            None => state
                .ring
                .distributor
                .clone()
                .or_else(|| state.ring.current_key().map(|k| k.creator().to_string()))
                .filter(|c| *c != local)
                .into_iter()
                .collect(),
        }
    }

    fn rotate_locked(
        &self,
        group_id: &str,
        state: &mut GroupState,
        outbox: &mut Vec<KeyDistributionPackage>,
        pending: &mut HashSet<(String, String)>,
    ) -> Result<KeyRotation, CryptoError> {
        let local = self.local_did();
        let version = state.ring.current + 1;
        let key = GroupKey::generate(group_id, version, &local)?;

        let mut packages = Vec::new();
        let mut undelivered = Vec::new();
        let recipients: Vec<String> = state
            .info
            .iter()
            .flat_map(|info| info.active_members())
            .map(|m| m.member_id.clone())
            .filter(|m| *m != local)
            .collect();
        for member_id in recipients {
            match self.wrap(&key, &member_id)? {
                Some(package) => packages.push(package),
                None => undelivered.push(member_id),
            }
        }

        outbox.extend(packages.iter().cloned());
        for member_id in &undelivered {
            pending.insert((group_id.to_string(), member_id.clone()));
        }
        if !undelivered.is_empty() {
            tracing::warn!(group = group_id, version, count = undelivered.len(), "members without a session");
        }

        state.ring.install(key.clone(), now_millis());
        if let Some(info) = state.info.as_mut() {
            info.key_version = version;
        }
        Ok(KeyRotation {
            key,
            packages,
            undelivered,
        })
    }

    fn wrap(
        &self,
        key: &GroupKey,
        member_id: &str,
    ) -> Result<Option<KeyDistributionPackage>, CryptoError> {
        let Some(session) = self.sessions.session(member_id) else {
            return Ok(None);
        };
        let encrypted = session.seal(
            &key.to_wire_bytes(),
            &package_aad(key.group_id(), key.version(), member_id),
        )?;
        Ok(Some(KeyDistributionPackage {
            group_id: key.group_id().to_string(),
            target_member_id: member_id.to_string(),
            encrypted_group_key: encrypted,
            key_version: key.version(),
            timestamp: now_millis(),
        }))
    }

    /// Look up a group, restoring a member-side key ring from the keychain.
    fn state_mut<'a>(
        &self,
        groups: &'a mut HashMap<String, GroupState>,
        group_id: &str,
    ) -> Option<&'a mut GroupState> {
        if !groups.contains_key(group_id) {
            let ring = self.restore_ring(group_id)?;
            groups.insert(
                group_id.to_string(),
                GroupState {
                    info: None,
                    policy: GroupPolicy::default(),
                    ring,
                },
            );
        }
        groups.get_mut(group_id)
    }

    fn restore_ring(&self, group_id: &str) -> Option<KeyRing> {
        let keychain = self.keychain.as_ref()?;
        match load_ring(keychain.as_ref(), group_id) {
            Ok(ring) => ring,
            Err(e) => {
                tracing::warn!(group = group_id, error = %e, "failed to restore group keys");
                None
            }
        }
    }

    fn persist(&self, group_id: &str, state: &GroupState) {
        if let (Some(store), Some(info)) = (&self.store, &state.info) {
            if let Err(e) = store.save_group(info) {
                tracing::warn!(group = group_id, error = %e, "failed to persist group roster");
            }
        }
        if let Some(keychain) = &self.keychain {
            let result = serde_json::to_vec(&state.ring)
                .map_err(|e| CryptoError::StorageError(e.to_string()))
                .and_then(|bytes| keychain.store_key(VAULT_GROUPS, &group_key_name(group_id), &bytes));
            if let Err(e) = result {
                tracing::warn!(group = group_id, error = %e, "failed to persist group keys");
            }
        }
    }
}

fn load_ring(keychain: &dyn Keychain, group_id: &str) -> Result<Option<KeyRing>, CryptoError> {
    let Some(bytes) = keychain.load_key(VAULT_GROUPS, &group_key_name(group_id))? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| CryptoError::StorageError(format!("corrupt key ring for {group_id}: {e}")))
}

fn administered<'a>(state: &'a mut GroupState, group_id: &str) -> Result<&'a mut GroupInfo, CryptoError> {
    state.info.as_mut().ok_or_else(|| {
        CryptoError::SecurityPolicyViolation(format!("{group_id} is not administered by this peer"))
    })
}

fn unknown_group(group_id: &str) -> CryptoError {
    CryptoError::GroupError(format!("unknown group {group_id}"))
}

fn package_aad(group_id: &str, version: u64, target: &str) -> Vec<u8> {
    format!("weave-group-key|{group_id}|{version}|{target}").into_bytes()
}

fn duration_ms(duration: std::time::Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
