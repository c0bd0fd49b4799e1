//! Group rosters and shared group keys.
//!
//! Each group has one current [`GroupKey`]. The key is wrapped for every
//! active member under that member's pairwise [`Session`](crate::session::Session)
//! and replaced whenever the roster shrinks.

mod group_key;
mod manager;
mod policy;

use serde::{Deserialize, Serialize};

pub use group_key::GroupKey;
pub use manager::GroupKeyManager;
pub use policy::GroupPolicy;

use crate::util::base64_bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupRole {
    Creator,
    Admin,
    Member,
}

impl GroupRole {
    pub fn can_manage_roster(self) -> bool {
        matches!(self, Self::Creator | Self::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    /// The member's DID.
    pub member_id: String,
    pub public_key: [u8; 32],
    pub joined_at: u64,
    pub role: GroupRole,
    pub is_active: bool,
}

/// Roster and policy of a group. Removed members stay listed as inactive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    pub group_id: String,
    pub name: String,
    pub creator: String,
    pub members: Vec<GroupMember>,
    pub policy: GroupPolicy,
    pub created_at: u64,
    /// Version of the current group key.
    pub key_version: u64,
}

impl GroupInfo {
    pub fn member(&self, member_id: &str) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.member_id == member_id)
    }

    pub fn is_active_member(&self, member_id: &str) -> bool {
        self.member(member_id).is_some_and(|m| m.is_active)
    }

    pub fn active_members(&self) -> impl Iterator<Item = &GroupMember> {
        self.members.iter().filter(|m| m.is_active)
    }

    pub fn active_count(&self) -> usize {
        self.active_members().count()
    }

    /// Whether `member_id` is active and may add or remove members.
    pub fn can_manage_roster(&self, member_id: &str) -> bool {
        self.member(member_id)
            .is_some_and(|m| m.is_active && m.role.can_manage_roster())
    }

    fn member_mut(&mut self, member_id: &str) -> Option<&mut GroupMember> {
        self.members.iter_mut().find(|m| m.member_id == member_id)
    }
}

/// A group key sealed for one member under the pairwise session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDistributionPackage {
    pub group_id: String,
    pub target_member_id: String,
    #[serde(with = "base64_bytes")]
    pub encrypted_group_key: Vec<u8>,
    pub key_version: u64,
    pub timestamp: u64,
}

/// A message encrypted under one version of a group key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessage {
    pub group_id: String,
    pub key_version: u64,
    pub sender_did: String,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    pub timestamp: u64,
}

impl GroupMessage {
    /// Bytes authenticated with the ciphertext besides group id and version.
    fn context(sender_did: &str, timestamp: u64) -> Vec<u8> {
        let mut context = Vec::with_capacity(sender_did.len() + 8);
        context.extend_from_slice(sender_did.as_bytes());
        context.extend_from_slice(&timestamp.to_be_bytes());
        context
    }
}

/// Result of replacing a group key.
#[derive(Debug, Clone)]
pub struct KeyRotation {
    pub key: GroupKey,
    pub packages: Vec<KeyDistributionPackage>,
    /// Active members the key could not be wrapped for (no session yet).
    pub undelivered: Vec<String>,
}

impl KeyRotation {
    pub fn version(&self) -> u64 {
        self.key.version()
    }
}
