use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Rules a group is run under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupPolicy {
    /// Upper bound on active members, creator included.
    pub max_group_size: usize,
    /// Rotate when a previously removed member is re-admitted. Removal always
    /// rotates and a first-time join never does.
    pub auto_rotate_on_member_change: bool,
    /// Time-based rotation; `None` disables it.
    pub key_rotation_interval_secs: Option<u64>,
    /// Messages older than this are refused; `None` disables the check.
    pub message_expiration_secs: Option<u64>,
    /// How long a superseded key version stays usable for in-flight messages.
    pub previous_key_retention_secs: u64,
}

impl Default for GroupPolicy {
    fn default() -> Self {
        Self {
            max_group_size: 256,
            auto_rotate_on_member_change: true,
            key_rotation_interval_secs: None,
            message_expiration_secs: None,
            previous_key_retention_secs: 10 * 60,
        }
    }
}

impl GroupPolicy {
    /// Daily rotation and a 50-member cap on top of the default rules.
    pub fn high_security() -> Self {
        Self {
            max_group_size: 50,
            key_rotation_interval_secs: Some(24 * 60 * 60),
            ..Self::default()
        }
    }

    pub fn key_rotation_interval(&self) -> Option<Duration> {
        self.key_rotation_interval_secs.map(Duration::from_secs)
    }

    pub fn message_expiration_time(&self) -> Option<Duration> {
        self.message_expiration_secs.map(Duration::from_secs)
    }

    pub fn previous_key_retention(&self) -> Duration {
        Duration::from_secs(self.previous_key_retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_security_tightens_defaults() {
        let policy = GroupPolicy::high_security();
        assert_eq!(policy.max_group_size, 50);
        assert_eq!(policy.key_rotation_interval(), Some(Duration::from_secs(86_400)));
        assert!(policy.auto_rotate_on_member_change);
        assert!(GroupPolicy::default().key_rotation_interval().is_none());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let policy: GroupPolicy = serde_json::from_str(r#"{"maxGroupSize":10}"#).unwrap();
        assert_eq!(policy.max_group_size, 10);
        assert_eq!(policy.previous_key_retention(), Duration::from_secs(600));
    }
}
