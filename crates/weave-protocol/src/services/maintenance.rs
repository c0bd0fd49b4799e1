use std::time::Duration;

use serde::{Deserialize, Serialize};
use weave_crypto::{GroupKeyManager, KeyDistributionPackage, PreKeyStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MaintenanceConfig {
    /// Pre-key rotation, replenish and prune.
    pub prekey_interval_secs: u64,
    /// Scheduled group key rotation and retired key cleanup.
    pub group_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            prekey_interval_secs: 6 * 60 * 60,
            group_interval_secs: 60,
        }
    }
}

impl MaintenanceConfig {
    pub fn prekey_interval(&self) -> Duration {
        Duration::from_secs(self.prekey_interval_secs.max(1))
    }

    pub fn group_interval(&self) -> Duration {
        Duration::from_secs(self.group_interval_secs.max(1))
    }
}

/// Rotate the signed pre-key when due, refill the one-time pool and prune
/// stale one-time keys. Failures are logged and retried next tick.
pub fn prekey_maintenance_tick(prekeys: &PreKeyStore) {
    if prekeys.needs_rotation() {
        if let Err(e) = prekeys.rotate_signed_pre_key() {
            tracing::error!(error = %e, "signed pre-key rotation failed");
        }
    }
    if let Err(e) = prekeys.replenish_if_needed() {
        tracing::error!(error = %e, "one-time pre-key replenish failed");
    }
    let max_age = prekeys.config().one_time_max_age();
    if let Err(e) = prekeys.prune_expired(max_age) {
        tracing::error!(error = %e, "one-time pre-key prune failed");
    }
}

/// Run scheduled rotations and drop retired keys past retention.
///
/// Returns every queued key package for the caller to deliver.
pub fn group_maintenance_tick(groups: &GroupKeyManager) -> Vec<KeyDistributionPackage> {
    let rotations = groups.rotate_due_groups();
    for rotation in &rotations {
        tracing::info!(
            version = rotation.version(),
            packages = rotation.packages.len(),
            undelivered = rotation.undelivered.len(),
            "scheduled group key rotation"
        );
    }
    let discarded = groups.discard_expired_keys();
    if discarded > 0 {
        tracing::debug!(discarded, "retired group keys discarded");
    }
    groups.drain_outbox()
}
