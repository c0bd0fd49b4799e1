use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use weave_crypto::PreKeyConfig;

use crate::error::ProtocolError;
use crate::file_transfer::{FileTransferConfig, MAX_CHUNK_SIZE};
use crate::services::MaintenanceConfig;
use crate::signaling::SignalingConfig;

/// Runtime configuration for a [`PeerNode`](crate::node::PeerNode).
///
/// Every field has a default, so a config file only needs the values it
/// overrides. Durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    pub prekeys: PreKeyConfig,
    pub signaling: SignalingConfig,
    pub file_transfer: FileTransferConfig,
    pub maintenance: MaintenanceConfig,
    /// Bound on fetching a peer's pre-key bundle during session setup.
    pub handshake_timeout_secs: u64,
    /// Drop inbound wrapper messages that carry no signature.
    pub require_signatures: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            prekeys: PreKeyConfig::default(),
            signaling: SignalingConfig::default(),
            file_transfer: FileTransferConfig::default(),
            maintenance: MaintenanceConfig::default(),
            handshake_timeout_secs: 30,
            require_signatures: true,
        }
    }
}

impl CoreConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ProtocolError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ProtocolError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        if self.file_transfer.chunk_size == 0 {
            return Err(ProtocolError::Config("fileTransfer.chunkSize must be positive".into()));
        }
        if self.file_transfer.chunk_size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::Config(format!(
                "fileTransfer.chunkSize must not exceed {MAX_CHUNK_SIZE}"
            )));
        }
        if self.file_transfer.window == 0 {
            return Err(ProtocolError::Config("fileTransfer.window must be positive".into()));
        }
        if self.signaling.max_buffered_candidates == 0 {
            return Err(ProtocolError::Config(
                "signaling.maxBufferedCandidates must be positive".into(),
            ));
        }
        if self.prekeys.replenish_target < self.prekeys.low_water_mark {
            return Err(ProtocolError::Config(
                "pre-key replenish target is below the low-water mark".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = CoreConfig::from_json_str(
            r#"{"fileTransfer": {"window": 4}, "signaling": {"ice": {"candidatePoolSize": 3}}}"#,
        )
        .unwrap();
        assert_eq!(config.file_transfer.window, 4);
        assert_eq!(config.file_transfer.chunk_size, 65_536);
        assert_eq!(config.signaling.ice.candidate_pool_size(), 3);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(30));
        assert!(config.require_signatures);
    }

    #[test]
    fn rejects_nonsense() {
        assert!(matches!(
            CoreConfig::from_json_str(r#"{"fileTransfer": {"window": 0}}"#),
            Err(ProtocolError::Config(_))
        ));
        assert!(matches!(
            CoreConfig::from_json_str(r#"{"signaling": {"maxBufferedCandidates": 0}}"#),
            Err(ProtocolError::Config(_))
        ));
        assert!(matches!(
            CoreConfig::from_json_str(r#"{"fileTransfer": {"chunkSize": 16777216}}"#),
            Err(ProtocolError::Config(_))
        ));
        assert!(matches!(CoreConfig::from_json_str("{"), Err(ProtocolError::Config(_))));
        assert!(matches!(
            CoreConfig::from_json_file("/nonexistent/weave.json"),
            Err(ProtocolError::Config(_))
        ));
    }
}
