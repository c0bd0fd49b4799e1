use serde::{Deserialize, Serialize};

/// Connection state for one remote peer.
///
/// `Idle → Connecting → Connected | Failed`, and `Connected → Disconnected`
/// on hangup or transport loss. Terminal states may start a new attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum PeerConnectionState {
    Idle,
    Connecting,
    Connected { peer: String },
    Disconnected { reason: String },
    Failed { error: String },
}

impl PeerConnectionState {
    pub fn can_transition_to(&self, next: &PeerConnectionState) -> bool {
        use PeerConnectionState::{Connected, Connecting, Disconnected, Failed, Idle};
        matches!(
            (self, next),
            (Idle | Disconnected { .. } | Failed { .. }, Connecting)
                | (Connecting, Connected { .. } | Failed { .. } | Disconnected { .. })
                | (Connected { .. }, Disconnected { .. } | Failed { .. })
                | (_, Idle)
        )
    }

    /// An offer/answer exchange is in progress or done, so ICE candidates
    /// have a context to belong to.
    pub fn has_exchange_context(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> PeerConnectionState {
        PeerConnectionState::Connected { peer: "did:key:zB".into() }
    }

    #[test]
    fn happy_path() {
        assert!(PeerConnectionState::Idle.can_transition_to(&PeerConnectionState::Connecting));
        assert!(PeerConnectionState::Connecting.can_transition_to(&connected()));
        assert!(connected().can_transition_to(&PeerConnectionState::Disconnected {
            reason: "hangup".into()
        }));
    }

    #[test]
    fn illegal_jumps() {
        assert!(!PeerConnectionState::Idle.can_transition_to(&connected()));
        assert!(!connected().can_transition_to(&PeerConnectionState::Connecting));
        let failed = PeerConnectionState::Failed { error: "x".into() };
        assert!(!failed.can_transition_to(&connected()));
        assert!(failed.can_transition_to(&PeerConnectionState::Connecting));
    }

    #[test]
    fn serialized_form() {
        let json = serde_json::to_value(PeerConnectionState::Failed { error: "timeout".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"state": "failed", "error": "timeout"}));
    }
}
