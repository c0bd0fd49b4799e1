use crate::group::GroupInfo;
use crate::session::Session;
use crate::CryptoError;

/// Persistence for established sessions.
///
/// Each remote peer has at most one live session. Sessions are keyed by the
/// peer's DID. Implementations hold shared keys and must encrypt at rest.
pub trait SessionStore: Send + Sync {
    /// Load the session for a peer.
    fn load_session(&self, remote_did: &str) -> Result<Option<Session>, CryptoError>;

    /// Store (or replace) the session for its remote peer.
    fn store_session(&self, session: &Session) -> Result<(), CryptoError>;

    /// Delete a session (e.g., on re-key or compromise).
    fn delete_session(&self, remote_did: &str) -> Result<(), CryptoError>;

    /// List the DIDs of all peers with a stored session.
    fn list_sessions(&self) -> Result<Vec<String>, CryptoError>;
}

/// Persistence for group rosters and policies.
///
/// Key material is not part of [`GroupInfo`]; group keys go through the
/// [`Keychain`](crate::keychain::Keychain).
pub trait GroupStore: Send + Sync {
    fn save_group(&self, info: &GroupInfo) -> Result<(), CryptoError>;

    fn load_group(&self, group_id: &str) -> Result<Option<GroupInfo>, CryptoError>;

    fn delete_group(&self, group_id: &str) -> Result<(), CryptoError>;

    fn list_groups(&self) -> Result<Vec<String>, CryptoError>;
}
