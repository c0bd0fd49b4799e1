pub mod did;
pub mod error;
pub mod group;
pub mod identity;
pub mod jws;
pub mod keychain;
pub mod memory_stores;
pub mod prekeys;
pub mod session;
pub mod store;
mod util;

pub use error::CryptoError;
pub use group::{
    GroupInfo, GroupKey, GroupKeyManager, GroupMember, GroupMessage, GroupPolicy, GroupRole,
    KeyDistributionPackage, KeyRotation,
};
pub use identity::Identity;
pub use keychain::Keychain;
pub use prekeys::{OneTimePreKey, PreKeyBundle, PreKeyConfig, PreKeyStore, SignedPreKey};
pub use session::{InitiatorMessage, Session, SessionManager};
pub use store::{GroupStore, SessionStore};
pub use util::{base64_bytes, now_millis};
