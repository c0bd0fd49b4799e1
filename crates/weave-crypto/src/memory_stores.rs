//! In-memory implementations of the storage traits.
//!
//! These are suitable for:
//! - Testing and development
//! - Platforms that keep state in the host app and re-hydrate on start
//!
//! **WARNING**: Data is lost on process exit.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::group::GroupInfo;
use crate::keychain::Keychain;
use crate::session::Session;
use crate::store::{GroupStore, SessionStore};
use crate::CryptoError;

/// In-memory key storage, keyed by `vault/key`.
#[derive(Default)]
pub struct MemoryKeychain {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Keychain for MemoryKeychain {
    fn store_key(&self, vault: &str, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        self.entries
            .lock()
            .insert((vault.to_string(), key.to_string()), data.to_vec());
        Ok(())
    }

    fn load_key(&self, vault: &str, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self
            .entries
            .lock()
            .get(&(vault.to_string(), key.to_string()))
            .cloned())
    }

    fn delete_key(&self, vault: &str, key: &str) -> Result<(), CryptoError> {
        self.entries
            .lock()
            .remove(&(vault.to_string(), key.to_string()));
        Ok(())
    }

    fn key_exists(&self, vault: &str, key: &str) -> Result<bool, CryptoError> {
        Ok(self
            .entries
            .lock()
            .contains_key(&(vault.to_string(), key.to_string())))
    }
}

/// In-memory session store keyed by remote DID.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load_session(&self, remote_did: &str) -> Result<Option<Session>, CryptoError> {
        Ok(self.sessions.lock().get(remote_did).cloned())
    }

    fn store_session(&self, session: &Session) -> Result<(), CryptoError> {
        self.sessions
            .lock()
            .insert(session.remote_did.clone(), session.clone());
        Ok(())
    }

    fn delete_session(&self, remote_did: &str) -> Result<(), CryptoError> {
        self.sessions.lock().remove(remote_did);
        Ok(())
    }

    fn list_sessions(&self) -> Result<Vec<String>, CryptoError> {
        Ok(self.sessions.lock().keys().cloned().collect())
    }
}

/// In-memory group roster store.
#[derive(Default)]
pub struct MemoryGroupStore {
    groups: Mutex<HashMap<String, GroupInfo>>,
}

impl MemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GroupStore for MemoryGroupStore {
    fn save_group(&self, info: &GroupInfo) -> Result<(), CryptoError> {
        self.groups
            .lock()
            .insert(info.group_id.clone(), info.clone());
        Ok(())
    }

    fn load_group(&self, group_id: &str) -> Result<Option<GroupInfo>, CryptoError> {
        Ok(self.groups.lock().get(group_id).cloned())
    }

    fn delete_group(&self, group_id: &str) -> Result<(), CryptoError> {
        self.groups.lock().remove(group_id);
        Ok(())
    }

    fn list_groups(&self) -> Result<Vec<String>, CryptoError> {
        Ok(self.groups.lock().keys().cloned().collect())
    }
}
