use serde::{Deserialize, Serialize};

/// Public STUN servers used when nothing custom is configured.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

pub const MAX_CANDIDATE_POOL_SIZE: u8 = 10;

/// One STUN or TURN entry as handed to the WebRTC stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }
}

/// ICE server set: the defaults, unless any custom server is configured, in
/// which case only the custom servers are used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IceServerConfig {
    custom: Vec<IceServer>,
    candidate_pool_size: u8,
}

impl IceServerConfig {
    /// The servers to hand to the peer connection.
    pub fn servers(&self) -> Vec<IceServer> {
        if self.custom.is_empty() {
            DEFAULT_STUN_SERVERS.iter().map(|url| IceServer::stun(url)).collect()
        } else {
            self.custom.clone()
        }
    }

    pub fn has_custom_servers(&self) -> bool {
        !self.custom.is_empty()
    }

    pub fn add_stun_server(&mut self, url: &str) {
        self.add(IceServer::stun(url));
    }

    pub fn add_turn_server(&mut self, url: &str, username: &str, credential: &str) {
        self.add(IceServer::turn(url, username, credential));
    }

    /// Remove every custom server listing `url`. Returns whether one was removed.
    pub fn remove_server(&mut self, url: &str) -> bool {
        let before = self.custom.len();
        self.custom.retain(|s| !s.urls.iter().any(|u| u == url));
        before != self.custom.len()
    }

    /// Drop all custom servers, falling back to the defaults.
    pub fn clear_custom_servers(&mut self) {
        self.custom.clear();
    }

    pub fn candidate_pool_size(&self) -> u8 {
        self.candidate_pool_size.min(MAX_CANDIDATE_POOL_SIZE)
    }

    /// Set the pre-gathered candidate pool, clamped to `0..=10`.
    pub fn set_candidate_pool_size(&mut self, size: i64) {
        let clamped = size.clamp(0, i64::from(MAX_CANDIDATE_POOL_SIZE));
        self.candidate_pool_size = u8::try_from(clamped).unwrap_or(MAX_CANDIDATE_POOL_SIZE);
    }

    fn add(&mut self, server: IceServer) {
        if let Some(existing) = self.custom.iter_mut().find(|s| s.urls == server.urls) {
            *existing = server;
        } else {
            self.custom.push(server);
        }
    }
}
