//! Configuration for pull replication

use crate::EfsError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One pull subscription: which peer to replicate from and which local
/// user owns the imported files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    /// Opaque identifier for this pull.
    pub pull_id: i64,
    /// Session owner; imported files are granted to this user.
    pub user_id: i64,
    /// Peer endpoint, `host[:port]` or a full `http(s)://` origin.
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Pre-seeded session cookie, replaced after re-auth.
    #[serde(default)]
    pub cookie: Option<String>,
    /// Reserved server-side filter. Never sent on the wire; the listing
    /// request is always `count=all`.
    #[serde(default)]
    pub query: Option<String>,
}

impl PullConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| EfsError::ConfigParse(e.to_string()))
    }
}
