use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;
use crate::sync::SyncPolicy;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Connection descriptor handed to the storage backend as-is.
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Policy applied by `Database::initialize`.
    #[serde(default)]
    pub sync_policy: SyncPolicy,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            max_connections: default_max_connections(),
            sync_policy: SyncPolicy::default(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub other: HashMap<String, String>, // application-specific keys, not interpreted here
}

impl Settings {
    /// Parse settings from a JSON document; missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Settings> {
        Ok(serde_json::from_str(json)?)
    }
}

fn default_url() -> String {
    "sqlite://relata.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}
