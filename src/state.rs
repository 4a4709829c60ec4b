use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ArtifactError;
use crate::subscription::{ProxyEntry, RoutingGroup};

/// One connectable host as presented to the desktop client and the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl Server {
    /// Numbers servers from 1 in subscription order.
    pub fn from_proxies(proxies: &[ProxyEntry]) -> Vec<Server> {
        proxies
            .iter()
            .enumerate()
            .map(|(index, entry)| Server {
                id: (index + 1).to_string(),
                name: entry.name.clone(),
                host: entry.server.clone(),
                port: entry.port,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default, rename = "subscriptionURL")]
    pub subscription_url: String,
    #[serde(default)]
    pub servers: Vec<Server>,
    #[serde(default)]
    pub proxy_groups: Vec<RoutingGroup>,
}

impl PersistedState {
    /// Missing or unreadable state starts empty.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        let raw = match fs::read_to_string(path) {
            Ok(value) => value,
            Err(e) => {
                warn!("cannot read {}: {e}", path.display());
                return Self::default();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("ignoring corrupt state {}: {e}", path.display());
            Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| ArtifactError::io(path, e))
    }
}
