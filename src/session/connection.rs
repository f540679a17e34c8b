//! Connection resolution: which endpoint serves a send.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A configured inference endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Higher wins.
    #[serde(default)]
    pub priority: i32,
}

fn default_enabled() -> bool {
    true
}

impl ConnectionDescriptor {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            api_key: None,
            enabled: true,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    #[inline]
    fn is_usable(&self) -> bool {
        self.enabled && !self.url.trim().is_empty()
    }
}

/// How a send reaches a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "connection", rename_all = "lowercase")]
pub enum Mode {
    Direct(ConnectionDescriptor),
    Offline,
    Backend,
    Unavailable,
}

impl Mode {
    pub fn label(&self) -> String {
        match self {
            Mode::Direct(c) => format!("direct ({})", c.id),
            Mode::Offline => "offline".to_string(),
            Mode::Backend => "backend".to_string(),
            Mode::Unavailable => "unavailable".to_string(),
        }
    }
}

/// Connection settings shared with whatever edits them. Sends read a
/// snapshot, never the live value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default)]
    pub connections: Vec<ConnectionDescriptor>,
    #[serde(default)]
    pub offline_mode: bool,
}

/// Pick the mode for one send.
///
/// The highest-priority usable descriptor wins; ties go to the earlier
/// entry. Without one, offline mode, then the backend, then nothing.
pub fn resolve_mode(
    connections: &[ConnectionDescriptor],
    offline_mode: bool,
    backend_reachable: bool,
) -> Mode {
    let direct = connections
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_usable())
        .max_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then(ib.cmp(ia)))
        .map(|(_, c)| c.clone());

    let mode = match direct {
        Some(connection) => Mode::Direct(connection),
        None if offline_mode => Mode::Offline,
        None if backend_reachable => Mode::Backend,
        None => Mode::Unavailable,
    };

    debug!("Resolved connection mode: {}", mode.label());
    mode
}
