//! Node identity and status types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one fleet participant
///
/// Self-identity is generated once per process lifetime; peer identity is
/// learned from the first `node-info` message on a connection and written
/// once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: Uuid,
    pub platform: String,
    pub hostname: String,
    pub connected_at: DateTime<Utc>,
    #[serde(default)]
    pub is_server: bool,
}

impl NodeInfo {
    /// Generate the identity for this process
    #[must_use]
    pub fn local(is_server: bool) -> Self {
        Self {
            node_id: Uuid::new_v4(),
            platform: node_platform().to_string(),
            hostname: local_hostname(),
            connected_at: Utc::now(),
            is_server,
        }
    }
}

/// Platform name this node reports, in the fleet's naming scheme
#[must_use]
pub fn node_platform() -> &'static str {
    match std::env::consts::OS {
        "windows" => "win32",
        "macos" => "darwin",
        other => other,
    }
}

/// Best-effort local hostname
#[must_use]
pub fn local_hostname() -> String {
    hostname::get().map_or_else(
        |_| "unknown".to_string(),
        |h| h.to_string_lossy().to_string(),
    )
}

/// Connection-role status of this node, broadcast on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Not listening and not connected
    Stopped,
    /// Coordinator listener is coming up
    Starting,
    /// Coordinator is accepting connections
    Running,
    /// Listen or connect failed
    Error,
    /// Worker is connected to a coordinator
    Connected,
}
