//! Result notification (`N`) — the message exchanged within the
//! correlated-await manager and, serialized as JSON, across the fan-out
//! bus (§3, §6).

use serde::{Deserialize, Serialize};

/// A regeneration outcome for one key, either completing local awaiters
/// directly or arriving from a peer node over the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    #[serde(rename = "Success")]
    pub success: bool,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Exception", skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(rename = "Sender")]
    pub sender_id: String,
}

impl Notification {
    pub fn success(key: impl Into<String>, sender_id: impl Into<String>) -> Self {
        Self {
            success: true,
            key: key.into(),
            error: None,
            sender_id: sender_id.into(),
        }
    }

    pub fn failure(
        key: impl Into<String>,
        sender_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            key: key.into(),
            error: Some(error.into()),
            sender_id: sender_id.into(),
        }
    }

    /// Whether this notification originated on `local_sender_id` itself,
    /// i.e. it is this node's own echo rather than a peer's message.
    pub fn is_own_echo(&self, local_sender_id: &str) -> bool {
        self.sender_id == local_sender_id
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
