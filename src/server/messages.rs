//! Wire messages pushed to subscribers and accepted from collaborators

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const REFRESH: &str = "refresh";

/// Notification telling a subscriber to re-read its data
///
/// Serializes as `{"event":"refresh"}` plus any correlation fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshEvent {
    pub event: String,
    #[serde(flatten)]
    pub correlation: BTreeMap<String, serde_json::Value>,
}

impl RefreshEvent {
    pub fn refresh() -> Self {
        Self {
            event: REFRESH.to_string(),
            correlation: BTreeMap::new(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Default for RefreshEvent {
    fn default() -> Self {
        Self::refresh()
    }
}

/// Optional body of `POST /refresh`
///
/// Collaborators describe what changed; the fields are logged but never
/// forwarded, so a manual refresh looks exactly like a stream-triggered one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManualTriggerRequest {
    pub event: Option<String>,
    pub case_id: Option<i64>,
}

/// Acknowledgment returned by `POST /refresh`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerAck {
    pub status: String,
    pub delivered: usize,
}

impl TriggerAck {
    pub fn ok(delivered: usize) -> Self {
        Self {
            status: "ok".to_string(),
            delivered,
        }
    }
}
