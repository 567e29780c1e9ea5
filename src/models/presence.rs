use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Cluster-visible presence of a user in a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    #[schema(value_type = Object)]
    pub display_state: Value,
    /// Milliseconds since the Unix epoch of the last write.
    pub timestamp: i64,
    pub origin_instance_id: String,
}

impl PresenceRecord {
    pub fn new(user_id: &str, display_state: Value, origin_instance_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_state,
            timestamp: chrono::Utc::now().timestamp_millis(),
            origin_instance_id: origin_instance_id.to_string(),
        }
    }

    pub fn is_older_than(&self, max_age_ms: i64, now_ms: i64) -> bool {
        now_ms - self.timestamp > max_age_ms
    }
}
