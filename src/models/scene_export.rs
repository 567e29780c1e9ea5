use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use utoipa::ToSchema;

use crate::models::SceneGraph;

/// Live state of a loaded room
#[serde_as]
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SceneExportResponse {
    pub page_id: String,
    pub version: i32,
    pub room_key: String,
    #[schema(value_type = Object)]
    pub scene_graph: SceneGraph,
    /// Encoded CRDT state vector
    #[serde_as(as = "Base64")]
    #[schema(value_type = String, format = Byte)]
    pub state_vector: Vec<u8>,
    pub clients: usize,
    pub last_snapshot_at: Option<i64>,
}
