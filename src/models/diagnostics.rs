use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response for diagnostics information
#[derive(Serialize, Deserialize, ToSchema)]
pub struct DiagnosticsResponse {
    pub instance_id: String,
    pub coordination: String,
    pub store: String,
    pub n_conn: u32,
    pub n_rooms: u32,
    pub n_active_rooms: u32,
    pub n_idle_rooms: u32,
    pub cpu_usage: f32,
    pub memory_alloc: u64,
    pub memory_total: u64,
    pub memory_free: u64,
}
