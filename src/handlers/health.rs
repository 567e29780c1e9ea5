use axum::{extract::State, http::StatusCode, Json};
use tracing::{debug, warn};

use crate::models::{HealthResponse, ReadyResponse};
use crate::ws::room::room_key;
use crate::AppState;

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
    })
}

/// Readiness check endpoint. Probes coordination and the scene store.
pub async fn ready_check(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    debug!("Readiness check requested");
    let ctx = state.registry.context();
    let probe = room_key("_ready", 0);
    let probe_result = match ctx.coordination.get_last_snapshot_time(&probe).await {
        Ok(_) => ctx.store.ping().await,
        Err(e) => Err(e),
    };
    let (status, message) = match probe_result {
        Ok(()) => (StatusCode::OK, "Service is ready".to_string()),
        Err(e) => {
            warn!("Readiness probe failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    };
    (
        status,
        Json(ReadyResponse {
            status: if status == StatusCode::OK { "ok" } else { "degraded" }.to_string(),
            message,
            instance_id: ctx.instance_id().to_string(),
            coordination: ctx.coordination.backend_name().to_string(),
            store: ctx.store.backend_name().to_string(),
        }),
    )
}
