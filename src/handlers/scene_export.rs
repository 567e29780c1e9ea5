use crate::{auth::auth, models::{ErrorResponse, SceneExportResponse}, AppState};
use axum::{extract::{Path, State, Extension}, http::StatusCode, Json};
use tracing::info;

/// Export the live scene graph of a loaded room
pub async fn scene_export(
    State(state): State<AppState>,
    Path((page_id, version)): Path<(String, i32)>,
    Extension(prpls): Extension<Vec<String>>,
) -> Result<(StatusCode, Json<SceneExportResponse>), (StatusCode, Json<ErrorResponse>)> {

    let accessor = auth::ensure_service(&prpls, &state.auth.service_name)?;

    let room = match state.registry.get(&page_id, version).await {
        Some(room) => room,
        None => {
            let status = StatusCode::NOT_FOUND;
            return Err((status, Json(ErrorResponse {
                code: status.as_u16(),
                status: status.to_string(),
                error: format!("No live session for page {} version {}", page_id, version),
            })));
        }
    };

    info!("Exporting scene of {} for {}", room.key(), accessor);

    Ok((
        StatusCode::OK,
        Json(SceneExportResponse {
            page_id,
            version,
            room_key: room.key().to_string(),
            scene_graph: room.scene_graph(),
            state_vector: room.state_vector(),
            clients: room.client_count(),
            last_snapshot_at: room.last_snapshot_at(),
        }),
    ))
}
