use utoipa::OpenApi;
use crate::models::*;
use crate::ws::registry::RegistryStats;
use crate::ws::room::{RoomPhase, RoomStats};

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness check endpoint
#[utoipa::path(
    get,
    path = "/api/ready",
    responses(
        (status = 200, description = "Service is ready", body = ReadyResponse),
        (status = 503, description = "Coordination backend unreachable", body = ReadyResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// Process diagnostics (cloud admin only)
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Diagnostics", body = DiagnosticsResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

/// Live scene graph of a loaded page version
#[utoipa::path(
    get,
    path = "/api/v1/pages/{page_id}/versions/{version}/scene",
    params(
        ("page_id" = String, Path, description = "Page id"),
        ("version" = i32, Path, description = "Page version")
    ),
    responses(
        (status = 200, description = "Scene export", body = SceneExportResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden", body = ErrorResponse),
        (status = 404, description = "No live session", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn scene_export_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        diagnostics_doc,
        scene_export_doc,
    ),
    components(
        schemas(
            HealthResponse,
            ReadyResponse,
            DiagnosticsResponse,
            SceneExportResponse,
            ErrorResponse,
            RegistryStats,
            RoomStats,
            RoomPhase
        )
    ),
    tags(
        (name = "api", description = "API endpoints")
    )
)]
pub struct ApiDoc;
