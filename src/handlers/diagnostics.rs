use crate::{auth::auth, models::{DiagnosticsResponse, ErrorResponse}, AppState};
use axum::{extract::{State, Extension}, http::StatusCode, Json};
use std::sync::{Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Process and room statistics
pub async fn diagnostics(
    State(state): State<AppState>,
    Extension(prpls): Extension<Vec<String>>,
) -> Result<(StatusCode, Json<DiagnosticsResponse>), (StatusCode, Json<ErrorResponse>)> {

    auth::ensure_cloud_admin(&prpls)?;

    let stats = state.registry.stats().await;
    let ctx = state.registry.context();

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| {
            Mutex::new(System::new_all())
        });
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0)
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Conn: {}, Rooms: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        stats.connections,
        stats.rooms
    );

    Ok((
        StatusCode::OK,
        Json(DiagnosticsResponse {
            instance_id: stats.instance_id,
            coordination: ctx.coordination.backend_name().to_string(),
            store: ctx.store.backend_name().to_string(),
            n_conn: stats.connections as u32,
            n_rooms: stats.rooms as u32,
            n_active_rooms: stats.active_rooms as u32,
            n_idle_rooms: stats.idle_rooms as u32,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    ))
}
