use crate::{
    docs::ApiDoc,
    handlers::{diagnostics, health_check, ready_check, scene_export},
    routes::auth_middleware::auth_middleware,
    ws::handler::collab_ws_handler,
    AppState,
};
use axum::{http::HeaderValue, middleware, routing::get, Router};
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};
use tracing::warn;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Create API routes
pub fn create_api_routes(state: AppState) -> Router {
    let protected = Router::<AppState>::new()
        .route("/v1/diagnostics", get(diagnostics))
        .route("/v1/pages/:page_id/versions/:version/scene", get(scene_export))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware)); // Applies to all routes added above

    Router::<AppState>::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .merge(protected)
        .with_state(state)
}

/// Full application: API, collaboration sockets and Swagger UI.
pub fn create_app(state: AppState, cors_origins: Option<&str>) -> Router {
    Router::new()
        .route("/collab/:page_id/:version", get(collab_ws_handler))
        .with_state(state.clone())
        .nest("/api", create_api_routes(state))
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(cors_origins: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    let cors_origins = match cors_origins.map(str::trim) {
        None | Some("*") => return layer.allow_origin(Any),
        Some(origins) => origins,
    };
    let origins: Vec<HeaderValue> = cors_origins
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(origin) => Some(origin),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}
