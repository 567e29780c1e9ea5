use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use tracing::{debug, error};
use crate::services::auth_service::{authenticate_token, get_auth_token};
use crate::AppState;

/// Authenticates the request and stores the caller's principals in the
/// request extensions.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {

    let token = match get_auth_token(&req) {
        Ok(token) => token,
        Err(e) => {
            debug!("No auth token on request: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    if state.auth.jwt_secret.is_none() {
        error!("Cloud auth JWT secret not configured");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    let identity = match authenticate_token(&state.auth, &token) {
        Ok(identity) => identity,
        Err(e) => {
            error!("{}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    {
        let extensions = req.extensions_mut();
        extensions.insert(identity.prpls);
        if !identity.is_service {
            extensions.insert(identity.subject);
        }
    }

    Ok(next.run(req).await)
}
