use axum::{http::StatusCode, Json};
use crate::models::ErrorResponse;

const CLOUD_ADMIN_PRPL: &str = "r/CloudAdmin";

pub fn is_cloud_admin(prpls: &[String]) -> bool {
    prpls.iter().any(|p| p == CLOUD_ADMIN_PRPL)
}

pub fn is_service(prpls: &[String], service_name: &str) -> bool {
    let service_prpl = format!("s/{}", service_name);
    prpls.iter().any(|p| p == &service_prpl)
}

/// Allows the named service and cloud admins.
pub fn ensure_service(prpls: &[String], service_name: &str) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    if is_service(prpls, service_name) {
        return Ok(format!("s/{}", service_name));
    }

    if is_cloud_admin(prpls) {
        return Ok(CLOUD_ADMIN_PRPL.to_string());
    }

    Err(forbidden(format!("Service '{}' access denied", service_name)))
}

pub fn ensure_cloud_admin(prpls: &[String]) -> Result<String, (StatusCode, Json<ErrorResponse>)> {
    if is_cloud_admin(prpls) {
        return Ok(CLOUD_ADMIN_PRPL.to_string());
    }

    Err(forbidden("Cloud Admin access required".to_string()))
}

fn forbidden(error: String) -> (StatusCode, Json<ErrorResponse>) {
    let status = StatusCode::FORBIDDEN;
    (status, Json(ErrorResponse {
        code: status.as_u16(),
        status: status.to_string(),
        error,
    }))
}
