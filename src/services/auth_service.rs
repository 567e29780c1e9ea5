use axum::http::{self, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, TokenData, Validation};
use tracing::{debug, info};

use crate::config::Config;

/// Settings needed to authenticate requests.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    pub service_name: String,
    /// Accept `user_id` / `user_name` query parameters when no secret is set.
    pub allow_dev_identity: bool,
}

impl From<&Config> for AuthConfig {
    fn from(config: &Config) -> Self {
        Self {
            jwt_secret: config.cloud_auth_jwt_secret.clone(),
            service_name: config.cloud_service_name.clone(),
            allow_dev_identity: config.is_development(),
        }
    }
}

/// Who is behind a request.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthIdentity {
    /// User id, or the service name for service tokens.
    pub subject: String,
    pub name: Option<String>,
    pub is_service: bool,
    pub prpls: Vec<String>,
}

// Get the auth token from a request
pub fn get_auth_token<B>(req: &http::Request<B>) -> Result<String, String> {
    get_auth_token_from_headers(req.headers())
}

pub fn get_auth_token_from_headers(headers: &HeaderMap) -> Result<String, String> {
    // 1. Try to get token from Authorization header
    if let Some(auth_header) = headers.get(http::header::AUTHORIZATION) {
        let auth_str = auth_header.to_str().map_err(|_| "Invalid Authorization header".to_string())?;
        Ok(auth_str.strip_prefix("Bearer ").unwrap_or(auth_str).to_string())
    }
    // 2. Try to get token from cookies
    else {
        let cookie_header = headers
            .get(http::header::COOKIE)
            .ok_or_else(|| "Missing Authorization header or Cookie".to_string())?
            .to_str()
            .map_err(|_| "Invalid Cookie header".to_string())?;

        for cookie in cookie::Cookie::split_parse(cookie_header).flatten() {
            if cookie.name() == "auth_token" {
                return Ok(cookie.value().to_string());
            }
        }
        Err("auth_token cookie not found".to_string())
    }
}

// Validate a JWT token and return the token data
pub fn validate_jwt(token: &str, secret: &str) -> Result<TokenData<serde_json::Value>, jsonwebtoken::errors::Error> {
    let validation = Validation::new(Algorithm::HS256);
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());
    decode::<serde_json::Value>(token, &decoding_key, &validation)
}

/// Turns validated claims into an identity. Tokens without a `type` claim are
/// user tokens.
pub fn identity_from_claims(claims: &serde_json::Value) -> Result<AuthIdentity, String> {
    let subject = claims
        .get("sub")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "JWT token does not contain 'sub' claim".to_string())?
        .to_string();
    let token_type = claims.get("type").and_then(|v| v.as_str()).unwrap_or("user");

    match token_type {
        "service" => Ok(AuthIdentity {
            prpls: vec![format!("s/{}", subject)],
            subject,
            name: None,
            is_service: true,
        }),
        "user" => {
            let mut prpls = vec![format!("u/{}", subject)];
            if let Some(roles) = claims.get("roles").and_then(|v| v.as_array()) {
                for role in roles.iter().filter_map(|r| r.as_str()) {
                    let role_prpl = format!("r/{}", role);
                    if !prpls.contains(&role_prpl) {
                        prpls.push(role_prpl);
                    }
                }
            }
            let name = claims.get("name").and_then(|v| v.as_str()).map(str::to_string);
            Ok(AuthIdentity { subject, name, is_service: false, prpls })
        }
        other => Err(format!("Invalid token type: {}", other)),
    }
}

/// Authenticates a token against the configured secret.
pub fn authenticate_token(auth: &AuthConfig, token: &str) -> Result<AuthIdentity, String> {
    let secret = auth
        .jwt_secret
        .as_deref()
        .ok_or_else(|| "No JWT secret configured!".to_string())?;
    let token_data = validate_jwt(token, secret).map_err(|e| format!("JWT validation failed: {}", e))?;
    let identity = identity_from_claims(&token_data.claims)?;
    info!("JWT token validated successfully for: {}", identity.subject);
    Ok(identity)
}

/// Resolves the identity of a collaboration socket.
///
/// The token comes from the `token` query parameter, the Authorization header
/// or the `auth_token` cookie. In development without a secret, the
/// `user_id` and `user_name` query parameters are trusted instead.
pub fn resolve_socket_identity(
    auth: &AuthConfig,
    headers: &HeaderMap,
    query_token: Option<&str>,
    dev_user_id: Option<&str>,
    dev_user_name: Option<&str>,
) -> Result<AuthIdentity, String> {
    if auth.jwt_secret.is_none() && auth.allow_dev_identity {
        let user_id = dev_user_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| "user_id query parameter required".to_string())?;
        debug!("Accepting development identity {}", user_id);
        return Ok(AuthIdentity {
            subject: user_id.to_string(),
            name: dev_user_name.map(str::to_string),
            is_service: false,
            prpls: vec![format!("u/{}", user_id)],
        });
    }

    let token = match query_token.filter(|t| !t.is_empty()) {
        Some(token) => token.to_string(),
        None => get_auth_token_from_headers(headers)?,
    };
    let identity = authenticate_token(auth, &token)?;
    if identity.is_service {
        return Err("Service tokens cannot join collaboration sessions".to_string());
    }
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn auth(secret: Option<&str>, dev: bool) -> AuthConfig {
        AuthConfig {
            jwt_secret: secret.map(str::to_string),
            service_name: "scene-collab".to_string(),
            allow_dev_identity: dev,
        }
    }

    fn token(claims: serde_json::Value) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(b"s3cret")).unwrap()
    }

    fn exp() -> i64 {
        chrono::Utc::now().timestamp() + 600
    }

    #[test]
    fn token_sources_in_order() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::COOKIE, HeaderValue::from_static("a=1; auth_token=from-cookie"));
        assert_eq!(get_auth_token_from_headers(&headers).unwrap(), "from-cookie");

        headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(get_auth_token_from_headers(&headers).unwrap(), "from-header");

        assert!(get_auth_token_from_headers(&HeaderMap::new()).is_err());
    }

    #[test]
    fn user_token_resolves_socket_identity() {
        let jwt = token(json!({ "sub": "u-1", "name": "Ann", "roles": ["Editor"], "exp": exp() }));
        let identity =
            resolve_socket_identity(&auth(Some("s3cret"), false), &HeaderMap::new(), Some(&jwt), None, None).unwrap();
        assert_eq!(identity.subject, "u-1");
        assert_eq!(identity.name.as_deref(), Some("Ann"));
        assert_eq!(identity.prpls, vec!["u/u-1".to_string(), "r/Editor".to_string()]);
    }

    #[test]
    fn rejects_bad_tokens_and_services() {
        let cfg = auth(Some("s3cret"), true);
        assert!(resolve_socket_identity(&cfg, &HeaderMap::new(), Some("garbage"), None, None).is_err());

        let service = token(json!({ "sub": "worker", "type": "service", "exp": exp() }));
        assert!(resolve_socket_identity(&cfg, &HeaderMap::new(), Some(&service), None, None).is_err());
        let identity = authenticate_token(&cfg, &service).unwrap();
        assert!(identity.is_service);
        assert_eq!(identity.prpls, vec!["s/worker".to_string()]);
    }

    #[test]
    fn development_identity_needs_no_secret() {
        let identity =
            resolve_socket_identity(&auth(None, true), &HeaderMap::new(), None, Some("dev-1"), Some("Dev")).unwrap();
        assert_eq!(identity.subject, "dev-1");
        assert!(resolve_socket_identity(&auth(None, false), &HeaderMap::new(), None, Some("dev-1"), None).is_err());
    }
}
