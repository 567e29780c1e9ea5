use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// Response for an error
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: u16,
    pub status: String,
    pub error: String,
}

/// Errors raised by the collaboration engine.
#[derive(Debug)]
pub enum CollabError {
    /// The room was destroyed while the caller held a reference to it.
    RoomDestroyed(String),
    /// The coordination service could not be reached.
    CoordinationUnavailable(String),
    Redis(redis::RedisError),
    Database(sqlx::Error),
    Http(reqwest::Error),
    Json(serde_json::Error),
    Cbor(serde_cbor::Error),
    Crdt(String),
    Codec(String),
    Protocol(String),
}

impl fmt::Display for CollabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollabError::RoomDestroyed(key) => write!(f, "Room '{}' has been destroyed", key),
            CollabError::CoordinationUnavailable(msg) => {
                write!(f, "Coordination service unavailable: {}", msg)
            }
            CollabError::Redis(e) => write!(f, "Redis error: {}", e),
            CollabError::Database(e) => write!(f, "Database error: {}", e),
            CollabError::Http(e) => write!(f, "HTTP error: {}", e),
            CollabError::Json(e) => write!(f, "JSON error: {}", e),
            CollabError::Cbor(e) => write!(f, "CBOR error: {}", e),
            CollabError::Crdt(msg) => write!(f, "CRDT error: {}", msg),
            CollabError::Codec(msg) => write!(f, "Scene graph codec error: {}", msg),
            CollabError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for CollabError {}

impl From<redis::RedisError> for CollabError {
    fn from(error: redis::RedisError) -> Self {
        CollabError::Redis(error)
    }
}

impl From<sqlx::Error> for CollabError {
    fn from(error: sqlx::Error) -> Self {
        CollabError::Database(error)
    }
}

impl From<reqwest::Error> for CollabError {
    fn from(error: reqwest::Error) -> Self {
        CollabError::Http(error)
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(error: serde_json::Error) -> Self {
        CollabError::Json(error)
    }
}

impl From<serde_cbor::Error> for CollabError {
    fn from(error: serde_cbor::Error) -> Self {
        CollabError::Cbor(error)
    }
}

impl From<loro::LoroError> for CollabError {
    fn from(error: loro::LoroError) -> Self {
        CollabError::Crdt(error.to_string())
    }
}
