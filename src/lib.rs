pub mod auth;
pub mod clients;
pub mod config;
pub mod db;
pub mod docs;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod utils;
pub mod ws;

use std::sync::Arc;

use services::auth_service::AuthConfig;
use ws::registry::RoomRegistry;

/// State shared by every HTTP and WebSocket handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub auth: AuthConfig,
}
