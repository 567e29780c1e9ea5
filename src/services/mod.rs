pub mod auth_service;
pub mod scene_store;
