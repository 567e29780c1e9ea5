pub mod app_service_client;
pub mod coordination;
