use std::net::SocketAddr;
use std::panic;
use std::sync::Arc;

use scene_collab::clients::app_service_client::AppServiceClient;
use scene_collab::clients::coordination::{CoordinationClient, MemoryCoordination};
use scene_collab::config::{CollabSettings, Config};
use scene_collab::db::dbscene::DbScene;
use scene_collab::routes::create_app;
use scene_collab::services::auth_service::AuthConfig;
use scene_collab::services::scene_store::SceneStore;
use scene_collab::ws::collabctx::CollabContext;
use scene_collab::ws::registry::RoomRegistry;
use scene_collab::AppState;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() {

    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "scene_collab=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    let instance_id = config.resolve_instance_id();
    info!("Instance id: {}", instance_id);

    let coordination = Arc::new(connect_coordination(&config, &instance_id).await);
    let store = open_scene_store(&config).await;
    info!(
        "Coordination backend: {}, scene store: {}",
        coordination.backend_name(),
        store.backend_name()
    );

    let ctx = CollabContext::new(coordination, store, CollabSettings::from(&config));
    let registry = RoomRegistry::new(ctx);
    registry.start_sweeper();

    let state = AppState {
        registry: registry.clone(),
        auth: AuthConfig::from(&config),
    };
    if state.auth.jwt_secret.is_none() {
        if state.auth.allow_dev_identity {
            warn!("No JWT secret configured - accepting development identities");
        } else {
            warn!("No JWT secret configured - all authenticated requests will be rejected");
        }
    }

    let app = create_app(state, config.cors_origins.as_deref());

    let listener = tokio::net::TcpListener::bind(config.server_address())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", config.server_address()));

    info!("🚀 Server running on http://{}", config.server_address());
    info!("📡 Collaboration sockets at ws://{}/collab/{{pageId}}/{{version}}", config.server_address());
    info!("📚 Swagger UI available at http://{}/swagger", config.server_address());

    if let Err(e) = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    info!("Checkpointing open rooms before exit");
    registry.shutdown().await;
    info!("Server stopped");
}

async fn connect_coordination(config: &Config, instance_id: &str) -> CoordinationClient {
    if let Some(redis_url) = &config.redis_url {
        match CoordinationClient::connect_redis(redis_url, instance_id).await {
            Ok(client) => return client,
            Err(e) => {
                error!("Failed to connect to Redis: {}", e);
                warn!("Falling back to in-memory coordination - sessions will not span instances");
            }
        }
    } else {
        warn!("No Redis URL configured - using in-memory coordination");
    }
    CoordinationClient::in_memory(Arc::new(MemoryCoordination::new()), instance_id)
}

async fn open_scene_store(config: &Config) -> SceneStore {
    if let Some(db_url) = &config.db_url {
        match DbScene::new(db_url).await {
            Ok(db) => {
                info!("Database initialized successfully");
                return SceneStore::Postgres(Arc::new(db));
            }
            Err(e) => {
                error!("Failed to initialize database: {}", e);
            }
        }
    }

    if let Some(app_url) = &config.app_service_url {
        match &config.cloud_auth_jwt_secret {
            Some(secret) => match AppServiceClient::new(app_url, secret, &config.cloud_service_name) {
                Ok(client) => return SceneStore::AppService(Arc::new(client)),
                Err(e) => error!("Failed to create app service client: {}", e),
            },
            None => warn!("App service URL set without a JWT secret - ignoring it"),
        }
    }

    warn!("No persistent scene store available - scene graphs are kept in memory only");
    SceneStore::memory()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
