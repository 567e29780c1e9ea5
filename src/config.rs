use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Cloud service identifiers
    #[serde(default = "default_service_name")]
    pub cloud_service_name: String,
    pub cloud_pod: Option<String>,

    /// JWT secret key
    pub cloud_auth_jwt_secret: Option<String>,

    /// Database URL
    pub db_url: Option<String>,

    /// Base URL of the application service storing scene graphs
    pub app_service_url: Option<String>,

    /// Redis URL of the coordination service
    pub redis_url: Option<String>,

    /// Identifier of this process instance, generated when absent
    pub instance_id: Option<String>,

    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,

    /// Grace period before an empty room is destroyed
    #[serde(default = "default_idle_grace_secs")]
    pub idle_grace_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_snapshot_lock_ttl_secs")]
    pub snapshot_lock_ttl_secs: u64,

    #[serde(default = "default_presence_max_age_secs")]
    pub presence_max_age_secs: u64,

    /// Concurrent connections allowed per source address and room
    #[serde(default = "default_max_connections_per_source")]
    pub max_connections_per_source: i64,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        // Load from environment variables using envy
        match envy::from_env::<Config>() {
            Ok(config) => {
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }

    /// Instance id from the environment, else pod name plus a random suffix
    pub fn resolve_instance_id(&self) -> String {
        if let Some(id) = self.instance_id.as_ref().filter(|id| !id.is_empty()) {
            return id.clone();
        }
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        match &self.cloud_pod {
            Some(pod) => format!("{}-{}", pod, &suffix[..8]),
            None => format!("{}-{}", self.cloud_service_name, &suffix[..8]),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            cloud_service_name: default_service_name(),
            cloud_pod: None,
            cloud_auth_jwt_secret: None,
            db_url: None,
            app_service_url: None,
            redis_url: None,
            instance_id: None,
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            idle_grace_secs: default_idle_grace_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            snapshot_lock_ttl_secs: default_snapshot_lock_ttl_secs(),
            presence_max_age_secs: default_presence_max_age_secs(),
            max_connections_per_source: default_max_connections_per_source(),
        }
    }
}

/// Timing and limits used by rooms and the registry.
#[derive(Debug, Clone)]
pub struct CollabSettings {
    pub checkpoint_interval: Duration,
    pub idle_grace: Duration,
    pub sweep_interval: Duration,
    pub snapshot_lock_ttl: Duration,
    pub presence_max_age: Duration,
    pub max_connections_per_source: i64,
}

impl Default for CollabSettings {
    fn default() -> Self {
        CollabSettings::from(&Config::default())
    }
}

impl From<&Config> for CollabSettings {
    fn from(config: &Config) -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(config.checkpoint_interval_secs.max(1)),
            idle_grace: Duration::from_secs(config.idle_grace_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
            snapshot_lock_ttl: Duration::from_secs(config.snapshot_lock_ttl_secs.max(1)),
            presence_max_age: Duration::from_secs(config.presence_max_age_secs),
            max_connections_per_source: config.max_connections_per_source,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    EnvError(envy::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::EnvError(e) => write!(f, "Environment variable error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "scene-collab".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_checkpoint_interval_secs() -> u64 {
    30
}

fn default_idle_grace_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_snapshot_lock_ttl_secs() -> u64 {
    30
}

fn default_presence_max_age_secs() -> u64 {
    600
}

fn default_max_connections_per_source() -> i64 {
    50
}
