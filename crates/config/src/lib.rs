use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// `AppConfig` holds all configuration parameters required by the order service.
///
/// The configuration is loaded from environment variables (optionally via a `.env` file)
/// or uses default values if the variable is not set. Keys are matched case-insensitively,
/// so `DB_HOST` fills `db_host`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfig {
    // --- Database settings ---
    /// Database hostname or service name (e.g. "postgres" in Docker Compose, "localhost" for local runs).
    pub db_host: String,
    /// Database port (default: 5432).
    pub db_port: u16,
    /// Database user.
    pub db_user: String,
    /// Database password.
    pub db_password: String,
    /// Database name.
    pub db_name: String,

    // --- Connection pool ---
    /// Upper bound on pooled connections, and so on concurrently open units of work.
    pub db_pool_max_size: usize,
    /// How long a request waits for a free connection before the store is reported unavailable.
    #[serde(deserialize_with = "deserialize_duration")]
    pub db_pool_wait_timeout: Duration,
    /// Directory holding `*.sql` migrations applied at startup.
    pub migrations_dir: String,

    // --- HTTP server ---
    /// The port on which the HTTP server will listen.
    pub http_port: u16,
    /// Name reported by the health endpoint.
    pub service_name: String,

    // --- Shutdown timeout ---
    /// Graceful shutdown timeout (human-friendly format, e.g. "5s", "1m").
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,

    // --- Logging ---
    /// Default log filter, used when `RUST_LOG` is not set.
    pub log_level: String,
}

/// Custom deserializer for durations.
/// Accepts human-readable formats like "5s", "750ms", "1m".
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let val = String::deserialize(deserializer)?;
    humantime::parse_duration(&val)
        .map_err(|e| D::Error::custom(format!("Invalid duration '{val}': {e}")))
}

impl AppConfig {
    /// Loads configuration from environment variables (and optionally from `.env` file).
    ///
    /// Fields not set via env will be filled with default values.
    ///
    /// # Errors
    /// Returns an error if environment variables are invalid or fail validation.
    pub fn load() -> Result<Self> {
        // Load from .env file (for Docker environment)
        dotenvy::dotenv().ok();

        Self::from_env(config::Environment::default())
    }

    /// Builds the configuration from defaults overlaid with the given environment source.
    ///
    /// Split out of [`AppConfig::load`] so callers can supply an explicit variable map
    /// through [`config::Environment::source`].
    pub fn from_env(env: config::Environment) -> Result<Self> {
        let settings = config::Config::builder()
            // Database
            .set_default("db_host", "localhost")?
            .set_default("db_port", 5432)?
            .set_default("db_user", "postgres")?
            .set_default("db_password", "password")?
            .set_default("db_name", "eks_microservices")?
            // Pool
            .set_default("db_pool_max_size", 20)?
            .set_default("db_pool_wait_timeout", "2s")?
            .set_default("migrations_dir", "migrations")?
            // HTTP
            .set_default("http_port", 3003)?
            .set_default("service_name", "order-service")?
            // Shutdown
            .set_default("shutdown_timeout", "5s")?
            // Logging
            .set_default("log_level", "info")?
            .add_source(env.try_parsing(true))
            .build()?;

        let cfg: AppConfig = settings
            .try_deserialize()
            .context("Failed to load configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.db_pool_max_size > 0, "db_pool_max_size must be at least 1");
        ensure!(
            !self.db_pool_wait_timeout.is_zero(),
            "db_pool_wait_timeout must be greater than zero"
        );
        Ok(())
    }
}
