//! Database initialization and migration logic for the order service.
//!
//! Provides `init_db_pool` for creating a bounded connection pool and
//! auto-applying SQL migrations from the migrations directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use app_config::AppConfig;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio::fs;
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tracing::info;

/// Connection settings for the configured database.
///
/// Values are set field by field, so passwords may contain any character.
pub fn pg_config(cfg: &AppConfig) -> PgConfig {
    let mut pg_config = PgConfig::new();
    pg_config
        .host(&cfg.db_host)
        .port(cfg.db_port)
        .user(&cfg.db_user)
        .password(&cfg.db_password)
        .dbname(&cfg.db_name);
    pg_config
}

/// Builds the connection pool without touching the database.
///
/// Capacity and acquisition timeout come from the configuration; a caller that
/// cannot get a connection within `db_pool_wait_timeout` receives a
/// `PoolError::Timeout`.
///
/// # Errors
/// Returns an error if the pool cannot be built.
pub fn build_pool(cfg: &AppConfig) -> Result<Pool> {
    let mgr = Manager::from_config(
        pg_config(cfg),
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );

    Pool::builder(mgr)
        .max_size(cfg.db_pool_max_size)
        .wait_timeout(Some(cfg.db_pool_wait_timeout))
        .create_timeout(Some(cfg.db_pool_wait_timeout))
        .recycle_timeout(Some(cfg.db_pool_wait_timeout))
        .runtime(Runtime::Tokio1)
        .build()
        .context("Failed to create database pool")
}

/// Initializes the database connection pool and runs migrations.
///
/// # Arguments
/// * `cfg` - The loaded application configuration.
///
/// # Returns
/// * `Pool` - A pool of PostgreSQL connections, ready for async use.
///
/// # Errors
/// Returns an error if the pool cannot be created or migrations fail.
pub async fn init_db_pool(cfg: &AppConfig) -> Result<Pool> {
    let pool = build_pool(cfg)?;

    // Apply migrations
    let client = pool
        .get()
        .await
        .context("Failed to get DB connection for migrations")?;
    run_migrations(&client, &cfg.migrations_dir).await?;

    info!(
        max_size = cfg.db_pool_max_size,
        wait_timeout = ?cfg.db_pool_wait_timeout,
        "Database pool ready"
    );
    Ok(pool)
}

/// Lists the `.sql` files of a migrations directory in the order they must run.
///
/// Files are applied by name, so `0001_init.sql` runs before `0002_*.sql`.
///
/// # Errors
/// Returns an error if the directory cannot be read.
pub async fn collect_migrations(migrations_dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = migrations_dir.as_ref();
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read migrations directory {}", dir.display()))?;

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "sql") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Applies all SQL migrations from the given directory to the provided database client.
///
/// Every migration is written with `IF NOT EXISTS`, so re-running on startup is safe.
///
/// # Arguments
/// * `client` - An active Postgres client.
/// * `migrations_dir` - Path to the folder containing .sql migration files.
///
/// # Errors
/// Returns an error if migration files cannot be read or applied.
pub async fn run_migrations(client: &Client, migrations_dir: &str) -> Result<()> {
    for path in collect_migrations(migrations_dir).await? {
        let file_name = path.display().to_string();
        info!("Applying migration: {}", file_name);
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read migration file {}", file_name))?;

        client
            .batch_execute(&content)
            .await
            .with_context(|| format!("Failed to execute migration {}", file_name))?;
    }
    Ok(())
}
