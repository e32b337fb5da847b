/// Order Service Application
///
/// This is the main entry point for the order service.
/// The application exposes REST API endpoints for placing orders, reading them
/// back and moving them through their status lifecycle.
///
/// # Architecture
///
/// The application follows a modular architecture with:
/// - Repository layer for data access
/// - Service layer for business logic
/// - API layer for HTTP endpoints
/// - Metrics for monitoring
///
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use app_config::AppConfig;
use repository::PgOrdersRepository;
use server::Server;
use service::OrderServiceImpl;

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` wins over the configured level when it is set.
fn init_logger(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("Invalid log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logger: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = AppConfig::load().context("Failed to load configuration")?;

    init_logger(&config.log_level)?;
    info!("{} starting...", config.service_name);

    // Initialize database
    let db_pool = match db::init_db_pool(&config).await {
        Ok(pool) => {
            info!("Database initialized successfully");
            pool
        }
        Err(e) => {
            error!("Failed to initialize database: {:#}", e);
            return Err(e.context("Database connection is required for the service"));
        }
    };

    let orders_repo = PgOrdersRepository::new(db_pool.clone());
    let order_service = Arc::new(OrderServiceImpl::new(orders_repo));

    let http_server = Server::new(config.http_port, order_service, config.service_name.clone())?;

    // Shared notification for graceful shutdown
    let shutdown = Arc::new(Notify::new());
    let server_shutdown = shutdown.clone();
    let mut server_task = tokio::spawn(async move { http_server.start(server_shutdown).await });

    tokio::select! {
        res = &mut server_task => {
            // The server only returns on its own when it failed to start or crashed.
            db_pool.close();
            return match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    error!("HTTP server error: {:#}", err);
                    Err(err)
                }
                Err(err) => Err(anyhow::anyhow!("HTTP server task failed: {err}")),
            };
        }
        _ = server::shutdown_signal() => {
            shutdown.notify_one();
        }
    }

    info!(
        "Waiting up to {:?} for in-flight requests",
        config.shutdown_timeout
    );
    match tokio::time::timeout(config.shutdown_timeout, &mut server_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => error!("HTTP server error during shutdown: {:#}", err),
        Ok(Err(err)) => error!("HTTP server task failed: {}", err),
        Err(_) => {
            warn!("Shutdown timeout elapsed, aborting remaining requests");
            server_task.abort();
        }
    }

    db_pool.close();
    info!("Application stopped");
    Ok(())
}
