//! Server crate provides the HTTP boundary of the order service.
//!
//! Routes translate JSON requests into [`OrderService`] calls and map
//! [`ServiceError`]s to status codes and a `{ "error", "code" }` body.
//! Server-side failures are logged in full and answered with a generic message.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        MatchedPath, Path, State,
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, patch},
    Json, Router,
};
use chrono::Utc;
use model::{NewOrder, Order, OrderDetails, OrderSummary, PlacedOrder};
use prometheus::{Counter, CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use serde::{Deserialize, Serialize};
use serde_json::json;
use service::{OrderService, ServiceError};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// Server represents the HTTP server for working with orders.
pub struct Server {
    service: Arc<dyn OrderService>,
    service_name: String,
    port: u16,
    metrics: Arc<Metrics>,
}

/// Metrics collects and exposes HTTP server metrics.
struct Metrics {
    registry: Registry,
    http_requests_total: CounterVec,
    http_request_duration_seconds: HistogramVec,
    errors_total: CounterVec,
    orders_placed_total: Counter,
}

impl Metrics {
    fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "endpoint", "status"],
        )?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "endpoint"],
        )?;

        let errors_total = CounterVec::new(
            Opts::new("errors_total", "Total number of errors"),
            &["source", "endpoint"],
        )?;

        let orders_placed_total =
            Counter::new("orders_placed_total", "Total number of orders placed")?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(orders_placed_total.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            errors_total,
            orders_placed_total,
        })
    }

    fn record_request(&self, method: &str, endpoint: &str, status: u16, duration: Duration) {
        self.http_requests_total
            .with_label_values(&[method, endpoint, &status.to_string()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, endpoint])
            .observe(duration.as_secs_f64());
    }

    fn record_error(&self, source: &str, endpoint: &str) {
        self.errors_total.with_label_values(&[source, endpoint]).inc();
    }
}

/// Error body returned for every failed request.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

/// A failed request, ready to be rendered.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

/// Status code for each kind of service failure.
pub fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::ConflictingState(_) => StatusCode::CONFLICT,
        ServiceError::ReferencedEntityNotFound { .. } | ServiceError::StoreUnavailable(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl ApiError {
    /// Wraps a service error. For 5xx the detail is logged and `failure` is sent instead.
    fn from_service(err: ServiceError, failure: &'static str) -> Self {
        let status = status_for(&err);
        let message = if status.is_server_error() {
            error!(error = %err, code = err.code(), "{failure}");
            failure.to_string()
        } else {
            err.to_string()
        };
        Self {
            status,
            code: err.code(),
            message,
        }
    }

    fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_INPUT",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            code: self.code.to_string(),
        };
        (self.status, Json(body)).into_response()
    }
}

/// Body of a successful placement.
#[derive(Debug, Serialize)]
struct PlaceOrderResponse {
    message: &'static str,
    order: PlacedOrder,
}

/// Body of a status update.
#[derive(Debug, Deserialize)]
struct StatusUpdate {
    #[serde(default)]
    status: Option<String>,
}

impl Server {
    /// Creates a new Server instance.
    ///
    /// # Arguments
    ///
    /// * `port` - The port on which the server will listen
    /// * `service` - The order service handling every route
    /// * `service_name` - Name reported by the health endpoint
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics registry cannot be set up.
    pub fn new(port: u16, service: Arc<dyn OrderService>, service_name: String) -> Result<Self> {
        info!("Initializing HTTP server on port {}", port);

        Ok(Self {
            service,
            service_name,
            port,
            metrics: Arc::new(Metrics::new().context("Failed to register metrics")?),
        })
    }

    /// Starts the server and blocks until `shutdown` is notified and in-flight requests drain.
    pub async fn start(&self, shutdown: Arc<Notify>) -> Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .context("Failed to bind to port")?;

        info!("HTTP server listening on port {}", self.port);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.notified().await })
            .await
            .context("Server error")?;

        info!("HTTP server shut down gracefully");
        Ok(())
    }

    /// Builds the router with all routes, the fallback and the metrics middleware.
    pub fn router(&self) -> Router {
        let metrics = self.metrics.clone();

        Router::new()
            .route(
                "/api/orders",
                get(Self::handle_list_orders).post(Self::handle_place_order),
            )
            .route("/api/orders/{id}", get(Self::handle_get_order))
            .route("/api/orders/{id}/status", patch(Self::handle_set_status))
            .route("/health", get(Self::handle_health))
            .route("/metrics", get(Self::handle_metrics))
            .fallback(Self::handle_not_found)
            .layer(axum::middleware::from_fn_with_state(
                metrics.clone(),
                Self::metrics_middleware,
            ))
            .with_state(AppState {
                service: self.service.clone(),
                service_name: Arc::from(self.service_name.as_str()),
                started: Instant::now(),
                metrics,
            })
    }

    /// Middleware for collecting metrics on HTTP requests, labelled by route template.
    async fn metrics_middleware(
        State(metrics): State<Arc<Metrics>>,
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> Response {
        let method = req.method().to_string();
        let endpoint = req
            .extensions()
            .get::<MatchedPath>()
            .map(|path| path.as_str().to_owned())
            .unwrap_or_else(|| "unmatched".to_owned());

        let start = Instant::now();
        let response = next.run(req).await;
        let status = response.status().as_u16();

        metrics.record_request(&method, &endpoint, status, start.elapsed());
        if status >= 400 {
            metrics.record_error("http", &endpoint);
        }

        response
    }

    async fn handle_place_order(
        State(state): State<AppState>,
        payload: Result<Json<NewOrder>, JsonRejection>,
    ) -> Result<(StatusCode, Json<PlaceOrderResponse>), ApiError> {
        let Json(order) = payload.map_err(|e| {
            warn!("Rejected order payload: {}", e.body_text());
            ApiError::invalid_input(e.body_text())
        })?;
        info!("Received order placement with {} line(s)", order.items.len());

        let placed = state
            .service
            .place_order(order)
            .await
            .map_err(|e| ApiError::from_service(e, "Failed to create order"))?;
        state.metrics.orders_placed_total.inc();

        Ok((
            StatusCode::CREATED,
            Json(PlaceOrderResponse {
                message: "Order created successfully",
                order: placed,
            }),
        ))
    }

    async fn handle_list_orders(
        State(state): State<AppState>,
    ) -> Result<Json<Vec<OrderSummary>>, ApiError> {
        let orders = state
            .service
            .list_orders()
            .await
            .map_err(|e| ApiError::from_service(e, "Failed to fetch orders"))?;
        Ok(Json(orders))
    }

    async fn handle_get_order(
        State(state): State<AppState>,
        id: Result<Path<i32>, PathRejection>,
    ) -> Result<Json<OrderDetails>, ApiError> {
        let Path(id) = id.map_err(|e| ApiError::invalid_input(e.body_text()))?;
        info!("Received order request for ID: {}", id);

        let order = state
            .service
            .get_order(id)
            .await
            .map_err(|e| ApiError::from_service(e, "Failed to fetch order"))?;
        Ok(Json(order))
    }

    async fn handle_set_status(
        State(state): State<AppState>,
        id: Result<Path<i32>, PathRejection>,
        payload: Result<Json<StatusUpdate>, JsonRejection>,
    ) -> Result<Json<Order>, ApiError> {
        let Path(id) = id.map_err(|e| ApiError::invalid_input(e.body_text()))?;
        let Json(update) = payload.map_err(|e| ApiError::invalid_input(e.body_text()))?;

        let order = state
            .service
            .set_status(id, update.status.as_deref())
            .await
            .map_err(|e| ApiError::from_service(e, "Failed to update order status"))?;
        Ok(Json(order))
    }

    async fn handle_health(State(state): State<AppState>) -> Response {
        Json(json!({
            "status": "OK",
            "service": &*state.service_name,
            "timestamp": Utc::now(),
            "uptime": state.started.elapsed().as_secs_f64(),
        }))
        .into_response()
    }

    async fn handle_metrics(State(state): State<AppState>) -> Response {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&state.metrics.registry.gather(), &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
        }

        match String::from_utf8(buffer) {
            Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
            Err(e) => {
                error!("Failed to convert metrics to UTF-8: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Invalid metrics data").into_response()
            }
        }
    }

    async fn handle_not_found(uri: Uri) -> Response {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Route not found", "path": uri.path() })),
        )
            .into_response()
    }
}

/// Application state shared between request handlers
#[derive(Clone)]
struct AppState {
    service: Arc<dyn OrderService>,
    service_name: Arc<str>,
    started: Instant,
    metrics: Arc<Metrics>,
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
