use crate::errors::{LinkError, Result};
use crate::link::{LinkStatus, PrinterLink};
use crate::dispatcher::PrintOutcome;
use crate::metrics::MetricsSnapshot;
use crate::record::RecordSummary;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// HTTP API server state
#[derive(Clone)]
pub struct ApiState {
    pub link: Arc<PrinterLink>,
    /// Start time for uptime calculation
    pub start_time: std::time::Instant,
}

/// Print request payload. `bytes` is the raw printer byte stream, base64 encoded.
#[derive(Debug, Deserialize, Serialize)]
pub struct PrintRequest {
    pub bytes: String,
    /// Target one printer; omitted means every connected printer.
    pub printer_id: Option<String>,
    pub label: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PrintResponse {
    pub printed: usize,
    pub results: Vec<PrintOutcome>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AddNetworkPrinterRequest {
    pub name: String,
    pub ip: String,
    pub port: Option<u16>,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub printers: LinkStatus,
    pub sweeping: bool,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: Option<String>,
}

impl IntoResponse for LinkError {
    fn into_response(self) -> Response {
        let status = match &self {
            LinkError::PrinterNotFound(_) => StatusCode::NOT_FOUND,
            LinkError::NotConnected(_) | LinkError::NoPrintersConnected | LinkError::InvalidTransition(_) => {
                StatusCode::CONFLICT
            }
            LinkError::InvalidRequest(_) | LinkError::Config(_) => StatusCode::BAD_REQUEST,
            LinkError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            LinkError::TransportTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            LinkError::OutOfRange(_)
            | LinkError::Disconnected(_)
            | LinkError::TransportBusy(_)
            | LinkError::TransportUnavailable(_)
            | LinkError::RetryCeiling(_) => StatusCode::SERVICE_UNAVAILABLE,
            LinkError::Relay(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse {
            error: self.code().to_string(),
            details: Some(self.user_message()),
        });

        (status, body).into_response()
    }
}

/// GET /api/health - Health check endpoint
async fn handle_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        printers: state.link.connection_status().await,
        sweeping: state.link.controller().is_sweeping(),
    })
}

/// GET /api/printers - Every known printer with its current status
async fn handle_list_printers(State(state): State<ApiState>) -> Json<Vec<RecordSummary>> {
    Json(state.link.list_printers().await)
}

/// POST /api/printers/network - Add a network printer by IP
async fn handle_add_network_printer(
    State(state): State<ApiState>,
    Json(request): Json<AddNetworkPrinterRequest>,
) -> Result<Json<RecordSummary>> {
    info!("Adding network printer {} at {}", request.name, request.ip);
    let record = state
        .link
        .add_network_printer(&request.name, &request.ip, request.port)
        .await?;
    Ok(Json(record))
}

/// POST /api/printers/:id/connect - Connect a known printer now
async fn handle_connect(State(state): State<ApiState>, Path(id): Path<String>) -> Result<Json<RecordSummary>> {
    Ok(Json(state.link.connect_printer(&id).await?))
}

/// DELETE /api/printers/:id - Forget a printer
async fn handle_remove(State(state): State<ApiState>, Path(id): Path<String>) -> Result<StatusCode> {
    state.link.disconnect_printer(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/printers/reconnect - Re-verify sessions and sweep, as after a wake from sleep
async fn handle_reconnect(State(state): State<ApiState>) -> Json<LinkStatus> {
    state.link.on_foreground().await;
    Json(state.link.connection_status().await)
}

/// POST /api/print - Send raw bytes to one printer or to all connected printers
async fn handle_print(State(state): State<ApiState>, Json(request): Json<PrintRequest>) -> Result<Json<PrintResponse>> {
    let bytes = STANDARD
        .decode(request.bytes.as_bytes())
        .map_err(|e| LinkError::InvalidRequest(format!("bytes is not valid base64: {}", e)))?;
    if bytes.is_empty() {
        return Err(LinkError::InvalidRequest("bytes is empty".to_string()));
    }
    let label = request.label.as_deref();
    debug!("Print request: {} bytes", bytes.len());

    let results = match &request.printer_id {
        Some(id) => {
            state.link.send_to(id, &bytes, label).await?;
            vec![PrintOutcome {
                id: id.clone(),
                success: true,
                error: None,
            }]
        }
        None => state.link.send_to_all_connected(&bytes, label).await?,
    };

    Ok(Json(PrintResponse {
        printed: results.iter().filter(|r| r.success).count(),
        results,
    }))
}

/// GET /api/metrics/json - Connection and print metrics
async fn handle_metrics_json(State(state): State<ApiState>) -> Json<MetricsSnapshot> {
    Json(state.link.metrics().await)
}

/// Create HTTP API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/printers", get(handle_list_printers))
        .route("/api/printers/network", post(handle_add_network_printer))
        .route("/api/printers/reconnect", post(handle_reconnect))
        .route("/api/printers/:id/connect", post(handle_connect))
        .route("/api/printers/:id", delete(handle_remove))
        .route("/api/print", post(handle_print))
        .route("/api/metrics/json", get(handle_metrics_json))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(AllowOrigin::predicate(|origin, _| {
                            let o = origin.as_bytes();
                            o.starts_with(b"http://localhost")
                                || o.starts_with(b"https://localhost")
                                || o.starts_with(b"http://127.0.0.1")
                        }))
                        .allow_methods([
                            axum::http::Method::GET,
                            axum::http::Method::POST,
                            axum::http::Method::DELETE,
                            axum::http::Method::OPTIONS,
                        ])
                        .allow_headers(tower_http::cors::Any),
                ),
        )
        .with_state(state)
}

/// Start HTTP API server
pub async fn start_api_server(addr: &str, state: ApiState) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    info!("Starting HTTP API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router).await.map_err(|e| {
        error!("HTTP API server error: {}", e);
        e.into()
    })
}
