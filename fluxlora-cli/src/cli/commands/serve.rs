use crate::cli::{
    commands::generate::{start_service, Service},
    config::Config,
    error::{CliError, CliResult},
};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::Args;
use fluxlora::{AdapterId, AdapterInfo, AdapterState, GenerationRequest};
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Args, Debug)]
pub struct ServeCommand {
    /// Port to bind the server to
    #[arg(short, long, help = "Server port (defaults to the configured one)")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, help = "Server host (defaults to the configured one)")]
    pub host: Option<String>,

    /// Enable CORS
    #[arg(long, help = "Enable CORS")]
    pub cors: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<Service>,
    pub request_tracker: Arc<RequestTracker>,
}

impl AppState {
    pub fn new(service: Service) -> Self {
        Self {
            service: Arc::new(service),
            request_tracker: Arc::new(RequestTracker::new()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub id: String,
    pub images: Vec<PathBuf>,
    pub generation_time_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_requests: usize,
    /// `None` while a generation holds the pipeline
    pub adapter: Option<AdapterState>,
}

#[derive(Debug, Serialize)]
pub struct AdapterEntry {
    pub id: AdapterId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<AdapterInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AdaptersResponse {
    pub adapters: Vec<AdapterEntry>,
    pub default: Option<AdapterId>,
    pub loaded: Option<AdapterId>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn execute(cmd: ServeCommand, config: Config) -> CliResult<()> {
    info!("Starting FluxLoRA image server");

    let host = cmd.host.clone().unwrap_or_else(|| config.server.host.clone());
    let port = cmd.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| CliError::InvalidArgument(format!("Invalid host:port combination: {}", e)))?;

    let service = tokio::task::spawn_blocking(move || start_service(&config))
        .await
        .map_err(|e| CliError::Other(e.into()))??;
    match service.default_adapter()? {
        Some(id) => info!(adapter = %id, "Default adapter"),
        None => warn!("No adapters found, requests will use base weights"),
    }

    let mut app = build_router(AppState::new(service));
    if cmd.cors {
        app = app.layer(CorsLayer::permissive());
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| CliError::Server(format!("Failed to bind to {}: {}", addr, e)))?;

    info!("FluxLoRA server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| CliError::Server(e.to_string()))?;

    info!("Server shutdown complete");
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/adapters", get(adapters_handler))
        .route("/generate", post(generate_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default().include_headers(true)),
            ),
        )
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let adapter = state.service.try_adapter_state();
    Json(HealthResponse {
        status: if adapter.is_some() { "healthy" } else { "busy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.request_tracker.uptime().as_secs(),
        active_requests: state.request_tracker.active_requests(),
        adapter,
    })
}

async fn adapters_handler(
    State(state): State<AppState>,
) -> Result<Json<AdaptersResponse>, ApiError> {
    let service = state.service.clone();
    let listing = tokio::task::spawn_blocking(move || -> fluxlora::Result<_> {
        let ids = service.adapters()?;
        let adapters = ids
            .into_iter()
            .map(|id| match service.inspect_adapter(&id) {
                Ok(info) => AdapterEntry {
                    id,
                    info: Some(info),
                    error: None,
                },
                Err(e) => AdapterEntry {
                    id,
                    info: None,
                    error: Some(e.to_string()),
                },
            })
            .collect::<Vec<_>>();
        let default = adapters.first().map(|entry| entry.id.clone());
        let loaded = service
            .try_adapter_state()
            .and_then(|state| state.current().cloned());
        Ok(AdaptersResponse {
            adapters,
            default,
            loaded,
        })
    })
    .await;

    match listing {
        Ok(Ok(response)) => Ok(Json(response)),
        Ok(Err(e)) => Err(core_error(&e, None)),
        Err(e) => Err(internal_error(e.to_string(), None)),
    }
}

async fn generate_handler(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let request_id = Uuid::new_v4().to_string();

    let Json(request) = payload.map_err(|rejection| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: rejection.body_text(),
                code: "INVALID_REQUEST".to_string(),
                request_id: Some(request_id.clone()),
            }),
        )
    })?;

    let start_time = Instant::now();
    let active = state.request_tracker.start_request();
    info!(
        request_id = %request_id,
        adapter = ?request.adapter,
        steps = request.steps,
        count = request.count,
        "Generation request"
    );

    let service = state.service.clone();
    // Held by the blocking job, which outlives a dropped connection
    let result = tokio::task::spawn_blocking(move || {
        let _active = active;
        service.generate(&request)
    })
    .await;

    match result {
        Ok(Ok(images)) => Ok(Json(GenerateResponse {
            id: request_id,
            images,
            generation_time_ms: start_time.elapsed().as_millis() as u64,
        })),
        Ok(Err(e)) => {
            error!(request_id = %request_id, error = %e, "Generation failed");
            Err(core_error(&e, Some(request_id)))
        }
        Err(e) => Err(internal_error(e.to_string(), Some(request_id))),
    }
}

fn core_error(err: &fluxlora::Error, request_id: Option<String>) -> ApiError {
    let (status, code) = match err {
        fluxlora::Error::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
        fluxlora::Error::AdapterLoad { .. } => (StatusCode::BAD_REQUEST, "ADAPTER_LOAD_ERROR"),
        fluxlora::Error::Generation(_) => (StatusCode::INTERNAL_SERVER_ERROR, "GENERATION_ERROR"),
        fluxlora::Error::Worker(_) => (StatusCode::INTERNAL_SERVER_ERROR, "WORKER_ERROR"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: code.to_string(),
            request_id,
        }),
    )
}

fn internal_error(message: String, request_id: Option<String>) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: message,
            code: "INTERNAL_ERROR".to_string(),
            request_id,
        }),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
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

    info!("Shutdown signal received, starting graceful shutdown");
}

#[derive(Debug)]
pub struct RequestTracker {
    start_time: Instant,
    active: parking_lot::RwLock<usize>,
}

impl RequestTracker {
    fn new() -> Self {
        Self {
            start_time: Instant::now(),
            active: parking_lot::RwLock::new(0),
        }
    }

    /// Count a request until the returned guard is dropped
    fn start_request(self: &Arc<Self>) -> ActiveRequest {
        *self.active.write() += 1;
        ActiveRequest(Arc::clone(self))
    }

    fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn active_requests(&self) -> usize {
        *self.active.read()
    }
}

/// One in-flight generation; uncounted on drop, including on panic
#[derive(Debug)]
struct ActiveRequest(Arc<RequestTracker>);

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        let mut active = self.0.active.write();
        *active = active.saturating_sub(1);
    }
}
