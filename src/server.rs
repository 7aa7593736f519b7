//! HTTP server for sample ingestion and remote configuration.
//!
//! ```text
//! phone / IoT node ──→ POST /predict ──→ FusionEngine ──→ classifier processes
//!                                             │
//! caregiver app ──→ PUT /users/:id/config     └──→ EmergencyNotifier
//!                   POST /users/:id/cancel
//! ```

use crate::config::ServerSettings;
use crate::core::sample::SamplePayload;
use crate::engine::{CancelOutcome, FusionEngine, StatusEcho};
use crate::fusion::SessionSnapshot;
use crate::remote::{RemoteConfigEvent, RemoteConfigHandle, RemoteOutcome};
use crate::stats::StatsSnapshot;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub host: String,
    /// Port to bind to (0 for random)
    pub port: u16,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self::new(settings.host.clone(), settings.port)
    }
}

/// Shared server state
#[derive(Clone)]
struct AppState {
    engine: Arc<FusionEngine>,
    remote: RemoteConfigHandle,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

fn listener_unavailable() -> ApiError {
    api_error(
        StatusCode::SERVICE_UNAVAILABLE,
        "REMOTE_CONFIG_UNAVAILABLE",
        "Remote configuration listener is not running",
    )
}

#[derive(Debug, Deserialize)]
pub struct SensitivityUpdate {
    pub sensitivity: i64,
}

#[derive(Debug, Serialize)]
pub struct SensitivityResponse {
    pub user_id: String,
    pub sensitivity: u8,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub user_id: String,
    pub outcome: CancelOutcome,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub sessions: usize,
    #[serde(flatten)]
    pub totals: StatsSnapshot,
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /predict
///
/// Ingests one sample. Classification, if triggered, continues after the
/// response is sent.
async fn predict(
    State(state): State<AppState>,
    payload: Result<Json<SamplePayload>, JsonRejection>,
) -> Result<Json<StatusEcho>, ApiError> {
    let Json(payload) = payload.map_err(|e| {
        state.engine.stats().record_sample_rejected();
        api_error(StatusCode::BAD_REQUEST, "MALFORMED_SAMPLE", e.body_text())
    })?;

    let receipt = state
        .engine
        .ingest(payload)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "MALFORMED_SAMPLE", e.to_string()))?;

    Ok(Json(receipt.echo))
}

/// GET /users/:id
async fn user_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    state
        .engine
        .session_snapshot(&user_id)
        .map(Json)
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "UNKNOWN_USER",
                format!("No session for user {user_id}"),
            )
        })
}

/// PUT /users/:id/config
async fn update_config(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(update): Json<SensitivityUpdate>,
) -> Result<Json<SensitivityResponse>, ApiError> {
    let outcome = state
        .remote
        .request(RemoteConfigEvent::Sensitivity {
            user_id: user_id.clone(),
            sensitivity: update.sensitivity,
        })
        .await
        .map_err(|_| listener_unavailable())?;

    match outcome {
        RemoteOutcome::SensitivityApplied { sensitivity } => Ok(Json(SensitivityResponse {
            user_id,
            sensitivity,
        })),
        RemoteOutcome::Cancel { .. } => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "UNEXPECTED_OUTCOME",
            "Sensitivity update produced a cancellation outcome",
        )),
    }
}

/// POST /users/:id/cancel
async fn cancel(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let outcome = state
        .remote
        .request(RemoteConfigEvent::Cancel {
            user_id: user_id.clone(),
        })
        .await
        .map_err(|_| listener_unavailable())?;

    match outcome {
        RemoteOutcome::Cancel {
            outcome: CancelOutcome::UnknownUser,
        } => Err(api_error(
            StatusCode::NOT_FOUND,
            "UNKNOWN_USER",
            format!("No session for user {user_id}"),
        )),
        RemoteOutcome::Cancel { outcome } => Ok(Json(CancelResponse { user_id, outcome })),
        RemoteOutcome::SensitivityApplied { .. } => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "UNEXPECTED_OUTCOME",
            "Cancellation produced a sensitivity outcome",
        )),
    }
}

/// GET /stats
async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        sessions: state.engine.session_count(),
        totals: state.engine.stats().stats(),
    })
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/predict", post(predict))
        .route("/stats", get(stats))
        .route("/users/:id", get(user_status))
        .route("/users/:id/config", put(update_config))
        .route("/users/:id/cancel", post(cancel))
        .layer(
            // Mobile apps and the caregiver web dashboard call from arbitrary origins.
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run(
    config: ServerConfig,
    engine: Arc<FusionEngine>,
    remote: RemoteConfigHandle,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(AppState { engine, remote });

    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Fusion server listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
