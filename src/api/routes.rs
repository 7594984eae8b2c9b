//! The ambient HTTP surface. Thin by design: a liveness check, a read-only
//! view of the account pool, the orchestrator's recent-events ring buffer,
//! and the one route that actually drives traffic — `/v1/responses`, which
//! hands the request body to the Fetch Orchestrator and returns whatever it
//! decides. This is not a general reverse proxy.

use std::sync::Arc;

use axum::body::Bytes as AxumBytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::account::Pool;
use crate::config::Config;
use crate::error::CoreError;
use crate::orchestrator::FetchOrchestrator;

use super::types::{AccountSnapshot, HealthResponse};

pub struct AppState {
    pub pool: Arc<Pool>,
    pub orchestrator: Arc<FetchOrchestrator>,
}

pub async fn serve(config: Config, pool: Arc<Pool>, orchestrator: Arc<FetchOrchestrator>) -> anyhow::Result<()> {
    let state = Arc::new(AppState { pool, orchestrator });

    let app = Router::new()
        .route("/health", get(health))
        .route("/accounts", get(accounts))
        .route("/accounts/events", get(accounts_events))
        .route("/v1/responses", post(v1_responses))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

async fn accounts(State(state): State<Arc<AppState>>) -> Json<Vec<AccountSnapshot>> {
    let snapshot = state.pool.snapshot().await;
    Json(snapshot.iter().map(AccountSnapshot::from).collect())
}

async fn accounts_events(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.recent_events(100).await)
}

async fn v1_responses(State(state): State<Arc<AppState>>, body: AxumBytes) -> Response {
    let parsed: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}"));
        }
    };

    match state.orchestrator.fetch(parsed).await {
        Ok(outcome) => {
            let mut headers = HeaderMap::new();
            for (name, value) in &outcome.headers {
                if let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
                    headers.insert(name, value);
                }
            }
            let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, headers, outcome.body).into_response()
        }
        Err(e) => core_error_response(e),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": { "message": message } }))).into_response()
}

/// Converts a terminal `CoreError` into an HTTP response. This is the only
/// place a `CoreError` is turned into a status code; the orchestrator itself
/// always resolves rate limits and pool exhaustion into a synthesized
/// `UpstreamOutcome` before this point is ever reached.
fn core_error_response(err: CoreError) -> Response {
    let status = match &err {
        CoreError::AuthFailure(_) => StatusCode::UNAUTHORIZED,
        CoreError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        CoreError::UpstreamError { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        CoreError::Transport(_) => StatusCode::BAD_GATEWAY,
        CoreError::StorageBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::StorageIO(_) => StatusCode::INTERNAL_SERVER_ERROR,
        CoreError::StorageCorrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        CoreError::ModelCatalogUnavailable(_) => StatusCode::BAD_GATEWAY,
        CoreError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        CoreError::PoolExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
        CoreError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error!(error = %err, %status, "request failed");
    error_response(status, err.to_string())
}
