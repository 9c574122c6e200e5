//! HTTP API
//!
//! Read endpoints over the memory store plus manual triggers for the
//! consolidation worker and the image sweep.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ReverieError;
use crate::images::{ImageSweeper, SweepReport};
use crate::pipeline::{BatchReport, ConsolidationWorker, ProcessingStats};
use crate::storage::MemoryStore;
use crate::types::{now_timestamp, today_prefix, MemoryBlock, TIMESTAMP_FORMAT};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MemoryStore>,
    pub worker: Arc<ConsolidationWorker>,
    /// `None` when image generation is disabled
    pub images: Option<Arc<ImageSweeper>>,
}

/// Error response: `{"error": {"type": ..., "message": ...}}`
pub struct ApiError(ReverieError);

impl From<ReverieError> for ApiError {
    fn from(err: ReverieError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ReverieError::NotFound(_) => StatusCode::NOT_FOUND,
            ReverieError::Validation(_) => StatusCode::BAD_REQUEST,
            ReverieError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(kind = self.0.kind(), "request failed: {}", self.0);
        }
        let body = json!({
            "error": {
                "type": self.0.kind(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// HTTP server
pub struct ApiServer {
    state: AppState,
    addr: SocketAddr,
}

impl ApiServer {
    pub fn new(state: AppState, addr: SocketAddr) -> Self {
        Self { state, addr }
    }

    /// Build the router
    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/memories", get(list_memories))
            .route("/memories/today", get(todays_memories))
            .route("/memory/:id", get(get_memory))
            .route("/transcriptions", post(create_transcription))
            .route("/consolidate", post(consolidate))
            .route("/stats", get(stats_handler))
            .route("/generate-images", post(generate_images))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = Self::router(self.state);

        tracing::info!("HTTP API listening on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({"message": "API is running"}))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.health_check().unwrap_or_else(|e| crate::storage::HealthStatus {
        healthy: false,
        error: Some(e.to_string()),
        ..Default::default()
    });
    let worker_running = state.worker.is_running();
    let status = if store.healthy && worker_running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let label = if status == StatusCode::OK { "ok" } else { "degraded" };

    (
        status,
        Json(json!({
            "status": label,
            "store": store,
            "worker_running": worker_running,
            "images_enabled": state.images.is_some(),
        })),
    )
}

/// All memory blocks, newest first
async fn list_memories(State(state): State<AppState>) -> ApiResult<Vec<MemoryBlock>> {
    Ok(Json(state.store.get_memories()?))
}

async fn todays_memories(State(state): State<AppState>) -> ApiResult<Vec<MemoryBlock>> {
    Ok(Json(state.store.get_memories_on(&today_prefix())?))
}

async fn get_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<MemoryBlock> {
    state
        .store
        .get_memory(&id)?
        .map(Json)
        .ok_or_else(|| ReverieError::NotFound(format!("memory {}", id)).into())
}

#[derive(Debug, Deserialize)]
struct NewTranscription {
    text: String,
    /// Defaults to now
    timestamp: Option<String>,
}

async fn create_transcription(
    State(state): State<AppState>,
    Json(input): Json<NewTranscription>,
) -> std::result::Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let text = input.text.trim();
    if text.is_empty() {
        return Err(ReverieError::Validation("transcription text is empty".to_string()).into());
    }

    let timestamp = match input.timestamp {
        Some(ts) => {
            NaiveDateTime::parse_from_str(&ts, TIMESTAMP_FORMAT).map_err(|_| {
                ReverieError::Validation(format!(
                    "timestamp '{}' does not match {}",
                    ts, TIMESTAMP_FORMAT
                ))
            })?;
            ts
        }
        None => now_timestamp(),
    };

    let id = state.store.create_transcription(text, &timestamp)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"id": id, "timestamp": timestamp})),
    ))
}

async fn consolidate(State(state): State<AppState>) -> ApiResult<BatchReport> {
    Ok(Json(state.worker.run_now().await?))
}

async fn stats_handler(State(state): State<AppState>) -> Json<ProcessingStats> {
    Json(state.worker.stats())
}

async fn generate_images(State(state): State<AppState>) -> ApiResult<SweepReport> {
    let sweeper = state.images.as_ref().ok_or_else(|| {
        ReverieError::Unavailable("image generation is disabled".to_string())
    })?;
    Ok(Json(sweeper.sweep().await?))
}
