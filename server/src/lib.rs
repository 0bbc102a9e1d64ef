pub mod config;
pub mod delivery;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod session;
pub mod sink;
pub mod validation;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use llm_core::NarrationRequest;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::delivery::{start_position, tail_sink};
use crate::error::ApiError;
use crate::metrics::{MetricsResponse, PipelineMetrics, SystemMetrics};
use crate::pipeline::PipelineCoordinator;
use crate::session::{Attach, SessionRegistry, SessionSnapshot};
use crate::validation::{validate_narration_request, validate_session_id};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: PipelineCoordinator,
    pub registry: Arc<SessionRegistry>,
    pub metrics: Arc<PipelineMetrics>,
    pub request_count: Arc<AtomicU64>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(coordinator: PipelineCoordinator, config: ServerConfig) -> Self {
        Self {
            registry: coordinator.registry().clone(),
            metrics: coordinator.metrics().clone(),
            coordinator,
            request_count: Arc::new(AtomicU64::new(0)),
            config,
        }
    }
}

#[derive(Deserialize)]
pub struct StartProcessingRequest {
    url_images: Vec<String>,
    question: String,
}

#[derive(Serialize)]
pub struct StartProcessingResponse {
    data: &'static str,
    task_id: Uuid,
}

#[derive(Deserialize)]
pub struct AudioStreamQuery {
    #[serde(default)]
    offset: u64,
}

/// All routes, served at the root and again under `/api`.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(health_check))
        .route("/start-processing", post(start_processing))
        .route("/audio-stream/{id}", get(audio_stream))
        .route("/sessions/{id}", get(session_status))
        .route("/metrics", get(metrics_endpoint));

    Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(axum::middleware::from_fn(add_request_id))
        .with_state(state)
}

/// Tag every request and response with an `x-request-id`.
pub async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let header_value = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = header_value.clone() {
        request.headers_mut().insert("x-request-id", value);
    }
    let mut response = next.run(request).await;
    if let Some(value) = header_value {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn start_processing(
    State(state): State<AppState>,
    Json(req): Json<StartProcessingRequest>,
) -> Result<(StatusCode, Json<StartProcessingResponse>), ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    validate_narration_request(&req.question, &req.url_images, state.config.max_images)?;

    let task_id = state
        .coordinator
        .start(NarrationRequest {
            images: req.url_images,
            question: req.question,
        })
        .await
        .map_err(|e| ApiError::InternalError(format!("Could not start narration: {e}")))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StartProcessingResponse {
            data: "success",
            task_id,
        }),
    ))
}

pub async fn audio_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AudioStreamQuery>,
) -> Result<Response, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let id = validate_session_id(&id)?;
    if start_position(query.offset).is_none() {
        return Err(ApiError::InvalidInput(format!(
            "offset {} is out of range",
            query.offset
        )));
    }

    let attach = state
        .registry
        .attach_reader(&id)
        .ok_or_else(|| ApiError::NotFound(format!("Session {id} not found")))?;

    let body = match attach {
        Attach::Reader(lease) => {
            info!(session = %id, offset = query.offset, "reader attached");
            Body::from_stream(tail_sink(lease, query.offset))
        }
        Attach::Duplicate => {
            PipelineMetrics::incr(&state.metrics.duplicate_attaches);
            info!(session = %id, "session already consumed, sending empty stream");
            Body::empty()
        }
        Attach::Unavailable(session_state) => {
            debug!(session = %id, state = ?session_state, "nothing to stream");
            Body::empty()
        }
    };

    Ok((
        [
            (header::CONTENT_TYPE, "audio/mpeg"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

pub async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let id = validate_session_id(&id)?;
    state
        .registry
        .get(&id)
        .map(|session| Json(session.snapshot()))
        .ok_or_else(|| ApiError::NotFound(format!("Session {id} not found")))
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<MetricsResponse> {
    let request_count = state.request_count.load(Ordering::Relaxed);
    Json(MetricsResponse {
        timestamp: Utc::now(),
        system: SystemMetrics::collect(request_count),
        pipeline: state.metrics.stats(state.registry.active_readers()),
        synthesis: state.metrics.synthesis.stats(),
    })
}
