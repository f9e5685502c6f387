use crate::cache::{CacheManager, CacheSizes};
use crate::config::ApiConfig;
use crate::datastore::Datastore;
use crate::error::{DatastoreError, TelemetryError, TriggerError};
use crate::models::{CeremonyVideo, Member};
use crate::performance::{DateRange, PerformanceMonitor, PerformanceReport};
use crate::telemetry::{AsyncTelemetry, CompletionOutcome};
use crate::trigger::{TriggerHandler, TriggerOutcome};
use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<TriggerHandler>,
    pub cache: Arc<CacheManager>,
    pub datastore: Arc<dyn Datastore>,
    pub telemetry: Arc<AsyncTelemetry>,
    pub monitor: Arc<PerformanceMonitor>,
    pub health_check_timeout: Duration,
    pub default_report_days: u32,
    pub max_preload_videos: usize,
}

/// Trigger request from an NFC reader
#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub nfc_card_id: String,
    #[serde(default)]
    pub device_info: serde_json::Value,
}

/// Trigger response
#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub trigger_id: Uuid,
    pub video: CeremonyVideo,
    pub member: Option<Member>,
    pub rule_applied: &'static str,
    pub rule_id: Option<i64>,
    pub response_time_ms: u64,
    pub cache_hit: bool,
}

impl From<TriggerOutcome> for TriggerResponse {
    fn from(o: TriggerOutcome) -> Self {
        Self {
            trigger_id: o.trigger_id,
            video: (*o.video).clone(),
            member: o.member,
            rule_applied: o.rule_applied,
            rule_id: o.rule_id,
            response_time_ms: o.response_time_ms,
            cache_hit: o.cache_hit,
        }
    }
}

/// Preload request
#[derive(Debug, Deserialize)]
pub struct PreloadRequest {
    pub video_ids: Vec<i64>,
}

/// Videos to pre-buffer on the playback surface
#[derive(Debug, Serialize)]
pub struct PreloadResponse {
    pub videos: Vec<CeremonyVideo>,
    pub total_size_bytes: i64,
    pub count: usize,
}

/// Playback completion signal
#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub trigger_id: Uuid,
    /// Milliseconds actually played
    pub actual_duration: i64,
    pub completed: bool,
}

/// Query parameters for the performance report
#[derive(Debug, Deserialize)]
pub struct PerformanceQuery {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

/// Cache clear response
#[derive(Debug, Serialize)]
pub struct CacheClearResponse {
    pub status: &'static str,
    /// False when a reload already running was left to complete
    pub reloaded: bool,
    pub cache: CacheSizes,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error returned by any handler, rendered as an [`ErrorResponse`]
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_REQUEST",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR",
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                code: self.code.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<TriggerError> for ApiError {
    fn from(e: TriggerError) -> Self {
        match e {
            TriggerError::InvalidRequest(_) => Self::invalid_request(e.to_string()),
            TriggerError::NoVideoResolvable(_) => Self {
                status: StatusCode::NOT_FOUND,
                code: "NO_VIDEO",
                message: e.to_string(),
            },
        }
    }
}

impl From<TelemetryError> for ApiError {
    fn from(e: TelemetryError) -> Self {
        match e {
            TelemetryError::TriggerNotFound(_) => Self {
                status: StatusCode::NOT_FOUND,
                code: "TRIGGER_NOT_FOUND",
                message: e.to_string(),
            },
            TelemetryError::Datastore(inner) => {
                error!(error = %inner, "Completion update failed");
                Self::internal("Failed to record completion")
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::invalid_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::invalid_request(rejection.body_text())
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
        if config.cors_origins.is_empty() {
            layer.allow_origin(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            layer.allow_origin(origins)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/trigger", post(trigger))
        .route("/preload", post(preload))
        .route("/complete", post(complete))
        .route("/performance", get(performance))
        .route("/cache/clear", post(clear_cache))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Resolve a scanned card to a video
async fn trigger(
    State(state): State<AppState>,
    payload: Result<Json<TriggerRequest>, JsonRejection>,
) -> Result<Json<TriggerResponse>, ApiError> {
    let Json(request) = payload?;
    let outcome = state
        .handler
        .handle(&request.nfc_card_id, request.device_info)
        .await?;
    Ok(Json(outcome.into()))
}

/// Video rows for client pre-buffering
#[instrument(skip(state, payload))]
async fn preload(
    State(state): State<AppState>,
    payload: Result<Json<PreloadRequest>, JsonRejection>,
) -> Result<Json<PreloadResponse>, ApiError> {
    let Json(request) = payload?;
    if request.video_ids.len() > state.max_preload_videos {
        return Err(ApiError::invalid_request(format!(
            "Maximum {} videos per preload",
            state.max_preload_videos
        )));
    }

    let ids: Vec<i64> = request
        .video_ids
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let videos = if ids.is_empty() {
        Vec::new()
    } else {
        state.datastore.videos_by_ids(&ids).await.map_err(|e| {
            error!(error = %e, "Failed to load videos for preload");
            ApiError::internal("Failed to load videos")
        })?
    };

    let total_size_bytes = videos.iter().map(|v| v.file_size_bytes).sum();
    Ok(Json(PreloadResponse {
        count: videos.len(),
        total_size_bytes,
        videos,
    }))
}

/// Playback completion from the playback surface
#[instrument(skip(state, payload))]
async fn complete(
    State(state): State<AppState>,
    payload: Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<Json<CompletionOutcome>, ApiError> {
    let Json(request) = payload?;
    if request.actual_duration < 0 {
        return Err(ApiError::invalid_request(
            "actual_duration must not be negative",
        ));
    }

    let outcome = state
        .telemetry
        .complete(request.trigger_id, request.actual_duration, request.completed)
        .await?;
    Ok(Json(outcome))
}

/// Response-time report for a date range, trailing days by default
#[instrument(skip(state, params))]
async fn performance(
    State(state): State<AppState>,
    params: Result<Query<PerformanceQuery>, QueryRejection>,
) -> Result<Json<PerformanceReport>, ApiError> {
    let Query(params) = params?;

    let fallback = state.monitor.default_range(state.default_report_days);
    let end = params.end_date.unwrap_or(fallback.end);
    let start = params
        .start_date
        .unwrap_or_else(|| DateRange::trailing(end, state.default_report_days).start);
    let range = DateRange::new(start, end)
        .ok_or_else(|| ApiError::invalid_request("start_date must not be after end_date"))?;

    Ok(Json(state.monitor.report(range)))
}

/// Drop cached members and reload rules and the default video.
///
/// A failed reload keeps serving the previous rules.
#[instrument(skip(state))]
async fn clear_cache(State(state): State<AppState>) -> Result<Json<CacheClearResponse>, ApiError> {
    state.cache.clear_members();
    let reloaded = state.cache.refresh().await.map_err(|e| {
        error!(error = %e, "Cache reload after clear failed");
        ApiError::internal(format!("Cache reload failed: {}", e))
    })?;
    if !reloaded {
        info!("Cache reload already in flight, leaving it to finish");
    }

    Ok(Json(CacheClearResponse {
        status: "cleared",
        reloaded,
        cache: state.cache.sizes(),
    }))
}

/// Liveness check with a bounded datastore round-trip
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let cache = state.cache.sizes();
    let ping = tokio::time::timeout(state.health_check_timeout, state.datastore.ping())
        .await
        .unwrap_or(Err(DatastoreError::Timeout(state.health_check_timeout)));
    let failure = ping.err().map(|e| e.to_string());

    match failure {
        None => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "database": "connected",
                "cache": cache
            })),
        ),
        Some(error) => {
            warn!(error = %error, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "unhealthy",
                    "database": "disconnected",
                    "error": error,
                    "cache": cache
                })),
            )
        }
    }
}

/// Serve the API on an already bound listener until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}

/// Start the ceremony API server
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting ceremony API server");

    let listener = TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    serve(listener, state, config, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_no_video_maps_to_404() {
        let response =
            ApiError::from(TriggerError::NoVideoResolvable("X1".to_string())).into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["code"], "NO_VIDEO");
    }

    #[test]
    fn test_invalid_request_maps_to_400() {
        let err = ApiError::from(TriggerError::InvalidRequest("empty".to_string()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[test]
    fn test_telemetry_errors_map() {
        let missing = ApiError::from(TelemetryError::TriggerNotFound(Uuid::new_v4()));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(missing.code(), "TRIGGER_NOT_FOUND");

        let down = ApiError::from(TelemetryError::Datastore(DatastoreError::Unavailable(
            "down".to_string(),
        )));
        assert_eq!(down.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(down.code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_trigger_request_defaults() {
        let request: TriggerRequest = serde_json::from_str("{}").unwrap();
        assert!(request.nfc_card_id.is_empty());
        assert!(request.device_info.is_null());
    }
}
