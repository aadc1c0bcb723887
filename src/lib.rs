pub mod delivery;
pub mod error;
pub mod hardware;
pub mod headers;
pub mod hls;
pub mod metrics;
pub mod playlist;
pub mod policy;
pub mod probe;
pub mod reaper;
pub mod registry;
pub mod resolver;
pub mod seek;
pub mod service;
pub mod settings;
pub mod task;
pub mod transcoder;
mod worker;

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::delivery::SegmentFetch;
use crate::error::TranscodeError;
use crate::metrics::MonitoringConfig;
use crate::service::{StartRequest, TranscodeService};
use crate::task::{StopReason, TaskId};

struct AppState {
    service: TranscodeService,
    monitoring: MonitoringConfig,
}

pub fn create_app(service: TranscodeService, monitoring: MonitoringConfig) -> Router {
    let state = Arc::new(AppState {
        service,
        monitoring,
    });

    Router::new()
        .route("/transcode", get(list_handler))
        .route("/transcode/start", post(start_handler))
        .route("/transcode/{id}", axum::routing::delete(delete_handler))
        .route("/transcode/{id}/status", get(status_handler))
        .route("/transcode/{id}/playlist", get(playlist_handler))
        .route("/transcode/{id}/segment/{index}", get(segment_handler))
        .route("/transcode/{id}/seek", post(seek_handler))
        .route("/transcode/{id}/stop", post(stop_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

fn user_agent(headers: &HeaderMap) -> &str {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>")
}

async fn fallback_handler(method: Method, uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    info!(
        "HTTP 404: method={} uri={} UA=\"{}\"",
        method,
        uri,
        user_agent(&headers)
    );
    (StatusCode::NOT_FOUND, "Not found")
}

async fn start_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<StartRequest>,
) -> Response {
    info!(
        "HTTP start: source_key={} file={:?} start_time={:?} UA=\"{}\"",
        req.source_key,
        req.file_name,
        req.start_time,
        user_agent(&headers)
    );
    match state.service.start(req).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => {
            warn!("HTTP start rejected: {}", e);
            e.into_response()
        }
    }
}

async fn list_handler(State(state): State<Arc<AppState>>) -> Response {
    let registry = state.service.registry();
    let summary = registry.summary().await;
    let tasks = registry.list().await;
    Json(serde_json::json!({ "summary": summary, "tasks": tasks })).into_response()
}

async fn status_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.service.registry().get(&TaskId::from(id)).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn playlist_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    info!("HTTP playlist: id={} UA=\"{}\"", id, user_agent(&headers));
    let body = match state.service.registry().playlist(&TaskId::from(id.clone())).await {
        Ok(b) => b,
        Err(e) => {
            if e.is_retryable() {
                warn!("HLS playlist not ready yet: id={} (503)", id);
            }
            return e.into_response();
        }
    };

    let mut resp = (
        [
            (header::CONTENT_TYPE, "application/vnd.apple.mpegurl"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        body.content,
    )
        .into_response();
    if let Some(duration) = body.duration {
        if let Ok(v) = format!("{duration:.3}").parse() {
            resp.headers_mut().insert("X-Video-Duration", v);
        }
    }
    resp
}

async fn segment_handler(
    Path((id, index)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let Ok(index) = index.trim_end_matches(".ts").parse::<u64>() else {
        return TranscodeError::InvalidRequest(format!("invalid segment {index:?}")).into_response();
    };
    info!(
        "HTTP segment: id={} index={} Range=\"{}\"",
        id,
        index,
        headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("<none>")
    );

    match state.service.registry().segment(&TaskId::from(id), index).await {
        Ok(SegmentFetch::Data(bytes)) => segment_response(bytes, &headers),
        Ok(SegmentFetch::Skip) => (
            StatusCode::NOT_FOUND,
            [(header::CACHE_CONTROL, "no-store")],
            "Segment skipped",
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Full body, or the requested `bytes=a-b` slice. Some Safari/iOS HLS stacks
/// probe segments with Range requests.
fn segment_response(bytes: Bytes, headers: &HeaderMap) -> Response {
    let total = bytes.len();
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("bytes="))
        .and_then(|spec| spec.split_once('-'))
        .and_then(|(start, end)| {
            let start: usize = start.parse().ok()?;
            let end: usize = if end.is_empty() {
                total.checked_sub(1)?
            } else {
                end.parse().ok()?
            };
            (start <= end && end < total).then_some((start, end))
        });

    let common = [
        (header::CONTENT_TYPE, "video/mp2t"),
        (header::ACCEPT_RANGES, "bytes"),
        (header::CACHE_CONTROL, "no-store"),
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
    ];
    match range {
        Some((start, end)) => {
            let body = bytes.slice(start..=end);
            (
                StatusCode::PARTIAL_CONTENT,
                common,
                [(header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}"))],
                Body::from(body),
            )
                .into_response()
        }
        None => (common, Body::from(bytes)).into_response(),
    }
}

#[derive(Deserialize)]
struct SeekBody {
    time: f64,
}

async fn seek_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SeekBody>,
) -> Response {
    info!("HTTP seek: id={} time={}", id, body.time);
    match state.service.registry().seek(&TaskId::from(id), body.time).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn stop_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    info!("HTTP stop: id={}", id);
    match state
        .service
        .registry()
        .stop(&TaskId::from(id), StopReason::Requested)
        .await
    {
        Ok(view) => Json(view).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_handler(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    info!("HTTP delete: id={}", id);
    match state.service.registry().delete(&TaskId::from(id)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    if !state.monitoring.enabled {
        return (StatusCode::NOT_FOUND, "Monitoring disabled").into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
        .into_response()
}
