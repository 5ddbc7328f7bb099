//! HTTP API
//!
//! Read endpoints over the query façade plus the `/events` push stream (SSE).
//! Errors are rendered as `{"error": "..."}` with the status from
//! [`Error::to_http_status`].

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{shutdown_signalled, timestamp_now_millis, Error, Result, METRICS};
use crate::indexer::{QueryService, Record};
use async_stream::stream;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

/// Header carrying the record count of `/pixels/binary`
pub const RECORD_COUNT_HEADER: &str = "x-record-count";

/// Request bodies are never read; anything larger is refused early
const MAX_BODY_BYTES: usize = 16 * 1024;

#[derive(Clone)]
pub struct ApiState {
    pub query: QueryService,
    pub heartbeat_interval: Duration,
    /// Open push streams end when this flips to `true`
    pub shutdown: watch::Receiver<bool>,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/health/live", axum::routing::get(health_live))
        .route("/stats", axum::routing::get(stats))
        .route("/pixels", axum::routing::get(pixels))
        .route("/pixels/binary", axum::routing::get(pixels_binary))
        .route("/pixels/:x/:y", axum::routing::get(pixel))
        .route("/region", axum::routing::get(region))
        .route("/events", axum::routing::get(events))
        .route("/metrics", axum::routing::get(metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(request_tracing_middleware))
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
}

/// Numeric query/path parameter; absent means `default`
fn parse_param(name: &str, value: Option<&str>, default: Option<i64>) -> Result<i64> {
    match value {
        Some(v) => v
            .trim()
            .parse::<i64>()
            .map_err(|_| Error::InvalidRequest(format!("{} must be an integer, got {:?}", name, v))),
        None => default.ok_or_else(|| Error::InvalidRequest(format!("missing parameter {}", name))),
    }
}

fn non_negative(name: &str, value: i64) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| Error::InvalidRequest(format!("{} must be non-negative", name)))
}

async fn health(State(state): State<ApiState>) -> Result<impl IntoResponse> {
    let mut body = serde_json::to_value(state.query.stats())?;
    body["status"] = json!("healthy");
    body["version"] = json!(env!("CARGO_PKG_VERSION"));
    Ok(Json(body))
}

async fn health_live() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "alive": true,
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": timestamp_now_millis() / 1000,
        })),
    )
}

async fn stats(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.query.stats())
}

#[derive(Debug, Deserialize)]
struct PageParams {
    offset: Option<String>,
    limit: Option<String>,
}

async fn pixels(
    State(state): State<ApiState>,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<Record>>> {
    let offset = parse_param("offset", params.offset.as_deref(), Some(0))?;
    let limit = parse_param(
        "limit",
        params.limit.as_deref(),
        Some(crate::indexer::query::MAX_PAGE_LIMIT),
    )?;
    Ok(Json(state.query.paginate(offset, limit)?))
}

async fn pixels_binary(State(state): State<ApiState>) -> Response {
    let (body, count) = state.query.binary();
    (
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            ),
            (HeaderName::from_static(RECORD_COUNT_HEADER), HeaderValue::from(count)),
        ],
        body,
    )
        .into_response()
}

async fn pixel(
    State(state): State<ApiState>,
    Path((x, y)): Path<(String, String)>,
) -> Result<Json<Record>> {
    let x = non_negative("x", parse_param("x", Some(&x), None)?)?;
    let y = non_negative("y", parse_param("y", Some(&y), None)?)?;
    state
        .query
        .get(x, y)?
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("pixel ({}, {}) has never been placed", x, y)))
}

#[derive(Debug, Deserialize)]
struct RegionParams {
    x: Option<String>,
    y: Option<String>,
    width: Option<String>,
    height: Option<String>,
}

async fn region(
    State(state): State<ApiState>,
    Query(params): Query<RegionParams>,
) -> Result<impl IntoResponse> {
    let field = |name: &str, value: &Option<String>| -> Result<u64> {
        non_negative(name, parse_param(name, value.as_deref(), None)?)
    };
    let x = field("x", &params.x)?;
    let y = field("y", &params.y)?;
    let width = field("width", &params.width)?;
    let height = field("height", &params.height)?;

    let cells = state.query.range(x, y, width, height)?;
    Ok(Json(json!({
        "x": x,
        "y": y,
        "width": width,
        "height": height,
        "pixels": cells,
    })))
}

enum StreamItem {
    Record(Arc<Record>),
    Heartbeat,
    Closed,
}

/// Server-sent events: `connected` once, then `record` per committed write and
/// `heartbeat` on an interval. Ends when the subscriber is dropped for falling
/// behind or the server shuts down.
async fn events(State(state): State<ApiState>) -> Response {
    let mut subscription = state.query.subscribe();
    let mut shutdown = state.shutdown.clone();
    let heartbeat = state.heartbeat_interval;
    let subscriber = subscription.id();

    let stream = stream! {
        yield Ok::<_, Infallible>(
            Event::default()
                .event("connected")
                .data(json!({ "subscriber": subscriber, "timestamp": timestamp_now_millis() }).to_string()),
        );

        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut shutdown) => StreamItem::Closed,
                record = subscription.recv() => record.map_or(StreamItem::Closed, StreamItem::Record),
                _ = ticker.tick() => StreamItem::Heartbeat,
            };

            match item {
                StreamItem::Record(record) => match Event::default().event("record").json_data(&*record) {
                    Ok(event) => yield Ok(event),
                    Err(e) => tracing::warn!(subscriber, "Failed to encode record event: {}", e),
                },
                StreamItem::Heartbeat => {
                    yield Ok(Event::default().event("heartbeat").data(timestamp_now_millis().to_string()));
                }
                StreamItem::Closed => break,
            }
        }
        tracing::debug!(subscriber, "Event stream closed");
    };

    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let stats = state.query.stats();
    let mut out = String::new();
    out += &format!("pixel_indexer_records {}\n", stats.total_records);
    out += &format!(
        "pixel_indexer_last_processed_position {}\n",
        stats.last_processed_position
    );
    out += &format!("pixel_indexer_head_position {}\n", stats.head_position);
    out += &format!("pixel_indexer_sync_gaps {}\n", stats.sync_gaps.len());
    out += &format!(
        "pixel_indexer_backfill_progress_ratio {}\n",
        stats.backfill_progress_ratio
    );
    out += &METRICS.to_prometheus();

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        out,
    )
}
