//! Prometheus metrics endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics))
}

/// Metrics in Prometheus text exposition format.
async fn metrics(State(state): State<AppState>) -> Response {
    let stats = state.master().stats().await;
    let metrics = state.metrics();
    metrics.set_tier_gauges("memory", stats.memory.size_used, stats.memory.count as u64);
    metrics.set_tier_gauges(
        "local_file",
        stats.local_file.size_used,
        stats.local_file.count as u64,
    );
    metrics.set_tier_gauges(
        "remote_cache",
        stats.remote_cache.size_used,
        stats.remote_cache.count as u64,
    );
    metrics.set_tier_gauges(
        "remote_store",
        stats.remote_store.size_used,
        stats.remote_store.count as u64,
    );

    let output = metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
        .into_response()
}
