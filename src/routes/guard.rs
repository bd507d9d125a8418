//! Middleware that refuses new requests once the recoverable-error rate has
//! tripped `Master`'s shutdown threshold.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

pub async fn error_threshold_guard(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if state.master().is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "too many recoverable errors, draining",
        )
            .into_response();
    }
    let response = next.run(req).await;
    if response.status().is_server_error() {
        state.master().note_error();
    }
    response
}
