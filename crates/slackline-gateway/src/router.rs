use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::completions::{self, ApiError};
use crate::state::SharedState;

/// Build the application router.
///
/// Clients put the API under arbitrary prefixes (`/v1`, `/api/v1`, ...), so
/// any path whose last segments are `models` or `chat/completions` is served.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/{*path}", get(get_any).post(post_any))
        .fallback(not_found)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn get_any(State(state): State<SharedState>, Path(path): Path<String>) -> Response {
    if ends_with_segments(&path, "models") {
        return list_models(&state).into_response();
    }
    not_found().await
}

async fn post_any(
    State(state): State<SharedState>,
    Path(path): Path<String>,
    body: Bytes,
) -> Response {
    if ends_with_segments(&path, "chat/completions") {
        return completions::chat_completions(state, body).await;
    }
    not_found().await
}

/// Whether the last path segments of `path` are exactly `suffix`.
fn ends_with_segments(path: &str, suffix: &str) -> bool {
    let path = path.trim_matches('/');
    path == suffix
        || path
            .strip_suffix(suffix)
            .is_some_and(|prefix| prefix.ends_with('/'))
}

async fn not_found() -> Response {
    ApiError::new(StatusCode::NOT_FOUND, "not_found", "no such route").into_response()
}

/// Static single-model listing. Clients only use it to check that the API is
/// reachable.
fn list_models(state: &SharedState) -> axum::Json<serde_json::Value> {
    let model = &state.config.model_name;
    axum::Json(json!({
        "object": "list",
        "data": [{
            "id": model,
            "object": "model",
            "created": chrono::Utc::now().timestamp(),
            "owned_by": "slackline",
            "permission": [],
            "root": model,
            "parent": null,
        }]
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_matches_whole_segments_only() {
        assert!(ends_with_segments("models", "models"));
        assert!(ends_with_segments("v1/models", "models"));
        assert!(ends_with_segments("api/v1/models/", "models"));
        assert!(!ends_with_segments("v1/foomodels", "models"));

        assert!(ends_with_segments("v1/chat/completions", "chat/completions"));
        assert!(ends_with_segments("chat/completions", "chat/completions"));
        assert!(!ends_with_segments("v1/xchat/completions", "chat/completions"));
        assert!(!ends_with_segments("v1/completions", "chat/completions"));
    }
}
