use std::convert::Infallible;

use axum::Json;
use axum::body::Bytes;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use slackline_bridge::{
    ChunkFrame, CompletionFrame, CompletionRequest, DONE_FRAME, SessionHandle, SessionOutput,
};
use slackline_common::{Error, PromptMessage};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};

use crate::state::SharedState;

/// Body of `POST .../chat/completions`. Unknown fields (temperature, max_tokens,
/// ...) are accepted and ignored since the agent decides on its own.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionBody {
    #[serde(default)]
    pub messages: Option<Vec<PromptMessage>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub model: Option<String>,
}

/// OpenAI-style error body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", message)
    }

    fn body(&self) -> serde_json::Value {
        json!({
            "error": {
                "message": self.message,
                "type": self.kind,
                "code": self.status.as_u16(),
            }
        })
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match e {
            Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e.kind(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

/// Validate the body, start a session and answer with either an event
/// stream or a single completion.
pub async fn chat_completions(state: SharedState, body: Bytes) -> Response {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("rejecting completion request: {}", e.message);
            return e.into_response();
        }
    };

    let handle = state.bridge.start(request);
    let model = state.config.model_name.clone();
    if handle.stream {
        stream_completion(handle, model).into_response()
    } else {
        complete(handle, &model).await
    }
}

fn parse_request(body: &[u8]) -> Result<CompletionRequest, ApiError> {
    let body: ChatCompletionBody = serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(format!("invalid request body: {e}")))?;
    let messages = body
        .messages
        .filter(|messages| !messages.is_empty())
        .ok_or_else(|| ApiError::bad_request("`messages` must be a non-empty array"))?;
    if let Some(model) = &body.model {
        info!("completion requested for model {model}");
    }
    Ok(CompletionRequest {
        messages,
        stream: body.stream,
    })
}

async fn complete(handle: SessionHandle, model: &str) -> Response {
    let id = handle.id.clone();
    match handle.into_completion().await {
        Ok(completion) => {
            info!(
                "completion {id} finished ({:?}), {} chars",
                completion.reason,
                completion.text.chars().count()
            );
            let created = chrono::Utc::now().timestamp();
            Json(CompletionFrame::new(&id, model, created, &completion.text)).into_response()
        }
        Err(e) => {
            error!("completion {id} failed: {e}");
            ApiError::from(e).into_response()
        }
    }
}

/// Render session output as `chat.completion.chunk` events. Dropping the
/// response (client gone) drops the receiver, which ends the session.
fn stream_completion(
    handle: SessionHandle,
    model: String,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let id = handle.id;
    let created = chrono::Utc::now().timestamp();
    let events = ReceiverStream::new(handle.output)
        .flat_map(move |output| futures::stream::iter(render(&id, &model, created, output)))
        .map(Ok::<Event, Infallible>);
    Sse::new(events).keep_alive(KeepAlive::default())
}

fn render(id: &str, model: &str, created: i64, output: SessionOutput) -> Vec<Event> {
    match output {
        SessionOutput::Delta(text) => vec![json_event(&ChunkFrame::content(
            id, model, created, &text,
        ))],
        SessionOutput::Done(completion) => {
            info!(
                "stream {id} finished ({:?}), {} chars",
                completion.reason,
                completion.text.chars().count()
            );
            vec![
                json_event(&ChunkFrame::stop(id, model, created)),
                Event::default().data(DONE_FRAME),
            ]
        }
        SessionOutput::Failed(e) => {
            error!("stream {id} failed: {e}");
            vec![
                json_event(&ApiError::from(e).body()),
                Event::default().data(DONE_FRAME),
            ]
        }
    }
}

fn json_event<T: Serialize>(frame: &T) -> Event {
    Event::default().json_data(frame).unwrap_or_else(|e| {
        warn!("failed to encode stream frame: {e}");
        Event::default().comment("encode error")
    })
}
