use serde::Serialize;
use slackline_common::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Why a session finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The canonical reply lost its typing marker or hit a stop string.
    Completed,
    /// The agent attached a file mid-reply.
    Truncated,
    /// The canonical reply stopped updating.
    Stalled,
    /// Every delivery attempt failed to produce a usable reply.
    RetriesExhausted,
    /// The real-time connection went away.
    FeedClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub reason: FinishReason,
    /// Candidate replies discarded on the way.
    pub candidates_discarded: usize,
}

#[derive(Debug)]
pub enum SessionOutput {
    Delta(String),
    Done(Completion),
    Failed(Error),
}

/// Writes a session's output to whoever is consuming it.
///
/// In stream mode every non-empty delta is forwarded; otherwise only the
/// final completion is. A consumer that went away is not an error.
#[derive(Debug, Clone)]
pub struct OutputEmitter {
    tx: mpsc::Sender<SessionOutput>,
    stream_mode: bool,
}

impl OutputEmitter {
    pub fn new(tx: mpsc::Sender<SessionOutput>, stream_mode: bool) -> Self {
        Self { tx, stream_mode }
    }

    pub fn stream_mode(&self) -> bool {
        self.stream_mode
    }

    pub async fn delta(&self, text: String) {
        if !self.stream_mode || text.is_empty() {
            return;
        }
        self.send(SessionOutput::Delta(text)).await;
    }

    pub async fn done(&self, completion: Completion) {
        self.send(SessionOutput::Done(completion)).await;
    }

    pub async fn fail(&self, error: Error) {
        self.send(SessionOutput::Failed(error)).await;
    }

    /// Resolves once the consumer dropped its receiver.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, output: SessionOutput) {
        if self.tx.send(output).await.is_err() {
            debug!("session output dropped, client already disconnected");
        }
    }
}

/// One `chat.completion.chunk` frame of an event stream.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkFrame<'a> {
    pub id: &'a str,
    pub object: &'static str,
    pub created: i64,
    pub model: &'a str,
    pub choices: [ChunkChoice<'a>; 1],
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice<'a> {
    pub index: u32,
    pub delta: ChunkDelta<'a>,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkDelta<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<&'a str>,
}

impl<'a> ChunkFrame<'a> {
    pub fn content(id: &'a str, model: &'a str, created: i64, content: &'a str) -> Self {
        Self::with(id, model, created, Some(content), None)
    }

    /// Empty delta carrying the finish reason, sent before `[DONE]`.
    pub fn stop(id: &'a str, model: &'a str, created: i64) -> Self {
        Self::with(id, model, created, None, Some("stop"))
    }

    fn with(
        id: &'a str,
        model: &'a str,
        created: i64,
        content: Option<&'a str>,
        finish_reason: Option<&'static str>,
    ) -> Self {
        Self {
            id,
            object: "chat.completion.chunk",
            created,
            model,
            choices: [ChunkChoice {
                index: 0,
                delta: ChunkDelta { content },
                finish_reason,
            }],
        }
    }
}

/// A full `chat.completion` body.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionFrame<'a> {
    pub id: &'a str,
    pub object: &'static str,
    pub created: i64,
    pub model: &'a str,
    pub choices: [CompletionChoice<'a>; 1],
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionChoice<'a> {
    pub index: u32,
    pub message: AssistantMessage<'a>,
    pub finish_reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantMessage<'a> {
    pub role: &'static str,
    pub content: &'a str,
}

impl<'a> CompletionFrame<'a> {
    pub fn new(id: &'a str, model: &'a str, created: i64, content: &'a str) -> Self {
        Self {
            id,
            object: "chat.completion",
            created,
            model,
            choices: [CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant",
                    content,
                },
                finish_reason: "stop",
            }],
        }
    }
}

/// Terminal frame of an event stream.
pub const DONE_FRAME: &str = "[DONE]";
