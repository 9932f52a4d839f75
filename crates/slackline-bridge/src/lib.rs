pub mod chunker;
pub mod classifier;
pub mod differ;
pub mod driver;
pub mod emitter;
pub mod filter;
pub mod reconciler;
pub mod session;
pub mod timers;

use std::sync::Arc;

use slackline_channels::{DeliveryAdapter, EventFeed};
use slackline_common::{Error, PromptMessage, Result};
use slackline_config::BridgeConfig;
use tokio::sync::mpsc;
use tracing::{Instrument, info, info_span};

pub use chunker::{ChunkerConfig, build_prompt_chunks};
pub use driver::SessionDriver;
pub use emitter::{
    ChunkFrame, Completion, CompletionFrame, DONE_FRAME, FinishReason, OutputEmitter,
    SessionOutput,
};
pub use filter::ContentFilter;
pub use session::{Effect, Session, SessionState};
pub use timers::{TimeoutLadder, TimerKind};

/// Output buffered per session before the driver waits on the client.
const OUTPUT_BUFFER: usize = 64;

/// One chat-completion request, already validated by the caller.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<PromptMessage>,
    pub stream: bool,
}

/// Client side of a running session.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: String,
    pub stream: bool,
    pub output: mpsc::Receiver<SessionOutput>,
}

impl SessionHandle {
    /// Wait for the final completion, ignoring deltas.
    pub async fn into_completion(mut self) -> Result<Completion> {
        while let Some(output) = self.output.recv().await {
            match output {
                SessionOutput::Delta(_) => {}
                SessionOutput::Done(completion) => return Ok(completion),
                SessionOutput::Failed(e) => return Err(e),
            }
        }
        Err(Error::Bridge("session ended without a completion".into()))
    }
}

/// Session factory. Built once at startup and shared by every request.
#[derive(Clone)]
pub struct Bridge {
    config: Arc<BridgeConfig>,
    filter: Arc<ContentFilter>,
    chunker: Arc<ChunkerConfig>,
    delivery: Arc<dyn DeliveryAdapter>,
    feed: Arc<dyn EventFeed>,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        delivery: Arc<dyn DeliveryAdapter>,
        feed: Arc<dyn EventFeed>,
    ) -> Result<Self> {
        let filter = ContentFilter::new(&config)?;
        let chunker = ChunkerConfig::from(&config);
        Ok(Self {
            config: Arc::new(config),
            filter: Arc::new(filter),
            chunker: Arc::new(chunker),
            delivery,
            feed,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn feed(&self) -> &Arc<dyn EventFeed> {
        &self.feed
    }

    /// Chunk the prompt, subscribe to the feed and spawn the session driver.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, request: CompletionRequest) -> SessionHandle {
        let id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
        let chunks = build_prompt_chunks(&request.messages, &self.chunker);
        info!(
            "starting session {id}: {} message(s) in {} chunk(s), stream={}",
            request.messages.len(),
            chunks.len(),
            request.stream
        );

        // Subscribe before anything is posted so no reply can be missed.
        let events = self.feed.subscribe();
        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        let session = Session::new(
            Arc::clone(&self.config),
            Arc::clone(&self.filter),
            request.stream,
        );
        let driver = SessionDriver::new(
            session,
            Arc::clone(&self.config),
            Arc::clone(&self.delivery),
            events,
            OutputEmitter::new(tx, request.stream),
            chunks,
        );
        tokio::spawn(driver.run().instrument(info_span!("session", id = %id)));

        SessionHandle {
            id,
            stream: request.stream,
            output: rx,
        }
    }
}
