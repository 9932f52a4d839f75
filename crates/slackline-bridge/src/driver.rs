use std::collections::VecDeque;
use std::sync::Arc;

use slackline_channels::{AgentPing, DeliveryAdapter, PlatformEvent};
use slackline_common::{Error, Result};
use slackline_config::BridgeConfig;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{error, info, warn};

use crate::emitter::OutputEmitter;
use crate::session::{Effect, Session};

/// Runs one session to completion on a single task.
///
/// Platform events, timer expiries and client disconnects all arrive through
/// one `select!` loop, so the session is only ever touched from here.
pub struct SessionDriver {
    session: Session,
    config: Arc<BridgeConfig>,
    delivery: Arc<dyn DeliveryAdapter>,
    events: broadcast::Receiver<PlatformEvent>,
    emitter: OutputEmitter,
    prompt_chunks: Vec<String>,
}

impl SessionDriver {
    pub fn new(
        session: Session,
        config: Arc<BridgeConfig>,
        delivery: Arc<dyn DeliveryAdapter>,
        events: broadcast::Receiver<PlatformEvent>,
        emitter: OutputEmitter,
        prompt_chunks: Vec<String>,
    ) -> Self {
        Self {
            session,
            config,
            delivery,
            events,
            emitter,
            prompt_chunks,
        }
    }

    pub async fn run(mut self) {
        let mut pending: VecDeque<Effect> = VecDeque::new();
        if let Err(e) = self.deliver(&mut pending).await {
            return self.fail(e).await;
        }

        loop {
            while let Some(effect) = pending.pop_front() {
                match effect {
                    Effect::Delta(text) => self.emitter.delta(text).await,
                    Effect::ReissueEditPing => {
                        if let Err(e) = self.reissue_edit_ping(&mut pending).await {
                            return self.fail(e).await;
                        }
                    }
                    Effect::Redeliver { attempt } => {
                        info!("redelivering prompt (attempt {attempt})");
                        if let Err(e) = self.deliver(&mut pending).await {
                            return self.fail(e).await;
                        }
                    }
                    Effect::Finish(reason) => {
                        let completion = self.session.completion(reason);
                        self.emitter.done(completion).await;
                        return;
                    }
                }
            }

            if self.session.is_finalized() {
                return;
            }

            let deadline = self.session.next_deadline();
            tokio::select! {
                biased;

                _ = self.emitter.closed() => {
                    info!("client disconnected, abandoning session");
                    return;
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    for kind in self.session.take_due_timers(Instant::now()) {
                        pending.extend(self.session.on_timer(kind));
                    }
                }
                received = self.events.recv() => match received {
                    Ok(event) => pending.extend(self.session.on_event(&event, Instant::now())),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("session fell behind the event feed, skipped {skipped} event(s)");
                    }
                    Err(RecvError::Closed) => {
                        warn!("event feed closed");
                        pending.extend(self.session.on_feed_closed());
                    }
                },
            }
        }
    }

    async fn fail(self, e: Error) {
        error!("session failed: {e}");
        self.emitter.fail(e).await;
    }

    /// Post the prompt and ping the agent. Retryable failures go through the
    /// session's retry path; fatal ones are returned.
    async fn deliver(&mut self, pending: &mut VecDeque<Effect>) -> Result<()> {
        match self.deliver_attempt(pending).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("delivery failed: {e}");
                pending.extend(self.session.on_delivery_error());
                Ok(())
            }
        }
    }

    async fn deliver_attempt(&mut self, pending: &mut VecDeque<Effect>) -> Result<()> {
        let first = self.prompt_chunks.first().cloned().unwrap_or_default();
        let root = self.delivery.post_root(&first).await?;
        info!("created thread {root}");
        self.session.begin_attempt(root.clone());

        for (i, chunk) in self.prompt_chunks.iter().enumerate().skip(1) {
            self.delivery.post_reply(chunk, &root).await?;
            info!("posted reply {i}/{} on thread {root}", self.prompt_chunks.len() - 1);
        }

        self.session.prompt_delivered(Instant::now());

        if !self.config.edit_trigger {
            self.delivery
                .ping_agent(AgentPing::Reply { root: &root })
                .await?;
            self.session.trigger_sent();
            return Ok(());
        }

        sleep(self.config.delay_before_edit()).await;
        for i in 0..self.config.multi_response {
            self.delivery
                .ping_agent(AgentPing::Edit {
                    target: &root,
                    original: &first,
                })
                .await?;
            self.session.trigger_sent();
            info!("pinged agent ({}/{})", i + 1, self.config.multi_response);

            sleep(self.config.multi_response_delay()).await;
            let interrupted = self.drain_buffered(pending);
            if interrupted || self.session.canonical().is_some() {
                break;
            }
        }
        Ok(())
    }

    async fn reissue_edit_ping(&mut self, pending: &mut VecDeque<Effect>) -> Result<()> {
        let Some(root) = self.session.thread_root().cloned() else {
            return Ok(());
        };
        let first = self.prompt_chunks.first().cloned().unwrap_or_default();
        let ping = AgentPing::Edit {
            target: &root,
            original: &first,
        };
        match self.delivery.ping_agent(ping).await {
            Ok(_) => {
                info!("re-pinged agent on {root}");
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("edit retry ping failed: {e}");
                pending.extend(self.session.on_delivery_error());
                Ok(())
            }
        }
    }

    /// Feed events that arrived while we were busy delivering. Returns true
    /// when one of them changed the session's course (retry or finish).
    fn drain_buffered(&mut self, pending: &mut VecDeque<Effect>) -> bool {
        let mut interrupted = false;
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    let effects = self.session.on_event(&event, Instant::now());
                    interrupted |= effects
                        .iter()
                        .any(|e| matches!(e, Effect::Redeliver { .. } | Effect::Finish(_)));
                    pending.extend(effects);
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("session fell behind the event feed, skipped {skipped} event(s)");
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => {
                    pending.extend(self.session.on_feed_closed());
                    return true;
                }
            }
        }
        interrupted
    }
}
