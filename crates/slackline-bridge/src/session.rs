//! Per-request state machine.
//!
//! A [`Session`] never performs I/O. The driver feeds it delivery progress,
//! platform events and expired timers, and carries out the [`Effect`]s it
//! returns. Keeping it synchronous means every transition can be tested
//! without a runtime.

use std::sync::Arc;

use slackline_channels::PlatformEvent;
use slackline_common::MessageId;
use slackline_config::BridgeConfig;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::classifier::{ClassifierConfig, SessionView, Verdict, classify};
use crate::differ::{StreamDiffer, crop_at_stop_strings, strip_typing_marker};
use crate::emitter::{Completion, FinishReason};
use crate::filter::ContentFilter;
use crate::reconciler::Reconciler;
use crate::timers::{TimeoutLadder, TimerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The prompt is being (re)delivered and the agent not yet pinged.
    AwaitingTrigger,
    /// The agent was pinged; replies are tracked but none is canonical.
    CollectingCandidates,
    /// One reply was chosen; only its edits matter now.
    CanonicalCommitted,
    Finalized,
}

/// Work the driver has to carry out on the session's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// New text for the client.
    Delta(String),
    /// Edit the thread root again so the agent produces another reply.
    ReissueEditPing,
    /// Deliver the whole prompt again in a new thread.
    Redeliver { attempt: u32 },
    /// Send the accumulated text and stop.
    Finish(FinishReason),
}

pub struct Session {
    config: Arc<BridgeConfig>,
    filter: Arc<ContentFilter>,
    classifier: ClassifierConfig,
    stream_mode: bool,
    state: SessionState,

    thread_root: Option<MessageId>,
    known_threads: Vec<MessageId>,
    reconciler: Reconciler,
    differ: StreamDiffer,

    retry_attempts: u32,
    edit_retry_budget: u32,
    rejected_this_attempt: u32,
    ladder: TimeoutLadder,
}

impl Session {
    pub fn new(config: Arc<BridgeConfig>, filter: Arc<ContentFilter>, stream_mode: bool) -> Self {
        let classifier = ClassifierConfig::from(config.as_ref());
        let edit_retry_budget = config.edit_retry_count;
        Self {
            config,
            filter,
            classifier,
            stream_mode,
            state: SessionState::AwaitingTrigger,
            thread_root: None,
            known_threads: Vec::new(),
            reconciler: Reconciler::new(),
            differ: StreamDiffer::new(),
            retry_attempts: 0,
            edit_retry_budget,
            rejected_this_attempt: 0,
            ladder: TimeoutLadder::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stream_mode(&self) -> bool {
        self.stream_mode
    }

    pub fn is_finalized(&self) -> bool {
        self.state == SessionState::Finalized
    }

    pub fn thread_root(&self) -> Option<&MessageId> {
        self.thread_root.as_ref()
    }

    pub fn known_threads(&self) -> &[MessageId] {
        &self.known_threads
    }

    pub fn canonical(&self) -> Option<&MessageId> {
        self.reconciler.canonical()
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn text(&self) -> &str {
        self.differ.text()
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn edit_retry_budget(&self) -> u32 {
        self.edit_retry_budget
    }

    pub fn ladder(&self) -> &TimeoutLadder {
        &self.ladder
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        if self.is_finalized() {
            return None;
        }
        self.ladder.next_deadline()
    }

    /// Disarm and return the timers that expired by `now`.
    pub fn take_due_timers(&mut self, now: Instant) -> Vec<TimerKind> {
        if self.is_finalized() {
            return Vec::new();
        }
        self.ladder.take_due(now)
    }

    /// The completion to hand to the client once finalized.
    pub fn completion(&self, reason: FinishReason) -> Completion {
        Completion {
            text: self.differ.text().to_string(),
            reason,
            candidates_discarded: self.reconciler.total_candidates_seen(),
        }
    }

    /// A new thread root was posted for this delivery attempt.
    pub fn begin_attempt(&mut self, root: MessageId) {
        if !self.known_threads.contains(&root) {
            self.known_threads.push(root.clone());
        }
        self.thread_root = Some(root);
        self.state = SessionState::AwaitingTrigger;
        self.reconciler.reset_candidates();
        self.differ.reset();
        self.edit_retry_budget = self.config.edit_retry_count;
        self.rejected_this_attempt = 0;
    }

    /// Every prompt chunk is posted; start waiting for a first reply.
    pub fn prompt_delivered(&mut self, now: Instant) {
        self.ladder
            .arm(TimerKind::InitialResponse, now, self.config.reply_timeout());
    }

    /// The agent was mentioned at least once.
    pub fn trigger_sent(&mut self) {
        if self.state == SessionState::AwaitingTrigger {
            self.state = SessionState::CollectingCandidates;
        }
    }

    pub fn on_event(&mut self, event: &PlatformEvent, now: Instant) -> Vec<Effect> {
        if self.is_finalized() {
            return Vec::new();
        }

        let verdict = classify(event, &self.view(), &self.classifier);
        match verdict {
            Verdict::Ignore(reason) => {
                debug!("ignoring event {:?}: {reason:?}", event.ts);
                Vec::new()
            }
            Verdict::Truncate => {
                warn!("agent attached a file mid-reply, finishing with partial text");
                self.finish(FinishReason::Truncated)
            }
            Verdict::Accept => match event.message_view() {
                Some(message) => {
                    let id = message.id();
                    let text = message.text.to_string();
                    self.on_reply_edit(id, &text, now)
                }
                None => Vec::new(),
            },
        }
    }

    pub fn on_timer(&mut self, kind: TimerKind) -> Vec<Effect> {
        if self.is_finalized() {
            return Vec::new();
        }
        match kind {
            TimerKind::InitialResponse => {
                warn!("no reply within {:?}", self.config.reply_timeout());
                self.retry()
            }
            TimerKind::MultiReplySettle => {
                warn!("remaining reply slots produced nothing usable");
                self.retry()
            }
            TimerKind::UpdateLiveness if self.canonical().is_some() => {
                info!("reply stopped updating, finishing with accumulated text");
                self.finish(FinishReason::Stalled)
            }
            TimerKind::UpdateLiveness => {
                warn!("candidate replies stopped updating before one was chosen");
                self.retry()
            }
        }
    }

    /// A post or edit failed with a retryable error.
    pub fn on_delivery_error(&mut self) -> Vec<Effect> {
        if self.is_finalized() {
            return Vec::new();
        }
        self.retry()
    }

    /// The real-time feed is gone; nothing more will arrive.
    pub fn on_feed_closed(&mut self) -> Vec<Effect> {
        if self.is_finalized() {
            return Vec::new();
        }
        self.finish(FinishReason::FeedClosed)
    }

    fn view(&self) -> SessionView<'_> {
        SessionView {
            known_threads: &self.known_threads,
            active_root: self.thread_root.as_ref(),
            rejected: self.reconciler.rejected(),
            canonical: self.reconciler.canonical(),
            accumulated: self.differ.text(),
        }
    }

    fn on_reply_edit(&mut self, id: MessageId, raw: &str, now: Instant) -> Vec<Effect> {
        self.ladder.cancel(TimerKind::InitialResponse);
        self.ladder
            .arm(TimerKind::UpdateLiveness, now, self.config.reply_update_timeout());
        if self.state == SessionState::AwaitingTrigger {
            self.state = SessionState::CollectingCandidates;
        }

        let (text, typing) = strip_typing_marker(raw);
        let (text, cropped) = crop_at_stop_strings(text, &self.config.stop_strings);
        if cropped {
            warn!("reply {id} hit a stop string, treating it as finished");
        }
        let is_final = !typing || cropped;

        if self.canonical().is_none() {
            if self.reconciler.observe(&id) {
                debug!("new candidate reply {id}");
            }
            if self.filter.in_prebuffer(text) {
                if self.filter.should_reject(text, is_final) {
                    return self.reject(id, text, now);
                }
                if !is_final {
                    return Vec::new();
                }
            }

            let edits = self.reconciler.record_edit(&id);
            if !self
                .reconciler
                .should_commit(&id, is_final, self.config.multi_response)
            {
                return Vec::new();
            }
            let discarded = self.reconciler.commit(&id);
            self.ladder.cancel(TimerKind::MultiReplySettle);
            self.state = SessionState::CanonicalCommitted;
            info!(
                "committed reply {id} after {edits} edit(s), discarded {discarded} other candidate(s)"
            );
        } else {
            self.reconciler.record_edit(&id);
        }

        let mut effects = Vec::new();
        if self.stream_mode {
            match self.differ.advance(text) {
                Some(delta) => effects.push(Effect::Delta(delta)),
                None if text != self.differ.text() => {
                    debug!("dropping out-of-order edit of {id}");
                }
                None => {}
            }
        } else {
            self.differ.replace(text);
        }

        if is_final {
            effects.extend(self.finish(FinishReason::Completed));
        }
        effects
    }

    fn reject(&mut self, id: MessageId, text: &str, now: Instant) -> Vec<Effect> {
        let preview: String = text.chars().take(33).collect();
        warn!("filtered reply {id}: {:?}", preview.trim());
        self.reconciler.reject(&id);
        self.rejected_this_attempt += 1;

        if self.config.edit_trigger && self.edit_retry_budget > 0 {
            self.edit_retry_budget -= 1;
            info!("asking for another reply, {} edit retries left", self.edit_retry_budget);
            return vec![Effect::ReissueEditPing];
        }

        let replies_left = self
            .config
            .replies_per_request()
            .saturating_sub(self.rejected_this_attempt);
        info!(
            "{}/{} replies rejected this attempt",
            self.rejected_this_attempt,
            self.config.replies_per_request()
        );
        if replies_left == 0 {
            return self.retry();
        }

        self.ladder.cancel(TimerKind::InitialResponse);
        let settle = self.config.reply_multi_timeout() * replies_left;
        if self.ladder.arm(TimerKind::MultiReplySettle, now, settle) {
            self.ladder.cancel(TimerKind::UpdateLiveness);
        }
        Vec::new()
    }

    fn retry(&mut self) -> Vec<Effect> {
        self.ladder.cancel_all();
        if self.canonical().is_some() {
            return self.finish(FinishReason::Completed);
        }
        self.retry_attempts += 1;
        if self.retry_attempts <= self.config.retry_count {
            info!(
                "retrying delivery (attempt {}/{})",
                self.retry_attempts, self.config.retry_count
            );
            self.state = SessionState::AwaitingTrigger;
            return vec![Effect::Redeliver {
                attempt: self.retry_attempts,
            }];
        }
        warn!("retries exhausted, finishing with partial text");
        self.finish(FinishReason::RetriesExhausted)
    }

    fn finish(&mut self, reason: FinishReason) -> Vec<Effect> {
        self.ladder.cancel_all();
        self.state = SessionState::Finalized;
        info!(
            "session finished ({reason:?}): {} chars, {} candidate(s) discarded",
            self.differ.text().chars().count(),
            self.reconciler.total_candidates_seen()
        );
        vec![Effect::Finish(reason)]
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::differ::TYPING_MARKER;

    const AGENT: &str = "U_AGENT";
    const ROOT: &str = "1700.000";

    fn config() -> BridgeConfig {
        BridgeConfig {
            agent_user: AGENT.to_string(),
            prebuffer_length: 0,
            blacklist: vec!["harmful".into(), "guidelines?".into(), "unethical".into()],
            blacklist_threshold: 2,
            ..BridgeConfig::default()
        }
    }

    fn session_with(config: BridgeConfig, stream: bool) -> Session {
        let filter = ContentFilter::new(&config).unwrap();
        let mut session = Session::new(Arc::new(config), Arc::new(filter), stream);
        session.begin_attempt(MessageId::from(ROOT));
        session.prompt_delivered(Instant::now());
        session.trigger_sent();
        session
    }

    fn typing(text: &str) -> String {
        format!("{text}{TYPING_MARKER}")
    }

    fn edit(ts: &str, text: &str) -> PlatformEvent {
        PlatformEvent::edit(AGENT, ts, ROOT, text)
    }

    fn deltas(effects: &[Effect]) -> Vec<&str> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Delta(d) => Some(d.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn hello_world_streams_suffix_then_finishes() {
        let mut s = session_with(config(), true);
        let now = Instant::now();

        let first = s.on_event(&edit("1700.100", &typing("Hello")), now);
        assert_eq!(first, vec![Effect::Delta("Hello".into())]);
        assert_eq!(s.state(), SessionState::CanonicalCommitted);

        let second = s.on_event(&edit("1700.100", "Hello world"), now);
        assert_eq!(deltas(&second), vec![" world"]);
        assert_eq!(second.last(), Some(&Effect::Finish(FinishReason::Completed)));
        assert!(s.is_finalized());
        assert_eq!(s.text(), "Hello world");
    }

    #[test]
    fn hello_world_non_stream_returns_full_text() {
        let mut s = session_with(config(), false);
        let now = Instant::now();

        assert!(s.on_event(&edit("1700.100", &typing("Hello")), now).is_empty());
        let effects = s.on_event(&edit("1700.100", "Hello world"), now);
        assert_eq!(effects, vec![Effect::Finish(FinishReason::Completed)]);
        assert_eq!(s.completion(FinishReason::Completed).text, "Hello world");
    }

    #[test]
    fn first_accepted_event_cancels_initial_timer() {
        let mut s = session_with(config(), true);
        assert!(s.ladder().is_armed(TimerKind::InitialResponse));
        assert_eq!(s.ladder().arm_count(TimerKind::InitialResponse), 1);

        s.on_event(&edit("1700.100", &typing("Hi")), Instant::now());
        assert!(!s.ladder().is_armed(TimerKind::InitialResponse));
        assert!(s.ladder().is_armed(TimerKind::UpdateLiveness));
    }

    #[test]
    fn ignored_events_leave_timers_alone() {
        let mut s = session_with(config(), true);
        let foreign = PlatformEvent::edit("U_OTHER", "1700.100", ROOT, "hi");
        assert!(s.on_event(&foreign, Instant::now()).is_empty());
        assert!(s.ladder().is_armed(TimerKind::InitialResponse));
        assert_eq!(s.state(), SessionState::CollectingCandidates);
    }

    #[test]
    fn canonical_is_immutable_and_others_are_silent() {
        let mut s = session_with(config(), true);
        let now = Instant::now();
        s.on_event(&edit("1700.100", &typing("Mine")), now);
        let canonical = s.canonical().cloned();

        let other = s.on_event(&edit("1700.050", "Earlier but late"), now);
        assert!(other.is_empty());
        assert_eq!(s.canonical().cloned(), canonical);
        assert_eq!(s.text(), "Mine");
    }

    #[test]
    fn out_of_order_edit_is_dropped() {
        let mut s = session_with(config(), true);
        let now = Instant::now();
        s.on_event(&edit("1700.100", &typing("Hello world")), now);
        let effects = s.on_event(&edit("1700.100", &typing("Hello")), now);
        assert!(effects.is_empty());
        assert_eq!(s.text(), "Hello world");
    }

    #[test]
    fn multi_reply_prefers_lowest_id() {
        let mut cfg = config();
        cfg.multi_response = 2;
        let mut s = session_with(cfg, true);
        let now = Instant::now();
        let a = "1700.001";
        let b = "1700.002";

        let mut text = String::from("x");
        let mut step = |s: &mut Session, ts: &str| {
            text.push('x');
            s.on_event(&edit(ts, &typing(&text)), now)
        };

        for ts in [b, b, a, b, b] {
            assert!(step(&mut s, ts).is_empty(), "nothing commits yet");
        }
        assert!(s.canonical().is_none());
        for _ in 0..2 {
            assert!(step(&mut s, a).is_empty());
        }
        let effects = step(&mut s, a);
        assert_eq!(deltas(&effects).len(), 1);
        assert_eq!(s.canonical(), Some(&MessageId::from(a)));
        assert!(s.reconciler().is_rejected(&MessageId::from(b)));
        assert_eq!(s.reconciler().total_candidates_seen(), 1);
    }

    #[test]
    fn typing_candidates_are_held_inside_prebuffer() {
        let mut cfg = config();
        cfg.prebuffer_length = 200;
        let mut s = session_with(cfg, true);
        let now = Instant::now();

        assert!(s.on_event(&edit("1700.100", &typing("Hello")), now).is_empty());
        assert!(s.canonical().is_none());

        let effects = s.on_event(&edit("1700.100", "Hello world"), now);
        assert_eq!(deltas(&effects), vec!["Hello world"]);
        assert!(s.is_finalized());
    }

    #[test]
    fn blacklisted_reply_uses_edit_retry_budget_first() {
        let mut cfg = config();
        cfg.prebuffer_length = 200;
        cfg.edit_retry_count = 1;
        let mut s = session_with(cfg, true);
        let now = Instant::now();

        let refusal = "That is harmful, unethical and against my guidelines.";
        let effects = s.on_event(&edit("1700.100", refusal), now);
        assert_eq!(effects, vec![Effect::ReissueEditPing]);
        assert_eq!(s.edit_retry_budget(), 0);
        assert!(s.reconciler().is_rejected(&MessageId::from("1700.100")));
        assert!(!s.ladder().is_armed(TimerKind::MultiReplySettle));

        // Budget spent and both reply slots used up: start over.
        let effects = s.on_event(&edit("1700.200", refusal), now);
        assert_eq!(effects, vec![Effect::Redeliver { attempt: 1 }]);
    }

    #[test]
    fn blacklisted_reply_arms_settle_timer_without_budget() {
        let mut cfg = config();
        cfg.prebuffer_length = 200;
        cfg.multi_response = 3;
        let mut s = session_with(cfg, true);
        let now = Instant::now();

        let effects = s.on_event(
            &edit("1700.100", &typing("harmful and unethical")),
            now,
        );
        assert!(effects.is_empty());
        assert!(s.ladder().is_armed(TimerKind::MultiReplySettle));
        assert_eq!(
            s.ladder().deadline(TimerKind::MultiReplySettle),
            Some(now + Duration::from_millis(6_000) * 2)
        );
        assert!(!s.ladder().is_armed(TimerKind::UpdateLiveness));
    }

    #[test]
    fn short_final_reply_is_filtered() {
        let mut cfg = config();
        cfg.prebuffer_length = 200;
        cfg.min_length = 20;
        let mut s = session_with(cfg, false);
        let effects = s.on_event(&edit("1700.100", "Too short."), Instant::now());
        assert_eq!(effects, vec![Effect::Redeliver { attempt: 1 }]);
        assert_eq!(s.state(), SessionState::AwaitingTrigger);
    }

    #[test]
    fn stop_string_forces_final_and_crops() {
        let mut s = session_with(config(), true);
        let effects = s.on_event(
            &edit("1700.100", &typing("Done here.\nHuman: keep going")),
            Instant::now(),
        );
        assert_eq!(deltas(&effects), vec!["Done here."]);
        assert!(s.is_finalized());
    }

    #[test]
    fn file_share_after_text_truncates() {
        let mut s = session_with(config(), true);
        let now = Instant::now();
        s.on_event(&edit("1700.100", &typing("Partial")), now);

        let file = PlatformEvent {
            event_type: "message".into(),
            subtype: Some("file_share".into()),
            user: Some(AGENT.into()),
            ts: Some("1700.200".into()),
            thread_ts: Some(ROOT.into()),
            ..PlatformEvent::default()
        };
        let effects = s.on_event(&file, now);
        assert_eq!(effects, vec![Effect::Finish(FinishReason::Truncated)]);
        assert_eq!(s.text(), "Partial");
    }

    #[test]
    fn liveness_finishes_when_canonical_exists() {
        let mut s = session_with(config(), true);
        let now = Instant::now();
        s.on_event(&edit("1700.100", &typing("Half an ans")), now);
        let effects = s.on_timer(TimerKind::UpdateLiveness);
        assert_eq!(effects, vec![Effect::Finish(FinishReason::Stalled)]);
        assert_eq!(s.completion(FinishReason::Stalled).text, "Half an ans");
    }

    #[test]
    fn timeouts_retry_until_budget_exhausted() {
        let mut cfg = config();
        cfg.retry_count = 2;
        let mut s = session_with(cfg, true);
        let now = Instant::now();

        assert_eq!(
            s.on_timer(TimerKind::InitialResponse),
            vec![Effect::Redeliver { attempt: 1 }]
        );
        s.begin_attempt(MessageId::from("1800.000"));
        assert_eq!(s.known_threads().len(), 2);

        assert_eq!(
            s.on_delivery_error(),
            vec![Effect::Redeliver { attempt: 2 }]
        );
        assert_eq!(
            s.on_timer(TimerKind::MultiReplySettle),
            vec![Effect::Finish(FinishReason::RetriesExhausted)]
        );
        assert!(s.on_timer(TimerKind::InitialResponse).is_empty());
        assert!(s.next_deadline().is_none());
    }

    #[test]
    fn events_after_finalize_are_ignored() {
        let mut s = session_with(config(), true);
        let now = Instant::now();
        s.on_event(&edit("1700.100", "Complete."), now);
        assert!(s.is_finalized());
        assert!(s.on_event(&edit("1700.100", "Complete. More"), now).is_empty());
        assert_eq!(s.text(), "Complete.");
    }
}
