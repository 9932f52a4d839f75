use std::collections::HashSet;

use slackline_channels::PlatformEvent;
use slackline_common::MessageId;
use slackline_config::BridgeConfig;

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Member id of the agent; replies from anyone else are ignored.
    pub agent_user: String,
    /// Only accept events from the current delivery attempt's thread.
    pub ignore_old_threads: bool,
}

impl From<&BridgeConfig> for ClassifierConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            agent_user: config.agent_user.clone(),
            ignore_old_threads: config.ignore_old_threads,
        }
    }
}

/// The parts of a session the classifier reads.
#[derive(Debug, Clone, Copy)]
pub struct SessionView<'a> {
    pub known_threads: &'a [MessageId],
    pub active_root: Option<&'a MessageId>,
    pub rejected: &'a HashSet<MessageId>,
    pub canonical: Option<&'a MessageId>,
    pub accumulated: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// An edit to a reply this session should look at.
    Accept,
    /// The agent attached a file after starting its reply: it gave up on the
    /// text, finish with what we have.
    Truncate,
    Ignore(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NoMessage,
    Rejected,
    ForeignThread,
    StaleThread,
    NotCanonical,
    FileBeforeText,
    ForeignSender,
    UnhandledSubtype,
}

/// Decide what a session should do with `event`. Pure; runs before any
/// session state changes.
pub fn classify(event: &PlatformEvent, session: &SessionView<'_>, config: &ClassifierConfig) -> Verdict {
    let Some(message) = event.message_view() else {
        return Verdict::Ignore(IgnoreReason::NoMessage);
    };
    let id = message.id();

    if session.rejected.contains(&id) {
        return Verdict::Ignore(IgnoreReason::Rejected);
    }

    let Some(thread) = message.thread_id() else {
        return Verdict::Ignore(IgnoreReason::ForeignThread);
    };
    if !session.known_threads.contains(&thread) {
        return Verdict::Ignore(IgnoreReason::ForeignThread);
    }
    if config.ignore_old_threads && session.active_root != Some(&thread) {
        return Verdict::Ignore(IgnoreReason::StaleThread);
    }

    // A file upload is a new message with its own ts, so it is checked
    // before the canonical id.
    if event.is_file_share() {
        return if session.accumulated.is_empty() {
            Verdict::Ignore(IgnoreReason::FileBeforeText)
        } else {
            Verdict::Truncate
        };
    }

    if let Some(canonical) = session.canonical
        && *canonical != id
    {
        return Verdict::Ignore(IgnoreReason::NotCanonical);
    }

    if let Some(sender) = event.sender()
        && sender != config.agent_user
    {
        return Verdict::Ignore(IgnoreReason::ForeignSender);
    }

    if !event.is_edit() {
        return Verdict::Ignore(IgnoreReason::UnhandledSubtype);
    }

    Verdict::Accept
}
