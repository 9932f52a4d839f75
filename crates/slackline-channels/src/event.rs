use serde::{Deserialize, Deserializer, Serialize};
use slackline_common::{Error, MessageId, Result};

pub const SUBTYPE_MESSAGE_CHANGED: &str = "message_changed";

/// A raw real-time event, as delivered by the platform socket.
///
/// Only the fields the bridge reasons about are kept. Message edits carry the
/// new state under `message`; plain posts and file shares carry it at the top
/// level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformEvent {
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub ts: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub message: Option<EventMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub ts: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

/// The message an event is about, normalized across event shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageView<'a> {
    pub ts: &'a str,
    pub thread_ts: Option<&'a str>,
    pub text: &'a str,
    pub user: Option<&'a str>,
}

impl MessageView<'_> {
    pub fn id(&self) -> MessageId {
        MessageId::from(self.ts)
    }

    pub fn thread_id(&self) -> Option<MessageId> {
        self.thread_ts.map(MessageId::from)
    }

    /// First few characters, for log lines.
    pub fn preview(&self) -> String {
        self.text.chars().take(33).collect::<String>().trim().to_string()
    }
}

impl PlatformEvent {
    /// Parse one socket frame.
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::Protocol(format!("malformed real-time event: {e}")))
    }

    pub fn is_edit(&self) -> bool {
        self.subtype.as_deref() == Some(SUBTYPE_MESSAGE_CHANGED)
    }

    pub fn is_file_share(&self) -> bool {
        self.subtype.as_deref() == Some("file_share")
            || self.event_type == "file_created"
            || self.event_type == "file_shared"
    }

    /// The message this event refers to, if it names one.
    pub fn message_view(&self) -> Option<MessageView<'_>> {
        if let Some(message) = &self.message {
            let ts = message.ts.as_deref()?;
            return Some(MessageView {
                ts,
                thread_ts: message.thread_ts.as_deref(),
                text: &message.text,
                user: message.user.as_deref().or(self.user.as_deref()),
            });
        }
        let ts = self.ts.as_deref()?;
        Some(MessageView {
            ts,
            thread_ts: self.thread_ts.as_deref(),
            text: self.text.as_deref().unwrap_or_default(),
            user: self.user.as_deref(),
        })
    }

    /// Sender of the event; top-level `user` wins over the nested one.
    pub fn sender(&self) -> Option<&str> {
        self.user
            .as_deref()
            .or_else(|| self.message.as_ref().and_then(|m| m.user.as_deref()))
    }

    /// Build a `message_changed` event, the shape the agent's streaming edits
    /// arrive in.
    pub fn edit(user: &str, ts: &str, thread_ts: &str, text: &str) -> Self {
        Self {
            event_type: "message".to_string(),
            subtype: Some(SUBTYPE_MESSAGE_CHANGED.to_string()),
            message: Some(EventMessage {
                ts: Some(ts.to_string()),
                text: text.to_string(),
                thread_ts: Some(thread_ts.to_string()),
                user: Some(user.to_string()),
            }),
            ..Self::default()
        }
    }
}

/// Slack sends ids as strings, but some relays re-encode them as numbers.
fn de_opt_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
