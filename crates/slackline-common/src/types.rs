use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a chat-platform message.
///
/// Slack message ids are decimal-with-dot timestamps (`"1700000000.000100"`).
/// Ordering is **lexicographic on the raw string**, which matches
/// chronological order for ids of the same width. The reconciler relies on
/// this: the lowest id is the reply that started first. Do not switch to a
/// numeric comparison without confirming the platform keeps the fractional
/// part zero-padded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl PartialEq<str> for MessageId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for MessageId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
