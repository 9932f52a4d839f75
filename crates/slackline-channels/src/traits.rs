use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slackline_common::{MessageId, Result};
use tokio::sync::broadcast;

use crate::event::PlatformEvent;

/// How the agent should be mentioned to start producing a reply.
#[derive(Debug, Clone, Copy)]
pub enum AgentPing<'a> {
    /// Post a new reply in the thread that only carries the mention.
    Reply { root: &'a MessageId },
    /// Rewrite an existing message so it carries the mention next to its
    /// `original` text. Each edit makes the agent start one more reply.
    Edit {
        target: &'a MessageId,
        original: &'a str,
    },
}

/// Outbound side of the platform: post and edit messages in the configured
/// channel.
///
/// Every method may fail with a transport error, which callers treat as
/// retryable, or with `Error::Auth`, which is fatal.
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    /// Unique identifier for this platform.
    fn platform(&self) -> &str;

    /// Start a new thread; the returned id is the thread root.
    async fn post_root(&self, text: &str) -> Result<MessageId>;

    /// Post `text` as a reply in the thread anchored at `root`.
    async fn post_reply(&self, text: &str, root: &MessageId) -> Result<MessageId>;

    /// Replace the text of `target`.
    async fn edit_message(&self, text: &str, target: &MessageId) -> Result<()>;

    /// Mention the agent so it starts replying in the thread.
    async fn ping_agent(&self, ping: AgentPing<'_>) -> Result<MessageId>;
}

/// Inbound side of the platform: a fan-out of every real-time event seen on
/// the shared connection.
///
/// Subscribers receive events from the whole channel, in arrival order, and
/// are expected to filter by content. Dropping the receiver unsubscribes.
pub trait EventFeed: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent>;

    /// Current connection status.
    fn status(&self) -> FeedStatus;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FeedStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error(String),
}
