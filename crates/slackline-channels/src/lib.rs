pub mod event;
pub mod feed;
pub mod traits;

#[cfg(feature = "slack")]
pub mod slack;

pub use event::{MessageView, PlatformEvent};
pub use feed::BroadcastFeed;
pub use traits::{AgentPing, DeliveryAdapter, EventFeed, FeedStatus};
