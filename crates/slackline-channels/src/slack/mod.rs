pub mod api;
pub mod socket;

pub use api::SlackDelivery;
pub use socket::SlackEventFeed;
