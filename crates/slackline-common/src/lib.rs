pub mod error;
pub mod message;
pub mod types;

pub use error::{Error, Result};
pub use message::{MessageContent, PromptMessage};
pub use types::MessageId;
