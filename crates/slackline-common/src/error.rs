use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing configuration / request input. Never retried.
    #[error("config error: {0}")]
    Config(String),

    /// The platform rejected our credentials. Fatal for the session.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network or platform API failure while posting or editing a message.
    #[error("transport error: {0}")]
    Transport(String),

    /// A real-time payload did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("bridge error: {0}")]
    Bridge(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Fatal errors end a session immediately instead of going through the
    /// retry path.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Auth(_) | Error::Config(_))
    }

    /// Short machine-readable category, used in OpenAI-style error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "invalid_request_error",
            Error::Auth(_) => "authentication_error",
            Error::Transport(_) | Error::Channel(_) => "upstream_error",
            Error::Protocol(_) | Error::Json(_) => "protocol_error",
            Error::Bridge(_) | Error::Io(_) => "server_error",
        }
    }
}
