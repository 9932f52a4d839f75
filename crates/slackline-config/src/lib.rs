pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{
    AppConfig, BridgeConfig, CHUNK_LABEL_OVERHEAD, GatewayConfig, PingConfig, SlackConfig,
};
