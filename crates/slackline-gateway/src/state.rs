use std::sync::Arc;

use slackline_bridge::Bridge;
use slackline_config::GatewayConfig;

/// Shared application state handed to every request handler.
pub struct AppState {
    pub config: GatewayConfig,
    pub bridge: Bridge,
}

impl AppState {
    pub fn new(config: GatewayConfig, bridge: Bridge) -> Self {
        Self { config, bridge }
    }
}

pub type SharedState = Arc<AppState>;
