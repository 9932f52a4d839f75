use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use slackline_bridge::Bridge;
use slackline_common::{Error, Result};
use slackline_config::GatewayConfig;
use tokio::net::TcpListener;
use tracing::info;

use crate::router::build_router;
use crate::state::{AppState, SharedState};

/// HTTP front end: binds the configured address and serves the router until
/// shutdown.
pub struct GatewayServer {
    state: SharedState,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, bridge: Bridge) -> Self {
        Self {
            state: Arc::new(AppState::new(config, bridge)),
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Bind the configured host and port and serve until ctrl-c.
    pub async fn run(self) -> Result<()> {
        let config = &self.state.config;
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {addr}: {e}")))?;
        self.serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
    }

    /// Serve on an already-bound listener until `shutdown` resolves.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let local: SocketAddr = listener.local_addr()?;
        info!(
            "slackline listening on http://{local} (model {})",
            self.state.config.model_name
        );

        let app = build_router(Arc::clone(&self.state));
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("gateway stopped");
        Ok(())
    }
}
