use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use slackline_bridge::Bridge;
use slackline_channels::FeedStatus;
use slackline_channels::slack::{SlackDelivery, SlackEventFeed};
use slackline_config::{AppConfig, ConfigLoader};
use slackline_gateway::GatewayServer;
use slackline_security::RedactingWriter;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "slackline",
    version,
    about = "OpenAI-compatible chat completions answered by an agent in a Slack channel"
)]
struct Cli {
    /// Config file (YAML or TOML). Defaults to ~/.slackline/config.yml.
    #[arg(short, long, global = true, env = "SLACKLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to Slack and serve the completion API.
    Serve {
        /// Override gateway.host.
        #[arg(long)]
        host: Option<String>,
        /// Override gateway.port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Load and validate the configuration, then print any warnings.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = ConfigLoader::new(cli.config.clone())
        .load()
        .context("failed to load configuration")?;

    match cli.command {
        Command::Serve { host, port } => serve(config, host, port).await,
        Command::CheckConfig => check_config(&config),
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(RedactingWriter::stderr())
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn report_warnings(config: &AppConfig) -> usize {
    let warnings = config.warnings();
    for warning in &warnings {
        warn!("config: {warning}");
    }
    warnings.len()
}

fn check_config(config: &AppConfig) -> Result<()> {
    config.validate().context("configuration is invalid")?;
    let warnings = report_warnings(config);
    println!(
        "configuration ok ({warnings} warning(s)); serving on {}:{} as model {}",
        config.gateway.host, config.gateway.port, config.gateway.model_name
    );
    Ok(())
}

async fn serve(mut config: AppConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }
    config.validate().context("configuration is invalid")?;
    report_warnings(&config);

    let delivery = SlackDelivery::new(&config.slack).context("failed to build Slack client")?;
    let feed = SlackEventFeed::spawn(&config.slack).context("failed to start Slack socket")?;
    match feed.wait_ready().await {
        FeedStatus::Connected => info!("connected to Slack real-time feed"),
        FeedStatus::Error(e) => bail!("could not connect to Slack real-time feed: {e}"),
        other => warn!("Slack real-time feed is {other:?}, continuing and retrying"),
    }

    let bridge = Bridge::new(config.bridge.clone(), Arc::new(delivery), Arc::new(feed))
        .context("failed to build bridge")?;
    GatewayServer::new(config.gateway.clone(), bridge)
        .run()
        .await
        .context("gateway exited with an error")
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_accepts_overrides() {
        let cli = Cli::parse_from(["slackline", "serve", "--port", "8080", "-c", "conf.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("conf.toml")));
        match cli.command {
            Command::Serve { port, host } => {
                assert_eq!(port, Some(8080));
                assert!(host.is_none());
            }
            Command::CheckConfig => panic!("expected serve"),
        }
    }
}
