use std::path::{Path, PathBuf};

use slackline_common::{Error, Result};
use tracing::{info, warn};

use crate::model::AppConfig;

const CONFIG_FILE_NAMES: &[&str] = &["config.yml", "config.yaml", "config.toml"];

/// Loads [`AppConfig`] from disk and the environment.
///
/// Lookup order: explicit path, then `~/.slackline/config.{yml,yaml,toml}`,
/// then built-in defaults. Environment variables (optionally from a `.env`
/// file) override whatever the file provided.
pub struct ConfigLoader {
    path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn default_config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".slackline")
    }

    pub fn load(&self) -> Result<AppConfig> {
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            warn!("failed to read .env file: {e}");
        }

        let mut config = match self.resolve_path() {
            Some(path) => {
                info!("loading config from {}", path.display());
                Self::parse_file(&path)?
            }
            None => {
                info!("no config file found, using defaults");
                AppConfig::default()
            }
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        config.normalize();
        Ok(config)
    }

    fn resolve_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.path {
            return Some(path.clone());
        }
        let dir = Self::default_config_dir();
        CONFIG_FILE_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    pub fn parse_file(path: &Path) -> Result<AppConfig> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&raw)
                .map_err(|e| Error::Config(format!("invalid toml in {}: {e}", path.display()))),
            _ => serde_yaml::from_str(&raw)
                .map_err(|e| Error::Config(format!("invalid yaml in {}: {e}", path.display()))),
        }
    }
}

/// Apply `SLACKLINE_*` overrides. `lookup` is injected so tests don't have to
/// mutate the process environment.
pub fn apply_env_overrides(
    config: &mut AppConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let set = |target: &mut String, key: &str| {
        if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
            *target = value;
        }
    };

    set(&mut config.slack.token, "SLACKLINE_SLACK_TOKEN");
    set(&mut config.slack.cookie, "SLACKLINE_SLACK_COOKIE");
    set(&mut config.slack.team_id, "SLACKLINE_SLACK_TEAM_ID");
    set(&mut config.slack.channel, "SLACKLINE_SLACK_CHANNEL");
    set(&mut config.slack.agent_user, "SLACKLINE_AGENT_USER");
    set(&mut config.gateway.host, "SLACKLINE_HOST");

    if let Some(port) = lookup("SLACKLINE_PORT") {
        config.gateway.port = port
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("SLACKLINE_PORT is not a valid port: {port}")))?;
    }

    Ok(())
}
