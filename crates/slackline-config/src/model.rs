use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slackline_common::{Error, Result};

/// Headroom reserved for a role label ("Human: ") when splitting oversized
/// prompt entries.
pub const CHUNK_LABEL_OVERHEAD: usize = 20;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub gateway: GatewayConfig,
    pub slack: SlackConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Model id advertised on `/models` and echoed in completion bodies.
    pub model_name: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5004,
            model_name: "claude-v1".to_string(),
        }
    }
}

/// Workspace identity used to reach the channel the agent lives in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    /// `xoxc-` session token.
    pub token: String,
    /// `xoxd-` session cookie (sent as `d=`).
    pub cookie: String,
    /// Workspace subdomain, the part before `.slack.com`.
    pub team_id: String,
    pub channel: String,
    /// Member id of the agent that produces replies.
    pub agent_user: String,
    /// Override for the web API base (defaults to `https://{team_id}.slack.com/api`).
    pub api_base: Option<String>,
    /// Override for the real-time socket endpoint.
    pub socket_url: Option<String>,
    pub ping: PingConfig,
}

/// How the agent is mentioned to start a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    /// Edit the thread root to carry the mention instead of posting a new
    /// reply. Required for multi-reply hedging.
    pub edit_msg_with_ping: bool,
    pub ping_prefix: String,
    pub ping_suffix: String,
    /// Put the mention before the root text (otherwise after it).
    pub ping_at_start_of_msg: bool,
    pub ping_message_prefix: String,
    pub ping_message: String,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            edit_msg_with_ping: true,
            ping_prefix: "\u{fffd}A".to_string(),
            ping_suffix: "r\u{fffd}\n\n\n".to_string(),
            ping_at_start_of_msg: true,
            ping_message_prefix: ".\n\n\u{fffd}A".to_string(),
            ping_message: "r\u{fffd}".to_string(),
        }
    }
}

/// Knobs for the reconciliation engine. Built once and shared read-only by
/// every session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub role_names: HashMap<String, String>,
    pub omit_first_role_label: bool,
    pub max_chunk_len: usize,
    pub min_split_size: usize,
    pub stop_strings: Vec<String>,
    pub retry_count: u32,
    pub min_length: usize,
    pub blacklist: Vec<String>,
    pub blacklist_threshold: usize,
    pub prebuffer_length: usize,
    pub ignore_old_threads: bool,
    pub multi_response: u32,
    pub multi_response_delay_ms: u64,
    pub edit_retry_count: u32,
    pub delay_before_edit_ms: u64,
    pub reply_timeout_ms: u64,
    pub reply_multi_timeout_ms: u64,
    pub reply_update_timeout_ms: u64,
    /// Mirrors `slack.ping.edit_msg_with_ping`; filled in by
    /// [`AppConfig::normalize`] so the engine never has to look at Slack
    /// settings.
    #[serde(skip)]
    pub edit_trigger: bool,
    /// Mirrors `slack.agent_user`, also filled in by [`AppConfig::normalize`].
    #[serde(skip)]
    pub agent_user: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let role_names = [
            ("system", "H"),
            ("user", "H"),
            ("assistant", "A"),
            ("example_user", "H"),
            ("example_assistant", "A"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let blacklist = [
            "ethical(ly)?",
            "unethical",
            "guidelines?",
            "harmful",
            "illegal",
            "(un)?comfortable",
            "engage",
            "generat(e|ing)",
            "nonconsensual",
            "I apologize",
            "My apologies",
            "upon further reflection",
            "continue this story",
            "(unable to|not|cannot) (continue|respond|provide|appropriate|assist)",
            "inappropriate",
            "content",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();

        Self {
            role_names,
            omit_first_role_label: true,
            max_chunk_len: 12_000,
            min_split_size: 500,
            stop_strings: vec!["\nH: ".into(), "\nHuman: ".into(), "<EOT>".into()],
            retry_count: 5,
            min_length: 0,
            blacklist,
            blacklist_threshold: 2,
            prebuffer_length: 200,
            ignore_old_threads: false,
            multi_response: 1,
            multi_response_delay_ms: 50,
            edit_retry_count: 0,
            delay_before_edit_ms: 400,
            reply_timeout_ms: 30_000,
            reply_multi_timeout_ms: 6_000,
            reply_update_timeout_ms: 25_000,
            edit_trigger: true,
            agent_user: String::new(),
        }
    }
}

impl BridgeConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn reply_multi_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_multi_timeout_ms)
    }

    pub fn reply_update_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_update_timeout_ms)
    }

    pub fn delay_before_edit(&self) -> Duration {
        Duration::from_millis(self.delay_before_edit_ms)
    }

    pub fn multi_response_delay(&self) -> Duration {
        Duration::from_millis(self.multi_response_delay_ms)
    }

    /// How many agent replies one delivery attempt can produce before the
    /// attempt is considered exhausted.
    pub fn replies_per_request(&self) -> u32 {
        if self.edit_trigger {
            self.multi_response + self.edit_retry_count
        } else {
            1
        }
    }
}

impl AppConfig {
    /// Clamp values into their supported ranges and propagate settings the
    /// engine needs from other sections.
    pub fn normalize(&mut self) {
        self.bridge.multi_response = self.bridge.multi_response.max(1);
        self.bridge.multi_response_delay_ms = self.bridge.multi_response_delay_ms.max(10);
        self.bridge.edit_trigger = self.slack.ping.edit_msg_with_ping;
        self.bridge.agent_user = self.slack.agent_user.clone();
        if !self.bridge.edit_trigger {
            // Extra replies can only be requested by re-editing the root.
            self.bridge.multi_response = 1;
            self.bridge.edit_retry_count = 0;
        }
    }

    /// Hard errors: anything that would make every request fail upstream.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("slack.token", &self.slack.token),
            ("slack.cookie", &self.slack.cookie),
            ("slack.team_id", &self.slack.team_id),
            ("slack.channel", &self.slack.channel),
            ("slack.agent_user", &self.slack.agent_user),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{name} is required")));
            }
        }
        if self.bridge.max_chunk_len <= CHUNK_LABEL_OVERHEAD {
            return Err(Error::Config(format!(
                "bridge.max_chunk_len must be greater than {CHUNK_LABEL_OVERHEAD}"
            )));
        }
        Ok(())
    }

    /// Soft checks for values that are accepted but look like a copy/paste
    /// mistake.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let slack = &self.slack;

        if slack.token.len() <= 9 || !slack.token.starts_with("xoxc") {
            warnings.push("slack.token looks abnormal, expected an xoxc- session token".into());
        }
        if slack.cookie.len() <= 9 || !slack.cookie.starts_with("xoxd") {
            warnings.push("slack.cookie looks abnormal, expected an xoxd- session cookie".into());
        }
        if slack.team_id.contains(".slack.com") {
            warnings.push(
                "slack.team_id needs to be the part before '.slack.com', not the entire URL".into(),
            );
        }
        if slack.channel.starts_with('D') {
            warnings.push(
                "slack.channel looks like a DM channel id; use a channel both you and the agent can access"
                    .into(),
            );
        } else if !slack.channel.starts_with('C') {
            warnings.push("slack.channel might be wrong, channel ids start with 'C'".into());
        }
        if slack.agent_user.starts_with('D') {
            warnings.push(
                "slack.agent_user looks like a DM channel id; use the agent's member id instead"
                    .into(),
            );
        } else if !slack.agent_user.starts_with('U') {
            warnings.push("slack.agent_user might be wrong, member ids start with 'U'".into());
        }
        if !slack.ping.edit_msg_with_ping && slack.ping.ping_message.is_empty() {
            warnings.push(
                "slack.ping.ping_message is empty; the agent will not reply to a bare mention, use at least a space"
                    .into(),
            );
        }

        warnings
    }
}
