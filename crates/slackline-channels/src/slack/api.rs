//! Slack web API delivery: post, reply, edit and mention the agent.
//!
//! Requests are sent the way the Slack web client sends them (multipart form,
//! session token in the body, `d=` cookie in the header) because the agent
//! only answers messages posted by a real workspace member.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::multipart::Form;
use serde::Deserialize;
use serde_json::{Value, json};
use slackline_common::{Error, MessageId, Result};
use slackline_config::SlackConfig;
use tracing::{debug, info};

use crate::traits::{AgentPing, DeliveryAdapter};

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/112.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct SlackApiResponse {
    ok: bool,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// One piece of a rich-text section.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Mention(String),
}

#[derive(Clone)]
pub struct SlackDelivery {
    http: reqwest::Client,
    api_base: String,
    token: String,
    channel: String,
    agent_user: String,
    ping: slackline_config::PingConfig,
}

impl SlackDelivery {
    pub fn new(config: &SlackConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        let cookie = HeaderValue::from_str(&format!("d={};", config.cookie))
            .map_err(|_| Error::Config("slack.cookie contains invalid header characters".into()))?;
        headers.insert(COOKIE, cookie);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to create slack http client: {e}")))?;

        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| format!("https://{}.slack.com/api", config.team_id));

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            channel: config.channel.clone(),
            agent_user: config.agent_user.clone(),
            ping: config.ping.clone(),
        })
    }

    fn base_form(&self) -> Form {
        Form::new()
            .text("token", self.token.clone())
            .text("channel", self.channel.clone())
            .text("_x_mode", "online")
            .text("_x_sonic", "true")
            .text("type", "message")
            .text("xArgs", "{}")
            .text("unfurl", "[]")
            .text("include_channel_perm_error", "true")
            .text("_x_reason", "webapp_message_send")
    }

    async fn send(
        &self,
        segments: &[Segment],
        thread_ts: Option<&MessageId>,
        edit_ts: Option<&MessageId>,
    ) -> Result<Option<String>> {
        let mut form = self.base_form();
        if let Some(ts) = edit_ts {
            form = form.text("ts", ts.to_string());
        }
        if let Some(thread) = thread_ts {
            form = form.text("thread_ts", thread.to_string());
        }
        form = form.text("blocks", rich_text_blocks(segments).to_string());

        let method = if edit_ts.is_some() {
            "chat.update"
        } else {
            "chat.postMessage"
        };

        let response = self
            .http
            .post(format!("{}/{method}", self.api_base))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("slack {method} request failed: {e}")))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "slack {method} returned HTTP {status}: {}",
                truncate(&body, 200)
            )));
        }

        let parsed: SlackApiResponse = serde_json::from_str(&body).map_err(|e| {
            Error::Transport(format!("slack {method} returned unexpected body: {e}"))
        })?;
        check_api_response(method, parsed)
    }

    fn ping_segments(&self, ping: &AgentPing<'_>) -> Vec<Segment> {
        let mention = Segment::Mention(self.agent_user.clone());
        match ping {
            AgentPing::Reply { .. } => vec![
                Segment::Text(self.ping.ping_message_prefix.clone()),
                mention,
                Segment::Text(self.ping.ping_message.clone()),
            ],
            AgentPing::Edit { original, .. } => {
                if self.ping.ping_at_start_of_msg {
                    vec![
                        Segment::Text(self.ping.ping_prefix.clone()),
                        mention,
                        Segment::Text(format!("{}\n{original}", self.ping.ping_suffix)),
                    ]
                } else {
                    vec![
                        Segment::Text(format!("{original}\n{}", self.ping.ping_prefix)),
                        mention,
                        Segment::Text(self.ping.ping_suffix.clone()),
                    ]
                }
            }
        }
    }
}

#[async_trait]
impl DeliveryAdapter for SlackDelivery {
    fn platform(&self) -> &str {
        "slack"
    }

    async fn post_root(&self, text: &str) -> Result<MessageId> {
        let ts = self
            .send(&[Segment::Text(text.to_string())], None, None)
            .await?
            .ok_or_else(|| {
                Error::Channel(
                    "first message did not return a thread timestamp; make sure slack.channel is a channel both you and the agent can access"
                        .into(),
                )
            })?;
        Ok(MessageId::from(ts))
    }

    async fn post_reply(&self, text: &str, root: &MessageId) -> Result<MessageId> {
        let ts = self
            .send(&[Segment::Text(text.to_string())], Some(root), None)
            .await?
            .ok_or_else(|| Error::Channel(format!("reply in thread {root} returned no ts")))?;
        Ok(MessageId::from(ts))
    }

    async fn edit_message(&self, text: &str, target: &MessageId) -> Result<()> {
        self.send(&[Segment::Text(text.to_string())], None, Some(target))
            .await?;
        Ok(())
    }

    async fn ping_agent(&self, ping: AgentPing<'_>) -> Result<MessageId> {
        let segments = self.ping_segments(&ping);
        match ping {
            AgentPing::Reply { root } => {
                let ts = self.send(&segments, Some(root), None).await?;
                info!("created agent ping in thread {root}");
                Ok(ts.map(MessageId::from).unwrap_or_else(|| root.clone()))
            }
            AgentPing::Edit { target, .. } => {
                self.send(&segments, None, Some(target)).await?;
                info!("added agent ping on {target}");
                Ok(target.clone())
            }
        }
    }
}

fn check_api_response(method: &str, response: SlackApiResponse) -> Result<Option<String>> {
    if response.ok {
        debug!("slack {method} ok (ts={:?})", response.ts);
        return Ok(response.ts);
    }
    let error = response.error.unwrap_or_else(|| "unknown error".to_string());
    if error == "invalid_auth" || error == "not_authed" {
        return Err(Error::Auth(format!(
            "slack {method} failed with {error}; slack.token and/or slack.cookie might be incorrect or expired"
        )));
    }
    Err(Error::Transport(format!("slack {method} failed: {error}")))
}

fn rich_text_blocks(segments: &[Segment]) -> Value {
    let elements: Vec<Value> = segments
        .iter()
        .filter_map(|segment| match segment {
            Segment::Text(text) if text.is_empty() => None,
            Segment::Text(text) => Some(json!({ "type": "text", "text": text })),
            Segment::Mention(user) => Some(json!({ "type": "user", "user_id": user })),
        })
        .collect();

    json!([{
        "type": "rich_text",
        "elements": [{
            "type": "rich_text_section",
            "elements": elements,
        }]
    }])
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(ping: slackline_config::PingConfig) -> SlackDelivery {
        let config = SlackConfig {
            token: "xoxc-test".into(),
            cookie: "xoxd-test".into(),
            team_id: "workspace".into(),
            channel: "C1".into(),
            agent_user: "U42".into(),
            api_base: None,
            socket_url: None,
            ping,
        };
        SlackDelivery::new(&config).expect("client should build")
    }

    #[test]
    fn api_base_defaults_to_team_subdomain() {
        let slack = delivery(Default::default());
        assert_eq!(slack.api_base, "https://workspace.slack.com/api");
    }

    #[test]
    fn edit_ping_wraps_original_text() {
        let ping = slackline_config::PingConfig {
            ping_prefix: "[".into(),
            ping_suffix: "]".into(),
            ping_at_start_of_msg: true,
            ..Default::default()
        };
        let slack = delivery(ping);
        let target = MessageId::from("1.1");
        let segments = slack.ping_segments(&AgentPing::Edit {
            target: &target,
            original: "prompt",
        });
        assert_eq!(
            segments,
            vec![
                Segment::Text("[".into()),
                Segment::Mention("U42".into()),
                Segment::Text("]\nprompt".into()),
            ]
        );
    }

    #[test]
    fn edit_ping_at_end_when_configured() {
        let ping = slackline_config::PingConfig {
            ping_prefix: "<".into(),
            ping_suffix: ">".into(),
            ping_at_start_of_msg: false,
            ..Default::default()
        };
        let slack = delivery(ping);
        let target = MessageId::from("1.1");
        let segments = slack.ping_segments(&AgentPing::Edit {
            target: &target,
            original: "prompt",
        });
        assert_eq!(segments[0], Segment::Text("prompt\n<".into()));
        assert_eq!(segments[2], Segment::Text(">".into()));
    }

    #[test]
    fn blocks_skip_empty_text_and_render_mentions() {
        let blocks = rich_text_blocks(&[
            Segment::Text(String::new()),
            Segment::Mention("U42".into()),
            Segment::Text(" go".into()),
        ]);
        let elements = &blocks[0]["elements"][0]["elements"];
        assert_eq!(elements.as_array().unwrap().len(), 2);
        assert_eq!(elements[0]["type"], "user");
        assert_eq!(elements[0]["user_id"], "U42");
        assert_eq!(elements[1]["text"], " go");
    }

    #[test]
    fn auth_errors_are_fatal() {
        let err = check_api_response(
            "chat.postMessage",
            SlackApiResponse {
                ok: false,
                ts: None,
                error: Some("invalid_auth".into()),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(err.is_fatal());

        let err = check_api_response(
            "chat.postMessage",
            SlackApiResponse {
                ok: false,
                ts: None,
                error: Some("ratelimited".into()),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
