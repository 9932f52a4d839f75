use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use slackline_bridge::differ::TYPING_MARKER;
use slackline_bridge::{Bridge, CompletionRequest, FinishReason, SessionOutput};
use slackline_channels::{
    AgentPing, BroadcastFeed, DeliveryAdapter, EventFeed, FeedStatus, PlatformEvent,
};
use slackline_common::{Error, MessageId, PromptMessage, Result};
use slackline_config::BridgeConfig;

const AGENT: &str = "U_AGENT";

type Script = Box<dyn Fn(u32, &MessageId) -> Vec<PlatformEvent> + Send + Sync>;

#[derive(Default)]
struct Calls {
    roots: Vec<String>,
    replies: Vec<String>,
    pings: u32,
    root_failures: Vec<Error>,
}

/// Delivery adapter that answers each ping by publishing scripted agent
/// events on the feed.
struct MockDelivery {
    feed: BroadcastFeed,
    calls: Mutex<Calls>,
    script: Script,
}

impl MockDelivery {
    fn new(feed: BroadcastFeed, script: Script) -> Self {
        Self {
            feed,
            calls: Mutex::new(Calls::default()),
            script,
        }
    }

    fn fail_next_roots(&self, errors: Vec<Error>) {
        self.calls.lock().unwrap().root_failures = errors;
    }

    fn roots(&self) -> usize {
        self.calls.lock().unwrap().roots.len()
    }

    fn replies(&self) -> usize {
        self.calls.lock().unwrap().replies.len()
    }

    fn pings(&self) -> u32 {
        self.calls.lock().unwrap().pings
    }
}

#[async_trait]
impl DeliveryAdapter for MockDelivery {
    fn platform(&self) -> &str {
        "mock"
    }

    async fn post_root(&self, text: &str) -> Result<MessageId> {
        let mut calls = self.calls.lock().unwrap();
        if !calls.root_failures.is_empty() {
            return Err(calls.root_failures.remove(0));
        }
        calls.roots.push(text.to_string());
        Ok(MessageId::from(format!("{}.000", 1700 + calls.roots.len())))
    }

    async fn post_reply(&self, text: &str, root: &MessageId) -> Result<MessageId> {
        let mut calls = self.calls.lock().unwrap();
        calls.replies.push(text.to_string());
        Ok(MessageId::from(format!("{root}{}", calls.replies.len())))
    }

    async fn edit_message(&self, _text: &str, _target: &MessageId) -> Result<()> {
        Ok(())
    }

    async fn ping_agent(&self, ping: AgentPing<'_>) -> Result<MessageId> {
        let root = match ping {
            AgentPing::Reply { root } => root,
            AgentPing::Edit { target, .. } => target,
        };
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.pings += 1;
            calls.pings - 1
        };
        for event in (self.script)(index, root) {
            self.feed.publish(event);
        }
        Ok(root.clone())
    }
}

fn reply_id(root: &MessageId, n: u32) -> String {
    root.as_str().replace(".000", &format!(".{:03}", 100 + n))
}

fn agent_edit(root: &MessageId, n: u32, text: &str) -> PlatformEvent {
    PlatformEvent::edit(AGENT, &reply_id(root, n), root.as_str(), text)
}

fn typing(text: &str) -> String {
    format!("{text}{TYPING_MARKER}")
}

fn config() -> BridgeConfig {
    BridgeConfig {
        agent_user: AGENT.to_string(),
        prebuffer_length: 0,
        ..BridgeConfig::default()
    }
}

fn setup(config: BridgeConfig, script: Script) -> (Bridge, Arc<MockDelivery>, BroadcastFeed) {
    let feed = BroadcastFeed::default();
    let delivery = Arc::new(MockDelivery::new(feed.clone(), script));
    let bridge = Bridge::new(config, delivery.clone(), Arc::new(feed.clone()))
        .expect("bridge should build");
    (bridge, delivery, feed)
}

fn request(stream: bool) -> CompletionRequest {
    CompletionRequest {
        messages: vec![
            PromptMessage::text("system", "You are terse."),
            PromptMessage::text("user", "Say hello"),
            PromptMessage::text("assistant", "Sure"),
        ],
        stream,
    }
}

fn hello_world() -> Script {
    Box::new(|_, root| {
        vec![
            agent_edit(root, 0, &typing("Hello")),
            agent_edit(root, 0, "Hello world"),
        ]
    })
}

#[tokio::test(start_paused = true)]
async fn test_three_messages_one_chunk_one_trigger() {
    let (bridge, delivery, _feed) = setup(config(), hello_world());

    let completion = bridge
        .start(request(false))
        .into_completion()
        .await
        .expect("session should complete");

    assert_eq!(completion.text, "Hello world");
    assert_eq!(completion.reason, FinishReason::Completed);
    assert_eq!(delivery.roots(), 1);
    assert_eq!(delivery.replies(), 0);
    assert_eq!(delivery.pings(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stream_emits_deltas_then_done() {
    let (bridge, _delivery, _feed) = setup(config(), hello_world());
    let mut handle = bridge.start(request(true));
    assert!(handle.id.starts_with("chatcmpl-"));

    let mut deltas = Vec::new();
    let completion = loop {
        match handle.output.recv().await.expect("session output") {
            SessionOutput::Delta(delta) => deltas.push(delta),
            SessionOutput::Done(completion) => break completion,
            SessionOutput::Failed(e) => panic!("unexpected failure: {e}"),
        }
    };

    assert_eq!(deltas, vec!["Hello".to_string(), " world".to_string()]);
    assert_eq!(completion.text, "Hello world");
    assert!(handle.output.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_long_prompt_is_posted_as_thread_replies() {
    let config = BridgeConfig {
        max_chunk_len: 100,
        min_split_size: 10,
        ..config()
    };
    let (bridge, delivery, _feed) = setup(config, hello_world());
    let request = CompletionRequest {
        messages: vec![
            PromptMessage::text("user", "a".repeat(60)),
            PromptMessage::text("assistant", "b".repeat(60)),
            PromptMessage::text("user", "c".repeat(60)),
        ],
        stream: false,
    };

    bridge.start(request).into_completion().await.unwrap();
    assert_eq!(delivery.roots(), 1);
    assert_eq!(delivery.replies(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_silence_retries_then_gives_up() {
    let config = BridgeConfig {
        retry_count: 2,
        reply_timeout_ms: 1_000,
        ..config()
    };
    let (bridge, delivery, _feed) = setup(config, Box::new(|_, _| Vec::new()));

    let completion = bridge.start(request(false)).into_completion().await.unwrap();
    assert_eq!(completion.reason, FinishReason::RetriesExhausted);
    assert_eq!(completion.text, "");
    assert_eq!(delivery.roots(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_is_fatal() {
    let (bridge, delivery, _feed) = setup(config(), hello_world());
    delivery.fail_next_roots(vec![Error::Auth("invalid_auth".into())]);

    let err = bridge
        .start(request(false))
        .into_completion()
        .await
        .expect_err("auth failure should surface");
    assert!(matches!(err, Error::Auth(_)));
    assert_eq!(delivery.pings(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_is_retried() {
    let (bridge, delivery, _feed) = setup(config(), hello_world());
    delivery.fail_next_roots(vec![Error::Transport("connection reset".into())]);

    let completion = bridge.start(request(false)).into_completion().await.unwrap();
    assert_eq!(completion.text, "Hello world");
    assert_eq!(delivery.roots(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_reply_finishes_with_partial_text() {
    let config = BridgeConfig {
        reply_update_timeout_ms: 2_000,
        ..config()
    };
    let script: Script = Box::new(|_, root| vec![agent_edit(root, 0, &typing("Partial"))]);
    let (bridge, _delivery, _feed) = setup(config, script);

    let completion = bridge.start(request(false)).into_completion().await.unwrap();
    assert_eq!(completion.reason, FinishReason::Stalled);
    assert_eq!(completion.text, "Partial");
}

#[tokio::test(start_paused = true)]
async fn test_filtered_reply_triggers_edit_retry() {
    let config = BridgeConfig {
        prebuffer_length: 200,
        edit_retry_count: 1,
        ..config()
    };
    let script: Script = Box::new(|ping, root| {
        if ping == 0 {
            vec![agent_edit(
                root,
                0,
                "I apologize, but that would be harmful and unethical.",
            )]
        } else {
            vec![agent_edit(root, 1, "Here is the story you asked for.")]
        }
    });
    let (bridge, delivery, _feed) = setup(config, script);

    let completion = bridge.start(request(false)).into_completion().await.unwrap();
    assert_eq!(completion.text, "Here is the story you asked for.");
    assert_eq!(completion.candidates_discarded, 1);
    assert_eq!(delivery.pings(), 2);
    assert_eq!(delivery.roots(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_multi_reply_picks_earliest_candidate() {
    let config = BridgeConfig {
        multi_response: 2,
        ..config()
    };
    let script: Script = Box::new(|ping, root| {
        if ping > 0 {
            return Vec::new();
        }
        // Reply 1 starts first but reply 0 has the lower id.
        let mut events = Vec::new();
        let mut a = String::new();
        let mut b = String::new();
        for (n, word) in [(1, "b1 "), (1, "b2 "), (0, "a1 "), (1, "b3 "), (1, "b4 ")] {
            let text = if n == 0 { &mut a } else { &mut b };
            text.push_str(word);
            events.push(agent_edit(root, n, &typing(text)));
        }
        for word in ["a2 ", "a3 ", "a4 "] {
            a.push_str(word);
            events.push(agent_edit(root, 0, &typing(&a)));
        }
        a.push_str("done");
        events.push(agent_edit(root, 0, &a));
        events.push(agent_edit(root, 1, "b1 b2 b3 b4 done"));
        events
    });
    let (bridge, _delivery, _feed) = setup(config, script);

    let completion = bridge.start(request(false)).into_completion().await.unwrap();
    assert_eq!(completion.text, "a1 a2 a3 a4 done");
    assert_eq!(completion.candidates_discarded, 1);
}

#[tokio::test(start_paused = true)]
async fn test_client_disconnect_ends_session() {
    let (bridge, _delivery, feed) = setup(config(), Box::new(|_, _| Vec::new()));
    let handle = bridge.start(request(true));
    assert_eq!(feed.subscriber_count(), 1);

    drop(handle);
    for _ in 0..100 {
        if feed.subscriber_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(feed.subscriber_count(), 0);
    assert_eq!(bridge.feed().status(), FeedStatus::Connected);
}
