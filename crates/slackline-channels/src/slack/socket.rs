use std::time::Duration;

use futures::{SinkExt, StreamExt};
use slackline_common::{Error, Result};
use slackline_config::SlackConfig;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};
use url::Url;

use crate::event::PlatformEvent;
use crate::feed::BroadcastFeed;
use crate::traits::{EventFeed, FeedStatus};

const DEFAULT_SOCKET_URL: &str = "wss://wss-primary.slack.com/";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Maximum backoff between reconnect attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// The shared real-time connection. One per process; every session
/// subscribes to it.
pub struct SlackEventFeed {
    feed: BroadcastFeed,
    status_rx: watch::Receiver<FeedStatus>,
    shutdown_tx: watch::Sender<bool>,
}

impl SlackEventFeed {
    /// Start the connection loop in the background. Returns immediately;
    /// watch [`EventFeed::status`] for progress.
    pub fn spawn(config: &SlackConfig) -> Result<Self> {
        let url = socket_url(config)?;
        let cookie = HeaderValue::from_str(&format!("d={};", config.cookie))
            .map_err(|_| Error::Config("slack.cookie contains invalid header characters".into()))?;

        let feed = BroadcastFeed::default();
        let (status_tx, status_rx) = watch::channel(FeedStatus::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let publisher = feed.clone();
        tokio::spawn(run_connection(url, cookie, publisher, status_tx, shutdown_rx));

        Ok(Self {
            feed,
            status_rx,
            shutdown_tx,
        })
    }

    /// Resolves once the first connection attempt has finished, with the
    /// status it reached.
    pub async fn wait_ready(&self) -> FeedStatus {
        let mut rx = self.status_rx.clone();
        loop {
            let status = rx.borrow_and_update().clone();
            if status != FeedStatus::Connecting {
                return status;
            }
            if rx.changed().await.is_err() {
                return FeedStatus::Disconnected;
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl EventFeed for SlackEventFeed {
    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.feed.subscribe()
    }

    fn status(&self) -> FeedStatus {
        self.status_rx.borrow().clone()
    }
}

impl Drop for SlackEventFeed {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn socket_url(config: &SlackConfig) -> Result<String> {
    let base = config.socket_url.as_deref().unwrap_or(DEFAULT_SOCKET_URL);
    let mut url = Url::parse(base)
        .map_err(|e| Error::Config(format!("invalid slack.socket_url {base:?}: {e}")))?;
    url.query_pairs_mut().append_pair("token", &config.token);
    Ok(url.into())
}

async fn run_connection(
    url: String,
    cookie: HeaderValue,
    feed: BroadcastFeed,
    status_tx: watch::Sender<FeedStatus>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut consecutive_failures: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match read_until_closed(&url, &cookie, &feed, &status_tx, &mut shutdown_rx).await {
            Ok(()) if *shutdown_rx.borrow() => break,
            Ok(()) => {
                warn!("slack socket closed by server, reconnecting");
                consecutive_failures = 0;
                let _ = status_tx.send(FeedStatus::Reconnecting);
            }
            Err(e) => {
                consecutive_failures = consecutive_failures.saturating_add(1);
                warn!("slack socket failed (attempt {consecutive_failures}): {e}");
                let _ = status_tx.send(FeedStatus::Error(e.to_string()));
            }
        }

        let backoff = if consecutive_failures == 0 {
            INITIAL_BACKOFF
        } else {
            INITIAL_BACKOFF
                .saturating_mul(1 << consecutive_failures.min(5))
                .min(MAX_BACKOFF)
        };

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    let _ = status_tx.send(FeedStatus::Disconnected);
    info!("slack socket loop stopped");
}

/// One connection lifetime. `Ok` means a clean close or shutdown.
async fn read_until_closed(
    url: &str,
    cookie: &HeaderValue,
    feed: &BroadcastFeed,
    status_tx: &watch::Sender<FeedStatus>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    let mut request = url
        .into_client_request()
        .map_err(|e| Error::Config(format!("invalid slack socket url: {e}")))?;
    request.headers_mut().insert("Cookie", cookie.clone());

    let (stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
        .await
        .map_err(|_| Error::Transport("slack socket connect timed out".into()))?
        .map_err(|e| Error::Transport(format!("slack socket connect failed: {e}")))?;
    let (mut sink, mut source) = stream.split();

    let _ = status_tx.send(FeedStatus::Connected);
    info!("slack socket connected");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
            }
            frame = source.next() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                let frame = frame
                    .map_err(|e| Error::Transport(format!("slack socket read failed: {e}")))?;
                match frame {
                    WsMessage::Text(text) => handle_frame(feed, text.as_str()),
                    WsMessage::Binary(bytes) => match std::str::from_utf8(&bytes) {
                        Ok(text) => handle_frame(feed, text),
                        Err(_) => warn!("dropping non-utf8 binary frame from slack socket"),
                    },
                    WsMessage::Ping(payload) => {
                        sink.send(WsMessage::Pong(payload))
                            .await
                            .map_err(|e| Error::Transport(format!("slack socket pong failed: {e}")))?;
                    }
                    WsMessage::Close(_) => return Ok(()),
                    WsMessage::Pong(_) | WsMessage::Frame(_) => {}
                }
            }
        }
    }
}

fn handle_frame(feed: &BroadcastFeed, raw: &str) {
    match feed.publish_raw(raw) {
        Ok(receivers) => debug!("slack event fanned out to {receivers} session(s)"),
        Err(e) => warn!("{e}"),
    }
}
