//! Upstream Link
//!
//! Single WebSocket client connection to the trading backend. A reader task
//! forwards frames under a read deadline; the link task runs the hub loop:
//!
//! - upstream frames are decoded and applied by the [`Dispatcher`]
//! - viewer requests from the shared queue are written upstream or served
//!   locally
//! - the recompute timer runs a pass and pushes reports
//! - the keep-alive timer pings upstream
//!
//! There is no reconnect. Any connect, read or write failure and a rejected
//! login end [`UpstreamLink::run`] with an error.

pub mod codec;
pub mod dispatch;
pub mod messages;

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

pub use codec::{CodecError, Envelope, decode_upstream, encode_request};
pub use dispatch::Dispatcher;
pub use messages::{OutboundRequest, UpstreamMessage, UpstreamRequest};

use crate::infrastructure::config::Credentials;
use crate::infrastructure::heartbeat::{HeartbeatState, KeepAliveConfig};
use crate::infrastructure::metrics;

/// Frames buffered between the reader task and the hub loop.
const FRAME_BUFFER: usize = 256;

// =============================================================================
// Errors
// =============================================================================

/// Fatal upstream link errors.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Dial or handshake failed.
    #[error("failed to connect to upstream: {0}")]
    Connect(String),

    /// Login verdict was not ok.
    #[error("upstream rejected login: {0}")]
    LoginRejected(String),

    /// Transport read failed.
    #[error("upstream read failed: {0}")]
    Read(String),

    /// Nothing heard within the read deadline.
    #[error("no upstream frame within {0:?}")]
    ReadTimeout(Duration),

    /// Peer closed the connection.
    #[error("upstream connection closed")]
    Closed,

    /// Transport write failed.
    #[error("upstream write failed: {0}")]
    Write(String),

    /// A write did not finish within the write deadline.
    #[error("upstream write deadline exceeded")]
    WriteTimeout,
}

// =============================================================================
// Link State
// =============================================================================

/// Link status shared with the health endpoints.
#[derive(Debug, Default)]
pub struct LinkState {
    connected: AtomicBool,
    logged_in: AtomicBool,
    frames: AtomicU64,
}

impl LinkState {
    /// Disconnected state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the transport is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Record transport up or down.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Whether the upstream login was accepted.
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::Acquire)
    }

    /// Record the login verdict.
    pub fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::Release);
    }

    /// Frames received since startup.
    #[must_use]
    pub fn frames_received(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Link
// =============================================================================

/// Upstream link settings.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// `ws://` or `wss://` address.
    pub url: String,
    /// Login sent once after connecting.
    pub credentials: Credentials,
    /// Keep-alive timing.
    pub keepalive: KeepAliveConfig,
    /// Recompute period.
    pub recompute_interval: Duration,
}

/// The upstream connection and the hub loop that owns the risk model.
#[derive(Debug)]
pub struct UpstreamLink {
    config: UpstreamConfig,
    dispatcher: Dispatcher,
    requests: mpsc::Receiver<OutboundRequest>,
    state: Arc<LinkState>,
}

impl UpstreamLink {
    /// Create a link. `requests` is the queue fed by viewer sessions.
    #[must_use]
    pub const fn new(
        config: UpstreamConfig,
        dispatcher: Dispatcher,
        requests: mpsc::Receiver<OutboundRequest>,
        state: Arc<LinkState>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            requests,
            state,
        }
    }

    /// Connect, log in and run the hub loop until the link fails.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamError` on any connect, read or write failure, a
    /// missed read deadline, or a rejected login.
    pub async fn run(mut self) -> Result<(), UpstreamError> {
        tracing::info!(url = %self.config.url, "Connecting to upstream");
        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.config.url.as_str())
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        self.state.set_connected(true);
        tracing::info!("Upstream connected");

        let (mut write, read) = ws_stream.split();
        let heartbeat = Arc::new(HeartbeatState::new());
        let (frames_tx, frames) = mpsc::channel(FRAME_BUFFER);
        let reader = tokio::spawn(read_loop(
            read,
            frames_tx,
            Arc::clone(&heartbeat),
            self.config.keepalive.pong_wait,
        ));

        let result = self.hub_loop(&mut write, frames, &heartbeat).await;

        reader.abort();
        self.state.set_connected(false);
        self.state.set_logged_in(false);
        metrics::set_upstream_logged_in(false);
        result
    }

    async fn hub_loop<W>(
        &mut self,
        write: &mut W,
        mut frames: mpsc::Receiver<Result<String, UpstreamError>>,
        heartbeat: &HeartbeatState,
    ) -> Result<(), UpstreamError>
    where
        W: Sink<Message> + Unpin,
        W::Error: Display,
    {
        let wait = self.config.keepalive.write_wait;
        let login = UpstreamRequest::Login {
            username: self.config.credentials.username().to_string(),
            password: self.config.credentials.password().to_string(),
        };
        send_request(write, &login, wait).await?;

        let now = tokio::time::Instant::now();
        let interval = self.config.recompute_interval;
        let mut recompute = tokio::time::interval_at(now + interval, interval);
        recompute.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let period = self.config.keepalive.ping_period();
        let mut ping = tokio::time::interval_at(now + period, period);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let text = match frame {
                        Some(Ok(text)) => text,
                        Some(Err(e)) => return Err(e),
                        None => return Err(UpstreamError::Closed),
                    };
                    for request in self.on_frame(&text).await? {
                        send_request(write, &request, wait).await?;
                    }
                }
                Some(request) = self.requests.recv() => match request {
                    OutboundRequest::Upstream(request) => {
                        send_request(write, &request, wait).await?;
                    }
                    OutboundRequest::Correlated { token, action } => {
                        self.dispatcher.serve(token, action).await;
                    }
                },
                _ = recompute.tick() => {
                    self.dispatcher.recompute(chrono::Utc::now().timestamp_millis()).await;
                }
                _ = ping.tick() => {
                    heartbeat.mark_ping_sent();
                    send_message(write, Message::Ping(Vec::<u8>::new().into()), wait).await?;
                }
            }
        }
    }

    async fn on_frame(&mut self, text: &str) -> Result<Vec<UpstreamRequest>, UpstreamError> {
        self.state.record_frame();
        match decode_upstream(text) {
            Ok(message) => {
                metrics::record_upstream_frame(message.kind());
                self.dispatcher.on_upstream(message).await
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed upstream frame");
                metrics::record_upstream_frame_rejected();
                Ok(Vec::new())
            }
        }
    }
}

async fn read_loop<R, E>(
    mut read: R,
    frames: mpsc::Sender<Result<String, UpstreamError>>,
    heartbeat: Arc<HeartbeatState>,
    pong_wait: Duration,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let deadline = heartbeat.read_deadline(pong_wait);
        let outcome = match tokio::time::timeout_at(deadline, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                heartbeat.record_pong();
                Ok(text.as_str().to_owned())
            }
            Ok(Some(Ok(Message::Close(_))) | None) => Err(UpstreamError::Closed),
            Ok(Some(Ok(_))) => {
                heartbeat.record_pong();
                continue;
            }
            Ok(Some(Err(e))) => Err(UpstreamError::Read(e.to_string())),
            Err(_) => Err(UpstreamError::ReadTimeout(pong_wait)),
        };

        let fatal = outcome.is_err();
        if frames.send(outcome).await.is_err() || fatal {
            break;
        }
    }
}

async fn send_request<W>(
    write: &mut W,
    request: &UpstreamRequest,
    wait: Duration,
) -> Result<(), UpstreamError>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    send_message(write, Message::Text(encode_request(request).into()), wait).await
}

async fn send_message<W>(
    write: &mut W,
    message: Message,
    wait: Duration,
) -> Result<(), UpstreamError>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    match tokio::time::timeout(wait, write.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(UpstreamError::Write(e.to_string())),
        Err(_) => Err(UpstreamError::WriteTimeout),
    }
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;

    #[tokio::test]
    async fn reader_forwards_text_and_stops_on_close() {
        let frames = vec![
            Ok::<_, String>(Message::Text(r#"["md"]"#.into())),
            Ok(Message::Pong(Vec::<u8>::new().into())),
            Ok(Message::Text(r#"["pnl"]"#.into())),
            Ok(Message::Close(None)),
            Ok(Message::Text(r#"["never"]"#.into())),
        ];
        let (tx, mut rx) = mpsc::channel(8);
        read_loop(
            stream::iter(frames),
            tx,
            Arc::new(HeartbeatState::new()),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(rx.recv().await.unwrap().unwrap(), r#"["md"]"#);
        assert_eq!(rx.recv().await.unwrap().unwrap(), r#"["pnl"]"#);
        assert!(matches!(rx.recv().await, Some(Err(UpstreamError::Closed))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn reader_reports_transport_errors() {
        let frames = vec![Err::<Message, _>("reset by peer".to_string())];
        let (tx, mut rx) = mpsc::channel(8);
        read_loop(
            stream::iter(frames),
            tx,
            Arc::new(HeartbeatState::new()),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(
            rx.recv().await,
            Some(Err(UpstreamError::Read(reason))) if reason == "reset by peer"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reader_times_out_on_silence() {
        let (tx, mut rx) = mpsc::channel(8);
        read_loop(
            stream::pending::<Result<Message, String>>(),
            tx,
            Arc::new(HeartbeatState::new()),
            Duration::from_secs(60),
        )
        .await;
        assert!(matches!(
            rx.recv().await,
            Some(Err(UpstreamError::ReadTimeout(_)))
        ));
    }

    #[tokio::test]
    async fn requests_are_written_as_text_frames() {
        let (mut sink, mut written) = futures::channel::mpsc::unbounded::<Message>();
        send_request(&mut sink, &UpstreamRequest::Offline, Duration::from_secs(1))
            .await
            .unwrap();
        let Some(Message::Text(text)) = written.next().await else {
            panic!("expected a text frame");
        };
        assert_eq!(text.as_str(), r#"["offline",0]"#);
    }

    #[test]
    fn link_state_flags() {
        let state = LinkState::new();
        assert!(!state.is_connected());
        state.set_connected(true);
        state.set_logged_in(true);
        state.record_frame();
        assert!(state.is_connected() && state.is_logged_in());
        assert_eq!(state.frames_received(), 1);
    }
}
