//! Viewer Session
//!
//! One WebSocket connection from a risk viewer. A receive loop decodes and
//! canonicalizes requests onto the shared upstream queue; a send loop drains
//! the session's outbound queue and pings the client. Either loop ending
//! cancels the session's closer, which tears down the other.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::ScriptRuntime;
use crate::application::services::PortfolioBuilder;
use crate::domain::portfolio::{PORTFOLIO_EXTENSION, SCRIPT_EXTENSION};
use crate::infrastructure::heartbeat::{HeartbeatState, KeepAliveConfig};
use crate::infrastructure::metrics::{self, ValidationKind};
use crate::infrastructure::storage::check_file_name;
use crate::infrastructure::upstream::codec::Envelope;
use crate::infrastructure::upstream::messages::{
    OutboundRequest, UpstreamRequest, VALIDATE_USER_TAG,
};
use crate::infrastructure::viewer::messages::{ViewerAction, ViewerRequest};
use crate::infrastructure::viewer::registry::{ConnectionToken, SessionHandle, SessionRegistry};

/// Everything a session needs from the rest of the relay.
pub struct SessionContext {
    /// Live sessions.
    pub registry: Arc<SessionRegistry>,
    /// Shared queue read by the hub loop.
    pub requests: mpsc::Sender<OutboundRequest>,
    /// Syntax checker for `.py` saves.
    pub scripts: Arc<dyn ScriptRuntime>,
    /// Portfolio compiler for `.ini` saves.
    pub builder: PortfolioBuilder,
    /// Keep-alive timing.
    pub keepalive: KeepAliveConfig,
    /// Where scripts are written for the syntax check.
    pub scratch_dir: PathBuf,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("sessions", &self.registry.len())
            .field("keepalive", &self.keepalive)
            .field("scratch_dir", &self.scratch_dir)
            .finish_non_exhaustive()
    }
}

/// Serve one upgraded viewer connection until it closes.
pub async fn run_session(socket: WebSocket, ctx: Arc<SessionContext>) {
    let (session, outbound) = ctx.registry.register();
    let token = session.token();
    metrics::set_viewer_sessions(ctx.registry.len());
    tracing::info!(token, "Viewer connected");

    let (sink, stream) = socket.split();
    let heartbeat = Arc::new(HeartbeatState::new());

    let sender = tokio::spawn(send_loop(
        sink,
        outbound,
        Arc::clone(&heartbeat),
        ctx.keepalive,
        session.closer(),
        token,
    ));

    let canonicalizer = RequestCanonicalizer::new(&ctx, &session);
    receive_loop(
        stream,
        &canonicalizer,
        &heartbeat,
        ctx.keepalive.pong_wait,
        &session.closer(),
    )
    .await;

    session.close();
    let _ = sender.await;
    ctx.registry.unregister(token);
    metrics::set_viewer_sessions(ctx.registry.len());
    tracing::info!(token, user_id = session.user_id(), "Viewer disconnected");
}

// =============================================================================
// Loops
// =============================================================================

async fn send_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    heartbeat: Arc<HeartbeatState>,
    keepalive: KeepAliveConfig,
    closer: CancellationToken,
    token: ConnectionToken,
) {
    let period = keepalive.ping_period();
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let result = tokio::select! {
            () = closer.cancelled() => {
                let _ = tokio::time::timeout(keepalive.write_wait, sink.send(Message::Close(None)))
                    .await;
                break;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                write(&mut sink, Message::Text(frame.into()), keepalive).await
            }
            _ = ping.tick() => {
                heartbeat.mark_ping_sent();
                write(&mut sink, Message::Ping(Vec::<u8>::new().into()), keepalive).await
            }
        };

        if let Err(reason) = result {
            tracing::debug!(token, reason, "Viewer write failed");
            break;
        }
    }

    closer.cancel();
}

async fn write(
    sink: &mut SplitSink<WebSocket, Message>,
    message: Message,
    keepalive: KeepAliveConfig,
) -> Result<(), &'static str> {
    match tokio::time::timeout(keepalive.write_wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err("transport error"),
        Err(_) => Err("write deadline exceeded"),
    }
}

async fn receive_loop(
    mut stream: SplitStream<WebSocket>,
    canonicalizer: &RequestCanonicalizer<'_>,
    heartbeat: &HeartbeatState,
    pong_wait: std::time::Duration,
    closer: &CancellationToken,
) {
    let token = canonicalizer.session.token();
    loop {
        let deadline = heartbeat.read_deadline(pong_wait);
        let frame = tokio::select! {
            () = closer.cancelled() => break,
            frame = tokio::time::timeout_at(deadline, stream.next()) => frame,
        };

        match frame {
            Ok(Some(Ok(Message::Text(text)))) => {
                heartbeat.record_pong();
                canonicalizer.handle(text.as_str()).await;
            }
            Ok(Some(Ok(Message::Pong(_) | Message::Ping(_) | Message::Binary(_)))) => {
                heartbeat.record_pong();
            }
            Ok(Some(Ok(Message::Close(_))) | None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(token, error = %e, "Viewer read failed");
                break;
            }
            Err(_) => {
                tracing::info!(token, "Viewer read deadline exceeded");
                break;
            }
        }
    }
}

// =============================================================================
// Request Canonicalization
// =============================================================================

/// Turns one session's frames into hub requests.
///
/// Logins are rewritten to the upstream auth check. Saves of `.py` and
/// `.ini` files are validated locally first and answered with an error
/// envelope on failure, without reaching the hub.
pub struct RequestCanonicalizer<'a> {
    ctx: &'a SessionContext,
    session: &'a SessionHandle,
}

impl<'a> RequestCanonicalizer<'a> {
    /// Canonicalizer for `session`.
    #[must_use]
    pub const fn new(ctx: &'a SessionContext, session: &'a SessionHandle) -> Self {
        Self { ctx, session }
    }

    /// Handle one text frame.
    pub async fn handle(&self, text: &str) {
        let token = self.session.token();
        let request = match ViewerRequest::decode(text) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(token, error = %e, "Rejected viewer frame");
                metrics::record_viewer_frame_rejected();
                return;
            }
        };

        let outbound = match request {
            ViewerRequest::Login(args) => OutboundRequest::Upstream(UpstreamRequest::Forward {
                tag: VALIDATE_USER_TAG.to_string(),
                args,
                token,
            }),
            ViewerRequest::Action(action) => {
                if let ViewerAction::SaveRiskFile { name, content } = &action
                    && let Err((kind, message)) = self.validate_save(name, content).await
                {
                    tracing::info!(token, file = %name, error = %message, "Risk file rejected");
                    metrics::record_validation_failure(kind);
                    let reply = Envelope::encode(
                        action.tag(),
                        [Value::from(name.as_str()), Value::from(message)],
                    );
                    self.session.send(reply).await;
                    return;
                }
                OutboundRequest::Correlated { token, action }
            }
            ViewerRequest::Forward { tag, args } => {
                OutboundRequest::Upstream(UpstreamRequest::Forward { tag, args, token })
            }
        };

        if self.ctx.requests.send(outbound).await.is_err() {
            tracing::warn!(token, "Hub queue closed, dropping viewer request");
        }
    }

    async fn validate_save(
        &self,
        name: &str,
        content: &str,
    ) -> Result<(), (ValidationKind, String)> {
        if name.ends_with(SCRIPT_EXTENSION) {
            self.check_script(name, content)
                .await
                .map_err(|message| (ValidationKind::Script, message))
        } else if name.ends_with(PORTFOLIO_EXTENSION) {
            self.ctx
                .builder
                .build_file(self.session.user_id(), name, content)
                .await
                .map(drop)
                .map_err(|e| (ValidationKind::Portfolio, e.to_string()))
        } else {
            Ok(())
        }
    }

    async fn check_script(&self, name: &str, content: &str) -> Result<(), String> {
        check_file_name(name).map_err(|e| e.to_string())?;
        let scratch = scratch_path(&self.ctx.scratch_dir, self.session.token(), name);

        tokio::fs::create_dir_all(&self.ctx.scratch_dir)
            .await
            .map_err(|e| e.to_string())?;
        tokio::fs::write(&scratch, content)
            .await
            .map_err(|e| e.to_string())?;

        let checked = self.ctx.scripts.check(&scratch).await;
        if let Err(e) = tokio::fs::remove_file(&scratch).await {
            tracing::warn!(path = %scratch.display(), error = %e, "Failed to remove scratch script");
        }
        checked.map_err(|e| e.to_string())
    }
}

/// `<dir>/.<token>tmp_<name>`
fn scratch_path(dir: &Path, token: ConnectionToken, name: &str) -> PathBuf {
    dir.join(format!(".{token}tmp_{name}"))
}
