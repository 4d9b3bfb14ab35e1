//! Relay Assembly
//!
//! Builds the shared registry, the hub queue, the dispatcher and the HTTP
//! server from a [`RelayConfig`] and the two collaborators.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{FileStore, ScriptRuntime};
use crate::application::services::{PortfolioBuilder, RiskModel};
use crate::infrastructure::config::RelayConfig;
use crate::infrastructure::http::{AppState, HttpServer, HttpServerError};
use crate::infrastructure::scripting::PythonRuntime;
use crate::infrastructure::storage::LocalFileStore;
use crate::infrastructure::upstream::{Dispatcher, LinkState, UpstreamConfig, UpstreamLink};
use crate::infrastructure::viewer::{SessionContext, SessionRegistry};

/// A fully wired relay, ready to run.
#[derive(Debug)]
pub struct Relay {
    /// Upstream connection and hub loop.
    pub link: UpstreamLink,
    /// Bound HTTP/WebSocket server.
    pub server: HttpServer,
    /// Live viewer sessions.
    pub registry: Arc<SessionRegistry>,
    /// Upstream status shared with health endpoints.
    pub link_state: Arc<LinkState>,
}

impl Relay {
    /// Wire the relay with the local file store and Python runtime.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if the listen address cannot be bound.
    pub async fn from_config(
        config: &RelayConfig,
        cancel: CancellationToken,
    ) -> Result<Self, HttpServerError> {
        let files: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(&config.data_dir));
        let scripts: Arc<dyn ScriptRuntime> = Arc::new(PythonRuntime::new(&config.python));
        Self::assemble(config, files, scripts, cancel).await
    }

    /// Wire the relay around the given collaborators. Stored portfolios are
    /// compiled before the server is bound.
    ///
    /// # Errors
    ///
    /// Returns `HttpServerError` if the listen address cannot be bound.
    pub async fn assemble(
        config: &RelayConfig,
        files: Arc<dyn FileStore>,
        scripts: Arc<dyn ScriptRuntime>,
        cancel: CancellationToken,
    ) -> Result<Self, HttpServerError> {
        let registry = Arc::new(SessionRegistry::new());
        let link_state = Arc::new(LinkState::new());
        let (requests_tx, requests_rx) = mpsc::channel(config.request_queue.max(1));

        let mut dispatcher = Dispatcher::new(
            RiskModel::new(config.history_limit),
            Arc::clone(&registry),
            Arc::clone(&files),
            Arc::clone(&scripts),
            config.admin_user_id,
            Arc::clone(&link_state),
        );
        dispatcher.load_portfolios().await;

        let sessions = Arc::new(SessionContext {
            registry: Arc::clone(&registry),
            requests: requests_tx,
            builder: PortfolioBuilder::new(Arc::clone(&scripts), files),
            scripts,
            keepalive: config.keepalive,
            scratch_dir: std::env::temp_dir(),
        });

        let state = Arc::new(AppState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            Arc::clone(&link_state),
            sessions,
        ));
        let server = HttpServer::bind(config.addr, state, cancel).await?;

        let link = UpstreamLink::new(
            UpstreamConfig {
                url: config.upstream_url.clone(),
                credentials: config.credentials.clone(),
                keepalive: config.keepalive,
                recompute_interval: config.recompute_interval,
            },
            dispatcher,
            requests_rx,
            Arc::clone(&link_state),
        );

        Ok(Self {
            link,
            server,
            registry,
            link_state,
        })
    }
}
