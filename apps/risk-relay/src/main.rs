//! Risk Relay Binary
//!
//! Starts the risk monitoring relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin risk-relay
//! ```
//!
//! # Environment Variables
//!
//! - `RISK_RELAY_ADDR`: HTTP/WebSocket bind address (default: 0.0.0.0:9113)
//! - `RISK_RELAY_UPSTREAM_URL`: Upstream trading server (default: ws://localhost:9111/)
//! - `RISK_RELAY_USERNAME` / `RISK_RELAY_PASSWORD`: Upstream login (default: admin / test)
//! - `RISK_RELAY_DATA_DIR`: Per-user risk file root (default: store)
//! - `RISK_RELAY_PYTHON`: Script interpreter (default: python3)
//! - `RISK_RELAY_ADMIN_USER_ID`: User that receives unrecognized upstream frames
//! - `RISK_RELAY_WRITE_WAIT_SECS`, `RISK_RELAY_PONG_WAIT_SECS`: Keep-alive (default: 10, 60)
//! - `RISK_RELAY_RECOMPUTE_INTERVAL_MS`: Recompute period (default: 1000)
//! - `RISK_RELAY_HISTORY_LIMIT`: Points kept per graph param (default: 86400)
//! - `RISK_RELAY_REQUEST_QUEUE`: Viewer request queue capacity (default: 1024)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`: Tracing export
//! - `RUST_LOG`: Log level (default: info)

use anyhow::Context;
use risk_relay::{Relay, RelayConfig, init_metrics, init_telemetry};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv_from_ancestors();

    let _telemetry_guard = init_telemetry();

    tracing::info!("Starting Risk Relay");

    let _metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let config = RelayConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    let relay = Relay::from_config(&config, shutdown_token.clone()).await?;

    let server = relay.server;
    tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tokio::select! {
        result = relay.link.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Upstream link failed");
                std::process::exit(1);
            }
        }
        () = await_shutdown() => {}
    }

    shutdown_token.cancel();
    tracing::info!("Risk relay stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        addr = %config.addr,
        upstream = %config.upstream_url,
        data_dir = %config.data_dir.display(),
        admin_user_id = ?config.admin_user_id,
        recompute_ms = config.recompute_interval.as_millis(),
        "Configuration loaded"
    );
    tracing::debug!(
        credentials = ?config.credentials,
        python = %config.python,
        history_limit = config.history_limit,
        "Relay settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for SIGTERM or SIGINT.
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
