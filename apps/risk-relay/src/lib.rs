#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Risk Relay - Risk Monitoring Hub
//!
//! Keeps one WebSocket link to an upstream trading server, maintains live
//! positions from its event stream, recomputes user-defined risk formulas
//! every second and pushes the results to many browser viewers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Risk model types and the formula engine
//!   - `config_tree`: Nested `key = value` documents risk files are written in
//!   - `expression`: Formula compiler, evaluator and aggregates
//!   - `market`: Securities, positions and upstream event payloads
//!   - `portfolio`: Compiled portfolios, history and reports
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: File store and script runtime interfaces
//!   - `services`: Portfolio construction and the risk model
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `upstream`: Upstream link, codec and hub dispatch
//!   - `viewer`: Viewer sessions and the connection registry
//!   - `scheduler`: Report fan-out
//!   - `http`: Viewer socket, health and metrics endpoints
//!   - `storage`, `scripting`: Collaborator implementations
//!   - `config`: Configuration and dependency injection
//!
//! # Data Flow
//!
//! ```text
//!                     ┌──────────────────────┐
//! Upstream WS ◄──────►│  Hub loop            │
//!                     │  (risk model owner)  │──► ["risk", report] ──► Viewer 1
//!                     └──────────▲───────────┘                    ──► Viewer N
//!                                │ shared request queue
//!                     Viewer sessions (login, files, history)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Risk model types and the formula engine.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::expression::{Expression, ExpressionBody, ExpressionError, Value, ValueKind};
pub use domain::portfolio::{ParamValue, Portfolio, PortfolioError, UserReport};

// Application
pub use application::ports::{CallValue, FileStore, FileStoreError, ScriptError, ScriptRuntime};
pub use application::services::{PortfolioBuilder, RiskModel};

// Infrastructure config
pub use infrastructure::config::{ConfigError, Credentials, Relay, RelayConfig};

// Servers and links (for integration tests)
pub use infrastructure::http::{AppState, HttpServer, HttpServerError, router};
pub use infrastructure::storage::LocalFileStore;
pub use infrastructure::upstream::{LinkState, UpstreamError, UpstreamLink};
pub use infrastructure::viewer::{ConnectionToken, SessionRegistry};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
