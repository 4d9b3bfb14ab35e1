//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the transports, the hub loop and the concrete
//! implementations of the port interfaces defined in the application layer.

/// Upstream trading-server link and hub dispatch.
pub mod upstream;

/// Viewer WebSocket sessions and their registry.
pub mod viewer;

/// Report fan-out to live sessions.
pub mod scheduler;

/// HTTP server: viewer socket, health and metrics.
pub mod http;

/// Keep-alive timing and read deadlines.
pub mod heartbeat;

/// Local directory file store.
pub mod storage;

/// Python script runtime.
pub mod scripting;

/// Configuration and dependency injection.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
