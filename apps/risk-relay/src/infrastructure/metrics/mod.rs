//! Prometheus Metrics Module
//!
//! # Metrics Categories
//!
//! - **Upstream**: frames received by tag, login state
//! - **Viewers**: live sessions, rejected frames, validation failures
//! - **Recompute**: pass duration, reports delivered
//!
//! Metrics are exposed at `/metrics` on the service port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder. Later calls return the
/// handle installed by the first.
///
/// # Errors
///
/// Returns `BuildError` if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "risk_relay_upstream_frames_total",
        "Frames received from the upstream source by tag"
    );
    describe_counter!(
        "risk_relay_upstream_frames_rejected_total",
        "Upstream frames that could not be decoded"
    );
    describe_gauge!(
        "risk_relay_upstream_logged_in",
        "1 once the upstream login has been accepted"
    );

    describe_gauge!("risk_relay_viewer_sessions", "Live viewer sessions");
    describe_counter!(
        "risk_relay_viewer_frames_rejected_total",
        "Viewer frames that could not be decoded"
    );
    describe_counter!(
        "risk_relay_validation_failures_total",
        "Risk file saves rejected before reaching the store, by kind"
    );

    describe_histogram!(
        "risk_relay_recompute_seconds",
        "Duration of one recompute pass over all portfolios"
    );
    describe_counter!(
        "risk_relay_reports_delivered_total",
        "Risk reports pushed to viewer sessions"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Kinds of local validation failure.
#[derive(Debug, Clone, Copy)]
pub enum ValidationKind {
    /// Script syntax check.
    Script,
    /// Portfolio file parse or build.
    Portfolio,
}

impl ValidationKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Portfolio => "portfolio",
        }
    }
}

/// Record a frame received from upstream.
pub fn record_upstream_frame(tag: &str) {
    counter!("risk_relay_upstream_frames_total", "tag" => tag.to_string()).increment(1);
}

/// Record an undecodable upstream frame.
pub fn record_upstream_frame_rejected() {
    counter!("risk_relay_upstream_frames_rejected_total").increment(1);
}

/// Update the upstream login flag.
pub fn set_upstream_logged_in(logged_in: bool) {
    gauge!("risk_relay_upstream_logged_in").set(if logged_in { 1.0 } else { 0.0 });
}

/// Update the live session count.
#[allow(clippy::cast_precision_loss)]
pub fn set_viewer_sessions(count: usize) {
    gauge!("risk_relay_viewer_sessions").set(count as f64);
}

/// Record an undecodable viewer frame.
pub fn record_viewer_frame_rejected() {
    counter!("risk_relay_viewer_frames_rejected_total").increment(1);
}

/// Record a rejected risk file save.
pub fn record_validation_failure(kind: ValidationKind) {
    counter!("risk_relay_validation_failures_total", "kind" => kind.as_str()).increment(1);
}

/// Record one recompute pass.
pub fn record_recompute(duration: Duration, delivered: u64) {
    histogram!("risk_relay_recompute_seconds").record(duration.as_secs_f64());
    counter!("risk_relay_reports_delivered_total").increment(delivered);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_kind_as_str() {
        assert_eq!(ValidationKind::Script.as_str(), "script");
        assert_eq!(ValidationKind::Portfolio.as_str(), "portfolio");
    }

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        record_upstream_frame("md");
        set_viewer_sessions(3);
        record_recompute(Duration::from_millis(2), 1);
    }
}
