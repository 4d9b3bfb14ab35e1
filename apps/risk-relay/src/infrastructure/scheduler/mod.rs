//! Report Fan-out
//!
//! Pushes each recompute pass's reports to live sessions. Sessions are
//! visited in token order and every send waits for that session's send loop,
//! so a slow viewer delays the viewers after it and the next pass.

use std::collections::BTreeMap;

use crate::domain::market::UserId;
use crate::domain::portfolio::UserReport;
use crate::infrastructure::upstream::codec::Envelope;
use crate::infrastructure::viewer::SessionRegistry;

/// Tag of the report envelope.
pub const REPORT_TAG: &str = "risk";

/// Send `["risk", report]` to every session whose user has a report.
/// Returns the number of sessions that took a report.
pub async fn push_reports(
    registry: &SessionRegistry,
    reports: &BTreeMap<UserId, UserReport>,
) -> u64 {
    if reports.is_empty() {
        return 0;
    }

    let mut frames: BTreeMap<UserId, String> = BTreeMap::new();
    let mut delivered = 0;
    for session in registry.snapshot() {
        let user = session.user_id();
        let Some(report) = reports.get(&user) else {
            continue;
        };

        let frame = match frames.get(&user) {
            Some(frame) => frame.clone(),
            None => match serde_json::to_value(report) {
                Ok(value) => {
                    let frame = Envelope::encode(REPORT_TAG, [value]);
                    frames.insert(user, frame.clone());
                    frame
                }
                Err(e) => {
                    tracing::error!(user, error = %e, "Failed to serialize risk report");
                    continue;
                }
            },
        };

        if session.send(frame).await {
            delivered += 1;
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;

    use super::*;
    use crate::domain::portfolio::{ParamReport, ParamValue, RiskReport};

    fn report(value: f64) -> UserReport {
        BTreeMap::from([(
            "P".to_string(),
            vec![RiskReport {
                name: "Exposure".into(),
                params: vec![ParamReport {
                    name: "gross".into(),
                    value: ParamValue::Number(value),
                }],
            }],
        )])
    }

    #[tokio::test]
    async fn pushes_only_to_users_with_reports() {
        let registry = SessionRegistry::new();
        let (alice, mut alice_rx) = registry.register();
        let (bob, mut bob_rx) = registry.register();
        let (_anon, mut anon_rx) = registry.register();
        alice.bind_user(5);
        bob.bind_user(6);

        let reports = BTreeMap::from([(5, report(2050.0))]);
        let consumer = tokio::spawn(async move { alice_rx.recv().await });

        assert_eq!(push_reports(&registry, &reports).await, 1);

        let frame: Value = serde_json::from_str(&consumer.await.unwrap().unwrap()).unwrap();
        assert_eq!(
            frame,
            serde_json::json!(["risk", {"P": [{"name": "Exposure", "params": [{"name": "gross", "value": 2050.0}]}]}])
        );
        assert!(bob_rx.try_recv().is_err());
        assert!(anon_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn nan_values_are_null_on_the_wire() {
        let registry = SessionRegistry::new();
        let (session, mut rx) = registry.register();
        session.bind_user(1);
        let reports = BTreeMap::from([(1, report(f64::NAN))]);

        assert_eq!(push_reports(&registry, &reports).await, 1);
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert!(frame[1]["P"][0]["params"][0]["value"].is_null());
    }

    #[tokio::test]
    async fn stalled_session_blocks_later_sessions() {
        let registry = SessionRegistry::new();
        let (slow, _slow_rx) = registry.register();
        let (fast, mut fast_rx) = registry.register();
        slow.bind_user(1);
        fast.bind_user(1);

        // Fill the slow session's one-slot queue so the next send waits.
        assert!(slow.send("pending".into()).await);

        let reports = BTreeMap::from([(1, report(1.0))]);
        let pass =
            tokio::time::timeout(Duration::from_millis(50), push_reports(&registry, &reports))
                .await;

        assert!(pass.is_err(), "fan-out is sequential and waits on the slow session");
        assert!(fast_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_sessions_are_not_counted() {
        let registry = SessionRegistry::new();
        let (session, rx) = registry.register();
        session.bind_user(3);
        drop(rx);

        let reports = BTreeMap::from([(3, report(1.0))]);
        assert_eq!(push_reports(&registry, &reports).await, 0);
    }
}
