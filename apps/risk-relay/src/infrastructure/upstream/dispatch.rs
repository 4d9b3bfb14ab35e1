//! Hub Dispatch
//!
//! Owns the risk model. Every upstream frame, every correlated viewer action
//! and every recompute pass runs through here on the link's task, so the
//! model is never shared across tasks.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::application::ports::{FileStore, FileStoreError, ScriptRuntime};
use crate::application::services::{HistoryLookup, PortfolioBuilder, RiskModel};
use crate::domain::market::UserId;
use crate::domain::portfolio::{PORTFOLIO_EXTENSION, portfolio_name};
use crate::infrastructure::metrics;
use crate::infrastructure::scheduler;
use crate::infrastructure::upstream::codec::Envelope;
use crate::infrastructure::upstream::messages::{CONNECTION_OK, UpstreamMessage, UpstreamRequest};
use crate::infrastructure::upstream::{LinkState, UpstreamError};
use crate::infrastructure::viewer::{ConnectionToken, SessionRegistry, ViewerAction};

/// Tag of the file listing sent after a viewer login is accepted.
pub const RISK_FILES_TAG: &str = "riskFiles";

/// Applies upstream frames and viewer actions to the risk model.
pub struct Dispatcher {
    model: RiskModel,
    registry: Arc<SessionRegistry>,
    files: Arc<dyn FileStore>,
    scripts: Arc<dyn ScriptRuntime>,
    builder: PortfolioBuilder,
    admin_user: Option<UserId>,
    state: Arc<LinkState>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("securities", &self.model.security_count())
            .field("admin_user", &self.admin_user)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher around `model`.
    #[must_use]
    pub fn new(
        model: RiskModel,
        registry: Arc<SessionRegistry>,
        files: Arc<dyn FileStore>,
        scripts: Arc<dyn ScriptRuntime>,
        admin_user: Option<UserId>,
        state: Arc<LinkState>,
    ) -> Self {
        let builder = PortfolioBuilder::new(Arc::clone(&scripts), Arc::clone(&files));
        Self {
            model,
            registry,
            files,
            scripts,
            builder,
            admin_user,
            state,
        }
    }

    /// The risk model.
    #[must_use]
    pub const fn model(&self) -> &RiskModel {
        &self.model
    }

    /// Compile every user's `.ini` files. Files that fail are skipped.
    pub async fn load_portfolios(&mut self) -> usize {
        let users = match self.files.users().await {
            Ok(users) => users,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list users in file store");
                return 0;
            }
        };

        let mut loaded = 0;
        for user in users {
            let files = match self.files.list(user).await {
                Ok(files) => files,
                Err(e) => {
                    tracing::warn!(user, error = %e, "Failed to list risk files");
                    continue;
                }
            };
            for (name, text) in files.iter().filter(|(name, _)| portfolio_name(name).is_some()) {
                match self.builder.build_file(user, name, text).await {
                    Ok(portfolio) => {
                        self.model.set_portfolio(user, portfolio);
                        loaded += 1;
                    }
                    Err(e) => tracing::warn!(user, file = %name, error = %e, "Skipping portfolio"),
                }
            }
        }
        tracing::info!(portfolios = loaded, "Loaded portfolios");
        loaded
    }

    // =========================================================================
    // Upstream Frames
    // =========================================================================

    /// Apply one upstream frame. Returns the requests to write upstream in
    /// response.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamError::LoginRejected` when the login verdict is not ok.
    pub async fn on_upstream(
        &mut self,
        message: UpstreamMessage,
    ) -> Result<Vec<UpstreamRequest>, UpstreamError> {
        match message {
            UpstreamMessage::Connection { status, user_id } => {
                if status != CONNECTION_OK {
                    return Err(UpstreamError::LoginRejected(status));
                }
                self.state.set_logged_in(true);
                metrics::set_upstream_logged_in(true);
                tracing::info!(user_id, "Upstream login accepted");
                return Ok(vec![UpstreamRequest::Securities]);
            }
            UpstreamMessage::Security(security) => self.model.upsert_security(*security),
            UpstreamMessage::Securities(securities) => {
                let count = securities.len();
                for security in securities {
                    self.model.upsert_security(security);
                }
                tracing::info!(count, "Security master loaded");
                return Ok(UpstreamRequest::bootstrap());
            }
            UpstreamMessage::Bod(records) => self.model.apply_bod(records),
            UpstreamMessage::Pnl(records) => self.model.apply_pnl(records),
            UpstreamMessage::Offline(events) => {
                tracing::debug!(count = events.len(), "Replaying offline orders");
                for event in &events {
                    self.model.apply_order(event);
                }
            }
            UpstreamMessage::Order(event) => self.model.apply_order(&event),
            UpstreamMessage::MarketData(updates) => self.model.apply_market_data(&updates),
            UpstreamMessage::Target(records) => self.model.apply_targets(records),
            UpstreamMessage::UserSubAccount { user_id, accounts } => {
                self.model.set_user_accounts(user_id, accounts);
            }
            UpstreamMessage::UserValidation { user_id, token } => {
                self.validate_user(user_id, token).await;
            }
            UpstreamMessage::Correlated { action, token } => self.serve(token, action).await,
            UpstreamMessage::Reserved(tag) => tracing::trace!(tag, "Ignoring reserved tag"),
            UpstreamMessage::Unrecognized { tag, raw } => self.forward_to_admin(&tag, raw).await,
        }
        Ok(Vec::new())
    }

    async fn validate_user(&self, user_id: UserId, token: ConnectionToken) {
        let Some(session) = self.registry.lookup(token) else {
            tracing::debug!(token, "Login verdict for a closed session");
            return;
        };

        if user_id <= 0 {
            tracing::info!(token, "Viewer login rejected");
            session.close();
            return;
        }

        session.bind_user(user_id);
        tracing::info!(token, user_id, "Viewer logged in");

        let listing = self.files.list(user_id).await.unwrap_or_else(|e| {
            tracing::warn!(user_id, error = %e, "Failed to list risk files");
            std::collections::BTreeMap::new()
        });
        let listing: serde_json::Map<String, Value> = listing
            .into_iter()
            .map(|(name, content)| (name, Value::String(content)))
            .collect();
        session
            .send(Envelope::encode(RISK_FILES_TAG, [Value::Object(listing)]))
            .await;
    }

    async fn forward_to_admin(&self, tag: &str, raw: String) {
        let Some(admin) = self.admin_user else {
            tracing::debug!(tag, "Unhandled upstream frame");
            return;
        };
        for session in self.registry.snapshot() {
            if session.user_id() == admin {
                session.send(raw.clone()).await;
            }
        }
    }

    // =========================================================================
    // Correlated Actions
    // =========================================================================

    /// Answer a file or history action for the session `token`. Unknown
    /// sessions are dropped silently.
    pub async fn serve(&mut self, token: ConnectionToken, action: ViewerAction) {
        let Some(session) = self.registry.lookup(token) else {
            tracing::debug!(token, action = action.tag(), "Dropping action for closed session");
            return;
        };
        let user = session.user_id();
        let tag = action.tag();

        let reply = match action {
            ViewerAction::RiskFile { name } => match self.files.get(user, &name).await {
                Ok(content) => Envelope::encode(tag, [Value::from(name), Value::from(content)]),
                Err(e) => Envelope::encode(
                    tag,
                    [Value::from(name), Value::Null, Value::from(e.to_string())],
                ),
            },
            ViewerAction::SaveRiskFile { name, content } => {
                let result = self.save(user, &name, &content).await;
                file_reply(tag, name, result)
            }
            ViewerAction::DeleteRiskFile { name } => {
                let result = self.delete(user, &name).await;
                file_reply(tag, name, result)
            }
            ViewerAction::HistoricalRisk {
                portfolio,
                risk,
                param,
            } => {
                let mut args = vec![
                    Value::from(portfolio.as_str()),
                    Value::from(risk.as_str()),
                    Value::from(param.as_str()),
                ];
                match self.model.history(user, &portfolio, &risk, &param) {
                    None => {
                        tracing::debug!(token, user, portfolio, "History for unknown portfolio");
                        return;
                    }
                    Some(HistoryLookup::Found(history)) => match serde_json::to_value(history) {
                        Ok(history) => args.push(history),
                        Err(e) => tracing::error!(error = %e, "Failed to serialize history"),
                    },
                    Some(HistoryLookup::NothingToAttach) => {}
                }
                Envelope::encode(tag, args)
            }
        };

        session.send(reply).await;
    }

    /// Portfolios are compiled before anything is written, so a rejected
    /// `.ini` leaves the stored file and the model untouched.
    async fn save(&mut self, user: UserId, name: &str, content: &str) -> Result<(), String> {
        let portfolio = if name.ends_with(PORTFOLIO_EXTENSION) {
            let portfolio = self
                .builder
                .build_file(user, name, content)
                .await
                .map_err(|e| e.to_string())?;
            Some(portfolio)
        } else {
            None
        };

        self.files
            .put(user, name, content)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(portfolio) = portfolio {
            tracing::info!(user, portfolio = %portfolio.name, "Portfolio rebuilt");
            self.model.set_portfolio(user, portfolio);
        }
        Ok(())
    }

    async fn delete(&mut self, user: UserId, name: &str) -> Result<(), String> {
        self.files
            .delete(user, name)
            .await
            .map_err(|e: FileStoreError| e.to_string())?;

        if let Some(portfolio) = portfolio_name(name)
            && self.model.remove_portfolio(user, portfolio)
        {
            tracing::info!(user, portfolio, "Portfolio removed");
        }
        Ok(())
    }

    // =========================================================================
    // Recompute
    // =========================================================================

    /// Recompute every portfolio and push reports to live sessions.
    pub async fn recompute(&mut self, now_ms: i64) -> u64 {
        let started = Instant::now();
        let reports = self
            .model
            .recompute(self.scripts.as_ref(), self.files.as_ref(), now_ms)
            .await;
        let delivered = scheduler::push_reports(&self.registry, &reports).await;
        metrics::record_recompute(started.elapsed(), delivered);
        delivered
    }
}

fn file_reply(tag: &str, name: String, result: Result<(), String>) -> String {
    match result {
        Ok(()) => Envelope::encode(tag, [Value::from(name)]),
        Err(message) => Envelope::encode(tag, [Value::from(name), Value::from(message)]),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::application::ports::MockScriptRuntime;
    use crate::domain::market::{BodRecord, PositionSnapshot, Security};
    use crate::infrastructure::storage::LocalFileStore;

    const PORTFOLIO: &str = "[Exposure]\ngross = sum(abs(Pos * Close))\ngraph = gross\n";

    struct Fixture {
        dispatcher: Dispatcher,
        registry: Arc<SessionRegistry>,
        state: Arc<LinkState>,
        dir: tempfile::TempDir,
    }

    fn fixture(admin_user: Option<UserId>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let state = Arc::new(LinkState::new());
        let dispatcher = Dispatcher::new(
            RiskModel::default(),
            Arc::clone(&registry),
            Arc::new(LocalFileStore::new(dir.path())),
            Arc::new(MockScriptRuntime::new()),
            admin_user,
            Arc::clone(&state),
        );
        Fixture {
            dispatcher,
            registry,
            state,
            dir,
        }
    }

    fn parse(frame: &str) -> Value {
        serde_json::from_str(frame).unwrap()
    }

    #[tokio::test]
    async fn login_verdicts() {
        let mut f = fixture(None);
        let ok = UpstreamMessage::Connection {
            status: "ok".into(),
            user_id: Some(1),
        };
        assert_eq!(
            f.dispatcher.on_upstream(ok).await.unwrap(),
            vec![UpstreamRequest::Securities]
        );
        assert!(f.state.is_logged_in());

        let denied = UpstreamMessage::Connection {
            status: "invalid password".into(),
            user_id: None,
        };
        assert!(matches!(
            f.dispatcher.on_upstream(denied).await,
            Err(UpstreamError::LoginRejected(status)) if status == "invalid password"
        ));
    }

    #[tokio::test]
    async fn securities_bootstrap_state() {
        let mut f = fixture(None);
        let securities = vec![
            Security {
                id: 1,
                symbol: "AAA".into(),
                ..Security::default()
            },
            Security {
                id: 2,
                symbol: "BBB".into(),
                ..Security::default()
            },
        ];
        let replies = f
            .dispatcher
            .on_upstream(UpstreamMessage::Securities(securities))
            .await
            .unwrap();
        assert_eq!(replies, UpstreamRequest::bootstrap());
        assert_eq!(f.dispatcher.model().security_count(), 2);

        let bod = vec![BodRecord {
            acc: 1,
            security: 2,
            snapshot: PositionSnapshot {
                qty: 100.0,
                avg_px: 10.0,
                ..PositionSnapshot::default()
            },
        }];
        f.dispatcher.on_upstream(UpstreamMessage::Bod(bod)).await.unwrap();
        assert!((f.dispatcher.model().position(1, 2).unwrap().qty - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn accepted_login_binds_user_and_lists_files() {
        let mut f = fixture(None);
        std::fs::create_dir_all(f.dir.path().join("5")).unwrap();
        std::fs::write(f.dir.path().join("5/P.ini"), PORTFOLIO).unwrap();
        let (session, mut rx) = f.registry.register();

        f.dispatcher
            .on_upstream(UpstreamMessage::UserValidation {
                user_id: 5,
                token: session.token(),
            })
            .await
            .unwrap();

        assert_eq!(session.user_id(), 5);
        assert_eq!(
            parse(&rx.recv().await.unwrap()),
            json!(["riskFiles", {"P.ini": PORTFOLIO}])
        );
    }

    #[tokio::test]
    async fn rejected_login_closes_session() {
        let mut f = fixture(None);
        let (session, _rx) = f.registry.register();
        f.dispatcher
            .on_upstream(UpstreamMessage::UserValidation {
                user_id: 0,
                token: session.token(),
            })
            .await
            .unwrap();
        assert!(session.closer().is_cancelled());
        assert_eq!(session.user_id(), 0);
    }

    #[tokio::test]
    async fn save_history_and_delete_of_a_portfolio() {
        let mut f = fixture(None);
        let (session, mut rx) = f.registry.register();
        session.bind_user(5);
        let token = session.token();

        f.dispatcher
            .serve(
                token,
                ViewerAction::SaveRiskFile {
                    name: "P.ini".into(),
                    content: PORTFOLIO.into(),
                },
            )
            .await;
        assert_eq!(parse(&rx.recv().await.unwrap()), json!(["saveRiskFile", "P.ini"]));
        assert!(f.dir.path().join("5/P.ini").exists());

        f.dispatcher.recompute(1_000).await;
        assert_eq!(
            parse(&rx.recv().await.unwrap())[0],
            json!("risk")
        );

        f.dispatcher
            .serve(
                token,
                ViewerAction::HistoricalRisk {
                    portfolio: "P".into(),
                    risk: "Exposure".into(),
                    param: "gross".into(),
                },
            )
            .await;
        assert_eq!(
            parse(&rx.recv().await.unwrap()),
            json!(["historicalRisk", "P", "Exposure", "gross", [[1000, 0.0]]])
        );

        f.dispatcher
            .serve(
                token,
                ViewerAction::HistoricalRisk {
                    portfolio: "P".into(),
                    risk: "Exposure".into(),
                    param: "missing".into(),
                },
            )
            .await;
        assert_eq!(
            parse(&rx.recv().await.unwrap()),
            json!(["historicalRisk", "P", "Exposure", "missing"])
        );

        f.dispatcher
            .serve(token, ViewerAction::DeleteRiskFile { name: "P.ini".into() })
            .await;
        assert_eq!(parse(&rx.recv().await.unwrap()), json!(["deleteRiskFile", "P.ini"]));
        assert!(f.dispatcher.model().portfolios(5).is_none());
    }

    #[tokio::test]
    async fn rejected_portfolio_save_writes_nothing() {
        let mut f = fixture(None);
        std::fs::create_dir_all(f.dir.path().join("5")).unwrap();
        std::fs::write(f.dir.path().join("5/Kept.ini"), PORTFOLIO).unwrap();
        let (session, mut rx) = f.registry.register();
        session.bind_user(5);

        f.dispatcher
            .serve(
                session.token(),
                ViewerAction::SaveRiskFile {
                    name: "P.ini".into(),
                    content: "[A]\nx = nope\n".into(),
                },
            )
            .await;
        let reply = parse(&rx.recv().await.unwrap());
        assert_eq!(reply[0], "saveRiskFile");
        assert_eq!(reply[1], "P.ini");
        assert!(reply[2].as_str().unwrap().contains("invalid x expression on line 2"));
        assert!(!f.dir.path().join("5/P.ini").exists());

        // Overwriting a good file with a bad one keeps the good content.
        f.dispatcher
            .serve(
                session.token(),
                ViewerAction::SaveRiskFile {
                    name: "Kept.ini".into(),
                    content: "[A]\nx = nope\n".into(),
                },
            )
            .await;
        assert_eq!(parse(&rx.recv().await.unwrap()).as_array().unwrap().len(), 3);
        assert_eq!(
            std::fs::read_to_string(f.dir.path().join("5/Kept.ini")).unwrap(),
            PORTFOLIO
        );
        assert!(f.dispatcher.model().portfolios(5).is_none());
    }

    #[tokio::test]
    async fn file_errors_are_reported() {
        let mut f = fixture(None);
        let (session, mut rx) = f.registry.register();
        session.bind_user(5);

        f.dispatcher
            .serve(session.token(), ViewerAction::RiskFile { name: "nope.ini".into() })
            .await;
        let reply = parse(&rx.recv().await.unwrap());
        assert_eq!(reply[0], "riskFile");
        assert_eq!(reply[1], "nope.ini");
        assert!(reply[2].is_null());
        assert!(reply[3].as_str().unwrap().contains("not found"));

        f.dispatcher
            .serve(session.token(), ViewerAction::DeleteRiskFile { name: "nope.ini".into() })
            .await;
        let reply = parse(&rx.recv().await.unwrap());
        assert_eq!(reply.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn history_for_unknown_portfolio_is_dropped() {
        let mut f = fixture(None);
        let (session, mut rx) = f.registry.register();
        session.bind_user(5);
        f.dispatcher
            .serve(
                session.token(),
                ViewerAction::HistoricalRisk {
                    portfolio: "P".into(),
                    risk: "R".into(),
                    param: "x".into(),
                },
            )
            .await;
        assert!(rx.try_recv().is_err());

        // Unknown token: nothing to answer and nothing to fail.
        f.dispatcher
            .serve(999, ViewerAction::RiskFile { name: "a.ini".into() })
            .await;
    }

    #[tokio::test]
    async fn unrecognized_frames_reach_only_the_admin() {
        let mut f = fixture(Some(1));
        let (admin, mut admin_rx) = f.registry.register();
        let (other, mut other_rx) = f.registry.register();
        admin.bind_user(1);
        other.bind_user(2);

        let raw = r#"["algo_status", 3]"#.to_string();
        f.dispatcher
            .on_upstream(UpstreamMessage::Unrecognized {
                tag: "algo_status".into(),
                raw: raw.clone(),
            })
            .await
            .unwrap();

        assert_eq!(admin_rx.recv().await.unwrap(), raw);
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn startup_loads_stored_portfolios() {
        let mut f = fixture(None);
        std::fs::create_dir_all(f.dir.path().join("5")).unwrap();
        std::fs::write(f.dir.path().join("5/P.ini"), PORTFOLIO).unwrap();
        std::fs::write(f.dir.path().join("5/Bad.ini"), "[A]\nx = nope\n").unwrap();
        std::fs::write(f.dir.path().join("5/model.py"), "def f(p): return 1\n").unwrap();

        assert_eq!(f.dispatcher.load_portfolios().await, 1);
        let names: Vec<_> = f.dispatcher.model().portfolios(5).unwrap().keys().cloned().collect();
        assert_eq!(names, vec!["P"]);
    }
}
