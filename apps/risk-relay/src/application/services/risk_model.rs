//! Portfolio/Risk Model
//!
//! In-memory market state (securities, positions, open orders, user
//! accounts) plus every user's compiled portfolios. The model has a single
//! owner, the upstream dispatch loop, so nothing here is synchronized.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;

use crate::application::ports::{CallValue, FileStore, ScriptRuntime};
use crate::domain::expression::{
    self, EvaluationContext, Expression, ExpressionBody, ExpressionError, Node, Value,
};
use crate::domain::market::{
    AccountId, BodRecord, MarketData, OrderEvent, OrderId, OrderStatus, PnlRecord, Position,
    Security, SecurityId, Side, TargetRecord, UserId,
};
use crate::domain::portfolio::{
    HistoryPoint, ParamReport, ParamValue, Portfolio, RiskReport, UserReport,
};

/// Default number of points kept per graph-enabled param.
pub const DEFAULT_HISTORY_LIMIT: usize = 86_400;

#[derive(Debug, Clone, Copy)]
struct OpenOrder {
    acc: AccountId,
    security: SecurityId,
    side: Side,
    leaves: f64,
}

/// Result of a history lookup for a known portfolio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HistoryLookup<'a> {
    /// Param exists and is graph-enabled.
    Found(&'a VecDeque<HistoryPoint>),
    /// Risk or param unknown, or param not graph-enabled.
    NothingToAttach,
}

/// Market state and portfolios.
#[derive(Debug)]
pub struct RiskModel {
    securities: HashMap<SecurityId, Security>,
    positions: BTreeMap<(AccountId, SecurityId), Position>,
    orders: HashMap<OrderId, OpenOrder>,
    user_accounts: HashMap<UserId, BTreeSet<AccountId>>,
    portfolios: HashMap<UserId, BTreeMap<String, Portfolio>>,
    history_limit: usize,
}

impl Default for RiskModel {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl RiskModel {
    /// Create an empty model.
    #[must_use]
    pub fn new(history_limit: usize) -> Self {
        Self {
            securities: HashMap::new(),
            positions: BTreeMap::new(),
            orders: HashMap::new(),
            user_accounts: HashMap::new(),
            portfolios: HashMap::new(),
            history_limit,
        }
    }

    // =========================================================================
    // Market updates
    // =========================================================================

    /// Insert or replace a security.
    pub fn upsert_security(&mut self, security: Security) {
        self.securities.insert(security.id, security);
    }

    /// Known security by id.
    #[must_use]
    pub fn security(&self, id: SecurityId) -> Option<&Security> {
        self.securities.get(&id)
    }

    /// Number of known securities.
    #[must_use]
    pub fn security_count(&self) -> usize {
        self.securities.len()
    }

    /// Position by account and security.
    #[must_use]
    pub fn position(&self, acc: AccountId, security: SecurityId) -> Option<&Position> {
        self.positions.get(&(acc, security))
    }

    fn position_mut(&mut self, acc: AccountId, security: SecurityId) -> &mut Position {
        self.positions
            .entry((acc, security))
            .or_insert_with(|| Position::new(acc, security))
    }

    /// Apply beginning-of-day rows, resetting current positions to them.
    pub fn apply_bod(&mut self, records: Vec<BodRecord>) {
        for record in records {
            self.position_mut(record.acc, record.security)
                .reset_to_bod(record.snapshot);
        }
    }

    /// Overwrite realized P&L and commission.
    pub fn apply_pnl(&mut self, records: Vec<PnlRecord>) {
        for record in records {
            let pos = self.position_mut(record.acc, record.security);
            pos.realized_pnl = record.realized_pnl;
            pos.commission = record.commission;
        }
    }

    /// Set target quantities.
    pub fn apply_targets(&mut self, records: Vec<TargetRecord>) {
        for record in records {
            self.position_mut(record.acc, record.security).target = record.target;
        }
    }

    /// Apply quote updates. Unknown securities are ignored.
    pub fn apply_market_data(&mut self, updates: &[MarketData]) {
        for update in updates {
            if let Some(security) = self.securities.get_mut(&update.security) {
                security.apply_quote(update);
            }
        }
    }

    /// Apply one order event.
    pub fn apply_order(&mut self, event: &OrderEvent) {
        let multiplier = self
            .securities
            .get(&event.security)
            .map_or(1.0, Security::pnl_multiplier);

        match event.status {
            OrderStatus::New => {
                if self.orders.contains_key(&event.id) {
                    return;
                }
                self.orders.insert(
                    event.id,
                    OpenOrder {
                        acc: event.acc,
                        security: event.security,
                        side: event.side,
                        leaves: event.qty,
                    },
                );
                self.position_mut(event.acc, event.security)
                    .add_outstanding(event.side, event.qty);
            }
            OrderStatus::Partial | OrderStatus::Filled => {
                let released = self.orders.get_mut(&event.id).map_or(0.0, |order| {
                    let released = event.last_qty.min(order.leaves);
                    order.leaves -= released;
                    released
                });
                let pos = self.position_mut(event.acc, event.security);
                pos.apply_fill(event.side, event.last_qty, event.last_px, multiplier);
                pos.release_outstanding(event.side, released);
                if event.status == OrderStatus::Filled {
                    self.close_order(event.id);
                }
            }
            OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Done => {
                self.close_order(event.id);
            }
        }
    }

    fn close_order(&mut self, id: OrderId) {
        if let Some(order) = self.orders.remove(&id) {
            self.position_mut(order.acc, order.security)
                .release_outstanding(order.side, order.leaves);
        }
    }

    /// Map a user to the accounts they may see.
    pub fn set_user_accounts(
        &mut self,
        user: UserId,
        accounts: impl IntoIterator<Item = AccountId>,
    ) {
        self.user_accounts.insert(user, accounts.into_iter().collect());
    }

    // =========================================================================
    // Portfolios
    // =========================================================================

    /// Insert or replace a user's portfolio.
    pub fn set_portfolio(&mut self, user: UserId, portfolio: Portfolio) {
        self.portfolios
            .entry(user)
            .or_default()
            .insert(portfolio.name.clone(), portfolio);
    }

    /// Remove a user's portfolio. Returns whether it existed.
    pub fn remove_portfolio(&mut self, user: UserId, name: &str) -> bool {
        let Some(set) = self.portfolios.get_mut(&user) else {
            return false;
        };
        let removed = set.remove(name).is_some();
        if set.is_empty() {
            self.portfolios.remove(&user);
        }
        removed
    }

    /// A user's portfolios, if any.
    #[must_use]
    pub fn portfolios(&self, user: UserId) -> Option<&BTreeMap<String, Portfolio>> {
        self.portfolios.get(&user)
    }

    /// Resolve a param's history. `None` when the user has no portfolios or
    /// the portfolio is unknown.
    #[must_use]
    pub fn history(
        &self,
        user: UserId,
        portfolio: &str,
        risk: &str,
        param: &str,
    ) -> Option<HistoryLookup<'_>> {
        let portfolio = self.portfolios.get(&user)?.get(portfolio)?;
        let found = portfolio
            .risk(risk)
            .and_then(|r| r.param(param))
            .filter(|p| p.is_graph())
            .map(|p| p.history());
        Some(found.map_or(HistoryLookup::NothingToAttach, HistoryLookup::Found))
    }

    // =========================================================================
    // Recompute
    // =========================================================================

    /// Recompute every portfolio of every user and record graph history.
    ///
    /// Users without portfolios get no report entry.
    pub async fn recompute(
        &mut self,
        scripts: &dyn ScriptRuntime,
        files: &dyn FileStore,
        now_ms: i64,
    ) -> BTreeMap<UserId, UserReport> {
        let Self {
            securities,
            positions,
            user_accounts,
            portfolios,
            history_limit,
            ..
        } = self;

        let mut reports = BTreeMap::new();
        for (user, set) in portfolios.iter_mut() {
            if set.is_empty() {
                continue;
            }
            let dir = files.user_dir(*user);
            let mut report = UserReport::new();

            for portfolio in set.values_mut() {
                let rows = select_positions(
                    positions,
                    securities,
                    user_accounts.get(user),
                    portfolio.accounts.as_ref(),
                    portfolio.filter.as_ref(),
                );

                let mut risk_reports = Vec::with_capacity(portfolio.risks.len());
                for risk in &mut portfolio.risks {
                    let mut params = Vec::with_capacity(risk.params.len());
                    for param in &mut risk.params {
                        let value = match &rows {
                            Ok(rows) => {
                                evaluate_param(param.expression(), rows, scripts, &dir).await
                            }
                            Err(e) => ParamValue::Error(e.to_string()),
                        };
                        if let ParamValue::Error(message) = &value {
                            tracing::debug!(
                                user,
                                portfolio = %portfolio.name,
                                risk = %risk.name,
                                param = param.name(),
                                error = %message,
                                "Risk param evaluation failed"
                            );
                        }
                        param.record(HistoryPoint(now_ms, value.clone()), *history_limit);
                        params.push(ParamReport {
                            name: param.name().to_string(),
                            value,
                        });
                    }
                    risk_reports.push(RiskReport {
                        name: risk.name.clone(),
                        params,
                    });
                }
                report.insert(portfolio.name.clone(), risk_reports);
            }
            reports.insert(*user, report);
        }
        reports
    }
}

/// Positions a portfolio covers, in (account, security) order.
///
/// A user with no account mapping sees every account.
fn select_positions<'a>(
    positions: &'a BTreeMap<(AccountId, SecurityId), Position>,
    securities: &'a HashMap<SecurityId, Security>,
    user_accounts: Option<&BTreeSet<AccountId>>,
    portfolio_accounts: Option<&BTreeSet<AccountId>>,
    filter: Option<&Expression>,
) -> Result<Vec<(&'a Security, &'a Position)>, ExpressionError> {
    let mut rows = Vec::new();
    for ((acc, security_id), position) in positions {
        if user_accounts.is_some_and(|a| !a.contains(acc))
            || portfolio_accounts.is_some_and(|a| !a.contains(acc))
        {
            continue;
        }
        let Some(security) = securities.get(security_id) else {
            continue;
        };
        if let Some(filter) = filter {
            match filter.evaluate(security, position)? {
                Value::Bool(true) => {}
                Value::Bool(false) => continue,
                other => {
                    return Err(ExpressionError::Eval(format!(
                        "filter must return bool, got {}",
                        other.kind()
                    )));
                }
            }
        }
        rows.push((security, position));
    }
    Ok(rows)
}

async fn evaluate_param(
    expr: &Expression,
    rows: &[(&Security, &Position)],
    scripts: &dyn ScriptRuntime,
    dir: &Path,
) -> ParamValue {
    let result = match expr.body() {
        ExpressionBody::Call(spec) => match scripts.call(spec, dir).await {
            Ok(CallValue::Number(n)) => Ok(ParamValue::Number(n)),
            Ok(CallValue::Pairs(pairs)) => Ok(ParamValue::Pairs(pairs)),
            Err(e) => Err(e.to_string()),
        },
        body => reduce(body, rows).map_err(|e| e.to_string()),
    };
    result.unwrap_or_else(ParamValue::Error)
}

fn reduce(
    body: &ExpressionBody,
    rows: &[(&Security, &Position)],
) -> Result<ParamValue, ExpressionError> {
    Ok(match body {
        ExpressionBody::Scalar(node) => ParamValue::Pairs(pairs(node, rows)?),
        ExpressionBody::Sum(node) => ParamValue::Number(expression::sum(&numbers(node, rows)?)),
        ExpressionBody::Mean(node) => {
            ParamValue::Number(expression::mean(&numbers(node, rows)?))
        }
        ExpressionBody::Std(node) => ParamValue::Number(expression::std(&numbers(node, rows)?)),
        ExpressionBody::Len(node) => {
            let mut count = 0_u32;
            for (security, position) in rows {
                match node.eval(&EvaluationContext::new(security, position))? {
                    Value::Bool(true) => count += 1,
                    Value::Bool(false) => {}
                    other => {
                        return Err(ExpressionError::Eval(format!(
                            "len condition must return bool, got {}",
                            other.kind()
                        )));
                    }
                }
            }
            ParamValue::Number(f64::from(count))
        }
        ExpressionBody::Top(node, selection) => {
            ParamValue::Pairs(selection.select(pairs(node, rows)?))
        }
        ExpressionBody::Call(_) => {
            return Err(ExpressionError::Eval(
                "call expressions are not reduced over positions".to_string(),
            ));
        }
    })
}

fn numbers(node: &Node, rows: &[(&Security, &Position)]) -> Result<Vec<f64>, ExpressionError> {
    rows.iter()
        .map(|(security, position)| {
            match node.eval(&EvaluationContext::new(security, position))? {
                Value::Number(n) => Ok(n),
                other => Err(ExpressionError::Eval(format!(
                    "which must return number, got {}",
                    other.kind()
                ))),
            }
        })
        .collect()
}

fn pairs(
    node: &Node,
    rows: &[(&Security, &Position)],
) -> Result<Vec<(String, f64)>, ExpressionError> {
    let values = numbers(node, rows)?;
    Ok(rows
        .iter()
        .zip(values)
        .map(|((security, _), v)| (security.symbol.clone(), v))
        .collect())
}
