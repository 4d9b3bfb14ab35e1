//! Portfolio and Risk Definition Types
//!
//! A portfolio is one `<name>.ini` risk file compiled into an account
//! selection, an optional position filter and an ordered list of risk
//! definitions. Report types mirror what viewers receive in `risk` frames.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::domain::config_tree::ConfigTreeError;
use crate::domain::expression::{Expression, ExpressionError};
use crate::domain::market::AccountId;

/// Extension of risk files that compile into portfolios.
pub const PORTFOLIO_EXTENSION: &str = ".ini";

/// Extension of script files.
pub const SCRIPT_EXTENSION: &str = ".py";

/// Portfolio name for a risk file, if it is a portfolio file.
#[must_use]
pub fn portfolio_name(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(PORTFOLIO_EXTENSION)
        .filter(|stem| !stem.is_empty())
}

// =============================================================================
// Errors
// =============================================================================

/// Portfolio construction errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortfolioError {
    /// The risk file is not a valid config tree.
    #[error(transparent)]
    Syntax(#[from] ConfigTreeError),

    /// A formula failed to compile.
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// The tree does not have the portfolio shape.
    #[error("invalid portfolio on line {line}: {reason}")]
    Structure {
        /// 1-based source line.
        line: usize,
        /// What was wrong.
        reason: String,
    },
}

// =============================================================================
// Values
// =============================================================================

/// Computed value of one risk parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Single number. NaN serializes as `null`.
    Number(f64),
    /// Name/value list.
    Pairs(Vec<(String, f64)>),
    /// Evaluation failed.
    Error(String),
}

fn serialize_number<S: Serializer>(value: f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.is_finite() {
        serializer.serialize_f64(value)
    } else {
        serializer.serialize_none()
    }
}

struct JsonNumber(f64);

impl Serialize for JsonNumber {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_number(self.0, serializer)
    }
}

impl Serialize for ParamValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Number(v) => serialize_number(*v, serializer),
            Self::Pairs(pairs) => {
                let mut seq = serializer.serialize_seq(Some(pairs.len()))?;
                for (name, value) in pairs {
                    seq.serialize_element(&(name, JsonNumber(*value)))?;
                }
                seq.end()
            }
            Self::Error(message) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("error", message)?;
                map.end()
            }
        }
    }
}

/// One graph point: unix milliseconds and the value computed at that tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint(pub i64, pub ParamValue);

// =============================================================================
// Risk Definitions
// =============================================================================

/// A named formula inside a risk definition.
#[derive(Debug, Clone)]
pub struct RiskParam {
    name: String,
    expression: Expression,
    graph: bool,
    history: VecDeque<HistoryPoint>,
}

impl RiskParam {
    /// Create a parameter.
    #[must_use]
    pub const fn new(name: String, expression: Expression, graph: bool) -> Self {
        Self {
            name,
            expression,
            graph,
            history: VecDeque::new(),
        }
    }

    /// Parameter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compiled formula.
    #[must_use]
    pub const fn expression(&self) -> &Expression {
        &self.expression
    }

    /// Whether values are kept for graphing.
    #[must_use]
    pub const fn is_graph(&self) -> bool {
        self.graph
    }

    /// Recorded history, oldest first. Always empty unless graph-enabled.
    #[must_use]
    pub const fn history(&self) -> &VecDeque<HistoryPoint> {
        &self.history
    }

    /// Append a point, dropping the oldest beyond `limit`. No-op unless
    /// graph-enabled.
    pub fn record(&mut self, point: HistoryPoint, limit: usize) {
        if !self.graph || limit == 0 {
            return;
        }
        self.history.push_back(point);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}

/// A display section of a portfolio.
#[derive(Debug, Clone)]
pub struct RiskDefinition {
    /// Display name.
    pub name: String,
    /// Parameters in file order.
    pub params: Vec<RiskParam>,
}

impl RiskDefinition {
    /// Look up a parameter by name.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&RiskParam> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// A compiled risk file.
#[derive(Debug, Clone)]
pub struct Portfolio {
    /// Portfolio name (file stem).
    pub name: String,
    /// Account restriction, intersected with the user's accounts.
    pub accounts: Option<BTreeSet<AccountId>>,
    /// Position predicate.
    pub filter: Option<Expression>,
    /// Risk definitions in file order.
    pub risks: Vec<RiskDefinition>,
}

impl Portfolio {
    /// Look up a risk definition by name.
    #[must_use]
    pub fn risk(&self, name: &str) -> Option<&RiskDefinition> {
        self.risks.iter().find(|r| r.name == name)
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Reported value of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamReport {
    /// Parameter name.
    pub name: String,
    /// Computed value.
    pub value: ParamValue,
}

/// Reported values of one risk definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskReport {
    /// Risk definition name.
    pub name: String,
    /// Parameter values in file order.
    pub params: Vec<ParamReport>,
}

/// One user's report: portfolio name to risk reports.
pub type UserReport = BTreeMap<String, Vec<RiskReport>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::expression::ValueKind;

    fn param(graph: bool) -> RiskParam {
        let expr = Expression::compile("p", 1, "sum(Pos)", ValueKind::Number).unwrap();
        RiskParam::new("p".into(), expr, graph)
    }

    #[test]
    fn portfolio_names_come_from_ini_stems() {
        assert_eq!(portfolio_name("main.ini"), Some("main"));
        assert_eq!(portfolio_name(".ini"), None);
        assert_eq!(portfolio_name("model.py"), None);
    }

    #[test]
    fn history_only_grows_for_graph_params() {
        let mut plain = param(false);
        plain.record(HistoryPoint(1, ParamValue::Number(1.0)), 10);
        assert!(plain.history().is_empty());

        let mut graphed = param(true);
        for i in 0..5 {
            graphed.record(HistoryPoint(i, ParamValue::Number(1.0)), 3);
        }
        let times: Vec<_> = graphed.history().iter().map(|p| p.0).collect();
        assert_eq!(times, vec![2, 3, 4]);
    }

    #[test]
    fn param_values_serialize_to_wire_shapes() {
        assert_eq!(serde_json::to_string(&ParamValue::Number(1.5)).unwrap(), "1.5");
        assert_eq!(
            serde_json::to_string(&ParamValue::Number(f64::NAN)).unwrap(),
            "null"
        );
        assert_eq!(
            serde_json::to_string(&ParamValue::Pairs(vec![("A".into(), 2.0)])).unwrap(),
            r#"[["A",2.0]]"#
        );
        assert_eq!(
            serde_json::to_string(&ParamValue::Error("bad".into())).unwrap(),
            r#"{"error":"bad"}"#
        );
        assert_eq!(
            serde_json::to_string(&HistoryPoint(5, ParamValue::Number(1.0))).unwrap(),
            "[5,1.0]"
        );
    }
}
