//! Risk Expression Engine
//!
//! Compiles formula text into an evaluable unit bound to the position and
//! security vocabulary. A formula is either a plain scalar, evaluated once
//! per position, or wrapped in exactly one aggregate:
//!
//! | Form                          | Result                                   |
//! |-------------------------------|------------------------------------------|
//! | `expr`                        | one `(symbol, value)` pair per position  |
//! | `sum(expr)`                   | sum over positions (0 when empty)        |
//! | `len(cond)`                   | positions where `cond` holds             |
//! | `mean(expr)` / `std(expr)`    | mean / population std (NaN when empty)   |
//! | `top(expr, [tie,] n)`         | best `n` pairs (worst when `n < 0`)      |
//! | `call(module, fn, [payload])` | value returned by an external script     |
//!
//! Aggregates are recognized only as the outermost wrapper. The closing
//! parenthesis is taken to be the last character of the text.

mod aggregate;
mod context;
mod eval;
mod lexer;
mod parser;

pub use aggregate::{AggregateKind, TopSelection, mean, std, sum};
pub use context::{EvaluationContext, Value, ValueKind, Variable};
pub use parser::{Function, Node};

use crate::domain::market::{Position, Security};

// =============================================================================
// Error Type
// =============================================================================

/// Expression compile and evaluation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
    /// Grammar rejected the text.
    #[error("{0}")]
    Syntax(String),

    /// Evaluation failed (operand kinds).
    #[error("{0}")]
    Eval(String),

    /// Compilation of a named formula failed.
    #[error("invalid {name} expression on line {line}: {text}: {reason}")]
    Invalid {
        /// Parameter or key name.
        name: String,
        /// 1-based source line.
        line: usize,
        /// Original formula text.
        text: String,
        /// Underlying reason.
        reason: String,
    },
}

impl ExpressionError {
    /// Wrap a reason with the formula's location.
    #[must_use]
    pub fn invalid(name: &str, line: usize, text: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            name: name.to_string(),
            line,
            text: text.to_string(),
            reason: reason.to_string(),
        }
    }
}

// =============================================================================
// Compiled Expression
// =============================================================================

/// External call-out target of a `call(...)` formula.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSpec {
    /// Script module name.
    pub module: String,
    /// Function within the module.
    pub function: String,
    /// Payload passed verbatim.
    pub payload: String,
}

/// Compiled body. The aggregate and its parameters are fixed here.
#[derive(Debug, Clone)]
pub enum ExpressionBody {
    /// Plain scalar.
    Scalar(Node),
    /// `sum(...)`
    Sum(Node),
    /// `len(...)`
    Len(Node),
    /// `mean(...)`
    Mean(Node),
    /// `std(...)`
    Std(Node),
    /// `top(...)`
    Top(Node, TopSelection),
    /// `call(...)`
    Call(CallSpec),
}

/// A compiled formula.
#[derive(Debug, Clone)]
pub struct Expression {
    text: String,
    body: ExpressionBody,
}

impl Expression {
    /// Compile formula text declared to produce `expected`.
    ///
    /// `name` and `line` only feed the error message.
    ///
    /// # Errors
    ///
    /// Returns `ExpressionError::Invalid` when the aggregate arguments are
    /// malformed, the grammar rejects the text, the dry run against an empty
    /// position fails, or the result kind differs from `expected`.
    pub fn compile(
        name: &str,
        line: usize,
        text: &str,
        expected: ValueKind,
    ) -> Result<Self, ExpressionError> {
        let invalid = |reason: &dyn std::fmt::Display| {
            ExpressionError::invalid(name, line, text, reason)
        };
        let trimmed = text.trim();

        let kind = AggregateKind::PREFIXED
            .into_iter()
            .find(|k| k.prefix().is_some_and(|p| trimmed.starts_with(p)))
            .unwrap_or(AggregateKind::None);

        if kind != AggregateKind::None && expected != ValueKind::Number {
            return Err(invalid(&format_args!("which must return {expected}")));
        }

        let inner = match kind.prefix() {
            None => trimmed,
            Some(prefix) => trimmed
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(')'))
                .ok_or_else(|| invalid(&"missing closing parenthesis"))?,
        };

        let scalar = |formula: &str, kind: ValueKind| {
            compile_scalar(formula, kind).map_err(|e| invalid(&e))
        };
        let body = match kind {
            AggregateKind::Call => {
                ExpressionBody::Call(parse_call(inner).map_err(|e| invalid(&e))?)
            }
            AggregateKind::Top => {
                let (formula, selection) = parse_top(inner).map_err(|e| invalid(&e))?;
                ExpressionBody::Top(scalar(formula, ValueKind::Number)?, selection)
            }
            AggregateKind::Len => ExpressionBody::Len(scalar(inner, ValueKind::Bool)?),
            AggregateKind::Sum => ExpressionBody::Sum(scalar(inner, expected)?),
            AggregateKind::Mean => ExpressionBody::Mean(scalar(inner, expected)?),
            AggregateKind::Std => ExpressionBody::Std(scalar(inner, expected)?),
            AggregateKind::None => ExpressionBody::Scalar(scalar(inner, expected)?),
        };

        Ok(Self {
            text: text.to_string(),
            body,
        })
    }

    /// Original formula text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Compiled body.
    #[must_use]
    pub const fn body(&self) -> &ExpressionBody {
        &self.body
    }

    /// Aggregate kind.
    #[must_use]
    pub const fn aggregate(&self) -> AggregateKind {
        match self.body {
            ExpressionBody::Scalar(_) => AggregateKind::None,
            ExpressionBody::Sum(_) => AggregateKind::Sum,
            ExpressionBody::Len(_) => AggregateKind::Len,
            ExpressionBody::Mean(_) => AggregateKind::Mean,
            ExpressionBody::Std(_) => AggregateKind::Std,
            ExpressionBody::Top(..) => AggregateKind::Top,
            ExpressionBody::Call(_) => AggregateKind::Call,
        }
    }

    /// Per-position tree, absent for `call(...)`.
    #[must_use]
    pub const fn program(&self) -> Option<&Node> {
        match &self.body {
            ExpressionBody::Scalar(n)
            | ExpressionBody::Sum(n)
            | ExpressionBody::Len(n)
            | ExpressionBody::Mean(n)
            | ExpressionBody::Std(n)
            | ExpressionBody::Top(n, _) => Some(n),
            ExpressionBody::Call(_) => None,
        }
    }

    /// Evaluate the per-position tree for one position.
    ///
    /// # Errors
    ///
    /// Returns `ExpressionError::Eval` on operand kind errors, or when called
    /// on a `call(...)` formula, which has no per-position tree.
    pub fn evaluate(
        &self,
        security: &Security,
        position: &Position,
    ) -> Result<Value, ExpressionError> {
        let program = self.program().ok_or_else(|| {
            ExpressionError::Eval("call expressions are not evaluated per position".to_string())
        })?;
        program.eval(&EvaluationContext::new(security, position))
    }
}

/// Parse and dry-run a scalar formula against an empty position.
fn compile_scalar(text: &str, expected: ValueKind) -> Result<Node, ExpressionError> {
    let node = parser::parse(text)?;
    let security = Security::default();
    let position = Position::default();
    let value = node.eval(&EvaluationContext::new(&security, &position))?;
    if value.kind() != expected {
        return Err(ExpressionError::Eval(format!("which must return {expected}")));
    }
    Ok(node)
}

/// Split on top-level commas, ignoring commas inside parentheses or quotes.
fn split_args(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0_i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(text[start..].trim());
    parts
}

fn parse_top(inner: &str) -> Result<(&str, TopSelection), String> {
    let fields = split_args(inner);
    if fields.len() < 2 {
        return Err("missing top length".to_string());
    }
    if fields.len() > 3 {
        return Err("bad top length".to_string());
    }
    let parse_count = |s: &str| s.parse::<i64>().map_err(|_| "bad top length".to_string());
    let count = parse_count(fields[fields.len() - 1])?;
    let tie = if fields.len() == 3 {
        Some(parse_count(fields[1])?)
    } else {
        None
    };
    Ok((fields[0], TopSelection::new(count, tie)))
}

fn parse_call(inner: &str) -> Result<CallSpec, String> {
    const REQUIRED: &str = "module name and function name required";

    let fields = split_args(inner);
    if fields.len() < 2 || fields.len() > 3 {
        return Err(REQUIRED.to_string());
    }

    let security = Security::default();
    let position = Position::default();
    let ctx = EvaluationContext::new(&security, &position);
    let mut strings = Vec::with_capacity(3);
    for field in fields {
        match parser::parse(field).and_then(|n| n.eval(&ctx)).map_err(|e| e.to_string())? {
            Value::Str(s) => strings.push(s),
            other => return Err(format!("call arguments must be strings, got {}", other.kind())),
        }
    }

    let mut strings = strings.into_iter();
    let module = strings.next().unwrap_or_default();
    let function = strings.next().unwrap_or_default();
    let payload = strings.next().unwrap_or_default();
    if module.is_empty() || function.is_empty() {
        return Err(REQUIRED.to_string());
    }
    Ok(CallSpec {
        module,
        function,
        payload,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn compile(text: &str) -> Result<Expression, ExpressionError> {
        Expression::compile("p", 3, text, ValueKind::Number)
    }

    #[test]
    fn recognizes_aggregate_prefixes() {
        assert_eq!(compile("Pos * Close").unwrap().aggregate(), AggregateKind::None);
        assert_eq!(compile("sum(Pos * Close)").unwrap().aggregate(), AggregateKind::Sum);
        assert_eq!(compile("len(Pos > 0)").unwrap().aggregate(), AggregateKind::Len);
        assert_eq!(compile("mean(Pos)").unwrap().aggregate(), AggregateKind::Mean);
        assert_eq!(compile("std(Pos)").unwrap().aggregate(), AggregateKind::Std);
        assert_eq!(compile("top(Pos, 3)").unwrap().aggregate(), AggregateKind::Top);
    }

    #[test]
    fn top_arguments() {
        let expr = compile("top(max(Pos, 0), -2, 5)").unwrap();
        let ExpressionBody::Top(_, selection) = expr.body() else {
            panic!("expected top");
        };
        assert_eq!(selection.count, 5);
        assert_eq!(selection.tie_break, Some(-2));

        let err = compile("top(Pos)").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid p expression on line 3: top(Pos): missing top length"
        );
        assert!(compile("top(Pos, x)").unwrap_err().to_string().ends_with("bad top length"));
        let err = compile("top(Pos, 1, -2, 3)").unwrap_err();
        assert!(err.to_string().ends_with("bad top length"));
    }

    #[test]
    fn call_arguments() {
        let expr = compile("call('risk', 'var', 'p=1,2')").unwrap();
        let ExpressionBody::Call(spec) = expr.body() else {
            panic!("expected call");
        };
        assert_eq!(spec.module, "risk");
        assert_eq!(spec.function, "var");
        assert_eq!(spec.payload, "p=1,2");
        assert!(expr.program().is_none());

        let err = compile("call('risk')").unwrap_err();
        assert!(err.to_string().ends_with("module name and function name required"));
        assert!(compile("call('', 'f')").is_err());
        assert!(compile("call(1, 'f')").is_err());
    }

    #[test]
    fn result_kind_is_checked() {
        let err = compile("Symbol").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid p expression on line 3: Symbol: which must return number"
        );
        assert!(compile("len(Pos)").is_err());
        assert!(Expression::compile("filter", 1, "Pos > 0", ValueKind::Bool).is_ok());
        assert!(Expression::compile("filter", 1, "sum(Pos)", ValueKind::Bool).is_err());
    }

    #[test]
    fn grammar_errors_carry_location() {
        let err = compile("Pos +").unwrap_err();
        assert!(err.to_string().starts_with("invalid p expression on line 3: Pos +: "));
        assert!(compile("sum(Pos").is_err());
    }

    #[test]
    fn evaluate_uses_position_bindings() {
        let expr = compile("Pos * Close").unwrap();
        let sec = Security {
            close: 2.0,
            ..Security::default()
        };
        let mut pos = Position::new(1, 1);
        pos.qty = 3.0;
        assert_eq!(expr.evaluate(&sec, &pos).unwrap(), Value::Number(6.0));
    }

    proptest! {
        #[test]
        fn evaluation_is_deterministic(
            qty in -1e6f64..1e6,
            px in 0.0f64..1e4,
            bod in -1e6f64..1e6,
            op in prop::sample::select(vec!["+", "-", "*", "/", "%", "**"]),
        ) {
            let text = format!("(Pos {op} Close) - Pos0 + abs(AvgPx)");
            let expr = compile(&text).unwrap();
            let sec = Security { close: px, ..Security::default() };
            let mut pos = Position::new(1, 1);
            pos.qty = qty;
            pos.avg_px = px;
            pos.bod.qty = bod;

            let first = expr.evaluate(&sec, &pos).unwrap();
            let second = expr.evaluate(&sec, &pos).unwrap();
            match (first, second) {
                (Value::Number(a), Value::Number(b)) => {
                    prop_assert!(a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan()));
                }
                other => prop_assert!(false, "unexpected {other:?}"),
            }
        }
    }
}
