//! Tree-walking evaluator.

use super::ExpressionError;
use super::context::{EvaluationContext, Value};
use super::parser::{BinaryOp, Function, Node, UnaryOp};

impl Node {
    /// Evaluate against one position's bindings.
    ///
    /// # Errors
    ///
    /// Returns `ExpressionError::Eval` when an operator or function receives
    /// operands of the wrong kind.
    pub fn eval(&self, ctx: &EvaluationContext<'_>) -> Result<Value, ExpressionError> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Var(var) => Ok(ctx.get(*var)),
            Self::Unary(op, operand) => {
                let value = operand.eval(ctx)?;
                match (op, value) {
                    (UnaryOp::Neg, Value::Number(n)) => Ok(Value::Number(-n)),
                    (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                    (UnaryOp::Neg, other) => Err(type_error("-", &other)),
                    (UnaryOp::Not, other) => Err(type_error("!", &other)),
                }
            }
            Self::Binary(BinaryOp::And, left, right) => {
                if expect_bool("&&", left.eval(ctx)?)? {
                    Ok(Value::Bool(expect_bool("&&", right.eval(ctx)?)?))
                } else {
                    Ok(Value::Bool(false))
                }
            }
            Self::Binary(BinaryOp::Or, left, right) => {
                if expect_bool("||", left.eval(ctx)?)? {
                    Ok(Value::Bool(true))
                } else {
                    Ok(Value::Bool(expect_bool("||", right.eval(ctx)?)?))
                }
            }
            Self::Binary(op, left, right) => binary(*op, left.eval(ctx)?, right.eval(ctx)?),
            Self::Conditional(cond, then, otherwise) => {
                if expect_bool("?", cond.eval(ctx)?)? {
                    then.eval(ctx)
                } else {
                    otherwise.eval(ctx)
                }
            }
            Self::Match {
                subject,
                pattern,
                negated,
            } => match subject.eval(ctx)? {
                Value::Str(s) => Ok(Value::Bool(pattern.is_match(&s) != *negated)),
                other => Err(type_error("=~", &other)),
            },
            Self::Call(function, args) => {
                let values = args
                    .iter()
                    .map(|a| a.eval(ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                apply(*function, &values)
            }
        }
    }
}

fn type_error(op: &str, value: &Value) -> ExpressionError {
    ExpressionError::Eval(format!("cannot apply '{op}' to {}", value.kind()))
}

fn expect_bool(op: &str, value: Value) -> Result<bool, ExpressionError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(type_error(op, &other)),
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, ExpressionError> {
    use Value::{Bool, Number, Str};

    match (op, left, right) {
        (BinaryOp::Add, Str(a), Str(b)) => Ok(Str(a + &b)),
        (BinaryOp::Add, Str(a), Number(b)) => Ok(Str(format!("{a}{b}"))),
        (BinaryOp::Add, Number(a), Str(b)) => Ok(Str(format!("{a}{b}"))),
        (BinaryOp::Add, Number(a), Number(b)) => Ok(Number(a + b)),
        (BinaryOp::Sub, Number(a), Number(b)) => Ok(Number(a - b)),
        (BinaryOp::Mul, Number(a), Number(b)) => Ok(Number(a * b)),
        (BinaryOp::Div, Number(a), Number(b)) => Ok(Number(a / b)),
        (BinaryOp::Rem, Number(a), Number(b)) => Ok(Number(a % b)),
        (BinaryOp::Pow, Number(a), Number(b)) => Ok(Number(a.powf(b))),
        (BinaryOp::Eq, a, b) => Ok(Bool(a == b)),
        (BinaryOp::Ne, a, b) => Ok(Bool(a != b)),
        (BinaryOp::Lt, Number(a), Number(b)) => Ok(Bool(a < b)),
        (BinaryOp::Le, Number(a), Number(b)) => Ok(Bool(a <= b)),
        (BinaryOp::Gt, Number(a), Number(b)) => Ok(Bool(a > b)),
        (BinaryOp::Ge, Number(a), Number(b)) => Ok(Bool(a >= b)),
        (BinaryOp::Lt, Str(a), Str(b)) => Ok(Bool(a < b)),
        (BinaryOp::Le, Str(a), Str(b)) => Ok(Bool(a <= b)),
        (BinaryOp::Gt, Str(a), Str(b)) => Ok(Bool(a > b)),
        (BinaryOp::Ge, Str(a), Str(b)) => Ok(Bool(a >= b)),
        (op, left, right) => Err(ExpressionError::Eval(format!(
            "cannot apply '{}' to {} and {}",
            op.symbol(),
            left.kind(),
            right.kind()
        ))),
    }
}

#[allow(clippy::cast_precision_loss)]
fn apply(function: Function, args: &[Value]) -> Result<Value, ExpressionError> {
    if function == Function::Strlen {
        return match args {
            [Value::Str(s)] => Ok(Value::Number(s.len() as f64)),
            _ => Err(ExpressionError::Eval("strlen expects a string".to_string())),
        };
    }

    let numbers = args
        .iter()
        .map(|v| match v {
            Value::Number(n) => Ok(*n),
            other => Err(ExpressionError::Eval(format!(
                "{function:?} expects numbers, got {}",
                other.kind()
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let result = match (function, numbers.as_slice()) {
        (Function::Min, [a, b]) => Value::Number(a.min(*b)),
        (Function::Max, [a, b]) => Value::Number(a.max(*b)),
        (Function::Pow, [a, b]) => Value::Number(a.powf(*b)),
        (Function::Sqrt, [x]) => Value::Number(x.sqrt()),
        (Function::Round, [x]) => Value::Number(x.round()),
        (Function::IsNaN, [x]) => Value::Bool(x.is_nan()),
        (Function::Ceil, [x]) => Value::Number(x.ceil()),
        (Function::Floor, [x]) => Value::Number(x.floor()),
        (Function::Exp, [x]) => Value::Number(x.exp()),
        (Function::Exp2, [x]) => Value::Number(x.exp2()),
        (Function::Abs, [x]) => Value::Number(x.abs()),
        (Function::Log, [x]) => Value::Number(x.ln()),
        (Function::Log2, [x]) => Value::Number(x.log2()),
        (Function::Log10, [x]) => Value::Number(x.log10()),
        (Function::IsInf, [x]) => Value::Bool(x.is_infinite()),
        _ => {
            return Err(ExpressionError::Eval(format!(
                "{function:?} called with {} argument(s)",
                numbers.len()
            )));
        }
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::domain::expression::parser::parse;
    use crate::domain::market::{Position, Security};

    fn eval(text: &str) -> Result<Value, ExpressionError> {
        let sec = Security {
            symbol: "ABC".into(),
            sector: "Tech".into(),
            close: 10.0,
            ..Security::default()
        };
        let mut pos = Position::new(1, 1);
        pos.qty = -5.0;
        parse(text)?.eval(&EvaluationContext::new(&sec, &pos))
    }

    fn num(text: &str) -> f64 {
        match eval(text).unwrap() {
            Value::Number(n) => n,
            other => panic!("expected number, got {other:?}"),
        }
    }

    #[test_case("min(3, 4)", 3.0 ; "min")]
    #[test_case("max(3, 4)", 4.0 ; "max")]
    #[test_case("pow(2, 10)", 1024.0 ; "pow")]
    #[test_case("sqrt(16)", 4.0 ; "sqrt")]
    #[test_case("round(2.5)", 3.0 ; "round half away from zero")]
    #[test_case("round(-2.5)", -3.0 ; "round negative")]
    #[test_case("ceil(1.2)", 2.0 ; "ceil")]
    #[test_case("floor(1.8)", 1.0 ; "floor")]
    #[test_case("exp(0)", 1.0 ; "exp")]
    #[test_case("exp2(3)", 8.0 ; "exp2")]
    #[test_case("abs(Pos)", 5.0 ; "abs")]
    #[test_case("log(1)", 0.0 ; "log")]
    #[test_case("log2(8)", 3.0 ; "log2")]
    #[test_case("log10(1000)", 3.0 ; "log10")]
    #[test_case("strlen(Symbol)", 3.0 ; "strlen")]
    fn numeric_functions(text: &str, expected: f64) {
        assert!((num(text) - expected).abs() < 1e-12, "{text}");
    }

    #[test_case("isNaN(NaN)", true ; "nan")]
    #[test_case("isNaN(1)", false ; "not nan")]
    #[test_case("isInf(1 / 0)", true ; "positive infinity")]
    #[test_case("isInf(-1 / 0)", true ; "negative infinity")]
    #[test_case("isInf(1)", false ; "finite")]
    #[test_case("NaN == NaN", false ; "nan never equals itself")]
    #[test_case("NaN != NaN", true ; "nan differs from itself")]
    #[test_case("Sector == 'Tech' && Pos < 0", true ; "logical and")]
    #[test_case("Symbol =~ '^AB'", true ; "regex match")]
    #[test_case("Symbol !~ '^AB'", false ; "regex not match")]
    #[test_case("'a' < 'b'", true ; "string ordering")]
    #[test_case("!(1 > 2) || Symbol", true ; "or short circuits")]
    fn boolean_results(text: &str, expected: bool) {
        assert_eq!(eval(text).unwrap(), Value::Bool(expected), "{text}");
    }

    #[test]
    fn arithmetic_and_conditional() {
        assert_eq!(num("Pos * Close + 1"), -49.0);
        assert_eq!(num("Pos < 0 ? -Pos : Pos"), 5.0);
        assert_eq!(num("7 % 4"), 3.0);
        assert_eq!(num("-2 ** 2"), 4.0);
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(eval("Symbol + '-' + 1").unwrap(), Value::Str("ABC-1".into()));
    }

    #[test]
    fn type_errors_propagate() {
        assert!(eval("Symbol * 2").is_err());
        assert!(eval("sqrt(Symbol)").is_err());
        assert!(eval("strlen(1)").is_err());
        assert!(eval("1 ? 2 : 3").is_err());
        assert!(eval("!Pos").is_err());
    }
}
