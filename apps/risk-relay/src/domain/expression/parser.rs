//! Recursive-descent parser producing a resolved syntax tree.
//!
//! Identifiers are bound to the variable vocabulary and function names to
//! the built-in library while parsing, so evaluation never does a name
//! lookup and an unknown name is a compile error.

use regex::Regex;

use super::ExpressionError;
use super::context::{Value, Variable};
use super::lexer::{Token, tokenize};

/// Built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// `min(a, b)`
    Min,
    /// `max(a, b)`
    Max,
    /// `pow(a, b)`
    Pow,
    /// `sqrt(x)`
    Sqrt,
    /// `round(x)`, half away from zero.
    Round,
    /// `isNaN(x)`
    IsNaN,
    /// `ceil(x)`
    Ceil,
    /// `floor(x)`
    Floor,
    /// `exp(x)`
    Exp,
    /// `exp2(x)`
    Exp2,
    /// `abs(x)`
    Abs,
    /// `log(x)`, natural logarithm.
    Log,
    /// `log2(x)`
    Log2,
    /// `log10(x)`
    Log10,
    /// `isInf(x)`, either sign.
    IsInf,
    /// `strlen(s)`, byte length.
    Strlen,
}

impl Function {
    /// Resolve a function name.
    #[must_use]
    pub fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "min" => Self::Min,
            "max" => Self::Max,
            "pow" => Self::Pow,
            "sqrt" => Self::Sqrt,
            "round" => Self::Round,
            "isNaN" => Self::IsNaN,
            "ceil" => Self::Ceil,
            "floor" => Self::Floor,
            "exp" => Self::Exp,
            "exp2" => Self::Exp2,
            "abs" => Self::Abs,
            "log" => Self::Log,
            "log2" => Self::Log2,
            "log10" => Self::Log10,
            "isInf" => Self::IsInf,
            "strlen" => Self::Strlen,
            _ => return None,
        })
    }

    /// Required argument count.
    #[must_use]
    pub const fn arity(self) -> usize {
        match self {
            Self::Min | Self::Max | Self::Pow => 2,
            _ => 1,
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `!x`
    Not,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    /// Operator spelling, for error messages.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Pow => "**",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }
}

/// Syntax tree node.
#[derive(Debug, Clone)]
pub enum Node {
    /// Constant.
    Literal(Value),
    /// Vocabulary variable.
    Var(Variable),
    /// Unary operation.
    Unary(UnaryOp, Box<Node>),
    /// Binary operation.
    Binary(BinaryOp, Box<Node>, Box<Node>),
    /// `cond ? a : b`
    Conditional(Box<Node>, Box<Node>, Box<Node>),
    /// `subject =~ 'pattern'` (or `!~` when negated).
    Match {
        /// String operand.
        subject: Box<Node>,
        /// Compiled pattern.
        pattern: Regex,
        /// True for `!~`.
        negated: bool,
    },
    /// Built-in function call.
    Call(Function, Vec<Node>),
}

/// Parse formula text.
pub fn parse(text: &str) -> Result<Node, ExpressionError> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(ExpressionError::Syntax("empty expression".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let node = parser.conditional()?;
    if let Some(token) = parser.peek() {
        return Err(ExpressionError::Syntax(format!(
            "unexpected token {token:?}"
        )));
    }
    Ok(node)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ExpressionError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(ExpressionError::Syntax(format!(
                "expected {expected:?}, found {:?}",
                self.peek()
            )))
        }
    }

    fn conditional(&mut self) -> Result<Node, ExpressionError> {
        let cond = self.or()?;
        if !self.eat(&Token::Question) {
            return Ok(cond);
        }
        let then = self.conditional()?;
        self.expect(&Token::Colon)?;
        let otherwise = self.conditional()?;
        Ok(Node::Conditional(
            Box::new(cond),
            Box::new(then),
            Box::new(otherwise),
        ))
    }

    fn or(&mut self) -> Result<Node, ExpressionError> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = Node::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Node, ExpressionError> {
        let mut left = self.comparison()?;
        while self.eat(&Token::And) {
            let right = self.comparison()?;
            left = Node::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Node, ExpressionError> {
        let mut left = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinaryOp::Eq,
                Some(Token::Ne) => BinaryOp::Ne,
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                Some(Token::Match | Token::NotMatch) => {
                    let negated = self.advance() == Some(Token::NotMatch);
                    let pattern = match self.advance() {
                        Some(Token::Str(p)) => Regex::new(&p).map_err(|e| {
                            ExpressionError::Syntax(format!("bad pattern '{p}': {e}"))
                        })?,
                        _ => {
                            return Err(ExpressionError::Syntax(
                                "pattern must be a string literal".to_string(),
                            ));
                        }
                    };
                    left = Node::Match {
                        subject: Box::new(left),
                        pattern,
                        negated,
                    };
                    continue;
                }
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.additive()?;
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn additive(&mut self) -> Result<Node, ExpressionError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Node, ExpressionError> {
        let mut left = self.power()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.power()?;
            left = Node::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn power(&mut self) -> Result<Node, ExpressionError> {
        let base = self.unary()?;
        if self.eat(&Token::Power) {
            let exponent = self.power()?;
            return Ok(Node::Binary(
                BinaryOp::Pow,
                Box::new(base),
                Box::new(exponent),
            ));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<Node, ExpressionError> {
        if self.eat(&Token::Minus) {
            return Ok(Node::Unary(UnaryOp::Neg, Box::new(self.unary()?)));
        }
        if self.eat(&Token::Not) {
            return Ok(Node::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Node, ExpressionError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Node::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Node::Literal(Value::Str(s))),
            Some(Token::LParen) => {
                let inner = self.conditional()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    return self.call(&name);
                }
                match name.as_str() {
                    "true" => Ok(Node::Literal(Value::Bool(true))),
                    "false" => Ok(Node::Literal(Value::Bool(false))),
                    _ => Variable::lookup(&name).map(Node::Var).ok_or_else(|| {
                        ExpressionError::Syntax(format!("no parameter '{name}' found"))
                    }),
                }
            }
            other => Err(ExpressionError::Syntax(format!(
                "unexpected token {other:?}"
            ))),
        }
    }

    fn call(&mut self, name: &str) -> Result<Node, ExpressionError> {
        let function = Function::lookup(name)
            .ok_or_else(|| ExpressionError::Syntax(format!("undefined function '{name}'")))?;

        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.conditional()?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(&Token::RParen)?;
                break;
            }
        }

        if args.len() != function.arity() {
            return Err(ExpressionError::Syntax(format!(
                "{name} takes {} argument(s), got {}",
                function.arity(),
                args.len()
            )));
        }
        Ok(Node::Call(function, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_is_right_associative() {
        let node = parse("2 ** 3 ** 2").unwrap();
        let Node::Binary(BinaryOp::Pow, _, right) = node else {
            panic!("expected power node");
        };
        assert!(matches!(*right, Node::Binary(BinaryOp::Pow, _, _)));
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let node = parse("1 + 2 * 3").unwrap();
        let Node::Binary(BinaryOp::Add, _, right) = node else {
            panic!("expected add node");
        };
        assert!(matches!(*right, Node::Binary(BinaryOp::Mul, _, _)));
    }

    #[test]
    fn unknown_names_fail_to_parse() {
        let err = parse("Foo + 1").unwrap_err();
        assert!(err.to_string().contains("Foo"));
        assert!(parse("nope(1)").is_err());
    }

    #[test]
    fn arity_is_checked() {
        assert!(parse("min(1)").is_err());
        assert!(parse("abs(1, 2)").is_err());
        assert!(parse("pow(2, 3)").is_ok());
    }

    #[test]
    fn pattern_must_be_literal() {
        assert!(parse("Symbol =~ Sector").is_err());
        assert!(parse("Symbol =~ '^A'").is_ok());
        assert!(parse("Symbol =~ '('").is_err());
    }

    #[test]
    fn trailing_tokens_are_rejected() {
        assert!(parse("1 2").is_err());
        assert!(parse("(1").is_err());
        assert!(parse("").is_err());
    }
}
