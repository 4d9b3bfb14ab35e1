//! Variable vocabulary and per-position evaluation context.

use std::fmt;

use crate::domain::market::{Position, Security};

/// Runtime value of a formula.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Floating point number.
    Number(f64),
    /// Boolean.
    Bool(bool),
    /// String.
    Str(String),
}

impl Value {
    /// Kind of this value.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Number(_) => ValueKind::Number,
            Self::Bool(_) => ValueKind::Bool,
            Self::Str(_) => ValueKind::String,
        }
    }
}

/// Declared result type of a formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `f64`
    Number,
    /// `String`
    String,
    /// `bool`
    Bool,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Number => "number",
            Self::String => "string",
            Self::Bool => "bool",
        })
    }
}

/// Names a formula may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Variable {
    Symbol,
    Sector,
    Industry,
    IndustryGroup,
    SubIndustry,
    Market,
    Type,
    Currency,
    Multiplier,
    Rate,
    Adv20,
    MarketCap,
    PrevClose,
    Open,
    High,
    Low,
    Close,
    Qty,
    Vol,
    Vwap,
    Ask,
    Bid,
    AskSize,
    BidSize,
    OutstandBuyQty,
    OutstandSellQty,
    Acc,
    Pos,
    AvgPx,
    Commission,
    RealizedPnl,
    BuyQty,
    SellQty,
    BuyValue,
    SellValue,
    Pos0,
    AvgPx0,
    Commission0,
    RealizedPnl0,
    Target,
    NaN,
}

impl Variable {
    /// Resolve an identifier to a vocabulary entry.
    #[must_use]
    pub fn lookup(name: &str) -> Option<Self> {
        let var = match name {
            "Symbol" => Self::Symbol,
            "Sector" => Self::Sector,
            "Industry" => Self::Industry,
            "IndustryGroup" => Self::IndustryGroup,
            "SubIndustry" => Self::SubIndustry,
            "Market" => Self::Market,
            "Type" => Self::Type,
            "Currency" => Self::Currency,
            "Multiplier" => Self::Multiplier,
            "Rate" => Self::Rate,
            "Adv20" => Self::Adv20,
            "MarketCap" => Self::MarketCap,
            "PrevClose" => Self::PrevClose,
            "Open" => Self::Open,
            "High" => Self::High,
            "Low" => Self::Low,
            "Close" => Self::Close,
            "Qty" => Self::Qty,
            "Vol" => Self::Vol,
            "Vwap" => Self::Vwap,
            "Ask" => Self::Ask,
            "Bid" => Self::Bid,
            "AskSize" => Self::AskSize,
            "BidSize" => Self::BidSize,
            "OutstandBuyQty" => Self::OutstandBuyQty,
            "OutstandSellQty" => Self::OutstandSellQty,
            "Acc" => Self::Acc,
            "Pos" => Self::Pos,
            "AvgPx" => Self::AvgPx,
            "Commission" => Self::Commission,
            "RealizedPnl" => Self::RealizedPnl,
            "BuyQty" => Self::BuyQty,
            "SellQty" => Self::SellQty,
            "BuyValue" => Self::BuyValue,
            "SellValue" => Self::SellValue,
            "Pos0" => Self::Pos0,
            "AvgPx0" => Self::AvgPx0,
            "Commission0" => Self::Commission0,
            "RealizedPnl0" => Self::RealizedPnl0,
            "Target" => Self::Target,
            "NaN" => Self::NaN,
            _ => return None,
        };
        Some(var)
    }
}

/// Bindings for one position. Built per evaluation and never shared.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    security: &'a Security,
    position: &'a Position,
}

impl<'a> EvaluationContext<'a> {
    /// Bind a position to its security.
    #[must_use]
    pub const fn new(security: &'a Security, position: &'a Position) -> Self {
        Self { security, position }
    }

    /// Symbol of the bound security.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.security.symbol
    }

    /// Read a variable.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn get(&self, var: Variable) -> Value {
        let s = self.security;
        let p = self.position;
        let n = Value::Number;
        let text = |v: &str| Value::Str(v.to_string());
        match var {
            Variable::Symbol => text(&s.symbol),
            Variable::Sector => text(&s.sector),
            Variable::Industry => text(&s.industry),
            Variable::IndustryGroup => text(&s.industry_group),
            Variable::SubIndustry => text(&s.sub_industry),
            Variable::Market => text(&s.market),
            Variable::Type => text(&s.kind),
            Variable::Currency => text(&s.currency),
            Variable::Multiplier => n(s.multiplier),
            Variable::Rate => n(s.rate),
            Variable::Adv20 => n(s.adv20),
            Variable::MarketCap => n(s.market_cap),
            Variable::PrevClose => n(s.prev_close),
            Variable::Open => n(s.open),
            Variable::High => n(s.high),
            Variable::Low => n(s.low),
            Variable::Close => n(s.effective_close()),
            Variable::Qty => n(s.qty),
            Variable::Vol => n(s.vol),
            Variable::Vwap => n(s.vwap),
            Variable::Ask => n(s.ask),
            Variable::Bid => n(s.bid),
            Variable::AskSize => n(s.ask_size),
            Variable::BidSize => n(s.bid_size),
            Variable::OutstandBuyQty => n(p.outstand_buy_qty),
            Variable::OutstandSellQty => n(p.outstand_sell_qty),
            Variable::Acc => n(p.acc as f64),
            Variable::Pos => n(p.qty),
            Variable::AvgPx => n(p.avg_px),
            Variable::Commission => n(p.commission),
            Variable::RealizedPnl => n(p.realized_pnl),
            Variable::BuyQty => n(p.buy_qty),
            Variable::SellQty => n(p.sell_qty),
            Variable::BuyValue => n(p.buy_value),
            Variable::SellValue => n(p.sell_value),
            Variable::Pos0 => n(p.bod.qty),
            Variable::AvgPx0 => n(p.bod.avg_px),
            Variable::Commission0 => n(p.bod.commission),
            Variable::RealizedPnl0 => n(p.bod.realized_pnl),
            Variable::Target => n(p.target),
            Variable::NaN => n(f64::NAN),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_is_case_sensitive() {
        assert_eq!(Variable::lookup("Pos"), Some(Variable::Pos));
        assert_eq!(Variable::lookup("pos"), None);
        assert_eq!(Variable::lookup("Unknown"), None);
    }

    #[test]
    fn context_reads_position_and_bod_fields() {
        let sec = Security {
            symbol: "AAA".into(),
            prev_close: 9.0,
            ..Security::default()
        };
        let mut pos = Position::new(4, 1);
        pos.qty = 10.0;
        pos.bod.qty = 7.0;
        let ctx = EvaluationContext::new(&sec, &pos);

        assert_eq!(ctx.get(Variable::Symbol), Value::Str("AAA".into()));
        assert_eq!(ctx.get(Variable::Close), Value::Number(9.0));
        assert_eq!(ctx.get(Variable::Pos), Value::Number(10.0));
        assert_eq!(ctx.get(Variable::Pos0), Value::Number(7.0));
        assert_eq!(ctx.get(Variable::Acc), Value::Number(4.0));
        assert!(matches!(ctx.get(Variable::NaN), Value::Number(v) if v.is_nan()));
    }
}
