//! Aggregate reductions applied across a portfolio's positions.

use std::cmp::Ordering;

/// Reduction kind of a compiled formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    /// Plain scalar, one value per position.
    None,
    /// `sum(...)`
    Sum,
    /// `len(...)`
    Len,
    /// `mean(...)`
    Mean,
    /// `std(...)`
    Std,
    /// `top(...)`
    Top,
    /// `call(...)`
    Call,
}

impl AggregateKind {
    /// Formula prefix for this kind.
    #[must_use]
    pub const fn prefix(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Sum => Some("sum("),
            Self::Len => Some("len("),
            Self::Mean => Some("mean("),
            Self::Std => Some("std("),
            Self::Top => Some("top("),
            Self::Call => Some("call("),
        }
    }

    /// Kinds that wrap an inner formula, in prefix match order.
    pub const PREFIXED: [Self; 6] = [
        Self::Sum,
        Self::Len,
        Self::Mean,
        Self::Std,
        Self::Top,
        Self::Call,
    ];
}

/// Top-N selection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopSelection {
    /// Signed count: positive for highest, negative for lowest.
    pub count: i64,
    /// Tie-break count, kept only when its sign is opposite to `count`.
    pub tie_break: Option<i64>,
}

impl TopSelection {
    /// Build from the parsed counts, dropping a same-sign tie-break.
    #[must_use]
    pub fn new(count: i64, tie_break: Option<i64>) -> Self {
        let tie_break = tie_break.filter(|t| count.saturating_mul(*t) < 0);
        Self { count, tie_break }
    }

    /// Select entries from `(name, value)` pairs given in position order.
    ///
    /// NaN values rank after every number in both directions. The sort is
    /// stable, so entries with equal values keep position order. With an
    /// active tie-break the tie group straddling the cut is taken in reverse
    /// position order.
    #[must_use]
    pub fn select(&self, items: Vec<(String, f64)>) -> Vec<(String, f64)> {
        let mut ranked = items;
        let descending = self.count > 0;
        ranked.sort_by(|a, b| match (a.1.is_nan(), b.1.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ord = a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal);
                if descending { ord.reverse() } else { ord }
            }
        });

        let n = usize::try_from(self.count.unsigned_abs())
            .unwrap_or(usize::MAX)
            .min(ranked.len());
        if n == 0 {
            return Vec::new();
        }

        if self.tie_break.is_some() {
            let boundary = ranked[n - 1].1;
            let lo = ranked[..n]
                .iter()
                .rposition(|(_, v)| *v != boundary)
                .map_or(0, |i| i + 1);
            let hi = ranked[n..]
                .iter()
                .position(|(_, v)| *v != boundary)
                .map_or(ranked.len(), |i| n + i);
            if hi > n {
                ranked[lo..hi].reverse();
            }
        }

        ranked.truncate(n);
        ranked
    }
}

/// Sum of values; 0 for an empty set.
#[must_use]
pub fn sum(values: &[f64]) -> f64 {
    values.iter().sum()
}

/// Arithmetic mean; NaN for an empty set.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    sum(values) / values.len() as f64
}

/// Population standard deviation; NaN for an empty set.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}
