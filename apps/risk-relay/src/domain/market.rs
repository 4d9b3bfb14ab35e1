//! Market State Types
//!
//! Securities, positions and the order/quote events that mutate them.
//! Payload field names follow the upstream trading server's camelCase JSON.

use serde::{Deserialize, Serialize};

// =============================================================================
// Identifiers
// =============================================================================

/// Upstream security identifier.
pub type SecurityId = i64;

/// Trading account identifier.
pub type AccountId = i64;

/// Authenticated user identifier (0 = unauthenticated).
pub type UserId = i64;

/// Upstream order identifier.
pub type OrderId = i64;

// =============================================================================
// Security
// =============================================================================

/// Static and live fields of one instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Security {
    /// Security id.
    pub id: SecurityId,
    /// Ticker symbol.
    pub symbol: String,
    /// GICS sector.
    pub sector: String,
    /// GICS industry.
    pub industry: String,
    /// GICS industry group.
    pub industry_group: String,
    /// GICS sub-industry.
    pub sub_industry: String,
    /// Listing market.
    pub market: String,
    /// Instrument type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Quote currency.
    pub currency: String,
    /// Contract multiplier.
    pub multiplier: f64,
    /// FX rate to the book currency.
    pub rate: f64,
    /// 20-day average daily volume.
    pub adv20: f64,
    /// Market capitalization.
    pub market_cap: f64,
    /// Previous session close.
    pub prev_close: f64,
    /// Session open.
    pub open: f64,
    /// Session high.
    pub high: f64,
    /// Session low.
    pub low: f64,
    /// Last traded price.
    pub close: f64,
    /// Last traded quantity.
    pub qty: f64,
    /// Session volume.
    pub vol: f64,
    /// Session VWAP.
    pub vwap: f64,
    /// Best ask.
    pub ask: f64,
    /// Best bid.
    pub bid: f64,
    /// Best ask size.
    pub ask_size: f64,
    /// Best bid size.
    pub bid_size: f64,
}

impl Security {
    /// Last price when one has printed, otherwise the previous close.
    #[must_use]
    pub fn effective_close(&self) -> f64 {
        if self.close > 0.0 {
            self.close
        } else {
            self.prev_close
        }
    }

    /// Multiplier used for P&L, treating an unset multiplier as 1.
    #[must_use]
    pub fn pnl_multiplier(&self) -> f64 {
        if self.multiplier > 0.0 {
            self.multiplier
        } else {
            1.0
        }
    }

    /// Apply a partial quote update.
    pub fn apply_quote(&mut self, quote: &MarketData) {
        let fields = [
            (&mut self.open, quote.open),
            (&mut self.high, quote.high),
            (&mut self.low, quote.low),
            (&mut self.close, quote.close),
            (&mut self.qty, quote.qty),
            (&mut self.vol, quote.vol),
            (&mut self.vwap, quote.vwap),
            (&mut self.ask, quote.ask),
            (&mut self.bid, quote.bid),
            (&mut self.ask_size, quote.ask_size),
            (&mut self.bid_size, quote.bid_size),
        ];
        for (slot, update) in fields {
            if let Some(v) = update {
                *slot = v;
            }
        }
    }
}

/// Partial quote update (`md`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketData {
    /// Target security.
    pub security: SecurityId,
    /// New open.
    #[serde(default)]
    pub open: Option<f64>,
    /// New high.
    #[serde(default)]
    pub high: Option<f64>,
    /// New low.
    #[serde(default)]
    pub low: Option<f64>,
    /// New last price.
    #[serde(default)]
    pub close: Option<f64>,
    /// New last quantity.
    #[serde(default)]
    pub qty: Option<f64>,
    /// New volume.
    #[serde(default)]
    pub vol: Option<f64>,
    /// New VWAP.
    #[serde(default)]
    pub vwap: Option<f64>,
    /// New ask.
    #[serde(default)]
    pub ask: Option<f64>,
    /// New bid.
    #[serde(default)]
    pub bid: Option<f64>,
    /// New ask size.
    #[serde(default)]
    pub ask_size: Option<f64>,
    /// New bid size.
    #[serde(default)]
    pub bid_size: Option<f64>,
}

// =============================================================================
// Position
// =============================================================================

/// Beginning-of-day snapshot of a position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PositionSnapshot {
    /// Signed quantity.
    pub qty: f64,
    /// Average price.
    pub avg_px: f64,
    /// Commission paid.
    pub commission: f64,
    /// Realized P&L.
    pub realized_pnl: f64,
}

/// One account's holding in one security.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Position {
    /// Owning account.
    pub acc: AccountId,
    /// Held security.
    pub security: SecurityId,
    /// Signed quantity.
    pub qty: f64,
    /// Average price.
    pub avg_px: f64,
    /// Commission paid.
    pub commission: f64,
    /// Realized P&L.
    pub realized_pnl: f64,
    /// Bought today.
    pub buy_qty: f64,
    /// Sold today.
    pub sell_qty: f64,
    /// Notional bought today.
    pub buy_value: f64,
    /// Notional sold today.
    pub sell_value: f64,
    /// Open buy order quantity.
    pub outstand_buy_qty: f64,
    /// Open sell order quantity.
    pub outstand_sell_qty: f64,
    /// Target quantity.
    pub target: f64,
    /// Beginning-of-day snapshot.
    pub bod: PositionSnapshot,
}

impl Position {
    /// Empty position for an account/security pair.
    #[must_use]
    pub fn new(acc: AccountId, security: SecurityId) -> Self {
        Self {
            acc,
            security,
            ..Self::default()
        }
    }

    /// Reset to a beginning-of-day snapshot.
    pub fn reset_to_bod(&mut self, bod: PositionSnapshot) {
        self.bod = bod;
        self.qty = bod.qty;
        self.avg_px = bod.avg_px;
        self.commission = bod.commission;
        self.realized_pnl = bod.realized_pnl;
        self.buy_qty = 0.0;
        self.sell_qty = 0.0;
        self.buy_value = 0.0;
        self.sell_value = 0.0;
    }

    /// Apply an execution of `qty` at `px`.
    pub fn apply_fill(&mut self, side: Side, qty: f64, px: f64, multiplier: f64) {
        if qty <= 0.0 {
            return;
        }
        let signed = match side {
            Side::Buy => {
                self.buy_qty += qty;
                self.buy_value += qty * px;
                qty
            }
            Side::Sell => {
                self.sell_qty += qty;
                self.sell_value += qty * px;
                -qty
            }
        };

        let total = self.qty + signed;
        if self.qty.abs() < f64::EPSILON || self.qty.signum() == signed.signum() {
            self.avg_px = (self.avg_px * self.qty.abs() + px * qty) / total.abs();
        } else {
            let closed = qty.min(self.qty.abs());
            self.realized_pnl += (px - self.avg_px) * closed * self.qty.signum() * multiplier;
            if total.abs() < f64::EPSILON {
                self.avg_px = 0.0;
            } else if total.signum() != self.qty.signum() {
                self.avg_px = px;
            }
        }
        self.qty = total;
    }

    /// Add to open order quantity.
    pub fn add_outstanding(&mut self, side: Side, qty: f64) {
        match side {
            Side::Buy => self.outstand_buy_qty += qty,
            Side::Sell => self.outstand_sell_qty += qty,
        }
    }

    /// Release open order quantity, never below zero.
    pub fn release_outstanding(&mut self, side: Side, qty: f64) {
        let slot = match side {
            Side::Buy => &mut self.outstand_buy_qty,
            Side::Sell => &mut self.outstand_sell_qty,
        };
        *slot = (*slot - qty).max(0.0);
    }
}

// =============================================================================
// Upstream Payloads
// =============================================================================

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy (including buy-to-cover).
    #[serde(alias = "B", alias = "Buy")]
    Buy,
    /// Sell (including short sell).
    #[serde(alias = "S", alias = "Sell", alias = "short")]
    Sell,
}

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Accepted, fully open.
    New,
    /// Partially executed.
    #[serde(alias = "partially_filled")]
    Partial,
    /// Fully executed.
    Filled,
    /// Cancelled by user or venue.
    #[serde(alias = "canceled")]
    Cancelled,
    /// Rejected.
    Rejected,
    /// Done for day.
    Done,
}

/// An order state change, in either the object or compact wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    /// Order id.
    pub id: OrderId,
    /// Account.
    pub acc: AccountId,
    /// Security.
    pub security: SecurityId,
    /// Side.
    pub side: Side,
    /// Order quantity.
    pub qty: f64,
    /// Limit price (0 for market).
    #[serde(default)]
    pub price: f64,
    /// New status.
    pub status: OrderStatus,
    /// Quantity of this execution.
    #[serde(default)]
    pub last_qty: f64,
    /// Price of this execution.
    #[serde(default)]
    pub last_px: f64,
}

/// Beginning-of-day row (`bod`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodRecord {
    /// Account.
    pub acc: AccountId,
    /// Security.
    pub security: SecurityId,
    /// Snapshot values.
    #[serde(flatten)]
    pub snapshot: PositionSnapshot,
}

/// Realized P&L row (`pnl`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PnlRecord {
    /// Account.
    pub acc: AccountId,
    /// Security.
    pub security: SecurityId,
    /// Realized P&L.
    #[serde(default)]
    pub realized_pnl: f64,
    /// Commission.
    #[serde(default)]
    pub commission: f64,
}

/// Target quantity row (`target`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRecord {
    /// Account.
    pub acc: AccountId,
    /// Security.
    pub security: SecurityId,
    /// Target quantity.
    pub target: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_close_falls_back_to_prev_close() {
        let mut sec = Security {
            prev_close: 10.0,
            ..Security::default()
        };
        assert_eq!(sec.effective_close(), 10.0);
        sec.close = 11.0;
        assert_eq!(sec.effective_close(), 11.0);
    }

    #[test]
    fn quote_update_only_touches_present_fields() {
        let mut sec = Security {
            bid: 1.0,
            ask: 2.0,
            ..Security::default()
        };
        sec.apply_quote(&MarketData {
            security: 1,
            ask: Some(2.5),
            ..MarketData::default()
        });
        assert_eq!(sec.bid, 1.0);
        assert_eq!(sec.ask, 2.5);
    }

    #[test]
    fn fills_build_average_price() {
        let mut pos = Position::new(1, 1);
        pos.apply_fill(Side::Buy, 100.0, 10.0, 1.0);
        pos.apply_fill(Side::Buy, 100.0, 20.0, 1.0);
        assert_eq!(pos.qty, 200.0);
        assert_eq!(pos.avg_px, 15.0);
        assert_eq!(pos.buy_value, 3000.0);
    }

    #[test]
    fn reducing_fill_realizes_pnl() {
        let mut pos = Position::new(1, 1);
        pos.apply_fill(Side::Buy, 100.0, 10.0, 1.0);
        pos.apply_fill(Side::Sell, 40.0, 12.0, 1.0);
        assert_eq!(pos.qty, 60.0);
        assert_eq!(pos.avg_px, 10.0);
        assert!((pos.realized_pnl - 80.0).abs() < 1e-9);
    }

    #[test]
    fn flipping_fill_resets_average_price() {
        let mut pos = Position::new(1, 1);
        pos.apply_fill(Side::Sell, 10.0, 5.0, 1.0);
        pos.apply_fill(Side::Buy, 30.0, 4.0, 1.0);
        assert_eq!(pos.qty, 20.0);
        assert_eq!(pos.avg_px, 4.0);
        assert!((pos.realized_pnl - 10.0).abs() < 1e-9);
    }

    #[test]
    fn release_outstanding_floors_at_zero() {
        let mut pos = Position::new(1, 1);
        pos.add_outstanding(Side::Sell, 5.0);
        pos.release_outstanding(Side::Sell, 8.0);
        assert_eq!(pos.outstand_sell_qty, 0.0);
    }

    #[test]
    fn order_event_accepts_aliases() {
        let event: OrderEvent = serde_json::from_str(
            r#"{"id":1,"acc":2,"security":3,"side":"B","qty":10,"status":"canceled"}"#,
        )
        .unwrap();
        assert_eq!(event.side, Side::Buy);
        assert_eq!(event.status, OrderStatus::Cancelled);
    }

    #[test]
    fn bod_record_flattens_snapshot() {
        let rec: BodRecord =
            serde_json::from_str(r#"{"acc":1,"security":2,"qty":5,"avgPx":3.5}"#).unwrap();
        assert_eq!(rec.snapshot.qty, 5.0);
        assert_eq!(rec.snapshot.avg_px, 3.5);
    }
}
