use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::errors::PortfolioError;
use crate::orders::{Fill, Order, OrderIdSource, Side};

/// Portfolio position for a specific symbol.
///
/// Created lazily on the first non-zero fill and never removed: a
/// zero-quantity position keeps its accumulated realized P&L queryable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed quantity: long positive, short negative.
    pub quantity: Decimal,
    /// Weighted average entry price of the currently open quantity.
    pub cost_basis: Decimal,
    /// Gross realized P&L accumulated for this symbol.
    pub realized_pnl: Decimal,
    pub last_price: Decimal,
    pub entry_time: Option<DateTime<Utc>>,
    pub entry_side: Option<Side>,
}

impl Position {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            quantity: Decimal::ZERO,
            cost_basis: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            last_price: Decimal::ZERO,
            entry_time: None,
            entry_side: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    pub fn is_long(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    pub fn is_short(&self) -> bool {
        self.quantity < Decimal::ZERO
    }

    pub fn market_value(&self) -> Decimal {
        self.quantity * self.last_price
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.quantity * (self.last_price - self.cost_basis)
    }
}

/// A closed round-trip or partial close, with realized P&L net of the
/// closing commission slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub entry_side: Side,
    pub entry_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub exit_time: DateTime<Utc>,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub realized_pnl: Decimal,
    pub commission: Decimal,
    pub rule_id: Option<String>,
    pub strategy_id: String,
}

/// Point on the equity curve, appended on every mark-to-market and fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityCurvePoint {
    pub timestamp: DateTime<Utc>,
    pub cash: Decimal,
    pub positions_market_value: Decimal,
    pub total_equity: Decimal,
    pub drawdown_from_peak: Decimal,
}

/// The single source of truth for positions, cash, realized P&L, the equity
/// curve, and the trade ledger. All mutation arrives through fill handling
/// and mark-to-market; reconciliation is re-checked after both.
#[derive(Debug, Clone)]
pub struct Portfolio {
    pub initial_capital: Decimal,
    pub cash: Decimal,
    positions: HashMap<String, Position>,
    trades: Vec<Trade>,
    equity_curve: Vec<EquityCurvePoint>,
    peak_equity: Decimal,
    total_commissions: Decimal,
    total_realized_pnl: Decimal,
    tolerance: Decimal,
    violation: Option<String>,
}

impl Portfolio {
    pub fn new(initial_capital: Decimal) -> Self {
        Self {
            initial_capital,
            cash: initial_capital,
            positions: HashMap::new(),
            trades: Vec::new(),
            equity_curve: Vec::new(),
            peak_equity: initial_capital,
            total_commissions: Decimal::ZERO,
            total_realized_pnl: Decimal::ZERO,
            tolerance: initial_capital.abs() * Decimal::new(1, 6),
            violation: None,
        }
    }

    pub fn apply_fill(&mut self, fill: &Fill) -> Result<(), PortfolioError> {
        self.cash += fill.net_cash_delta();
        self.total_commissions += fill.commission;

        let position = self
            .positions
            .entry(fill.symbol.clone())
            .or_insert_with(|| Position::new(fill.symbol.clone()));

        let dq = fill.signed_quantity();
        let q0 = position.quantity;
        let q1 = q0 + dq;
        let q0_sign = sign_of(q0);
        let dq_sign = sign_of(dq);

        if q0.is_zero() || q0_sign == dq_sign {
            // Opening from flat or adding in the same direction: weighted
            // average cost, no trade recorded.
            position.cost_basis = (q0 * position.cost_basis + dq * fill.price) / q1;
            if q0.is_zero() {
                position.entry_time = Some(fill.timestamp);
                position.entry_side = Some(fill.side);
            }
            position.quantity = q1;
        } else if dq.abs() <= q0.abs() {
            // Reducing toward zero without crossing. Cost basis unchanged.
            let closed = dq.abs();
            let gross = closed * (fill.price - position.cost_basis) * Decimal::from(q0_sign);
            position.realized_pnl += gross;
            self.total_realized_pnl += gross;

            self.trades.push(Trade {
                symbol: fill.symbol.clone(),
                entry_side: position.entry_side.unwrap_or_else(|| fill.side.opposite()),
                entry_time: position.entry_time.unwrap_or(fill.timestamp),
                entry_price: position.cost_basis,
                exit_time: fill.timestamp,
                exit_price: fill.price,
                quantity: closed,
                realized_pnl: gross - fill.commission,
                commission: fill.commission,
                rule_id: fill.rule_id.clone(),
                strategy_id: fill.strategy_id.clone(),
            });

            position.quantity = q1;
            if q1.is_zero() {
                position.cost_basis = Decimal::ZERO;
                position.entry_time = None;
                position.entry_side = None;
            }
        } else {
            // Crossing through zero: close the old position, reopen the
            // remainder at the fill price. Commission splits proportionally.
            let closed = q0.abs();
            let close_commission = fill.commission * closed / dq.abs();
            let gross = closed * (fill.price - position.cost_basis) * Decimal::from(q0_sign);
            position.realized_pnl += gross;
            self.total_realized_pnl += gross;

            self.trades.push(Trade {
                symbol: fill.symbol.clone(),
                entry_side: position.entry_side.unwrap_or_else(|| fill.side.opposite()),
                entry_time: position.entry_time.unwrap_or(fill.timestamp),
                entry_price: position.cost_basis,
                exit_time: fill.timestamp,
                exit_price: fill.price,
                quantity: closed,
                realized_pnl: gross - close_commission,
                commission: close_commission,
                rule_id: fill.rule_id.clone(),
                strategy_id: fill.strategy_id.clone(),
            });

            position.quantity = q1;
            position.cost_basis = fill.price;
            position.entry_time = Some(fill.timestamp);
            position.entry_side = Some(fill.side);
        }

        position.last_price = fill.price;
        self.append_equity_point(fill.timestamp)?;
        self.verify_reconciliation()
    }

    /// Revalue open positions at the latest observed prices and append an
    /// equity point.
    pub fn apply_mark(
        &mut self,
        timestamp: DateTime<Utc>,
        prices: &BTreeMap<String, Decimal>,
    ) -> Result<(), PortfolioError> {
        for (symbol, price) in prices {
            if let Some(position) = self.positions.get_mut(symbol) {
                position.last_price = *price;
            }
        }
        self.append_equity_point(timestamp)?;
        self.verify_reconciliation()
    }

    fn append_equity_point(&mut self, timestamp: DateTime<Utc>) -> Result<(), PortfolioError> {
        if let Some(last) = self.equity_curve.last() {
            if timestamp < last.timestamp {
                let detail = format!("{} after {}", timestamp, last.timestamp);
                self.violation = Some(detail.clone());
                return Err(PortfolioError::NonMonotonicEquity { detail });
            }
        }

        let positions_market_value = self.positions_market_value();
        let total_equity = self.cash + positions_market_value;
        if total_equity > self.peak_equity {
            self.peak_equity = total_equity;
        }
        let drawdown_from_peak = if self.peak_equity > Decimal::ZERO {
            (self.peak_equity - total_equity) / self.peak_equity
        } else {
            Decimal::ZERO
        };

        self.equity_curve.push(EquityCurvePoint {
            timestamp,
            cash: self.cash,
            positions_market_value,
            total_equity,
            drawdown_from_peak,
        });
        Ok(())
    }

    /// Cash reconciliation, checked after every event that touches state:
    /// cash + market value must equal initial capital plus gross realized
    /// P&L minus commissions plus open mark-to-market.
    pub fn verify_reconciliation(&mut self) -> Result<(), PortfolioError> {
        let lhs = self.cash + self.positions_market_value();
        let unrealized: Decimal = self.positions.values().map(|p| p.unrealized_pnl()).sum();
        let rhs = self.initial_capital + self.total_realized_pnl - self.total_commissions
            + unrealized;

        if (lhs - rhs).abs() > self.tolerance {
            let detail = format!("cash+mv={} expected={}", lhs, rhs);
            self.violation = Some(detail.clone());
            return Err(PortfolioError::Reconciliation { detail });
        }
        Ok(())
    }

    /// Closing market orders for every open position, priced downstream at
    /// each symbol's last observed price. Ordered by symbol so replays are
    /// stable.
    pub fn liquidation_orders(
        &self,
        ids: &OrderIdSource,
        timestamp: DateTime<Utc>,
    ) -> Vec<Order> {
        let mut open: Vec<&Position> = self.positions.values().filter(|p| !p.is_flat()).collect();
        open.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        open.iter()
            .map(|position| {
                let side = if position.is_long() { Side::Sell } else { Side::Buy };
                Order::market(
                    position.symbol.clone(),
                    side,
                    position.quantity.abs(),
                    timestamp,
                    "end_of_run",
                )
                .with_id(ids.next())
                .with_rule_id(format!("final_close_{}", position.symbol))
            })
            .collect()
    }

    pub fn equity(&self) -> Decimal {
        self.cash + self.positions_market_value()
    }

    pub fn positions_market_value(&self) -> Decimal {
        self.positions.values().map(|p| p.market_value()).sum()
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn position_quantity(&self, symbol: &str) -> Decimal {
        self.positions
            .get(symbol)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    /// Number of symbols with a non-zero quantity.
    pub fn open_position_count(&self) -> usize {
        self.positions.values().filter(|p| !p.is_flat()).count()
    }

    /// All positions (including retained flat ones), ordered by symbol.
    pub fn positions_sorted(&self) -> BTreeMap<String, Position> {
        self.positions
            .iter()
            .map(|(s, p)| (s.clone(), p.clone()))
            .collect()
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn equity_curve(&self) -> &[EquityCurvePoint] {
        &self.equity_curve
    }

    pub fn total_commissions(&self) -> Decimal {
        self.total_commissions
    }

    pub fn total_realized_pnl(&self) -> Decimal {
        self.total_realized_pnl
    }

    /// Detail of the first invariant violation, if any. A poisoned
    /// portfolio aborts the run.
    pub fn violation(&self) -> Option<&str> {
        self.violation.as_deref()
    }
}

fn sign_of(value: Decimal) -> i8 {
    if value > Decimal::ZERO {
        1
    } else if value < Decimal::ZERO {
        -1
    } else {
        0
    }
}
