use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::errors::OrderError;

/// Unique order identifier, assigned from a run-scoped sequence.
///
/// Zero is the unassigned sentinel; the order manager assigns an id to any
/// order that arrives without one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct OrderId(pub u64);

impl OrderId {
    pub const UNASSIGNED: OrderId = OrderId(0);

    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ord-{}", self.0)
    }
}

/// Shared deterministic order-id sequence.
///
/// One source is shared by every component of a backtest graph, so ids are
/// unique across the run; `reset` rewinds it so a replayed run produces
/// identical ids.
#[derive(Debug, Clone, Default)]
pub struct OrderIdSource(Rc<Cell<u64>>);

impl OrderIdSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> OrderId {
        let next = self.0.get() + 1;
        self.0.set(next);
        OrderId(next)
    }

    pub fn reset(&self) {
        self.0.set(0);
    }
}

/// Direction of an order (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn sign(&self) -> i8 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }

    /// Uppercase label used in rule ids.
    pub fn label(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Order types supported by the simulator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit { price: Decimal },
    Stop { stop_price: Decimal },
}

/// Order status during lifecycle. Transitions are monotonic: once an order
/// reaches a terminal state it never moves again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Created,
    Pending,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match self {
            Created => matches!(next, Pending | Rejected),
            Pending => matches!(next, PartiallyFilled | Filled | Canceled | Rejected | Expired),
            PartiallyFilled => matches!(next, PartiallyFilled | Filled | Canceled | Expired),
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Created => "created",
            OrderStatus::Pending => "pending",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

/// An instruction to trade, produced by the risk manager or the end-of-run
/// liquidation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    pub filled_quantity: Decimal,
    pub average_fill_price: Option<Decimal>,
    pub rule_id: Option<String>,
    pub parent_id: Option<String>,
    pub strategy_id: String,
}

impl Order {
    pub fn market(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        timestamp: DateTime<Utc>,
        strategy_id: impl Into<String>,
    ) -> Self {
        Self::new(symbol, side, quantity, OrderType::Market, timestamp, strategy_id)
    }

    pub fn limit(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        timestamp: DateTime<Utc>,
        strategy_id: impl Into<String>,
    ) -> Self {
        Self::new(symbol, side, quantity, OrderType::Limit { price }, timestamp, strategy_id)
    }

    pub fn stop(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        stop_price: Decimal,
        timestamp: DateTime<Utc>,
        strategy_id: impl Into<String>,
    ) -> Self {
        Self::new(
            symbol,
            side,
            quantity,
            OrderType::Stop { stop_price },
            timestamp,
            strategy_id,
        )
    }

    fn new(
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        order_type: OrderType,
        timestamp: DateTime<Utc>,
        strategy_id: impl Into<String>,
    ) -> Self {
        Self {
            id: OrderId::UNASSIGNED,
            symbol: symbol.into(),
            side,
            quantity,
            order_type,
            status: OrderStatus::Created,
            created_time: timestamp,
            updated_time: timestamp,
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            rule_id: None,
            parent_id: None,
            strategy_id: strategy_id.into(),
        }
    }

    pub fn with_id(mut self, id: OrderId) -> Self {
        self.id = id;
        self
    }

    pub fn with_rule_id(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Created | OrderStatus::Pending | OrderStatus::PartiallyFilled
        )
    }

    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }

    /// Move to `next`, rejecting any transition the lifecycle does not allow.
    pub fn transition(&mut self, next: OrderStatus, at: DateTime<Utc>) -> Result<(), OrderError> {
        if !self.status.can_transition_to(next) {
            return Err(OrderError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_time = at;
        Ok(())
    }

    /// Record an execution against this order, keeping the weighted average
    /// fill price and advancing the status.
    pub fn apply_fill(
        &mut self,
        quantity: Decimal,
        price: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), OrderError> {
        let fill_quantity = quantity.min(self.remaining_quantity());
        let total_filled = self.filled_quantity + fill_quantity;

        self.average_fill_price = Some(match self.average_fill_price {
            Some(avg) if !total_filled.is_zero() => {
                (avg * self.filled_quantity + price * fill_quantity) / total_filled
            }
            _ => price,
        });
        self.filled_quantity = total_filled;

        let next = if self.remaining_quantity().is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        if self.status == OrderStatus::Created {
            self.transition(OrderStatus::Pending, at)?;
        }
        self.transition(next, at)
    }
}

/// A realized execution of an order at a specific price and quantity.
///
/// `rule_id` and `strategy_id` are copied through from the order so the
/// portfolio can stamp them onto trade records without a lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub commission: Decimal,
    pub timestamp: DateTime<Utc>,
    pub rule_id: Option<String>,
    pub strategy_id: String,
}

impl Fill {
    pub fn gross_amount(&self) -> Decimal {
        self.quantity * self.price
    }

    /// Signed effect on cash: buys pay, sells receive, commission always
    /// reduces cash.
    pub fn net_cash_delta(&self) -> Decimal {
        match self.side {
            Side::Buy => -(self.gross_amount() + self.commission),
            Side::Sell => self.gross_amount() - self.commission,
        }
    }

    /// Quantity signed by side: positive for buys, negative for sells.
    pub fn signed_quantity(&self) -> Decimal {
        match self.side {
            Side::Buy => self.quantity,
            Side::Sell => -self.quantity,
        }
    }
}
