use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;

use qb_types::{Bar, Fill, Order, OrderId, OrderStatus, Signal};

/// Revaluation tick emitted after each bar (or batch of simultaneous bars),
/// carrying the latest close per symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkToMarket {
    pub timestamp: DateTime<Utc>,
    pub prices: BTreeMap<String, Decimal>,
}

/// Emitted by the order manager on every order status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusUpdate {
    pub order_id: OrderId,
    pub symbol: String,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub average_fill_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

/// Terminal event: the coordinator emits this once after the last bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestEnd {
    pub timestamp: DateTime<Utc>,
}

/// The typed event variants flowing through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    Bar(Bar),
    Signal(Signal),
    Order(Order),
    Fill(Fill),
    MarkToMarket(MarkToMarket),
    OrderStatus(OrderStatusUpdate),
    BacktestEnd(BacktestEnd),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Bar(_) => EventKind::Bar,
            EventPayload::Signal(_) => EventKind::Signal,
            EventPayload::Order(_) => EventKind::Order,
            EventPayload::Fill(_) => EventKind::Fill,
            EventPayload::MarkToMarket(_) => EventKind::MarkToMarket,
            EventPayload::OrderStatus(_) => EventKind::OrderStatus,
            EventPayload::BacktestEnd(_) => EventKind::BacktestEnd,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EventPayload::Bar(bar) => bar.timestamp,
            EventPayload::Signal(signal) => signal.timestamp,
            EventPayload::Order(order) => order.created_time,
            EventPayload::Fill(fill) => fill.timestamp,
            EventPayload::MarkToMarket(mark) => mark.timestamp,
            EventPayload::OrderStatus(update) => update.timestamp,
            EventPayload::BacktestEnd(end) => end.timestamp,
        }
    }

    /// Domain-dependent dedup key. Signals key by rule_id; orders by rule_id
    /// or assigned order id; fills by assigned order id. No key disables
    /// dedup for the event.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            EventPayload::Signal(signal) => signal.rule_id.clone(),
            EventPayload::Order(order) => order
                .rule_id
                .clone()
                .or_else(|| order.id.is_assigned().then(|| order.id.to_string())),
            EventPayload::Fill(fill) => {
                fill.order_id.is_assigned().then(|| fill.order_id.to_string())
            }
            _ => None,
        }
    }
}

/// Event type discriminant for registration and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    Bar,
    Signal,
    Order,
    Fill,
    MarkToMarket,
    OrderStatus,
    BacktestEnd,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Bar => "bar",
            EventKind::Signal => "signal",
            EventKind::Order => "order",
            EventKind::Fill => "fill",
            EventKind::MarkToMarket => "mark_to_market",
            EventKind::OrderStatus => "order_status",
            EventKind::BacktestEnd => "backtest_end",
        };
        write!(f, "{}", s)
    }
}

/// A payload in flight, carrying the consumption flag for the current
/// dispatch.
#[derive(Debug)]
pub struct Event {
    payload: EventPayload,
    consumed: Cell<bool>,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            consumed: Cell::new(false),
        }
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Stop dispatch: no further handlers see this event.
    pub fn consume(&self) {
        self.consumed.set(true);
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed.get()
    }
}
