use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::orders::Side;

/// Directional intent produced by a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Flat,
    Short,
}

impl Direction {
    pub fn sign(&self) -> i8 {
        match self {
            Direction::Long => 1,
            Direction::Flat => 0,
            Direction::Short => -1,
        }
    }

    pub fn from_sign(sign: i8) -> Direction {
        match sign.signum() {
            1 => Direction::Long,
            -1 => Direction::Short,
            _ => Direction::Flat,
        }
    }

    /// Order side that opens a position in this direction.
    pub fn side(&self) -> Option<Side> {
        match self {
            Direction::Long => Some(Side::Buy),
            Direction::Short => Some(Side::Sell),
            Direction::Flat => None,
        }
    }
}

/// A directional signal for one symbol at one bar.
///
/// `rule_id` is left empty by strategies; the risk manager assigns it when a
/// signal opens a new group, and it becomes the dedup key for the downstream
/// order. Strategies are free to emit the same direction on every bar; the
/// risk manager collapses sustained runs into one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: Direction,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    pub strategy_id: String,
    pub rule_id: Option<String>,
}

impl Signal {
    pub fn new(
        symbol: impl Into<String>,
        direction: Direction,
        price: Decimal,
        timestamp: DateTime<Utc>,
        strategy_id: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            direction,
            price,
            timestamp,
            strategy_id: strategy_id.into(),
            rule_id: None,
        }
    }

    pub fn with_rule_id(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }
}
