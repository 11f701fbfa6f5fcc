use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Time resolution tag carried by every bar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    Minute,
    FiveMinute,
    FifteenMinute,
    Hour,
    FourHour,
    Day,
    Week,
}

impl Timeframe {
    pub fn to_seconds(&self) -> u64 {
        match self {
            Timeframe::Minute => 60,
            Timeframe::FiveMinute => 300,
            Timeframe::FifteenMinute => 900,
            Timeframe::Hour => 3600,
            Timeframe::FourHour => 14400,
            Timeframe::Day => 86400,
            Timeframe::Week => 604800,
        }
    }

    /// Parse the short tags used in configuration files ("1m", "1d", ...).
    pub fn parse(tag: &str) -> Option<Timeframe> {
        match tag {
            "1m" => Some(Timeframe::Minute),
            "5m" => Some(Timeframe::FiveMinute),
            "15m" => Some(Timeframe::FifteenMinute),
            "1h" => Some(Timeframe::Hour),
            "4h" => Some(Timeframe::FourHour),
            "1d" => Some(Timeframe::Day),
            "1w" => Some(Timeframe::Week),
            _ => None,
        }
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Timeframe::Day
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Timeframe::Minute => "1m",
            Timeframe::FiveMinute => "5m",
            Timeframe::FifteenMinute => "15m",
            Timeframe::Hour => "1h",
            Timeframe::FourHour => "4h",
            Timeframe::Day => "1d",
            Timeframe::Week => "1w",
        };
        write!(f, "{}", s)
    }
}

/// OHLCV bar data with volume and timestamp. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub timeframe: Timeframe,
}

impl Bar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
        timeframe: Timeframe,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            timeframe,
        }
    }

    /// Calculate typical price (HLC/3)
    pub fn typical_price(&self) -> Decimal {
        (self.high + self.low + self.close) / Decimal::from(3)
    }

    /// True when `price` lies inside the bar's trading range.
    pub fn range_contains(&self, price: Decimal) -> bool {
        price >= self.low && price <= self.high
    }
}

/// Latest observed bar per symbol.
///
/// The data handler writes here before dispatching each bar, so every
/// downstream component ("current price" lookups in the broker, the final
/// mark in the coordinator) reads prices that are current for the bar being
/// processed.
#[derive(Debug, Clone, Default)]
pub struct MarketState {
    latest: HashMap<String, Bar>,
    timestamp: Option<DateTime<Utc>>,
}

impl MarketState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bar: &Bar) {
        match self.timestamp {
            Some(ts) if ts >= bar.timestamp => {}
            _ => self.timestamp = Some(bar.timestamp),
        }
        self.latest.insert(bar.symbol.clone(), bar.clone());
    }

    pub fn bar(&self, symbol: &str) -> Option<&Bar> {
        self.latest.get(symbol)
    }

    pub fn close(&self, symbol: &str) -> Option<Decimal> {
        self.latest.get(symbol).map(|b| b.close)
    }

    /// Latest close per symbol, ordered by symbol for deterministic iteration.
    pub fn closes(&self) -> BTreeMap<String, Decimal> {
        self.latest
            .iter()
            .map(|(s, b)| (s.clone(), b.close))
            .collect()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn clear(&mut self) {
        self.latest.clear();
        self.timestamp = None;
    }
}
