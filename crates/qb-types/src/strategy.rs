use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

use crate::errors::ConfigError;
use crate::market::Bar;
use crate::signal::{Direction, Signal};

/// The strategy contract.
///
/// A strategy consumes bars and may emit a directional signal per bar. It is
/// pure with respect to the bar stream: replaying the same bars produces the
/// same signals. It never reads from the portfolio, the order manager, or
/// the broker; position awareness belongs to the risk manager.
pub trait Strategy {
    /// Identifier used in rule ids and trade records.
    fn name(&self) -> &str;

    /// Apply parameters. Called once at setup and again per optimizer trial.
    fn configure(&mut self, params: &HashMap<String, Value>) -> Result<(), ConfigError>;

    fn on_bar(&mut self, bar: &Bar) -> Option<Signal>;

    /// Restore freshly-constructed indicator state, keeping configuration.
    fn reset(&mut self);
}

/// Instantiate a strategy by configuration name.
pub fn create_strategy(
    name: &str,
    params: &HashMap<String, Value>,
) -> Result<Box<dyn Strategy>, ConfigError> {
    match name {
        "ma_crossover" => {
            let mut strategy = MovingAverageCrossover::default();
            strategy.configure(params)?;
            Ok(Box::new(strategy))
        }
        "momentum" => {
            let mut strategy = Momentum::default();
            strategy.configure(params)?;
            Ok(Box::new(strategy))
        }
        "buy_and_hold" => {
            let mut strategy = BuyAndHold::default();
            strategy.configure(params)?;
            Ok(Box::new(strategy))
        }
        "mean_reversion" => {
            let mut strategy = MeanReversion::default();
            strategy.configure(params)?;
            Ok(Box::new(strategy))
        }
        "rsi" => {
            let mut strategy = Rsi::default();
            strategy.configure(params)?;
            Ok(Box::new(strategy))
        }
        other => Err(ConfigError::UnknownStrategy { name: other.into() }),
    }
}

pub fn is_known_strategy(name: &str) -> bool {
    matches!(
        name,
        "ma_crossover" | "momentum" | "buy_and_hold" | "mean_reversion" | "rsi"
    )
}

fn param_usize(
    params: &HashMap<String, Value>,
    key: &str,
    default: usize,
) -> Result<usize, ConfigError> {
    match params.get(key) {
        None => Ok(default),
        Some(value) => value
            .as_u64()
            .map(|v| v as usize)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: key.into(),
                message: format!("expected a positive integer, got {value}"),
            }),
    }
}

fn param_decimal(
    params: &HashMap<String, Value>,
    key: &str,
    default: Decimal,
) -> Result<Decimal, ConfigError> {
    match params.get(key) {
        None => Ok(default),
        Some(value) => value
            .as_f64()
            .and_then(Decimal::from_f64_retain)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: key.into(),
                message: format!("expected a number, got {value}"),
            }),
    }
}

fn sma(window: &VecDeque<Decimal>, period: usize) -> Option<Decimal> {
    if window.len() < period {
        return None;
    }
    let sum: Decimal = window.iter().rev().take(period).sum();
    Some(sum / Decimal::from(period))
}

/// Moving average crossover.
///
/// Emits a sustained long signal while the fast MA is above the slow MA and
/// a sustained short signal while it is below; equality emits nothing.
/// Downstream grouping collapses the sustained runs.
#[derive(Debug, Clone)]
pub struct MovingAverageCrossover {
    fast_period: usize,
    slow_period: usize,
    closes: HashMap<String, VecDeque<Decimal>>,
}

impl Default for MovingAverageCrossover {
    fn default() -> Self {
        Self {
            fast_period: 10,
            slow_period: 20,
            closes: HashMap::new(),
        }
    }
}

impl Strategy for MovingAverageCrossover {
    fn name(&self) -> &str {
        "ma_crossover"
    }

    fn configure(&mut self, params: &HashMap<String, Value>) -> Result<(), ConfigError> {
        self.fast_period = param_usize(params, "fast_period", self.fast_period)?;
        self.slow_period = param_usize(params, "slow_period", self.slow_period)?;
        if self.fast_period == 0 || self.slow_period == 0 {
            return Err(ConfigError::InvalidValue {
                field: "fast_period/slow_period".into(),
                message: "periods must be positive".into(),
            });
        }
        if self.fast_period >= self.slow_period {
            return Err(ConfigError::InvalidValue {
                field: "fast_period".into(),
                message: format!(
                    "fast period {} must be shorter than slow period {}",
                    self.fast_period, self.slow_period
                ),
            });
        }
        self.reset();
        Ok(())
    }

    fn on_bar(&mut self, bar: &Bar) -> Option<Signal> {
        let window = self.closes.entry(bar.symbol.clone()).or_default();
        window.push_back(bar.close);
        if window.len() > self.slow_period {
            window.pop_front();
        }

        let fast = sma(window, self.fast_period)?;
        let slow = sma(window, self.slow_period)?;

        let direction = if fast > slow {
            Direction::Long
        } else if fast < slow {
            Direction::Short
        } else {
            return None;
        };

        Some(Signal::new(
            bar.symbol.clone(),
            direction,
            bar.close,
            bar.timestamp,
            self.name(),
        ))
    }

    fn reset(&mut self) {
        self.closes.clear();
    }
}

/// Price momentum over a lookback window.
///
/// Long when the percentage change over the lookback exceeds the threshold,
/// short when it falls below the negative threshold, silent in between.
#[derive(Debug, Clone)]
pub struct Momentum {
    lookback: usize,
    threshold_pct: Decimal,
    closes: HashMap<String, VecDeque<Decimal>>,
}

impl Default for Momentum {
    fn default() -> Self {
        Self {
            lookback: 10,
            threshold_pct: Decimal::from(5),
            closes: HashMap::new(),
        }
    }
}

impl Momentum {
    fn momentum_pct(&self, window: &VecDeque<Decimal>) -> Option<Decimal> {
        if window.len() <= self.lookback {
            return None;
        }
        let current = window.back()?;
        let past = window.get(window.len() - 1 - self.lookback)?;
        if past.is_zero() {
            return None;
        }
        Some((*current - *past) / *past * Decimal::from(100))
    }
}

impl Strategy for Momentum {
    fn name(&self) -> &str {
        "momentum"
    }

    fn configure(&mut self, params: &HashMap<String, Value>) -> Result<(), ConfigError> {
        self.lookback = param_usize(params, "lookback", self.lookback)?;
        self.threshold_pct = param_decimal(params, "threshold_pct", self.threshold_pct)?;
        if self.lookback == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lookback".into(),
                message: "lookback must be positive".into(),
            });
        }
        self.reset();
        Ok(())
    }

    fn on_bar(&mut self, bar: &Bar) -> Option<Signal> {
        let window = self.closes.entry(bar.symbol.clone()).or_default();
        window.push_back(bar.close);
        if window.len() > self.lookback + 1 {
            window.pop_front();
        }

        let window = self.closes.get(&bar.symbol)?;
        let momentum = self.momentum_pct(window)?;

        let direction = if momentum > self.threshold_pct {
            Direction::Long
        } else if momentum < -self.threshold_pct {
            Direction::Short
        } else {
            return None;
        };

        Some(Signal::new(
            bar.symbol.clone(),
            direction,
            bar.close,
            bar.timestamp,
            self.name(),
        ))
    }

    fn reset(&mut self) {
        self.closes.clear();
    }
}

/// Goes long on the first bar per symbol and stays there.
#[derive(Debug, Clone, Default)]
pub struct BuyAndHold {
    seen: HashMap<String, bool>,
}

impl Strategy for BuyAndHold {
    fn name(&self) -> &str {
        "buy_and_hold"
    }

    fn configure(&mut self, _params: &HashMap<String, Value>) -> Result<(), ConfigError> {
        self.reset();
        Ok(())
    }

    fn on_bar(&mut self, bar: &Bar) -> Option<Signal> {
        // Sustained long from the first bar; grouping downstream opens the
        // position exactly once.
        self.seen.insert(bar.symbol.clone(), true);
        Some(Signal::new(
            bar.symbol.clone(),
            Direction::Long,
            bar.close,
            bar.timestamp,
            self.name(),
        ))
    }

    fn reset(&mut self) {
        self.seen.clear();
    }
}

/// Z-score mean reversion.
///
/// Short when the close sits more than `entry_threshold` standard
/// deviations above the rolling mean, long when equally far below, flat
/// signal once it re-enters `exit_threshold`.
#[derive(Debug, Clone)]
pub struct MeanReversion {
    lookback: usize,
    entry_threshold: Decimal,
    exit_threshold: Decimal,
    closes: HashMap<String, VecDeque<Decimal>>,
    state: HashMap<String, Direction>,
}

impl Default for MeanReversion {
    fn default() -> Self {
        Self {
            lookback: 20,
            entry_threshold: Decimal::from(2),
            exit_threshold: Decimal::ONE,
            closes: HashMap::new(),
            state: HashMap::new(),
        }
    }
}

impl MeanReversion {
    fn z_score(&self, window: &VecDeque<Decimal>) -> Option<Decimal> {
        if window.len() < self.lookback {
            return None;
        }
        let current = *window.back()?;
        let mean: Decimal = window.iter().sum::<Decimal>() / Decimal::from(window.len());
        let variance: Decimal = window
            .iter()
            .map(|price| (*price - mean) * (*price - mean))
            .sum::<Decimal>()
            / Decimal::from(window.len());
        let std_dev = variance
            .to_f64()
            .map(f64::sqrt)
            .and_then(Decimal::from_f64_retain)?;
        if std_dev.is_zero() {
            return None;
        }
        Some((current - mean) / std_dev)
    }
}

impl Strategy for MeanReversion {
    fn name(&self) -> &str {
        "mean_reversion"
    }

    fn configure(&mut self, params: &HashMap<String, Value>) -> Result<(), ConfigError> {
        self.lookback = param_usize(params, "lookback", self.lookback)?;
        self.entry_threshold =
            param_decimal(params, "entry_threshold", self.entry_threshold)?;
        self.exit_threshold = param_decimal(params, "exit_threshold", self.exit_threshold)?;
        if self.lookback < 2 {
            return Err(ConfigError::InvalidValue {
                field: "lookback".into(),
                message: "lookback must be at least 2".into(),
            });
        }
        if self.exit_threshold >= self.entry_threshold {
            return Err(ConfigError::InvalidValue {
                field: "exit_threshold".into(),
                message: "exit threshold must sit inside the entry threshold".into(),
            });
        }
        self.reset();
        Ok(())
    }

    fn on_bar(&mut self, bar: &Bar) -> Option<Signal> {
        let window = self.closes.entry(bar.symbol.clone()).or_default();
        window.push_back(bar.close);
        if window.len() > self.lookback {
            window.pop_front();
        }

        let z = {
            let window = self.closes.get(&bar.symbol)?;
            self.z_score(window)?
        };
        let held = self
            .state
            .get(bar.symbol.as_str())
            .copied()
            .unwrap_or(Direction::Flat);

        let next = if z > self.entry_threshold {
            Direction::Short
        } else if z < -self.entry_threshold {
            Direction::Long
        } else if z.abs() < self.exit_threshold {
            Direction::Flat
        } else {
            held
        };
        self.state.insert(bar.symbol.clone(), next);

        Some(Signal::new(
            bar.symbol.clone(),
            next,
            bar.close,
            bar.timestamp,
            self.name(),
        ))
    }

    fn reset(&mut self) {
        self.closes.clear();
        self.state.clear();
    }
}

/// Relative strength index: long below the oversold threshold, short above
/// the overbought threshold.
#[derive(Debug, Clone)]
pub struct Rsi {
    lookback: usize,
    oversold: Decimal,
    overbought: Decimal,
    closes: HashMap<String, VecDeque<Decimal>>,
}

impl Default for Rsi {
    fn default() -> Self {
        Self {
            lookback: 14,
            oversold: Decimal::from(30),
            overbought: Decimal::from(70),
            closes: HashMap::new(),
        }
    }
}

impl Rsi {
    fn rsi(&self, window: &VecDeque<Decimal>) -> Option<Decimal> {
        if window.len() < self.lookback + 1 {
            return None;
        }
        let mut gains = Decimal::ZERO;
        let mut losses = Decimal::ZERO;
        let mut iter = window.iter();
        let mut previous = *iter.next()?;
        for price in iter {
            let change = *price - previous;
            if change > Decimal::ZERO {
                gains += change;
            } else {
                losses += change.abs();
            }
            previous = *price;
        }

        if losses.is_zero() {
            return Some(Decimal::from(100));
        }
        if gains.is_zero() {
            return Some(Decimal::ZERO);
        }
        let rs = gains / losses;
        Some(Decimal::from(100) - Decimal::from(100) / (Decimal::ONE + rs))
    }
}

impl Strategy for Rsi {
    fn name(&self) -> &str {
        "rsi"
    }

    fn configure(&mut self, params: &HashMap<String, Value>) -> Result<(), ConfigError> {
        self.lookback = param_usize(params, "lookback", self.lookback)?;
        self.oversold = param_decimal(params, "oversold", self.oversold)?;
        self.overbought = param_decimal(params, "overbought", self.overbought)?;
        if self.lookback == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lookback".into(),
                message: "lookback must be positive".into(),
            });
        }
        if self.oversold >= self.overbought {
            return Err(ConfigError::InvalidValue {
                field: "oversold".into(),
                message: "oversold threshold must sit below overbought".into(),
            });
        }
        self.reset();
        Ok(())
    }

    fn on_bar(&mut self, bar: &Bar) -> Option<Signal> {
        let window = self.closes.entry(bar.symbol.clone()).or_default();
        window.push_back(bar.close);
        if window.len() > self.lookback + 1 {
            window.pop_front();
        }

        let rsi = {
            let window = self.closes.get(&bar.symbol)?;
            self.rsi(window)?
        };

        let direction = if rsi < self.oversold {
            Direction::Long
        } else if rsi > self.overbought {
            Direction::Short
        } else {
            return None;
        };

        Some(Signal::new(
            bar.symbol.clone(),
            direction,
            bar.close,
            bar.timestamp,
            self.name(),
        ))
    }

    fn reset(&mut self) {
        self.closes.clear();
    }
}
