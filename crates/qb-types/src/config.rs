use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use crate::errors::ConfigError;
use crate::market::Timeframe;
use crate::strategy::is_known_strategy;

/// Top-level `backtest` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSettings {
    pub initial_capital: Decimal,
    pub symbols: Vec<String>,
    #[serde(default)]
    pub timeframe: Timeframe,
}

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            initial_capital: Decimal::from(100000),
            symbols: Vec::new(),
            timeframe: Timeframe::Day,
        }
    }
}

/// Logical-to-physical column mapping for a CSV source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceColumns {
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: Option<String>,
}

impl Default for PriceColumns {
    fn default() -> Self {
        Self {
            open: "open".into(),
            high: "high".into(),
            low: "low".into(),
            close: "close".into(),
            volume: Some("volume".into()),
        }
    }
}

/// One per-symbol CSV source under `data.sources`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceSpec {
    pub symbol: String,
    pub file: PathBuf,
    pub date_column: Option<String>,
    pub date_format: Option<String>,
    pub price_columns: Option<PriceColumns>,
}

/// Train/test split under `data.train_test_split`. Boundaries are inclusive
/// on the left, exclusive on the right, in every mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SplitSpec {
    Ratio {
        train_ratio: f64,
        #[serde(default)]
        test_ratio: Option<f64>,
    },
    Date {
        train_start: DateTime<Utc>,
        train_end: DateTime<Utc>,
        test_start: DateTime<Utc>,
        test_end: DateTime<Utc>,
    },
    Fixed {
        train_periods: usize,
        test_periods: usize,
    },
}

/// `data` section.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataSettings {
    #[serde(default)]
    pub sources: Vec<DataSourceSpec>,
    pub train_test_split: Option<SplitSpec>,
}

/// `strategy` section: discovered by name, params merged with any
/// optimizer point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySpec {
    pub name: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

/// `risk` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSettings {
    pub position_sizing_method: String,
    pub position_size: Option<Decimal>,
    pub max_position_pct: Option<Decimal>,
    pub max_positions: Option<usize>,
    #[serde(default)]
    pub enforce_single_position: bool,
    pub risk_pct: Option<Decimal>,
    pub stop_pct: Option<Decimal>,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            position_sizing_method: "fixed".into(),
            position_size: Some(Decimal::from(100)),
            max_position_pct: None,
            max_positions: None,
            enforce_single_position: false,
            risk_pct: None,
            stop_pct: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlippageSpec {
    /// Fractional slippage: fill price moves by `amount` against the side.
    Percentage { amount: Decimal },
    /// Basis-point slippage.
    Fixed { bps: Decimal },
}

impl Default for SlippageSpec {
    fn default() -> Self {
        SlippageSpec::Percentage {
            amount: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommissionSpec {
    /// Fraction of fill notional.
    Percentage { rate: Decimal },
    /// Flat amount per unit traded.
    PerShare { amount: Decimal },
}

impl Default for CommissionSpec {
    fn default() -> Self {
        CommissionSpec::Percentage {
            rate: Decimal::ZERO,
        }
    }
}

/// `broker` section. With `seed` set, the slippage applied per fill gets a
/// deterministic jitter stream; without it, slippage is exactly the
/// configured amount.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BrokerSettings {
    #[serde(default)]
    pub slippage: SlippageSpec,
    #[serde(default)]
    pub commission: CommissionSpec,
    #[serde(default)]
    pub fill_delay_bars: u32,
    pub seed: Option<u64>,
}

/// One dimension of the optimizer parameter space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterKind {
    Int {
        min: i64,
        max: i64,
        #[serde(default = "default_int_step")]
        step: i64,
    },
    Float {
        min: f64,
        max: f64,
        step: Option<f64>,
        #[serde(default)]
        log: bool,
    },
    Categorical {
        choices: Vec<Value>,
    },
    Bool,
}

fn default_int_step() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: ParameterKind,
}

/// `optimization` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSettings {
    pub method: String,
    pub objective: String,
    /// Metric weights for the `combined_score` objective.
    pub weights: Option<BTreeMap<String, f64>>,
    pub num_trials: Option<usize>,
    #[serde(default)]
    pub parameter_space: Vec<ParameterDef>,
    pub seed: Option<u64>,
    pub window_size: Option<usize>,
    pub step_size: Option<usize>,
    pub window_type: Option<String>,
    pub train_weight: Option<f64>,
    pub test_weight: Option<f64>,
}

/// Complete backtest configuration. Loading from YAML/JSON is the caller's
/// concern; these structs are the interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub backtest: BacktestSettings,
    #[serde(default)]
    pub data: DataSettings,
    pub strategy: StrategySpec,
    #[serde(default)]
    pub risk: RiskSettings,
    #[serde(default)]
    pub broker: BrokerSettings,
    pub optimization: Option<OptimizationSettings>,
    pub output_dir: Option<PathBuf>,
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backtest.initial_capital <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue {
                field: "backtest.initial_capital".into(),
                message: "must be positive".into(),
            });
        }
        if self.backtest.symbols.is_empty() {
            return Err(ConfigError::MissingField {
                field: "backtest.symbols".into(),
            });
        }
        if !is_known_strategy(&self.strategy.name) {
            return Err(ConfigError::UnknownStrategy {
                name: self.strategy.name.clone(),
            });
        }
        if !matches!(
            self.risk.position_sizing_method.as_str(),
            "fixed" | "percent_equity" | "percent_risk"
        ) {
            return Err(ConfigError::UnknownSizingMethod {
                method: self.risk.position_sizing_method.clone(),
            });
        }
        Ok(())
    }
}
