use rust_decimal::Decimal;

use qb_types::{ConfigError, RiskSettings};

/// Position sizing policy, parsed from the `risk` configuration section.
#[derive(Debug, Clone, PartialEq)]
pub enum SizingPolicy {
    /// Fixed number of units per opening order.
    Fixed { size: Decimal },
    /// `floor((equity · pct) / price)` units.
    PercentEquity { pct: Decimal },
    /// `floor((equity · risk_pct) / (price · stop_pct))` units.
    PercentRisk { risk_pct: Decimal, stop_pct: Decimal },
}

impl SizingPolicy {
    pub fn from_settings(settings: &RiskSettings) -> Result<Self, ConfigError> {
        match settings.position_sizing_method.as_str() {
            "fixed" => {
                let size = settings.position_size.ok_or_else(|| ConfigError::MissingField {
                    field: "risk.position_size".into(),
                })?;
                if size <= Decimal::ZERO {
                    return Err(ConfigError::InvalidValue {
                        field: "risk.position_size".into(),
                        message: "must be positive".into(),
                    });
                }
                Ok(SizingPolicy::Fixed { size })
            }
            "percent_equity" => {
                let pct = settings.max_position_pct.ok_or_else(|| ConfigError::MissingField {
                    field: "risk.max_position_pct".into(),
                })?;
                if pct <= Decimal::ZERO || pct > Decimal::ONE {
                    return Err(ConfigError::InvalidValue {
                        field: "risk.max_position_pct".into(),
                        message: "must be in (0, 1]".into(),
                    });
                }
                Ok(SizingPolicy::PercentEquity { pct })
            }
            "percent_risk" => {
                let risk_pct = settings.risk_pct.ok_or_else(|| ConfigError::MissingField {
                    field: "risk.risk_pct".into(),
                })?;
                let stop_pct = settings.stop_pct.ok_or_else(|| ConfigError::MissingField {
                    field: "risk.stop_pct".into(),
                })?;
                if risk_pct <= Decimal::ZERO || stop_pct <= Decimal::ZERO {
                    return Err(ConfigError::InvalidValue {
                        field: "risk.risk_pct/risk.stop_pct".into(),
                        message: "must be positive".into(),
                    });
                }
                Ok(SizingPolicy::PercentRisk { risk_pct, stop_pct })
            }
            other => Err(ConfigError::UnknownSizingMethod {
                method: other.to_string(),
            }),
        }
    }

    /// Units to open given current equity and the signal's reference price.
    pub fn quantity(&self, equity: Decimal, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        match self {
            SizingPolicy::Fixed { size } => *size,
            SizingPolicy::PercentEquity { pct } => ((equity * pct) / price).floor(),
            SizingPolicy::PercentRisk { risk_pct, stop_pct } => {
                ((equity * risk_pct) / (price * stop_pct)).floor()
            }
        }
    }
}
