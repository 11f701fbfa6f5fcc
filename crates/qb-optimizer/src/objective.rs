use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use qb_types::ConfigError;

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveDirection {
    Maximize,
    Minimize,
}

const RECOGNIZED: &[&str] = &[
    "sharpe_ratio",
    "sortino_ratio",
    "total_return",
    "profit_factor",
    "max_drawdown",
    "win_rate",
    "expectancy",
    "calmar_ratio",
    "combined_score",
];

/// A named objective over the metric suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    name: String,
    direction: ObjectiveDirection,
    weights: Option<BTreeMap<String, f64>>,
}

impl Objective {
    /// Parse a recognized objective name. `combined_score` requires metric
    /// weights; any other name ignores them.
    pub fn parse(
        name: &str,
        weights: Option<&BTreeMap<String, f64>>,
    ) -> Result<Self, ConfigError> {
        if !RECOGNIZED.contains(&name) {
            return Err(ConfigError::UnknownObjective { name: name.into() });
        }
        if name == "combined_score" && weights.map(|w| w.is_empty()).unwrap_or(true) {
            return Err(ConfigError::MissingField {
                field: "optimization.weights".into(),
            });
        }
        let direction = if name == "max_drawdown" {
            ObjectiveDirection::Minimize
        } else {
            ObjectiveDirection::Maximize
        };
        Ok(Self {
            name: name.to_string(),
            direction,
            weights: weights.cloned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> ObjectiveDirection {
        self.direction
    }

    /// The worst defined value: failed trials score here so they rank last
    /// without aborting the sweep.
    pub fn worst(&self) -> f64 {
        match self.direction {
            ObjectiveDirection::Maximize => f64::NEG_INFINITY,
            ObjectiveDirection::Minimize => f64::INFINITY,
        }
    }

    /// Scalar score from the computed metric suite.
    pub fn score(&self, stats: &BTreeMap<String, f64>) -> f64 {
        if self.name == "combined_score" {
            return self
                .weights
                .as_ref()
                .map(|weights| {
                    weights
                        .iter()
                        .map(|(metric, weight)| {
                            weight * stats.get(metric).copied().unwrap_or(0.0)
                        })
                        .sum()
                })
                .unwrap_or_else(|| self.worst());
        }
        stats.get(&self.name).copied().unwrap_or_else(|| self.worst())
    }

    /// True when `candidate` beats `incumbent` under this objective.
    /// NaN never wins.
    pub fn better(&self, candidate: f64, incumbent: f64) -> bool {
        if candidate.is_nan() {
            return false;
        }
        if incumbent.is_nan() {
            return true;
        }
        match self.direction {
            ObjectiveDirection::Maximize => candidate > incumbent,
            ObjectiveDirection::Minimize => candidate < incumbent,
        }
    }

    /// Scaled train-vs-test divergence: positive when the test score is
    /// worse than the train score, direction-adjusted.
    pub fn overfitting_score(&self, train: f64, test: f64) -> f64 {
        if !train.is_finite() || !test.is_finite() {
            return 0.0;
        }
        let scale = train.abs().max(1e-9);
        match self.direction {
            ObjectiveDirection::Maximize => (train - test) / scale,
            ObjectiveDirection::Minimize => (test - train) / scale,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn recognized_names_parse() {
        for name in ["sharpe_ratio", "total_return", "win_rate", "calmar_ratio"] {
            let objective = Objective::parse(name, None).unwrap();
            assert_eq!(objective.direction(), ObjectiveDirection::Maximize);
        }
        let drawdown = Objective::parse("max_drawdown", None).unwrap();
        assert_eq!(drawdown.direction(), ObjectiveDirection::Minimize);
    }

    #[test]
    fn unknown_name_rejected() {
        assert!(matches!(
            Objective::parse("alpha_decay", None),
            Err(ConfigError::UnknownObjective { .. })
        ));
    }

    #[test]
    fn combined_score_requires_weights() {
        assert!(Objective::parse("combined_score", None).is_err());

        let weights = stats(&[("sharpe_ratio", 0.7), ("win_rate", 0.3)]);
        let objective = Objective::parse("combined_score", Some(&weights)).unwrap();
        let score = objective.score(&stats(&[("sharpe_ratio", 2.0), ("win_rate", 0.5)]));
        assert!((score - (0.7 * 2.0 + 0.3 * 0.5)).abs() < 1e-12);
    }

    #[test]
    fn minimize_direction_flips_comparison() {
        let drawdown = Objective::parse("max_drawdown", None).unwrap();
        assert!(drawdown.better(0.05, 0.10));
        assert!(!drawdown.better(0.10, 0.05));
        assert_eq!(drawdown.worst(), f64::INFINITY);

        let sharpe = Objective::parse("sharpe_ratio", None).unwrap();
        assert!(sharpe.better(2.0, 1.0));
        assert_eq!(sharpe.worst(), f64::NEG_INFINITY);
    }

    #[test]
    fn overfitting_score_direction_adjusted() {
        let sharpe = Objective::parse("sharpe_ratio", None).unwrap();
        // Train 2.0, test 1.0: overfit by half the train score.
        assert!((sharpe.overfitting_score(2.0, 1.0) - 0.5).abs() < 1e-12);

        let drawdown = Objective::parse("max_drawdown", None).unwrap();
        // Train dd 0.1, test dd 0.2: worse out of sample.
        assert!(drawdown.overfitting_score(0.1, 0.2) > 0.0);
    }

    #[test]
    fn nan_never_wins() {
        let sharpe = Objective::parse("sharpe_ratio", None).unwrap();
        assert!(!sharpe.better(f64::NAN, 1.0));
        assert!(sharpe.better(1.0, f64::NAN));
    }
}
