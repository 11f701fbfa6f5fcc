use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};
use uuid::Uuid;

use qb_data::{TEST_SPLIT, TRAIN_SPLIT};
use qb_engine::BacktestCoordinator;
use qb_types::{ConfigError, OptimizationSettings, OptimizerError, QbResult};

use crate::metrics;
use crate::objective::Objective;
use crate::search::ParameterSpace;
use crate::trial::{OptimizationReport, TrialRecord};
use crate::walkforward;

const DEFAULT_RANDOM_TRIALS: usize = 25;

/// Drives a parameter sweep against a backtest coordinator.
///
/// Per trial: configure the strategy with the sampled point merged over the
/// fixed params, run the train split, score, run the test split, score.
/// Trials rank by the train objective; both scores land in the report.
pub struct Optimizer {
    pub(crate) settings: OptimizationSettings,
    pub(crate) space: ParameterSpace,
    pub(crate) objective: Objective,
    fixed_params: HashMap<String, Value>,
}

impl Optimizer {
    pub fn new(
        settings: &OptimizationSettings,
        fixed_params: &HashMap<String, Value>,
    ) -> Result<Self, ConfigError> {
        if !matches!(settings.method.as_str(), "grid" | "random" | "walk_forward") {
            return Err(ConfigError::UnknownSearchMethod {
                method: settings.method.clone(),
            });
        }
        let objective = Objective::parse(&settings.objective, settings.weights.as_ref())?;
        Ok(Self {
            settings: settings.clone(),
            space: ParameterSpace::new(settings.parameter_space.clone()),
            objective,
            fixed_params: fixed_params.clone(),
        })
    }

    pub fn objective(&self) -> &Objective {
        &self.objective
    }

    pub fn run(&self, coordinator: &mut BacktestCoordinator) -> QbResult<OptimizationReport> {
        if self.settings.method == "walk_forward" {
            return walkforward::run_walk_forward(self, coordinator);
        }

        let points = self.points()?;
        info!(
            method = %self.settings.method,
            objective = %self.objective.name(),
            trials = points.len(),
            "starting parameter sweep"
        );

        let mut trials = Vec::with_capacity(points.len());
        for (index, point) in points.iter().enumerate() {
            trials.push(self.run_trial(coordinator, index + 1, point));
        }

        self.build_report(&self.settings.method, trials)
    }

    /// Enumerate (grid) or sample (random, seeded) the points to evaluate.
    pub(crate) fn points(&self) -> Result<Vec<BTreeMap<String, Value>>, OptimizerError> {
        match self.settings.method.as_str() {
            "random" | "walk_forward" if self.settings.num_trials.is_some() => {
                if self.space.is_empty() {
                    return Err(OptimizerError::EmptySpace);
                }
                let count = self.settings.num_trials.unwrap_or(DEFAULT_RANDOM_TRIALS);
                let mut rng = ChaCha8Rng::seed_from_u64(self.settings.seed.unwrap_or(0));
                Ok((0..count).map(|_| self.space.sample(&mut rng)).collect())
            }
            "random" => {
                if self.space.is_empty() {
                    return Err(OptimizerError::EmptySpace);
                }
                let mut rng = ChaCha8Rng::seed_from_u64(self.settings.seed.unwrap_or(0));
                Ok((0..DEFAULT_RANDOM_TRIALS)
                    .map(|_| self.space.sample(&mut rng))
                    .collect())
            }
            _ => self.space.grid_points(),
        }
    }

    pub(crate) fn run_trial(
        &self,
        coordinator: &mut BacktestCoordinator,
        number: usize,
        point: &BTreeMap<String, Value>,
    ) -> TrialRecord {
        match self.evaluate(coordinator, point) {
            Ok((train_score, train_metrics, test_score, test_metrics)) => TrialRecord {
                number,
                parameters: point.clone(),
                train_score,
                test_score,
                train_metrics,
                test_metrics,
                failed: false,
                error: None,
            },
            Err(error) => {
                warn!(number, %error, "trial failed, scored as worst");
                TrialRecord::failed(number, point.clone(), self.objective.worst(), error)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn evaluate(
        &self,
        coordinator: &mut BacktestCoordinator,
        point: &BTreeMap<String, Value>,
    ) -> Result<(f64, BTreeMap<String, f64>, f64, BTreeMap<String, f64>), String> {
        let mut params = self.fixed_params.clone();
        for (key, value) in point {
            params.insert(key.clone(), value.clone());
        }

        coordinator
            .configure_strategy(&params)
            .map_err(|e| e.to_string())?;

        coordinator.activate_split(TRAIN_SPLIT).map_err(|e| e.to_string())?;
        coordinator.reset();
        let train = coordinator.run().map_err(|e| e.to_string())?;
        if train.trades.is_empty() {
            return Err("zero trades on the train split".into());
        }
        let train_metrics = metrics::compute_all(&train.equity_curve, &train.trades);
        let train_score = self.objective.score(&train_metrics);

        coordinator.activate_split(TEST_SPLIT).map_err(|e| e.to_string())?;
        coordinator.reset();
        let test = coordinator.run().map_err(|e| e.to_string())?;
        let test_metrics = metrics::compute_all(&test.equity_curve, &test.trades);
        let test_score = self.objective.score(&test_metrics);

        Ok((train_score, train_metrics, test_score, test_metrics))
    }

    fn build_report(
        &self,
        method: &str,
        trials: Vec<TrialRecord>,
    ) -> QbResult<OptimizationReport> {
        let best_index = trials
            .iter()
            .enumerate()
            .fold(None::<usize>, |best, (index, trial)| match best {
                None => Some(index),
                Some(current)
                    if self.objective.better(trial.train_score, trials[current].train_score) =>
                {
                    Some(index)
                }
                other => other,
            })
            .ok_or(OptimizerError::NoTrials)?;

        let best = &trials[best_index];
        info!(
            best_trial = best.number,
            train_score = best.train_score,
            test_score = best.test_score,
            "sweep complete"
        );

        Ok(OptimizationReport {
            id: Uuid::new_v4(),
            method: method.to_string(),
            objective: self.objective.name().to_string(),
            best_parameters: best.parameters.clone(),
            best_score: best.train_score,
            train_metrics: best.train_metrics.clone(),
            test_metrics: best.test_metrics.clone(),
            overfitting_score: self
                .objective
                .overfitting_score(best.train_score, best.test_score),
            results_grid: trials,
        })
    }
}
