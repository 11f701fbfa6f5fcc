use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

use qb_data::SplitWindow;
use qb_engine::BacktestCoordinator;
use qb_types::{ConfigError, OptimizerError, QbResult};

use crate::runner::Optimizer;
use crate::trial::{OptimizationReport, TrialRecord};

/// Window advancement mode: rolling keeps the train length fixed,
/// expanding anchors the train start at the first bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    Rolling,
    Expanding,
}

impl WindowType {
    pub fn parse(tag: Option<&str>) -> Result<Self, ConfigError> {
        match tag {
            None | Some("rolling") => Ok(WindowType::Rolling),
            Some("expanding") => Ok(WindowType::Expanding),
            Some(other) => Err(ConfigError::InvalidValue {
                field: "optimization.window_type".into(),
                message: format!("unknown window type {other:?}"),
            }),
        }
    }
}

/// One train/test window pair over the distinct-timestamp axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkForwardWindow {
    pub number: usize,
    pub train: SplitWindow,
    pub test: SplitWindow,
}

/// Build the window sequence: `window_size` train bars, `step_size` test
/// bars, advancing by `step_size` until the data runs out.
pub fn build_windows(
    total: usize,
    window_size: usize,
    step_size: usize,
    window_type: WindowType,
) -> Result<Vec<WalkForwardWindow>, OptimizerError> {
    if window_size == 0 || step_size == 0 {
        return Err(OptimizerError::InvalidWindow {
            message: "window_size and step_size must be positive".into(),
        });
    }
    if window_size + step_size > total {
        return Err(OptimizerError::InvalidWindow {
            message: format!(
                "window_size {window_size} + step_size {step_size} exceeds {total} timestamps"
            ),
        });
    }

    let mut windows = Vec::new();
    let mut number = 0;
    loop {
        let offset = number * step_size;
        let (train_start, train_end) = match window_type {
            WindowType::Rolling => (offset, offset + window_size),
            WindowType::Expanding => (0, window_size + offset),
        };
        let test_end = train_end + step_size;
        if test_end > total {
            break;
        }
        windows.push(WalkForwardWindow {
            number,
            train: SplitWindow::new(train_start, train_end),
            test: SplitWindow::new(train_end, test_end),
        });
        number += 1;
    }
    Ok(windows)
}

struct Aggregate {
    parameters: BTreeMap<String, Value>,
    train_scores: Vec<f64>,
    test_scores: Vec<f64>,
    last_trial: usize,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Walk-forward evaluation: within each window the best parameter set on
/// train is evaluated on the window's test segment; the final winner is the
/// parameter set with the best aggregate out-of-sample score (optionally
/// blended with its train score via `train_weight`/`test_weight`).
pub(crate) fn run_walk_forward(
    optimizer: &Optimizer,
    coordinator: &mut BacktestCoordinator,
) -> QbResult<OptimizationReport> {
    let settings = &optimizer.settings;
    let window_size = settings.window_size.ok_or_else(|| ConfigError::MissingField {
        field: "optimization.window_size".into(),
    })?;
    let step_size = settings.step_size.ok_or_else(|| ConfigError::MissingField {
        field: "optimization.step_size".into(),
    })?;
    let window_type = WindowType::parse(settings.window_type.as_deref())?;

    let total = coordinator.data().len();
    let windows = build_windows(total, window_size, step_size, window_type)?;
    let points = optimizer.points()?;
    info!(
        windows = windows.len(),
        points = points.len(),
        ?window_type,
        "starting walk-forward sweep"
    );

    let mut trials: Vec<TrialRecord> = Vec::new();
    let mut aggregates: BTreeMap<String, Aggregate> = BTreeMap::new();

    for window in &windows {
        coordinator
            .data_mut()
            .setup_index_windows(window.train, window.test)?;
        debug!(window = window.number, train = ?window.train, test = ?window.test, "evaluating window");

        let start = trials.len();
        for point in &points {
            let number = trials.len() + 1;
            trials.push(optimizer.run_trial(coordinator, number, point));
        }

        // Window-best on train, evaluated out of sample.
        let best = trials[start..]
            .iter()
            .enumerate()
            .filter(|(_, trial)| !trial.failed)
            .fold(None::<(usize, f64)>, |best, (offset, trial)| match best {
                Some((_, score)) if !optimizer.objective.better(trial.train_score, score) => best,
                _ => Some((offset, trial.train_score)),
            });

        if let Some((offset, _)) = best {
            let trial = &trials[start + offset];
            let key = serde_json::to_string(&trial.parameters).unwrap_or_default();
            let entry = aggregates.entry(key).or_insert_with(|| Aggregate {
                parameters: trial.parameters.clone(),
                train_scores: Vec::new(),
                test_scores: Vec::new(),
                last_trial: start + offset,
            });
            entry.train_scores.push(trial.train_score);
            entry.test_scores.push(trial.test_score);
            entry.last_trial = start + offset;
        }
    }

    if aggregates.is_empty() {
        return Err(OptimizerError::NoTrials.into());
    }

    // Aggregate OOS selection; explicit weights blend the train side in.
    let (train_weight, test_weight) = match (settings.train_weight, settings.test_weight) {
        (None, None) => (0.0, 1.0),
        (tw, sw) => (tw.unwrap_or(0.5), sw.unwrap_or(0.5)),
    };

    let mut winner: Option<(&Aggregate, f64)> = None;
    for aggregate in aggregates.values() {
        let score =
            train_weight * mean(&aggregate.train_scores) + test_weight * mean(&aggregate.test_scores);
        let replace = match &winner {
            None => true,
            Some((_, incumbent)) => optimizer.objective.better(score, *incumbent),
        };
        if replace {
            winner = Some((aggregate, score));
        }
    }
    let (aggregate, best_score) = winner.ok_or(OptimizerError::NoTrials)?;
    let representative = &trials[aggregate.last_trial];
    let mean_train = mean(&aggregate.train_scores);
    let mean_test = mean(&aggregate.test_scores);
    info!(
        windows = windows.len(),
        best_score,
        mean_train,
        mean_test,
        "walk-forward sweep complete"
    );

    Ok(OptimizationReport {
        id: Uuid::new_v4(),
        method: "walk_forward".into(),
        objective: optimizer.objective.name().to_string(),
        best_parameters: aggregate.parameters.clone(),
        best_score,
        train_metrics: representative.train_metrics.clone(),
        test_metrics: representative.test_metrics.clone(),
        overfitting_score: optimizer.objective.overfitting_score(mean_train, mean_test),
        results_grid: trials,
    })
}
