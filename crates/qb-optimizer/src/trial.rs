use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique sweep identifier.
pub type SweepId = Uuid;

/// One evaluated parameter point: scored on the train split, re-scored on
/// the test split. Failed trials carry the objective's worst score and the
/// failure reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialRecord {
    pub number: usize,
    pub parameters: BTreeMap<String, Value>,
    pub train_score: f64,
    pub test_score: f64,
    pub train_metrics: BTreeMap<String, f64>,
    pub test_metrics: BTreeMap<String, f64>,
    pub failed: bool,
    pub error: Option<String>,
}

impl TrialRecord {
    pub fn failed(number: usize, parameters: BTreeMap<String, Value>, worst: f64, error: String) -> Self {
        Self {
            number,
            parameters,
            train_score: worst,
            test_score: worst,
            train_metrics: BTreeMap::new(),
            test_metrics: BTreeMap::new(),
            failed: true,
            error: Some(error),
        }
    }
}

/// Sweep output: the winning parameter set with its train/test metrics, the
/// overfitting score, and the full results grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationReport {
    pub id: SweepId,
    pub method: String,
    pub objective: String,
    pub best_parameters: BTreeMap<String, Value>,
    pub best_score: f64,
    pub train_metrics: BTreeMap<String, f64>,
    pub test_metrics: BTreeMap<String, f64>,
    pub overfitting_score: f64,
    pub results_grid: Vec<TrialRecord>,
}
