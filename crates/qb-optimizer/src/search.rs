use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde_json::Value;
use std::collections::BTreeMap;

use qb_types::{OptimizerError, ParameterDef, ParameterKind};

/// The ordered parameter search space.
///
/// Grid enumeration follows declaration order: the last declared parameter
/// varies fastest, like nested loops.
#[derive(Debug, Clone)]
pub struct ParameterSpace {
    parameters: Vec<ParameterDef>,
}

impl ParameterSpace {
    pub fn new(parameters: Vec<ParameterDef>) -> Self {
        Self { parameters }
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn parameters(&self) -> &[ParameterDef] {
        &self.parameters
    }

    /// Full Cartesian product over the discrete axes. Float dimensions need
    /// an explicit `step` to be grid-able.
    pub fn grid_points(&self) -> Result<Vec<BTreeMap<String, Value>>, OptimizerError> {
        if self.parameters.is_empty() {
            return Err(OptimizerError::EmptySpace);
        }

        let mut axes: Vec<(String, Vec<Value>)> = Vec::with_capacity(self.parameters.len());
        for def in &self.parameters {
            let values = match &def.kind {
                ParameterKind::Int { min, max, step } => {
                    let step = (*step).max(1);
                    let mut values = Vec::new();
                    let mut v = *min;
                    while v <= *max {
                        values.push(Value::from(v));
                        v += step;
                    }
                    values
                }
                ParameterKind::Float { min, max, step, .. } => {
                    let step = step.ok_or_else(|| OptimizerError::GridRequiresStep {
                        parameter: def.name.clone(),
                    })?;
                    let mut values = Vec::new();
                    let mut v = *min;
                    // Tolerate accumulated float error at the upper bound.
                    while v <= *max + step * 1e-9 {
                        values.push(Value::from(v));
                        v += step;
                    }
                    values
                }
                ParameterKind::Categorical { choices } => choices.clone(),
                ParameterKind::Bool => vec![Value::from(false), Value::from(true)],
            };
            axes.push((def.name.clone(), values));
        }

        let mut points: Vec<BTreeMap<String, Value>> = vec![BTreeMap::new()];
        for (name, values) in &axes {
            let mut next = Vec::with_capacity(points.len() * values.len());
            for existing in &points {
                for value in values {
                    let mut point = existing.clone();
                    point.insert(name.clone(), value.clone());
                    next.push(point);
                }
            }
            points = next;
        }
        Ok(points)
    }

    /// One random point: uniform over integer/float ranges (log-uniform when
    /// flagged), uniform over categorical and boolean axes.
    pub fn sample(&self, rng: &mut ChaCha8Rng) -> BTreeMap<String, Value> {
        let mut point = BTreeMap::new();
        for def in &self.parameters {
            let value = match &def.kind {
                ParameterKind::Int { min, max, step } => {
                    let step = (*step).max(1);
                    let buckets = (max - min) / step + 1;
                    let index = rng.gen_range(0..buckets);
                    Value::from(min + index * step)
                }
                ParameterKind::Float { min, max, log, .. } => {
                    let v = if *log {
                        let (lo, hi) = (min.ln(), max.ln());
                        rng.gen_range(lo..=hi).exp()
                    } else {
                        rng.gen_range(*min..=*max)
                    };
                    Value::from(v)
                }
                ParameterKind::Categorical { choices } => {
                    choices[rng.gen_range(0..choices.len())].clone()
                }
                ParameterKind::Bool => Value::from(rng.gen_bool(0.5)),
            };
            point.insert(def.name.clone(), value);
        }
        point
    }
}
