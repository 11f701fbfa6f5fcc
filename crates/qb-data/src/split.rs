use chrono::{DateTime, Utc};
use std::collections::HashMap;

use qb_types::{DataError, SplitSpec};

pub const TRAIN_SPLIT: &str = "train";
pub const TEST_SPLIT: &str = "test";

/// Half-open index window `[start, end)` over the ordered distinct-timestamp
/// axis of the loaded data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitWindow {
    pub start: usize,
    pub end: usize,
}

impl SplitWindow {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Compute named train/test windows from a split specification.
///
/// Splitting happens on the merged distinct-timestamp axis, so train and
/// test never share a timestamp for any symbol. Boundaries are inclusive on
/// the left, exclusive on the right, in every mode.
pub fn compute_splits(
    spec: &SplitSpec,
    timestamps: &[DateTime<Utc>],
) -> Result<HashMap<String, SplitWindow>, DataError> {
    let total = timestamps.len();
    if total == 0 {
        return Err(DataError::NoData);
    }

    let (train, test) = match spec {
        SplitSpec::Ratio { train_ratio, test_ratio } => {
            if !(0.0..1.0).contains(train_ratio) || *train_ratio <= 0.0 {
                return Err(DataError::InvalidSplit {
                    message: format!("train_ratio {train_ratio} must be in (0, 1)"),
                });
            }
            if let Some(test_ratio) = test_ratio {
                if train_ratio + test_ratio > 1.0 + f64::EPSILON {
                    return Err(DataError::InvalidSplit {
                        message: format!(
                            "train_ratio {train_ratio} + test_ratio {test_ratio} exceeds 1"
                        ),
                    });
                }
            }
            let boundary = ((total as f64) * train_ratio).floor() as usize;
            let test_end = match test_ratio {
                Some(ratio) => {
                    (boundary + ((total as f64) * ratio).floor() as usize).min(total)
                }
                None => total,
            };
            (
                SplitWindow::new(0, boundary),
                SplitWindow::new(boundary, test_end),
            )
        }
        SplitSpec::Date {
            train_start,
            train_end,
            test_start,
            test_end,
        } => {
            let index_of = |at: &DateTime<Utc>| timestamps.partition_point(|ts| ts < at);
            (
                SplitWindow::new(index_of(train_start), index_of(train_end)),
                SplitWindow::new(index_of(test_start), index_of(test_end)),
            )
        }
        SplitSpec::Fixed {
            train_periods,
            test_periods,
        } => {
            let train_end = (*train_periods).min(total);
            let test_end = (train_end + test_periods).min(total);
            (
                SplitWindow::new(0, train_end),
                SplitWindow::new(train_end, test_end),
            )
        }
    };

    if train.is_empty() || test.is_empty() {
        return Err(DataError::InvalidSplit {
            message: format!(
                "split produced empty window (train {}..{}, test {}..{}, {} timestamps)",
                train.start, train.end, test.start, test.end, total
            ),
        });
    }

    let mut splits = HashMap::new();
    splits.insert(TRAIN_SPLIT.to_string(), train);
    splits.insert(TEST_SPLIT.to_string(), test);
    Ok(splits)
}
