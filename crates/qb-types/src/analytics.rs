use std::collections::BTreeMap;

use crate::portfolio::{EquityCurvePoint, Trade};

/// Hook for computing summary statistics from run artifacts.
///
/// The engine treats statistics as an external concern: whatever
/// implementation is attached to the coordinator fills the `statistics`
/// field of the results from the equity curve and the trade ledger.
pub trait PerformanceAnalytics {
    fn compute(&self, equity_curve: &[EquityCurvePoint], trades: &[Trade]) -> BTreeMap<String, f64>;
}
