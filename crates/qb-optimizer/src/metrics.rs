use rust_decimal::prelude::ToPrimitive;
use std::collections::BTreeMap;

use qb_types::{EquityCurvePoint, PerformanceAnalytics, Trade};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Standard metric suite computed from the equity curve and trade ledger.
///
/// Every objective the optimizer recognizes appears as a key here, so a
/// single computation serves both scoring and reporting.
pub fn compute_all(
    equity_curve: &[EquityCurvePoint],
    trades: &[Trade],
) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();

    let equities: Vec<f64> = equity_curve
        .iter()
        .filter_map(|p| p.total_equity.to_f64())
        .collect();
    let returns = period_returns(&equities);

    let total_return = match (equities.first(), equities.last()) {
        (Some(first), Some(last)) if *first != 0.0 => last / first - 1.0,
        _ => 0.0,
    };
    let annualized_return = if returns.is_empty() {
        0.0
    } else {
        (1.0 + total_return).powf(TRADING_DAYS_PER_YEAR / returns.len() as f64) - 1.0
    };

    let volatility = std_dev(&returns) * TRADING_DAYS_PER_YEAR.sqrt();
    let sharpe = ratio_over(&returns, std_dev(&returns));
    let sortino = ratio_over(&returns, downside_dev(&returns));

    let max_drawdown = equity_curve
        .iter()
        .filter_map(|p| p.drawdown_from_peak.to_f64())
        .fold(0.0f64, f64::max);
    let calmar = if max_drawdown > 0.0 {
        annualized_return / max_drawdown
    } else {
        0.0
    };

    let pnls: Vec<f64> = trades.iter().filter_map(|t| t.realized_pnl.to_f64()).collect();
    let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
    let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();
    let gross_profit: f64 = wins.iter().sum();
    let gross_loss: f64 = losses.iter().map(|p| p.abs()).sum();

    let win_rate = if pnls.is_empty() {
        0.0
    } else {
        wins.len() as f64 / pnls.len() as f64
    };
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };
    let expectancy = if pnls.is_empty() {
        0.0
    } else {
        pnls.iter().sum::<f64>() / pnls.len() as f64
    };

    out.insert("total_return".into(), total_return);
    out.insert("annualized_return".into(), annualized_return);
    out.insert("volatility".into(), volatility);
    out.insert("sharpe_ratio".into(), sharpe);
    out.insert("sortino_ratio".into(), sortino);
    out.insert("max_drawdown".into(), max_drawdown);
    out.insert("calmar_ratio".into(), calmar);
    out.insert("win_rate".into(), win_rate);
    out.insert("profit_factor".into(), profit_factor);
    out.insert("expectancy".into(), expectancy);
    out.insert("num_trades".into(), pnls.len() as f64);
    out.insert("total_pnl".into(), pnls.iter().sum());
    out
}

fn period_returns(equities: &[f64]) -> Vec<f64> {
    equities
        .windows(2)
        .filter(|pair| pair[0] != 0.0)
        .map(|pair| pair[1] / pair[0] - 1.0)
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance =
        values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Deviation of negative returns only, against a zero target.
fn downside_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let downside: f64 = values
        .iter()
        .filter(|v| **v < 0.0)
        .map(|v| v * v)
        .sum::<f64>()
        / values.len() as f64;
    downside.sqrt()
}

/// Annualized mean-return-over-deviation ratio; zero when the deviation
/// vanishes.
fn ratio_over(returns: &[f64], deviation: f64) -> f64 {
    if deviation == 0.0 {
        0.0
    } else {
        mean(returns) / deviation * TRADING_DAYS_PER_YEAR.sqrt()
    }
}

/// The analytics hook the coordinator accepts.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSuite;

impl PerformanceAnalytics for MetricsSuite {
    fn compute(
        &self,
        equity_curve: &[EquityCurvePoint],
        trades: &[Trade],
    ) -> BTreeMap<String, f64> {
        compute_all(equity_curve, trades)
    }
}
