//! End-to-end demo: synthetic daily bars through the full pipeline.
//!
//! Run with: cargo run --example ma_crossover

use chrono::{Duration, TimeZone, Utc};
use qb_data::HistoricalDataHandler;
use qb_engine::BacktestCoordinator;
use qb_types::{
    BacktestConfig, BacktestSettings, Bar, BrokerSettings, CommissionSpec, DataSettings,
    RiskSettings, SlippageSpec, StrategySpec, Timeframe,
};
use rust_decimal::Decimal;

fn synthetic_bars(symbol: &str, days: usize) -> Vec<Bar> {
    let start = Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap();
    let mut bars = Vec::with_capacity(days);
    let mut price = 100.0f64;

    for i in 0..days {
        // Trend plus a slow cycle, fully deterministic.
        let drift = 0.05;
        let cycle = 3.0 * ((i as f64) / 12.0).sin();
        price = (price + drift + cycle * 0.1).max(1.0);

        let close = Decimal::from_f64_retain(price).unwrap_or(Decimal::from(100)).round_dp(2);
        let open = Decimal::from_f64_retain(price - 0.2).unwrap_or(close).round_dp(2);
        let high = close + Decimal::new(5, 1);
        let low = open - Decimal::new(5, 1);
        bars.push(Bar::new(
            symbol,
            start + Duration::days(i as i64),
            open,
            high,
            low,
            close,
            Decimal::from(1_000_000),
            Timeframe::Day,
        ));
    }
    bars
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = BacktestConfig {
        backtest: BacktestSettings {
            initial_capital: Decimal::from(100_000),
            symbols: vec!["DEMO".into()],
            timeframe: Timeframe::Day,
        },
        data: DataSettings::default(),
        strategy: StrategySpec {
            name: "ma_crossover".into(),
            params: [
                ("fast_period".to_string(), 5.into()),
                ("slow_period".to_string(), 20.into()),
            ]
            .into(),
        },
        risk: RiskSettings::default(),
        broker: BrokerSettings {
            slippage: SlippageSpec::Fixed { bps: Decimal::from(5) },
            commission: CommissionSpec::Percentage { rate: Decimal::new(5, 4) },
            fill_delay_bars: 0,
            seed: None,
        },
        optimization: None,
        output_dir: None,
    };

    let mut data = HistoricalDataHandler::new(Timeframe::Day);
    data.add_series("DEMO", synthetic_bars("DEMO", 250))?;

    let mut coordinator = BacktestCoordinator::new(config, data)?;
    let results = coordinator.run()?;

    let final_point = results.equity_curve.last().expect("non-empty equity curve");
    println!("bars replayed : 250");
    println!("orders placed : {}", results.orders.len());
    println!("trades closed : {}", results.trades.len());
    println!("final equity  : {}", final_point.total_equity);
    println!("max drawdown  : {}", results
        .equity_curve
        .iter()
        .map(|p| p.drawdown_from_peak)
        .max()
        .unwrap_or_default());

    Ok(())
}
