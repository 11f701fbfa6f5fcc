use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use tracing::{debug, info};

use qb_data::HistoricalDataHandler;
use qb_events::{BacktestEnd, EventBus, EventHandler, EventKind, EventPayload, HandlerToken, MarkToMarket};
use qb_risk::RiskManager;
use qb_types::{
    create_strategy, BacktestConfig, ConfigError, DataError, EquityCurvePoint, Order,
    OrderIdSource, PerformanceAnalytics, Portfolio, PortfolioError, Position, QbResult, Trade,
};

use crate::execution::SimulatedBroker;
use crate::handlers::{PortfolioHandler, StrategyHandler};
use crate::orders::OrderManager;

// Handler priorities within a bar dispatch: the strategy's signal must be
// fully processed into a fill and into the portfolio before lower-priority
// handlers (and the next bar) run.
const PRIORITY_STRATEGY: i32 = 90;
const PRIORITY_RISK: i32 = 80;
const PRIORITY_ORDER_MANAGER: i32 = 70;
const PRIORITY_BROKER: i32 = 60;
const PRIORITY_PORTFOLIO: i32 = 50;

/// Everything a run produces; `statistics` is filled by the attached
/// analytics implementation, if any.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestResults {
    pub equity_curve: Vec<EquityCurvePoint>,
    pub trades: Vec<Trade>,
    pub orders: Vec<Order>,
    pub final_positions: BTreeMap<String, Position>,
    pub statistics: BTreeMap<String, f64>,
}

/// Composes the component graph, owns the run lifecycle, and guarantees
/// run-to-run state isolation: `reset()` restores every component to its
/// post-setup state, and a reset run replays byte-identically.
pub struct BacktestCoordinator {
    config: BacktestConfig,
    bus: EventBus,
    data: HistoricalDataHandler,
    strategy: Rc<RefCell<StrategyHandler>>,
    risk: Rc<RefCell<RiskManager>>,
    orders: Rc<RefCell<OrderManager>>,
    broker: Rc<RefCell<SimulatedBroker>>,
    portfolio: Rc<RefCell<Portfolio>>,
    // Owns the adapter so the bus's weak reference stays live.
    portfolio_handler: Rc<RefCell<PortfolioHandler>>,
    ids: OrderIdSource,
    tokens: Vec<HandlerToken>,
    analytics: Option<Box<dyn PerformanceAnalytics>>,
    has_run: bool,
}

impl BacktestCoordinator {
    /// Build the component graph around an existing data handler. CSV
    /// sources and the train/test split from the configuration are applied
    /// if present.
    pub fn new(config: BacktestConfig, mut data: HistoricalDataHandler) -> QbResult<Self> {
        config.validate()?;

        if !config.data.sources.is_empty() {
            data.load_csv(&config.data.sources)?;
        }
        if let Some(split) = &config.data.train_test_split {
            if !data.is_empty() {
                data.setup_split(split)?;
            }
        }

        let strategy = create_strategy(&config.strategy.name, &config.strategy.params)?;
        let ids = OrderIdSource::new();
        let portfolio = Rc::new(RefCell::new(Portfolio::new(config.backtest.initial_capital)));
        let risk = Rc::new(RefCell::new(RiskManager::new(
            &config.risk,
            Rc::clone(&portfolio),
            ids.clone(),
        )?));
        let broker = Rc::new(RefCell::new(SimulatedBroker::new(
            &config.broker,
            data.market(),
        )));
        let orders = Rc::new(RefCell::new(OrderManager::new(ids.clone())));
        let strategy = Rc::new(RefCell::new(StrategyHandler::new(strategy)));
        let portfolio_handler =
            Rc::new(RefCell::new(PortfolioHandler::new(Rc::clone(&portfolio))));

        let mut coordinator = Self {
            config,
            bus: EventBus::new(),
            data,
            strategy,
            risk,
            orders,
            broker,
            portfolio,
            portfolio_handler,
            ids,
            tokens: Vec::new(),
            analytics: None,
            has_run: false,
        };
        coordinator.wire();
        Ok(coordinator)
    }

    pub fn with_analytics(mut self, analytics: Box<dyn PerformanceAnalytics>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    fn wire(&mut self) {
        let strategy: Rc<RefCell<dyn EventHandler>> = self.strategy.clone();
        let risk: Rc<RefCell<dyn EventHandler>> = self.risk.clone();
        let orders: Rc<RefCell<dyn EventHandler>> = self.orders.clone();
        let broker: Rc<RefCell<dyn EventHandler>> = self.broker.clone();
        let portfolio: Rc<RefCell<dyn EventHandler>> = self.portfolio_handler.clone();

        self.tokens = vec![
            self.bus.register(EventKind::Bar, PRIORITY_STRATEGY, Rc::clone(&strategy)),
            self.bus.register(EventKind::Bar, PRIORITY_BROKER, Rc::clone(&broker)),
            self.bus.register(EventKind::Signal, PRIORITY_RISK, risk),
            self.bus.register(EventKind::Order, PRIORITY_ORDER_MANAGER, Rc::clone(&orders)),
            self.bus.register(EventKind::Order, PRIORITY_BROKER, broker),
            self.bus.register(EventKind::Fill, PRIORITY_ORDER_MANAGER, orders),
            self.bus.register(EventKind::Fill, PRIORITY_PORTFOLIO, Rc::clone(&portfolio)),
            self.bus.register(EventKind::MarkToMarket, PRIORITY_PORTFOLIO, portfolio),
        ];
    }

    fn unwire(&mut self) {
        for token in self.tokens.drain(..) {
            self.bus.unregister(token);
        }
    }

    /// Restore the state the graph had immediately after setup: dedup and
    /// statistics cleared, portfolio rebuilt at initial capital, groups and
    /// order history cleared, strategy indicator state reset, data cursor
    /// rewound, id sequence and broker jitter stream rewound.
    pub fn reset(&mut self) {
        self.unwire();
        self.bus.reset();
        self.portfolio
            .replace(Portfolio::new(self.config.backtest.initial_capital));
        self.risk.borrow_mut().reset();
        self.orders.borrow_mut().reset();
        self.broker.borrow_mut().reset();
        self.strategy.borrow_mut().reset();
        self.data.rewind();
        self.ids.reset();
        self.has_run = false;
        self.wire();
        debug!("coordinator reset");
    }

    /// Apply a parameter point to the strategy (merged over its configured
    /// params by the caller).
    pub fn configure_strategy(&mut self, params: &HashMap<String, Value>) -> Result<(), ConfigError> {
        self.strategy.borrow_mut().configure(params)
    }

    pub fn activate_split(&mut self, name: &str) -> Result<(), DataError> {
        self.data.activate_split(name)
    }

    pub fn data(&self) -> &HistoricalDataHandler {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut HistoricalDataHandler {
        &mut self.data
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn order_manager(&self) -> &Rc<RefCell<OrderManager>> {
        &self.orders
    }

    pub fn portfolio(&self) -> &Rc<RefCell<Portfolio>> {
        &self.portfolio
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    fn check_portfolio(&self) -> Result<(), PortfolioError> {
        if let Some(detail) = self.portfolio.borrow().violation() {
            return Err(PortfolioError::Reconciliation {
                detail: detail.to_string(),
            });
        }
        Ok(())
    }

    /// Run the active window to completion and collect results.
    ///
    /// A dirty coordinator resets itself first, so `run` is always replaying
    /// from clean dedup state.
    pub fn run(&mut self) -> QbResult<BacktestResults> {
        if self.has_run {
            self.reset();
        }
        if self.data.window_len() == 0 {
            return Err(DataError::NoData.into());
        }
        self.has_run = true;

        info!(
            strategy = self.strategy.borrow().strategy_name(),
            symbols = ?self.config.backtest.symbols,
            bars = self.data.window_len(),
            split = self.data.active_split().unwrap_or("full"),
            "starting backtest"
        );

        while self.data.step(&self.bus).is_some() {
            self.check_portfolio()?;
        }

        let end_timestamp = self
            .data
            .window_end_timestamp()
            .ok_or(DataError::NoData)?;
        self.bus
            .emit(EventPayload::BacktestEnd(BacktestEnd { timestamp: end_timestamp }));

        // Liquidation: close every open position at its last observed price,
        // then append the final mark.
        let closing = self
            .portfolio
            .borrow()
            .liquidation_orders(&self.ids, end_timestamp);
        for order in closing {
            self.bus.emit(EventPayload::Order(order));
        }
        self.broker.borrow_mut().flush_market_orders(&self.bus);
        self.check_portfolio()?;

        let prices = self.data.market().borrow().closes();
        self.bus.emit(EventPayload::MarkToMarket(MarkToMarket {
            timestamp: end_timestamp,
            prices,
        }));
        self.check_portfolio()?;

        let portfolio = self.portfolio.borrow();
        let mut results = BacktestResults {
            equity_curve: portfolio.equity_curve().to_vec(),
            trades: portfolio.trades().to_vec(),
            orders: self.orders.borrow().snapshot(),
            final_positions: portfolio.positions_sorted(),
            statistics: BTreeMap::new(),
        };
        info!(
            final_equity = %portfolio.equity(),
            trades = results.trades.len(),
            orders = results.orders.len(),
            "backtest complete"
        );
        drop(portfolio);

        if let Some(analytics) = &self.analytics {
            results.statistics = analytics.compute(&results.equity_curve, &results.trades);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use qb_types::{
        Bar, BacktestSettings, BrokerSettings, CommissionSpec, DataSettings, Direction,
        RiskSettings, Side, Signal, SlippageSpec, StrategySpec, Timeframe,
    };
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn bars_from_closes(symbol: &str, closes: &[Decimal]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| {
                Bar::new(
                    symbol,
                    start + Duration::days(i as i64),
                    *close,
                    *close,
                    *close,
                    *close,
                    dec!(1000),
                    Timeframe::Day,
                )
            })
            .collect()
    }

    fn ma_config() -> BacktestConfig {
        BacktestConfig {
            backtest: BacktestSettings {
                initial_capital: dec!(100000),
                symbols: vec!["X".into()],
                timeframe: Timeframe::Day,
            },
            data: DataSettings::default(),
            strategy: StrategySpec {
                name: "ma_crossover".into(),
                params: [
                    ("fast_period".to_string(), 2.into()),
                    ("slow_period".to_string(), 3.into()),
                ]
                .into(),
            },
            risk: RiskSettings::default(),
            broker: BrokerSettings::default(),
            optimization: None,
            output_dir: None,
        }
    }

    fn coordinator_with_closes(config: BacktestConfig, closes: &[Decimal]) -> BacktestCoordinator {
        let mut data = HistoricalDataHandler::new(Timeframe::Day);
        data.add_series("X", bars_from_closes("X", closes)).unwrap();
        BacktestCoordinator::new(config, data).unwrap()
    }

    /// Single direction change: one BUY at the crossover bar, flat price
    /// afterwards, liquidation closes at entry for zero P&L.
    #[test]
    fn single_crossover_round_trip() {
        let closes = [dec!(10), dec!(10), dec!(10), dec!(12), dec!(12), dec!(12)];
        let mut coordinator = coordinator_with_closes(ma_config(), &closes);
        let results = coordinator.run().unwrap();

        // Opening order plus the end-of-run liquidation order.
        assert_eq!(results.orders.len(), 2);
        let open = &results.orders[0];
        assert_eq!(open.side, Side::Buy);
        assert_eq!(open.quantity, dec!(100));
        assert_eq!(open.average_fill_price, Some(dec!(12)));
        assert_eq!(open.rule_id.as_deref(), Some("ma_crossover_X_BUY_group_1"));

        // One trade from liquidation: entry 12, exit 12, zero P&L.
        assert_eq!(results.trades.len(), 1);
        let trade = &results.trades[0];
        assert_eq!(trade.entry_price, dec!(12));
        assert_eq!(trade.exit_price, dec!(12));
        assert_eq!(trade.quantity, dec!(100));
        assert_eq!(trade.realized_pnl, Decimal::ZERO);

        // No price change after entry: equity ends where it started.
        let final_point = results.equity_curve.last().unwrap();
        assert_eq!(final_point.total_equity, dec!(100000));
        assert_eq!(final_point.positions_market_value, Decimal::ZERO);

        // Position retained at zero quantity.
        let position = &results.final_positions["X"];
        assert!(position.quantity.is_zero());
        assert_eq!(position.realized_pnl, Decimal::ZERO);
    }

    /// Sustained signals after the crossover dedup down to a single order.
    #[test]
    fn sustained_signals_deduplicate() {
        let closes = [dec!(10), dec!(10), dec!(10), dec!(12), dec!(12), dec!(12)];
        let mut coordinator = coordinator_with_closes(ma_config(), &closes);
        let results = coordinator.run().unwrap();

        // Signals on bars 3..5, but exactly one opening order.
        let signals = coordinator.bus().stats(EventKind::Signal);
        assert_eq!(signals.emitted, 3);
        let opening: Vec<_> = results
            .orders
            .iter()
            .filter(|o| o.rule_id.as_deref() == Some("ma_crossover_X_BUY_group_1"))
            .collect();
        assert_eq!(opening.len(), 1);
    }

    /// Commission and slippage both work against the buyer.
    #[test]
    fn slippage_and_commission_signs() {
        let mut config = ma_config();
        config.broker = BrokerSettings {
            slippage: SlippageSpec::Percentage { amount: dec!(0.001) },
            commission: CommissionSpec::Percentage { rate: dec!(0.0005) },
            fill_delay_bars: 0,
            seed: None,
        };
        let closes = [dec!(100), dec!(100), dec!(100), dec!(102), dec!(102), dec!(102)];
        let mut coordinator = coordinator_with_closes(config, &closes);
        let results = coordinator.run().unwrap();

        let open = &results.orders[0];
        // 102 * 1.001
        assert_eq!(open.average_fill_price, Some(dec!(102.102)));

        // Cash after the opening fill reflects price + commission.
        let fill_point = results
            .equity_curve
            .iter()
            .find(|p| !p.positions_market_value.is_zero())
            .unwrap();
        let notional = dec!(100) * dec!(102.102);
        let commission = notional * dec!(0.0005);
        assert_eq!(fill_point.cash, dec!(100000) - notional - commission);
    }

    /// Direction flip mid-stream: close then reverse, two trades total
    /// (reversal close + liquidation close).
    #[test]
    fn reversal_produces_flat_then_reverse() {
        let closes = [
            dec!(10),
            dec!(10),
            dec!(10),
            dec!(12),
            dec!(12),
            dec!(9),
            dec!(8),
            dec!(8),
        ];
        let mut coordinator = coordinator_with_closes(ma_config(), &closes);
        let results = coordinator.run().unwrap();

        let rule_ids: Vec<_> = results
            .orders
            .iter()
            .filter_map(|o| o.rule_id.as_deref())
            .collect();
        assert!(rule_ids.contains(&"ma_crossover_X_BUY_group_1"));
        assert!(rule_ids.contains(&"ma_crossover_X_SELL_group_2_close"));
        assert!(rule_ids.contains(&"ma_crossover_X_SELL_group_2"));

        // The close order flattened the long before the short opened.
        let close = results
            .orders
            .iter()
            .find(|o| o.rule_id.as_deref() == Some("ma_crossover_X_SELL_group_2_close"))
            .unwrap();
        assert_eq!(close.quantity, dec!(100));
        assert_eq!(
            close.parent_id.as_deref(),
            Some("ma_crossover_X_SELL_group_2")
        );

        // Long closed at a loss, short closed by liquidation.
        assert_eq!(results.trades.len(), 2);
        assert!(results.trades[0].realized_pnl < Decimal::ZERO);
        assert_eq!(results.final_positions["X"].quantity, Decimal::ZERO);
    }

    /// reset(); run() replays byte-identically.
    #[test]
    fn reset_and_rerun_is_deterministic() {
        let mut config = ma_config();
        config.broker.slippage = SlippageSpec::Percentage { amount: dec!(0.002) };
        config.broker.seed = Some(42);
        let closes = [
            dec!(10),
            dec!(10),
            dec!(10),
            dec!(12),
            dec!(13),
            dec!(9),
            dec!(8),
            dec!(11),
            dec!(14),
            dec!(13),
        ];
        let mut coordinator = coordinator_with_closes(config, &closes);

        let first = coordinator.run().unwrap();
        coordinator.reset();
        let second = coordinator.run().unwrap();
        assert_eq!(first, second);

        // A dirty run (no explicit reset) also replays identically.
        let third = coordinator.run().unwrap();
        assert_eq!(first, third);
    }

    /// Duplicate rule ids are dropped at the bus and counted.
    #[test]
    fn duplicate_rule_id_drops_at_bus() {
        let closes = [dec!(10), dec!(10), dec!(10), dec!(10), dec!(10), dec!(10)];
        let mut coordinator = coordinator_with_closes(ma_config(), &closes);

        let make_signal = || {
            Signal::new(
                "X",
                Direction::Long,
                dec!(10),
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                "s",
            )
            .with_rule_id("s_X_BUY_group_1")
        };
        coordinator.bus().emit(EventPayload::Signal(make_signal()));
        coordinator.bus().emit(EventPayload::Signal(make_signal()));

        assert_eq!(coordinator.bus().stats(EventKind::Signal).deduplicated, 1);
        // The risk manager saw the signal once and emitted one order.
        assert_eq!(coordinator.order_manager().borrow().history(None, None).len(), 1);
    }

    #[test]
    fn empty_window_is_an_error() {
        let config = ma_config();
        let data = HistoricalDataHandler::new(Timeframe::Day);
        let mut coordinator = BacktestCoordinator::new(config, data).unwrap();
        assert!(coordinator.run().is_err());
    }

    #[test]
    fn split_runs_use_only_their_window() {
        let mut config = ma_config();
        config.data.train_test_split = Some(qb_types::SplitSpec::Ratio {
            train_ratio: 0.5,
            test_ratio: Some(0.5),
        });
        let closes = [
            dec!(10),
            dec!(10),
            dec!(10),
            dec!(12),
            dec!(12),
            dec!(12),
            dec!(12),
            dec!(12),
        ];
        let mut coordinator = coordinator_with_closes(config, &closes);

        coordinator.activate_split("train").unwrap();
        let train = coordinator.run().unwrap();
        // Train window covers 4 timestamps; marks = 4 + final mark appended
        // as an equity point, all at train timestamps.
        assert!(train.equity_curve.len() >= 4);

        coordinator.activate_split("test").unwrap();
        coordinator.reset();
        let test = coordinator.run().unwrap();
        let train_last = train.equity_curve.last().unwrap().timestamp;
        assert!(test.equity_curve.first().unwrap().timestamp > train_last);
    }

    /// Groups, orders, and positions stay independent per symbol.
    #[test]
    fn multi_symbol_positions_are_independent() {
        let mut config = ma_config();
        config.backtest.symbols = vec!["A".into(), "B".into()];

        let mut data = HistoricalDataHandler::new(Timeframe::Day);
        // A crosses up; B stays flat and never signals.
        data.add_series(
            "A",
            bars_from_closes("A", &[dec!(10), dec!(10), dec!(10), dec!(12), dec!(12)]),
        )
        .unwrap();
        data.add_series(
            "B",
            bars_from_closes("B", &[dec!(20), dec!(20), dec!(20), dec!(20), dec!(20)]),
        )
        .unwrap();

        let mut coordinator = BacktestCoordinator::new(config, data).unwrap();
        let results = coordinator.run().unwrap();

        assert!(results.orders.iter().all(|o| o.symbol == "A"));
        assert_eq!(results.final_positions["A"].quantity, Decimal::ZERO);
        assert!(results.final_positions["A"].realized_pnl.is_zero());
        assert!(!results.final_positions.contains_key("B"));
    }

    /// percent_equity sizing floors the quantity from current equity.
    #[test]
    fn percent_equity_sizing_flows_through() {
        let mut config = ma_config();
        config.risk = RiskSettings {
            position_sizing_method: "percent_equity".into(),
            position_size: None,
            max_position_pct: Some(dec!(0.5)),
            ..RiskSettings::default()
        };
        let closes = [dec!(10), dec!(10), dec!(10), dec!(12), dec!(12), dec!(12)];
        let mut coordinator = coordinator_with_closes(config, &closes);
        let results = coordinator.run().unwrap();

        // floor(100000 * 0.5 / 12) = 4166 units.
        assert_eq!(results.orders[0].quantity, dec!(4166));
    }

    #[test]
    fn unknown_strategy_fails_setup() {
        let mut config = ma_config();
        config.strategy.name = "mystery".into();
        let data = HistoricalDataHandler::new(Timeframe::Day);
        assert!(BacktestCoordinator::new(config, data).is_err());
    }

    #[test]
    fn unknown_sizing_method_fails_setup() {
        let mut config = ma_config();
        config.risk.position_sizing_method = "kelly".into();
        let data = HistoricalDataHandler::new(Timeframe::Day);
        assert!(BacktestCoordinator::new(config, data).is_err());
    }
}
