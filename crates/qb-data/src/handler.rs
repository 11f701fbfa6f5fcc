use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use tracing::{debug, info};

use qb_events::{EventBus, EventPayload, MarkToMarket};
use qb_types::{Bar, DataError, DataSourceSpec, MarketState, SplitSpec, Timeframe};

use crate::loader::CsvBarLoader;
use crate::split::{compute_splits, SplitWindow, TEST_SPLIT, TRAIN_SPLIT};

/// Historical bar replay with deterministic ordering and train/test splits.
///
/// Bars are kept on a merged timeline keyed by timestamp; simultaneous bars
/// across symbols are ordered lexicographically by symbol so every replay is
/// reproducible. The handler owns the shared `MarketState` and updates it
/// before dispatching each timestamp's bars, then emits one `MarkToMarket`
/// per timestamp.
pub struct HistoricalDataHandler {
    timeline: BTreeMap<DateTime<Utc>, Vec<Bar>>,
    timestamps: Vec<DateTime<Utc>>,
    splits: HashMap<String, SplitWindow>,
    active_split: Option<String>,
    window: SplitWindow,
    cursor: usize,
    market: Rc<RefCell<MarketState>>,
    symbols: Vec<String>,
    timeframe: Timeframe,
    dropped_rows: u64,
}

impl HistoricalDataHandler {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            timeline: BTreeMap::new(),
            timestamps: Vec::new(),
            splits: HashMap::new(),
            active_split: None,
            window: SplitWindow::new(0, 0),
            cursor: 0,
            market: Rc::new(RefCell::new(MarketState::new())),
            symbols: Vec::new(),
            timeframe,
            dropped_rows: 0,
        }
    }

    /// Shared handle to the latest-bar view; the broker and coordinator read
    /// prices through this.
    pub fn market(&self) -> Rc<RefCell<MarketState>> {
        Rc::clone(&self.market)
    }

    /// Load every configured CSV source.
    pub fn load_csv(&mut self, sources: &[DataSourceSpec]) -> Result<(), DataError> {
        let loader = CsvBarLoader::new(self.timeframe);
        for spec in sources {
            let series = loader.load(spec)?;
            self.dropped_rows += series.dropped_rows;
            self.add_series(&series.symbol, series.bars)?;
        }
        Ok(())
    }

    /// Add an already-materialized series for one symbol. Timestamps must be
    /// strictly increasing within the symbol. Bars on a finer timeframe than
    /// the handler's target are resampled up to it.
    pub fn add_series(&mut self, symbol: &str, bars: Vec<Bar>) -> Result<(), DataError> {
        if bars.is_empty() {
            return Err(DataError::EmptySeries {
                symbol: symbol.to_string(),
            });
        }
        for pair in bars.windows(2) {
            if pair[1].timestamp <= pair[0].timestamp {
                return Err(DataError::NonMonotonicTimestamps {
                    symbol: symbol.to_string(),
                });
            }
        }

        let bars = if bars.iter().any(|b| b.timeframe != self.timeframe) {
            let resampled = crate::resample::resample_bars(&bars, self.timeframe);
            info!(
                symbol,
                source = bars.len(),
                resampled = resampled.len(),
                target = %self.timeframe,
                "resampled series to target timeframe"
            );
            resampled
        } else {
            bars
        };

        info!(symbol, bars = bars.len(), "adding series to timeline");
        for bar in bars {
            self.timeline.entry(bar.timestamp).or_default().push(bar);
        }
        if !self.symbols.iter().any(|s| s == symbol) {
            self.symbols.push(symbol.to_string());
            self.symbols.sort();
        }
        self.rebuild_index();
        Ok(())
    }

    fn rebuild_index(&mut self) {
        for bars in self.timeline.values_mut() {
            bars.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        }
        self.timestamps = self.timeline.keys().copied().collect();
        self.window = SplitWindow::new(0, self.timestamps.len());
        self.active_split = None;
        self.rewind();
    }

    /// Compute the named train/test windows for a split specification.
    pub fn setup_split(&mut self, spec: &SplitSpec) -> Result<(), DataError> {
        self.splits = compute_splits(spec, &self.timestamps)?;
        debug!(
            train = ?self.splits.get(TRAIN_SPLIT),
            test = ?self.splits.get(TEST_SPLIT),
            "split configured"
        );
        Ok(())
    }

    /// Install explicit train/test index windows (walk-forward support).
    pub fn setup_index_windows(
        &mut self,
        train: SplitWindow,
        test: SplitWindow,
    ) -> Result<(), DataError> {
        let total = self.timestamps.len();
        if train.is_empty() || test.is_empty() || train.end > total || test.end > total {
            return Err(DataError::InvalidSplit {
                message: format!(
                    "index windows train {}..{} / test {}..{} out of range ({} timestamps)",
                    train.start, train.end, test.start, test.end, total
                ),
            });
        }
        self.splits.insert(TRAIN_SPLIT.to_string(), train);
        self.splits.insert(TEST_SPLIT.to_string(), test);
        Ok(())
    }

    /// Activate a named split, rewinding the cursor to its start. Missing
    /// splits are an error, never a silent fallback.
    pub fn activate_split(&mut self, name: &str) -> Result<(), DataError> {
        let window = *self
            .splits
            .get(name)
            .ok_or_else(|| DataError::SplitNotFound {
                name: name.to_string(),
            })?;
        self.window = window;
        self.active_split = Some(name.to_string());
        self.rewind();
        Ok(())
    }

    /// Activate the full loaded range.
    pub fn activate_full(&mut self) {
        self.window = SplitWindow::new(0, self.timestamps.len());
        self.active_split = None;
        self.rewind();
    }

    /// Rewind the cursor to the start of the active window and clear the
    /// market view.
    pub fn rewind(&mut self) {
        self.cursor = self.window.start;
        self.market.borrow_mut().clear();
    }

    /// Emit the next timestamp's bars plus its mark-to-market tick.
    /// Returns the timestamp processed, or `None` when the window is
    /// exhausted.
    pub fn step(&mut self, bus: &EventBus) -> Option<DateTime<Utc>> {
        if self.cursor >= self.window.end {
            return None;
        }
        let timestamp = self.timestamps[self.cursor];
        self.cursor += 1;

        let bars = self
            .timeline
            .get(&timestamp)
            .cloned()
            .unwrap_or_default();

        {
            let mut market = self.market.borrow_mut();
            for bar in &bars {
                market.update(bar);
            }
        }

        for bar in bars {
            bus.emit(EventPayload::Bar(bar));
        }

        let prices = self.market.borrow().closes();
        bus.emit(EventPayload::MarkToMarket(MarkToMarket { timestamp, prices }));
        Some(timestamp)
    }

    /// Drive the event loop over the whole active window.
    pub fn run(&mut self, bus: &EventBus) -> Result<(), DataError> {
        if self.window.is_empty() {
            return Err(DataError::NoData);
        }
        while self.step(bus).is_some() {}
        Ok(())
    }

    pub fn current_bar(&self, symbol: &str) -> Option<Bar> {
        self.market.borrow().bar(symbol).cloned()
    }

    pub fn current_price(&self, symbol: &str) -> Option<Decimal> {
        self.market.borrow().close(symbol)
    }

    /// Number of distinct timestamps loaded.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn active_split(&self) -> Option<&str> {
        self.active_split.as_deref()
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn dropped_rows(&self) -> u64 {
        self.dropped_rows
    }

    /// Last timestamp of the active window, if any.
    pub fn window_end_timestamp(&self) -> Option<DateTime<Utc>> {
        if self.window.is_empty() {
            None
        } else {
            self.timestamps.get(self.window.end - 1).copied()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn bars_for(symbol: &str, closes: &[Decimal]) -> Vec<Bar> {
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

    fn handler_with_two_symbols() -> HistoricalDataHandler {
        let mut handler = HistoricalDataHandler::new(Timeframe::Day);
        handler
            .add_series("X", bars_for("X", &[dec!(10), dec!(11), dec!(12), dec!(13)]))
            .unwrap();
        handler
            .add_series("B", bars_for("B", &[dec!(20), dec!(21), dec!(22), dec!(23)]))
            .unwrap();
        handler
    }

    #[test]
    fn replay_is_time_ordered_with_symbol_tiebreak() {
        let mut handler = handler_with_two_symbols();
        let bus = EventBus::new();
        handler.run(&bus).unwrap();

        let bars = bus.recent(qb_events::EventKind::Bar);
        let order: Vec<(String, DateTime<Utc>)> = bars
            .iter()
            .map(|p| match p {
                EventPayload::Bar(bar) => (bar.symbol.clone(), bar.timestamp),
                other => panic!("unexpected payload {other:?}"),
            })
            .collect();

        // Non-decreasing timestamps; "B" before "X" at each tie.
        for pair in order.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
            if pair[0].1 == pair[1].1 {
                assert!(pair[0].0 < pair[1].0);
            }
        }
        assert_eq!(order[0].0, "B");
        assert_eq!(order[1].0, "X");
    }

    #[test]
    fn one_mark_per_timestamp_with_latest_prices() {
        let mut handler = handler_with_two_symbols();
        let bus = EventBus::new();
        handler.run(&bus).unwrap();

        let marks = bus.recent(qb_events::EventKind::MarkToMarket);
        assert_eq!(marks.len(), 4);
        match marks.last().unwrap() {
            EventPayload::MarkToMarket(mark) => {
                assert_eq!(mark.prices["X"], dec!(13));
                assert_eq!(mark.prices["B"], dec!(23));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn non_monotonic_series_rejected() {
        let mut handler = HistoricalDataHandler::new(Timeframe::Day);
        let mut bars = bars_for("X", &[dec!(10), dec!(11)]);
        bars[1].timestamp = bars[0].timestamp;
        assert!(matches!(
            handler.add_series("X", bars),
            Err(DataError::NonMonotonicTimestamps { .. })
        ));
    }

    #[test]
    fn split_activation_rewinds_cursor() {
        let mut handler = handler_with_two_symbols();
        handler
            .setup_split(&SplitSpec::Ratio { train_ratio: 0.5, test_ratio: None })
            .unwrap();

        handler.activate_split(TRAIN_SPLIT).unwrap();
        let bus = EventBus::new();
        handler.run(&bus).unwrap();
        assert_eq!(bus.recent(qb_events::EventKind::MarkToMarket).len(), 2);

        // Re-activating replays the same window.
        handler.activate_split(TRAIN_SPLIT).unwrap();
        let bus = EventBus::new();
        handler.run(&bus).unwrap();
        assert_eq!(bus.recent(qb_events::EventKind::MarkToMarket).len(), 2);
    }

    #[test]
    fn train_and_test_share_no_timestamps() {
        let mut handler = handler_with_two_symbols();
        handler
            .setup_split(&SplitSpec::Ratio { train_ratio: 0.5, test_ratio: None })
            .unwrap();

        let mut collect = |name: &str| {
            handler.activate_split(name).unwrap();
            let bus = EventBus::new();
            handler.run(&bus).unwrap();
            bus.recent(qb_events::EventKind::Bar)
                .into_iter()
                .map(|p| match p {
                    EventPayload::Bar(bar) => bar.timestamp,
                    other => panic!("unexpected payload {other:?}"),
                })
                .collect::<Vec<_>>()
        };

        let train = collect(TRAIN_SPLIT);
        let test = collect(TEST_SPLIT);
        for ts in &train {
            assert!(!test.contains(ts));
        }
    }

    #[test]
    fn missing_split_is_an_error() {
        let mut handler = handler_with_two_symbols();
        assert!(matches!(
            handler.activate_split("validation"),
            Err(DataError::SplitNotFound { .. })
        ));
    }

    #[test]
    fn finer_series_resamples_to_handler_timeframe() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let hourly: Vec<Bar> = (0..48)
            .map(|i| {
                let close = dec!(100) + Decimal::from(i);
                Bar::new(
                    "X",
                    start + Duration::hours(i),
                    close,
                    close,
                    close,
                    close,
                    dec!(10),
                    Timeframe::Hour,
                )
            })
            .collect();

        let mut handler = HistoricalDataHandler::new(Timeframe::Day);
        handler.add_series("X", hourly).unwrap();

        assert_eq!(handler.len(), 2);
        let bus = EventBus::new();
        handler.run(&bus).unwrap();
        // Last daily close is the last hourly close of day two.
        assert_eq!(handler.current_price("X"), Some(dec!(147)));
    }

    #[test]
    fn market_state_follows_replay() {
        let mut handler = handler_with_two_symbols();
        let bus = EventBus::new();
        handler.step(&bus).unwrap();
        assert_eq!(handler.current_price("X"), Some(dec!(10)));
        handler.step(&bus).unwrap();
        assert_eq!(handler.current_price("X"), Some(dec!(11)));

        handler.rewind();
        assert_eq!(handler.current_price("X"), None);
    }
}
