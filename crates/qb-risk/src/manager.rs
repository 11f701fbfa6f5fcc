use rust_decimal::Decimal;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use tracing::{debug, warn};

use qb_events::{Event, EventBus, EventHandler, EventPayload};
use qb_types::{
    ConfigError, HandlerError, Order, OrderIdSource, Portfolio, RiskSettings, Signal,
};

use crate::sizing::SizingPolicy;

/// Per-symbol signal-grouping state.
///
/// Consecutive same-direction signals share one group; only a direction
/// change opens a new one. The group counter is monotonic per symbol so
/// rule ids stay stable even when orders are suppressed.
#[derive(Debug, Clone, Default)]
pub struct SignalGroup {
    pub direction: i8,
    pub counter: u64,
    pub processed: HashSet<String>,
}

/// Converts signals into orders: deduplicates sustained same-direction
/// signals, and translates a direction change into a flat-then-reverse
/// order sequence (closing order first, then the opening order).
pub struct RiskManager {
    policy: SizingPolicy,
    max_open_positions: Option<usize>,
    enforce_single_position: bool,
    portfolio: Rc<RefCell<Portfolio>>,
    ids: OrderIdSource,
    groups: HashMap<String, SignalGroup>,
}

impl RiskManager {
    pub fn new(
        settings: &RiskSettings,
        portfolio: Rc<RefCell<Portfolio>>,
        ids: OrderIdSource,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            policy: SizingPolicy::from_settings(settings)?,
            max_open_positions: settings.max_positions,
            enforce_single_position: settings.enforce_single_position,
            portfolio,
            ids,
            groups: HashMap::new(),
        })
    }

    /// Clear all per-symbol directions, counters, and processed rule ids.
    pub fn reset(&mut self) {
        self.groups.clear();
    }

    pub fn group(&self, symbol: &str) -> Option<&SignalGroup> {
        self.groups.get(symbol)
    }

    fn handle_signal(&mut self, signal: &Signal, bus: &EventBus) {
        let value = signal.direction.sign();
        let group = self.groups.entry(signal.symbol.clone()).or_default();

        // Sustained or neutral signals never produce orders.
        if value == 0 || value == group.direction {
            debug!(symbol = %signal.symbol, value, "signal discarded (no direction change)");
            return;
        }

        group.counter += 1;
        group.direction = value;

        let side = match signal.direction.side() {
            Some(side) => side,
            None => return,
        };
        let rule_id = format!(
            "{}_{}_{}_group_{}",
            signal.strategy_id,
            signal.symbol,
            side.label(),
            group.counter
        );
        if !group.processed.insert(rule_id.clone()) {
            return;
        }

        let (quantity, equity, open_count) = {
            let portfolio = self.portfolio.borrow();
            (
                portfolio.position_quantity(&signal.symbol),
                portfolio.equity(),
                portfolio.open_position_count(),
            )
        };
        let held_sign = if quantity > Decimal::ZERO {
            1
        } else if quantity < Decimal::ZERO {
            -1
        } else {
            0
        };

        // Closing leg: flatten an opposing position before reversing.
        if held_sign != 0 && held_sign != value {
            let close = Order::market(
                signal.symbol.clone(),
                side,
                quantity.abs(),
                signal.timestamp,
                signal.strategy_id.clone(),
            )
            .with_id(self.ids.next())
            .with_rule_id(format!("{rule_id}_close"))
            .with_parent(rule_id.clone());
            bus.emit(EventPayload::Order(close));
        }

        // Opening leg, subject to position limits. The group counter has
        // already advanced, so identity stays stable across suppressions.
        if let Some(max) = self.max_open_positions {
            if held_sign == 0 && open_count >= max {
                warn!(
                    symbol = %signal.symbol,
                    open_count,
                    max,
                    "opening order suppressed by max_open_positions"
                );
                return;
            }
        }
        if self.enforce_single_position && held_sign != 0 {
            warn!(
                symbol = %signal.symbol,
                "opening order suppressed by enforce_single_position"
            );
            return;
        }

        let open_quantity = self.policy.quantity(equity, signal.price);
        if open_quantity <= Decimal::ZERO {
            warn!(symbol = %signal.symbol, "sizing produced zero quantity, no order");
            return;
        }

        let open = Order::market(
            signal.symbol.clone(),
            side,
            open_quantity,
            signal.timestamp,
            signal.strategy_id.clone(),
        )
        .with_id(self.ids.next())
        .with_rule_id(rule_id);
        bus.emit(EventPayload::Order(open));
    }
}

impl EventHandler for RiskManager {
    fn name(&self) -> &str {
        "risk_manager"
    }

    fn on_event(&mut self, event: &Event, bus: &EventBus) -> Result<(), HandlerError> {
        if let EventPayload::Signal(signal) = event.payload() {
            self.handle_signal(signal, bus);
        }
        Ok(())
    }
}
