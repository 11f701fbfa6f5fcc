use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rust_decimal::Decimal;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, warn};

use qb_events::{Event, EventBus, EventHandler, EventPayload};
use qb_types::{
    Bar, BrokerSettings, CommissionSpec, Fill, HandlerError, MarketState, Order, OrderType, Side,
    SlippageSpec,
};

/// An order waiting for a later bar: delayed market orders and resting
/// limit/stop orders.
#[derive(Debug, Clone)]
struct PendingOrder {
    order: Order,
    bars_seen: u32,
}

/// Immediate-execution broker simulator.
///
/// Market orders fill against the current bar close with slippage applied
/// against the order side; limit and stop orders rest until a bar's range
/// crosses their level. Commission is charged on every fill. With a
/// configured seed the slippage fraction carries a deterministic jitter
/// stream; the same seed and bar stream reproduce identical fills.
pub struct SimulatedBroker {
    settings: BrokerSettings,
    market: Rc<RefCell<MarketState>>,
    pending: Vec<PendingOrder>,
    rng: Option<ChaCha8Rng>,
}

impl SimulatedBroker {
    pub fn new(settings: &BrokerSettings, market: Rc<RefCell<MarketState>>) -> Self {
        Self {
            rng: settings.seed.map(ChaCha8Rng::seed_from_u64),
            settings: settings.clone(),
            market,
            pending: Vec::new(),
        }
    }

    /// Drop pending orders and rewind the jitter stream to its seed.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.rng = self.settings.seed.map(ChaCha8Rng::seed_from_u64);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn slippage_fraction(&mut self) -> Decimal {
        let base = match &self.settings.slippage {
            SlippageSpec::Percentage { amount } => *amount,
            SlippageSpec::Fixed { bps } => *bps / Decimal::from(10000),
        };
        match &mut self.rng {
            // Uniform in [0, 2·base]: mean equals the configured amount.
            Some(rng) => {
                let factor = rng.gen_range(0.0..=2.0);
                base * Decimal::from_f64_retain(factor).unwrap_or(Decimal::ONE)
            }
            None => base,
        }
    }

    fn execution_price(&mut self, side: Side, base: Decimal) -> Decimal {
        let slip = self.slippage_fraction();
        match side {
            Side::Buy => base * (Decimal::ONE + slip),
            Side::Sell => base * (Decimal::ONE - slip),
        }
    }

    fn commission_for(&self, quantity: Decimal, price: Decimal) -> Decimal {
        match &self.settings.commission {
            CommissionSpec::Percentage { rate } => quantity * price * *rate,
            CommissionSpec::PerShare { amount } => quantity * *amount,
        }
    }

    fn fill_at(&mut self, order: &Order, price: Decimal, at: chrono::DateTime<chrono::Utc>) -> Fill {
        let commission = self.commission_for(order.quantity, price);
        Fill {
            order_id: order.id,
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            price,
            commission,
            timestamp: at,
            rule_id: order.rule_id.clone(),
            strategy_id: order.strategy_id.clone(),
        }
    }

    fn handle_order(&mut self, order: &Order, bus: &EventBus) {
        let immediate = matches!(order.order_type, OrderType::Market)
            && self.settings.fill_delay_bars == 0;

        if immediate {
            let current = self.market.borrow().bar(&order.symbol).cloned();
            if let Some(bar) = current {
                let price = self.execution_price(order.side, bar.close);
                let fill = self.fill_at(order, price, bar.timestamp);
                debug!(order_id = %order.id, symbol = %order.symbol, %price, "market order filled");
                bus.emit(EventPayload::Fill(fill));
                return;
            }
            warn!(order_id = %order.id, symbol = %order.symbol, "no price yet, order queued");
        }

        self.pending.push(PendingOrder {
            order: order.clone(),
            bars_seen: 0,
        });
    }

    fn handle_bar(&mut self, bar: &Bar, bus: &EventBus) {
        let mut still_pending = Vec::with_capacity(self.pending.len());
        let waiting = std::mem::take(&mut self.pending);

        for mut pending in waiting {
            if pending.order.symbol != bar.symbol
                || bar.timestamp <= pending.order.created_time
            {
                still_pending.push(pending);
                continue;
            }
            pending.bars_seen += 1;

            let fill = match pending.order.order_type {
                OrderType::Market => {
                    if pending.bars_seen >= self.settings.fill_delay_bars.max(1) {
                        let price = self.execution_price(pending.order.side, bar.close);
                        Some(self.fill_at(&pending.order, price, bar.timestamp))
                    } else {
                        None
                    }
                }
                // Limit fills at the level once the bar range crosses it.
                OrderType::Limit { price } => {
                    let crossed = match pending.order.side {
                        Side::Buy => bar.low <= price,
                        Side::Sell => bar.high >= price,
                    };
                    crossed.then(|| self.fill_at(&pending.order, price, bar.timestamp))
                }
                // A triggered stop executes like a market order at the stop
                // level, slippage included.
                OrderType::Stop { stop_price } => {
                    let triggered = match pending.order.side {
                        Side::Buy => bar.high >= stop_price,
                        Side::Sell => bar.low <= stop_price,
                    };
                    if triggered {
                        let price = self.execution_price(pending.order.side, stop_price);
                        Some(self.fill_at(&pending.order, price, bar.timestamp))
                    } else {
                        None
                    }
                }
            };

            match fill {
                Some(fill) => {
                    debug!(order_id = %fill.order_id, symbol = %fill.symbol, price = %fill.price, "pending order filled");
                    bus.emit(EventPayload::Fill(fill));
                }
                None => still_pending.push(pending),
            }
        }

        self.pending = still_pending;
    }

    /// Execute every resting market order at the latest observed close.
    /// The coordinator calls this at end of run so delayed market orders
    /// (including the liquidation pass) settle before the final mark.
    /// Resting limit/stop orders never crossed and stay unfilled.
    pub fn flush_market_orders(&mut self, bus: &EventBus) {
        let waiting = std::mem::take(&mut self.pending);
        for pending in waiting {
            if !matches!(pending.order.order_type, OrderType::Market) {
                self.pending.push(pending);
                continue;
            }
            let current = self.market.borrow().bar(&pending.order.symbol).cloned();
            match current {
                Some(bar) => {
                    let price = self.execution_price(pending.order.side, bar.close);
                    let fill = self.fill_at(&pending.order, price, bar.timestamp);
                    bus.emit(EventPayload::Fill(fill));
                }
                None => {
                    warn!(order_id = %pending.order.id, symbol = %pending.order.symbol, "no price to flush market order");
                }
            }
        }
    }
}

impl EventHandler for SimulatedBroker {
    fn name(&self) -> &str {
        "broker"
    }

    fn on_event(&mut self, event: &Event, bus: &EventBus) -> Result<(), HandlerError> {
        match event.payload() {
            EventPayload::Order(order) => self.handle_order(order, bus),
            EventPayload::Bar(bar) => self.handle_bar(bar, bus),
            _ => {}
        }
        Ok(())
    }
}
