use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use qb_events::{Event, EventBus, EventHandler, EventPayload};
use qb_types::{ConfigError, HandlerError, Portfolio, Strategy};

/// Puts a strategy object on the bus: consumes bars, forwards any signal.
pub struct StrategyHandler {
    strategy: Box<dyn Strategy>,
}

impl StrategyHandler {
    pub fn new(strategy: Box<dyn Strategy>) -> Self {
        Self { strategy }
    }

    pub fn configure(&mut self, params: &HashMap<String, Value>) -> Result<(), ConfigError> {
        self.strategy.configure(params)
    }

    pub fn reset(&mut self) {
        self.strategy.reset();
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }
}

impl EventHandler for StrategyHandler {
    fn name(&self) -> &str {
        "strategy"
    }

    fn on_event(&mut self, event: &Event, bus: &EventBus) -> Result<(), HandlerError> {
        if let EventPayload::Bar(bar) = event.payload() {
            if let Some(signal) = self.strategy.on_bar(bar) {
                bus.emit(EventPayload::Signal(signal));
            }
        }
        Ok(())
    }
}

/// Puts the portfolio on the bus: applies fills and mark-to-market ticks.
///
/// Accounting failures poison the portfolio itself; the coordinator checks
/// for the violation and aborts, so the error here only stops this handler.
pub struct PortfolioHandler {
    portfolio: Rc<RefCell<Portfolio>>,
}

impl PortfolioHandler {
    pub fn new(portfolio: Rc<RefCell<Portfolio>>) -> Self {
        Self { portfolio }
    }
}

impl EventHandler for PortfolioHandler {
    fn name(&self) -> &str {
        "portfolio"
    }

    fn on_event(&mut self, event: &Event, _bus: &EventBus) -> Result<(), HandlerError> {
        let result = match event.payload() {
            EventPayload::Fill(fill) => self.portfolio.borrow_mut().apply_fill(fill),
            EventPayload::MarkToMarket(mark) => self
                .portfolio
                .borrow_mut()
                .apply_mark(mark.timestamp, &mark.prices),
            _ => Ok(()),
        };
        result.map_err(|e| HandlerError::new(self.name(), e.to_string()))
    }
}
