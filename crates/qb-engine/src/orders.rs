use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

use qb_events::{Event, EventBus, EventHandler, EventPayload, OrderStatusUpdate};
use qb_types::{Fill, HandlerError, Order, OrderError, OrderId, OrderIdSource, OrderStatus};

/// Order lifecycle tracking.
///
/// Intercepts order events, assigns ids to unassigned orders, registers
/// them, and consumes fills to advance status. An `OrderStatus` event goes
/// out on every transition.
pub struct OrderManager {
    orders: HashMap<OrderId, Order>,
    sequence: Vec<OrderId>,
    ids: OrderIdSource,
}

impl OrderManager {
    pub fn new(ids: OrderIdSource) -> Self {
        Self {
            orders: HashMap::new(),
            sequence: Vec::new(),
            ids,
        }
    }

    pub fn reset(&mut self) {
        self.orders.clear();
        self.sequence.clear();
    }

    fn emit_status(&self, order: &Order, bus: &EventBus) {
        bus.emit(EventPayload::OrderStatus(OrderStatusUpdate {
            order_id: order.id,
            symbol: order.symbol.clone(),
            status: order.status,
            filled_quantity: order.filled_quantity,
            average_fill_price: order.average_fill_price,
            timestamp: order.updated_time,
        }));
    }

    fn handle_order(&mut self, incoming: &Order, bus: &EventBus) -> Result<(), OrderError> {
        let mut order = incoming.clone();
        if !order.id.is_assigned() {
            order.id = self.ids.next();
        }
        if self.orders.contains_key(&order.id) {
            warn!(order_id = %order.id, "duplicate order registration ignored");
            return Ok(());
        }

        if order.status == OrderStatus::Created {
            order.transition(OrderStatus::Pending, order.created_time)?;
        }
        debug!(order_id = %order.id, symbol = %order.symbol, side = %order.side, "order registered");
        self.emit_status(&order, bus);
        self.sequence.push(order.id);
        self.orders.insert(order.id, order);
        Ok(())
    }

    fn handle_fill(&mut self, fill: &Fill, bus: &EventBus) -> Result<(), OrderError> {
        let matched = if fill.order_id.is_assigned() && self.orders.contains_key(&fill.order_id) {
            Some(fill.order_id)
        } else {
            // Oldest active order on the same symbol and side.
            self.sequence
                .iter()
                .find(|id| {
                    self.orders
                        .get(id)
                        .map(|o| o.is_active() && o.symbol == fill.symbol && o.side == fill.side)
                        .unwrap_or(false)
                })
                .copied()
        };

        let Some(order_id) = matched else {
            warn!(
                order_id = %fill.order_id,
                symbol = %fill.symbol,
                "fill matched no registered order"
            );
            return Ok(());
        };

        if let Some(order) = self.orders.get_mut(&order_id) {
            order.apply_fill(fill.quantity, fill.price, fill.timestamp)?;
            let snapshot = order.clone();
            self.emit_status(&snapshot, bus);
        }
        Ok(())
    }

    /// Cancel an order; only CREATED/PENDING/PARTIAL orders are cancelable.
    pub fn cancel(&mut self, order_id: OrderId, at: DateTime<Utc>) -> Result<(), OrderError> {
        let order = self
            .orders
            .get_mut(&order_id)
            .ok_or(OrderError::NotFound { id: order_id })?;
        if !order.is_active() {
            return Err(OrderError::NotCancelable {
                id: order_id,
                status: order.status,
            });
        }
        if order.status == OrderStatus::Created {
            order.transition(OrderStatus::Pending, at)?;
        }
        order.transition(OrderStatus::Canceled, at)
    }

    pub fn get(&self, order_id: OrderId) -> Option<&Order> {
        self.orders.get(&order_id)
    }

    pub fn active_orders(&self, symbol: Option<&str>) -> Vec<&Order> {
        self.sequence
            .iter()
            .filter_map(|id| self.orders.get(id))
            .filter(|o| o.is_active())
            .filter(|o| symbol.map(|s| o.symbol == s).unwrap_or(true))
            .collect()
    }

    /// Registered orders in arrival order; `limit` keeps the most recent.
    pub fn history(&self, symbol: Option<&str>, limit: Option<usize>) -> Vec<&Order> {
        let all: Vec<&Order> = self
            .sequence
            .iter()
            .filter_map(|id| self.orders.get(id))
            .filter(|o| symbol.map(|s| o.symbol == s).unwrap_or(true))
            .collect();
        match limit {
            Some(n) if n < all.len() => all[all.len() - n..].to_vec(),
            _ => all,
        }
    }

    /// Owned copies of all registered orders, in arrival order.
    pub fn snapshot(&self) -> Vec<Order> {
        self.sequence
            .iter()
            .filter_map(|id| self.orders.get(id))
            .cloned()
            .collect()
    }
}

impl EventHandler for OrderManager {
    fn name(&self) -> &str {
        "order_manager"
    }

    fn on_event(&mut self, event: &Event, bus: &EventBus) -> Result<(), HandlerError> {
        let result = match event.payload() {
            EventPayload::Order(order) => self.handle_order(order, bus),
            EventPayload::Fill(fill) => self.handle_fill(fill, bus),
            _ => Ok(()),
        };
        result.map_err(|e| HandlerError::new(self.name(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qb_events::EventKind;
    use qb_types::Side;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn manager() -> (EventBus, OrderManager) {
        (EventBus::new(), OrderManager::new(OrderIdSource::new()))
    }

    fn order(symbol: &str, side: Side, quantity: Decimal) -> Order {
        Order::market(symbol, side, quantity, Utc::now(), "test")
    }

    fn fill_for(order: &Order, quantity: Decimal, price: Decimal) -> Fill {
        Fill {
            order_id: order.id,
            symbol: order.symbol.clone(),
            side: order.side,
            quantity,
            price,
            commission: Decimal::ZERO,
            timestamp: Utc::now(),
            rule_id: None,
            strategy_id: "test".into(),
        }
    }

    #[test]
    fn registers_and_assigns_missing_ids() {
        let (bus, mut om) = manager();
        om.handle_order(&order("X", Side::Buy, dec!(100)), &bus).unwrap();

        let active = om.active_orders(None);
        assert_eq!(active.len(), 1);
        assert!(active[0].id.is_assigned());
        assert_eq!(active[0].status, OrderStatus::Pending);
        assert_eq!(bus.stats(EventKind::OrderStatus).emitted, 1);
    }

    #[test]
    fn fill_by_order_id_advances_status() {
        let (bus, mut om) = manager();
        let placed = order("X", Side::Buy, dec!(100)).with_id(OrderId(7));
        om.handle_order(&placed, &bus).unwrap();

        om.handle_fill(&fill_for(&placed, dec!(40), dec!(10)), &bus).unwrap();
        assert_eq!(om.get(OrderId(7)).unwrap().status, OrderStatus::PartiallyFilled);

        om.handle_fill(&fill_for(&placed, dec!(60), dec!(11)), &bus).unwrap();
        let done = om.get(OrderId(7)).unwrap();
        assert_eq!(done.status, OrderStatus::Filled);
        assert_eq!(done.filled_quantity, dec!(100));
        assert!(om.active_orders(None).is_empty());
    }

    #[test]
    fn unknown_fill_matches_oldest_active_by_symbol_side() {
        let (bus, mut om) = manager();
        let first = order("X", Side::Buy, dec!(100)).with_id(OrderId(1));
        let second = order("X", Side::Buy, dec!(100)).with_id(OrderId(2));
        om.handle_order(&first, &bus).unwrap();
        om.handle_order(&second, &bus).unwrap();

        let mut anonymous = fill_for(&first, dec!(100), dec!(10));
        anonymous.order_id = OrderId::UNASSIGNED;
        om.handle_fill(&anonymous, &bus).unwrap();

        assert_eq!(om.get(OrderId(1)).unwrap().status, OrderStatus::Filled);
        assert_eq!(om.get(OrderId(2)).unwrap().status, OrderStatus::Pending);
    }

    #[test]
    fn unmatched_fill_is_logged_not_fatal() {
        let (bus, mut om) = manager();
        let ghost = order("X", Side::Sell, dec!(10)).with_id(OrderId(42));
        let result = om.handle_fill(&fill_for(&ghost, dec!(10), dec!(5)), &bus);
        assert!(result.is_ok());
        assert!(om.snapshot().is_empty());
    }

    #[test]
    fn cancel_only_active_orders() {
        let (bus, mut om) = manager();
        let placed = order("X", Side::Buy, dec!(100)).with_id(OrderId(5));
        om.handle_order(&placed, &bus).unwrap();

        om.cancel(OrderId(5), Utc::now()).unwrap();
        assert_eq!(om.get(OrderId(5)).unwrap().status, OrderStatus::Canceled);

        let result = om.cancel(OrderId(5), Utc::now());
        assert!(matches!(result, Err(OrderError::NotCancelable { .. })));
        assert!(matches!(
            om.cancel(OrderId(999), Utc::now()),
            Err(OrderError::NotFound { .. })
        ));
    }

    #[test]
    fn history_filters_and_limits() {
        let (bus, mut om) = manager();
        for i in 1..=4 {
            let symbol = if i % 2 == 0 { "X" } else { "Y" };
            om.handle_order(&order(symbol, Side::Buy, dec!(10)).with_id(OrderId(i)), &bus)
                .unwrap();
        }
        assert_eq!(om.history(None, None).len(), 4);
        assert_eq!(om.history(Some("X"), None).len(), 2);
        let limited = om.history(None, Some(2));
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, OrderId(3));
    }
}
