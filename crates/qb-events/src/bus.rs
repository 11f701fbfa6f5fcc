use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::rc::{Rc, Weak};

use tracing::{debug, error};

use qb_types::HandlerError;

use crate::event::{Event, EventKind, EventPayload};

/// A component that receives dispatched events.
///
/// Handlers may emit further events through the bus reference; dispatch is
/// depth-first and single-threaded, so the nested emit completes before the
/// current one resumes.
pub trait EventHandler {
    fn name(&self) -> &str;
    fn on_event(&mut self, event: &Event, bus: &EventBus) -> Result<(), HandlerError>;
}

/// Opaque registration token; unregister by token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

#[derive(Clone)]
struct HandlerSlot {
    token: HandlerToken,
    priority: i32,
    name: String,
    handler: Weak<RefCell<dyn EventHandler>>,
}

/// Per-kind dispatch statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventStats {
    pub emitted: u64,
    pub deduplicated: u64,
    pub handler_errors: u64,
}

/// Single-threaded typed pub/sub with deduplication and ordered dispatch.
///
/// Handler entries are non-owning weak references: when the owning component
/// is dropped, its entry is purged transparently on the next dispatch. The
/// bus owns dispatch state only — no domain state lives here.
pub struct EventBus {
    handlers: RefCell<HashMap<EventKind, Vec<HandlerSlot>>>,
    seen: RefCell<HashMap<EventKind, HashSet<String>>>,
    stats: RefCell<BTreeMap<EventKind, EventStats>>,
    history: RefCell<HashMap<EventKind, VecDeque<EventPayload>>>,
    history_limit: usize,
    next_token: Cell<u64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_limit(64)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            handlers: RefCell::new(HashMap::new()),
            seen: RefCell::new(HashMap::new()),
            stats: RefCell::new(BTreeMap::new()),
            history: RefCell::new(HashMap::new()),
            history_limit,
            next_token: Cell::new(0),
        }
    }

    /// Register a handler for one event kind. Handlers run in descending
    /// priority; ties keep registration order.
    pub fn register(
        &self,
        kind: EventKind,
        priority: i32,
        handler: Rc<RefCell<dyn EventHandler>>,
    ) -> HandlerToken {
        let token = HandlerToken(self.next_token.get() + 1);
        self.next_token.set(token.0);

        let name = handler.borrow().name().to_string();
        let slot = HandlerSlot {
            token,
            priority,
            name,
            handler: Rc::downgrade(&handler),
        };

        let mut handlers = self.handlers.borrow_mut();
        let slots = handlers.entry(kind).or_default();
        let position = slots
            .iter()
            .position(|existing| existing.priority < priority)
            .unwrap_or(slots.len());
        slots.insert(position, slot);
        token
    }

    /// Remove a registration by token. Returns whether anything was removed.
    pub fn unregister(&self, token: HandlerToken) -> bool {
        let mut removed = false;
        for slots in self.handlers.borrow_mut().values_mut() {
            let before = slots.len();
            slots.retain(|slot| slot.token != token);
            removed |= slots.len() != before;
        }
        removed
    }

    /// Dispatch one event, returning the number of handlers that completed
    /// successfully. Duplicate events (by dedup key, per kind, since the
    /// last reset) are dropped without dispatch.
    pub fn emit(&self, payload: EventPayload) -> usize {
        let kind = payload.kind();

        if let Some(key) = payload.dedup_key() {
            let mut seen = self.seen.borrow_mut();
            if !seen.entry(kind).or_default().insert(key.clone()) {
                drop(seen);
                self.stats.borrow_mut().entry(kind).or_default().deduplicated += 1;
                debug!(%kind, %key, "duplicate event dropped");
                return 0;
            }
        }

        self.stats.borrow_mut().entry(kind).or_default().emitted += 1;
        {
            let mut history = self.history.borrow_mut();
            let entries = history.entry(kind).or_default();
            entries.push_back(payload.clone());
            while entries.len() > self.history_limit {
                entries.pop_front();
            }
        }

        // Snapshot the handler list so handlers can register/unregister and
        // emit transitively without holding the borrow.
        let slots: Vec<HandlerSlot> = self
            .handlers
            .borrow()
            .get(&kind)
            .map(|slots| slots.to_vec())
            .unwrap_or_default();

        let event = Event::new(payload);
        let mut completed = 0;
        let mut saw_dead = false;

        for slot in &slots {
            if event.is_consumed() {
                break;
            }
            let Some(cell) = slot.handler.upgrade() else {
                saw_dead = true;
                continue;
            };
            match cell.try_borrow_mut() {
                Ok(mut handler) => match handler.on_event(&event, self) {
                    Ok(()) => completed += 1,
                    Err(err) => {
                        self.stats.borrow_mut().entry(kind).or_default().handler_errors += 1;
                        error!(%kind, handler = %slot.name, %err, "handler failed during dispatch");
                    }
                },
                Err(_) => {
                    self.stats.borrow_mut().entry(kind).or_default().handler_errors += 1;
                    error!(%kind, handler = %slot.name, "handler re-entered during its own dispatch");
                }
            };
        }

        if saw_dead {
            if let Some(slots) = self.handlers.borrow_mut().get_mut(&kind) {
                slots.retain(|slot| slot.handler.strong_count() > 0);
            }
        }

        completed
    }

    /// Clear dedup state, statistics, and history. Registrations survive;
    /// use `clear_handlers` for explicit teardown.
    pub fn reset(&self) {
        self.seen.borrow_mut().clear();
        self.stats.borrow_mut().clear();
        self.history.borrow_mut().clear();
    }

    pub fn clear_handlers(&self) {
        self.handlers.borrow_mut().clear();
    }

    pub fn stats(&self, kind: EventKind) -> EventStats {
        self.stats.borrow().get(&kind).copied().unwrap_or_default()
    }

    /// Recent payloads of one kind, oldest first, bounded by the history
    /// limit.
    pub fn recent(&self, kind: EventKind) -> Vec<EventPayload> {
        self.history
            .borrow()
            .get(&kind)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .borrow()
            .get(&kind)
            .map(|slots| slots.len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::BacktestEnd;
    use chrono::Utc;
    use qb_types::{Direction, Signal};
    use rust_decimal_macros::dec;

    struct Recorder {
        name: String,
        seen: Rc<RefCell<Vec<String>>>,
        consume: bool,
        fail: bool,
    }

    impl Recorder {
        fn shared(
            name: &str,
            seen: &Rc<RefCell<Vec<String>>>,
        ) -> Rc<RefCell<Recorder>> {
            Rc::new(RefCell::new(Recorder {
                name: name.to_string(),
                seen: Rc::clone(seen),
                consume: false,
                fail: false,
            }))
        }
    }

    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_event(&mut self, event: &Event, _bus: &EventBus) -> Result<(), HandlerError> {
            self.seen.borrow_mut().push(self.name.clone());
            if self.fail {
                return Err(HandlerError::new(self.name.clone(), "boom"));
            }
            if self.consume {
                event.consume();
            }
            Ok(())
        }
    }

    /// Register while keeping the caller's strong reference alive; the bus
    /// itself only holds a weak one.
    fn attach(
        bus: &EventBus,
        kind: EventKind,
        priority: i32,
        handler: &Rc<RefCell<Recorder>>,
    ) -> HandlerToken {
        let dynamic: Rc<RefCell<dyn EventHandler>> = handler.clone();
        bus.register(kind, priority, dynamic)
    }

    fn end_event() -> EventPayload {
        EventPayload::BacktestEnd(BacktestEnd { timestamp: Utc::now() })
    }

    fn keyed_signal(rule_id: &str) -> EventPayload {
        EventPayload::Signal(
            Signal::new("X", Direction::Long, dec!(10), Utc::now(), "s").with_rule_id(rule_id),
        )
    }

    #[test]
    fn dispatch_descending_priority_ties_by_registration() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let low = Recorder::shared("low", &seen);
        let high = Recorder::shared("high", &seen);
        let tie_a = Recorder::shared("tie_a", &seen);
        let tie_b = Recorder::shared("tie_b", &seen);

        attach(&bus, EventKind::BacktestEnd, 10, &low);
        attach(&bus, EventKind::BacktestEnd, 90, &high);
        attach(&bus, EventKind::BacktestEnd, 50, &tie_a);
        attach(&bus, EventKind::BacktestEnd, 50, &tie_b);

        let completed = bus.emit(end_event());
        assert_eq!(completed, 4);
        assert_eq!(*seen.borrow(), vec!["high", "tie_a", "tie_b", "low"]);
    }

    #[test]
    fn consumed_event_stops_dispatch() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let first = Recorder::shared("first", &seen);
        first.borrow_mut().consume = true;
        let second = Recorder::shared("second", &seen);

        attach(&bus, EventKind::BacktestEnd, 90, &first);
        attach(&bus, EventKind::BacktestEnd, 10, &second);

        let completed = bus.emit(end_event());
        assert_eq!(completed, 1);
        assert_eq!(*seen.borrow(), vec!["first"]);
    }

    #[test]
    fn duplicate_keyed_events_are_dropped() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let handler = Recorder::shared("h", &seen);
        attach(&bus, EventKind::Signal, 50, &handler);

        assert_eq!(bus.emit(keyed_signal("X_BUY_group_1")), 1);
        assert_eq!(bus.emit(keyed_signal("X_BUY_group_1")), 0);
        assert_eq!(bus.emit(keyed_signal("X_BUY_group_2")), 1);

        let stats = bus.stats(EventKind::Signal);
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.deduplicated, 1);
        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    fn unkeyed_events_never_dedup() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let handler = Recorder::shared("h", &seen);
        attach(&bus, EventKind::BacktestEnd, 50, &handler);

        bus.emit(end_event());
        bus.emit(end_event());
        assert_eq!(seen.borrow().len(), 2);
        assert_eq!(bus.stats(EventKind::BacktestEnd).deduplicated, 0);
    }

    #[test]
    fn handler_failure_does_not_abort_dispatch() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let failing = Recorder::shared("failing", &seen);
        failing.borrow_mut().fail = true;
        let healthy = Recorder::shared("healthy", &seen);

        attach(&bus, EventKind::BacktestEnd, 90, &failing);
        attach(&bus, EventKind::BacktestEnd, 10, &healthy);

        let completed = bus.emit(end_event());
        assert_eq!(completed, 1);
        assert_eq!(*seen.borrow(), vec!["failing", "healthy"]);
        assert_eq!(bus.stats(EventKind::BacktestEnd).handler_errors, 1);
    }

    #[test]
    fn dropped_handler_is_purged_on_dispatch() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let keep = Recorder::shared("keep", &seen);
        let dying = Recorder::shared("dying", &seen);

        attach(&bus, EventKind::BacktestEnd, 90, &dying);
        attach(&bus, EventKind::BacktestEnd, 10, &keep);
        assert_eq!(bus.handler_count(EventKind::BacktestEnd), 2);

        drop(dying);
        let completed = bus.emit(end_event());
        assert_eq!(completed, 1);
        assert_eq!(*seen.borrow(), vec!["keep"]);
        assert_eq!(bus.handler_count(EventKind::BacktestEnd), 1);
    }

    #[test]
    fn unregister_by_token() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let handler = Recorder::shared("h", &seen);
        let token = attach(&bus, EventKind::BacktestEnd, 50, &handler);

        assert!(bus.unregister(token));
        assert!(!bus.unregister(token));
        assert_eq!(bus.emit(end_event()), 0);
    }

    #[test]
    fn reset_clears_dedup_but_keeps_handlers() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let handler = Recorder::shared("h", &seen);
        attach(&bus, EventKind::Signal, 50, &handler);

        bus.emit(keyed_signal("X_BUY_group_1"));
        bus.emit(keyed_signal("X_BUY_group_1"));
        assert_eq!(bus.stats(EventKind::Signal).deduplicated, 1);

        bus.reset();
        assert_eq!(bus.stats(EventKind::Signal), EventStats::default());
        assert!(bus.recent(EventKind::Signal).is_empty());
        assert_eq!(bus.handler_count(EventKind::Signal), 1);

        // Same key dispatches again after reset.
        assert_eq!(bus.emit(keyed_signal("X_BUY_group_1")), 1);
    }

    #[test]
    fn reset_is_idempotent() {
        let bus = EventBus::new();
        bus.emit(keyed_signal("k"));
        bus.reset();
        bus.reset();
        assert_eq!(bus.stats(EventKind::Signal), EventStats::default());
    }

    #[test]
    fn history_is_bounded() {
        let bus = EventBus::with_history_limit(3);
        for _ in 0..5 {
            bus.emit(end_event());
        }
        assert_eq!(bus.recent(EventKind::BacktestEnd).len(), 3);
        assert_eq!(bus.stats(EventKind::BacktestEnd).emitted, 5);
    }

    /// A handler that emits a follow-up event mid-dispatch; the nested emit
    /// must complete before the outer one resumes.
    struct Chainer {
        seen: Rc<RefCell<Vec<String>>>,
    }

    impl EventHandler for Chainer {
        fn name(&self) -> &str {
            "chainer"
        }

        fn on_event(&mut self, event: &Event, bus: &EventBus) -> Result<(), HandlerError> {
            if let EventPayload::Signal(_) = event.payload() {
                self.seen.borrow_mut().push("chainer:signal".into());
                bus.emit(EventPayload::BacktestEnd(BacktestEnd { timestamp: Utc::now() }));
                self.seen.borrow_mut().push("chainer:after_emit".into());
            }
            Ok(())
        }
    }

    #[test]
    fn nested_emit_is_depth_first() {
        let bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let chainer = Rc::new(RefCell::new(Chainer { seen: Rc::clone(&seen) }));
        let downstream = Recorder::shared("downstream", &seen);

        let chainer_handler: Rc<RefCell<dyn EventHandler>> = chainer.clone();
        bus.register(EventKind::Signal, 90, chainer_handler);
        attach(&bus, EventKind::BacktestEnd, 50, &downstream);

        bus.emit(keyed_signal("k"));
        assert_eq!(
            *seen.borrow(),
            vec!["chainer:signal", "downstream", "chainer:after_emit"]
        );
    }
}
