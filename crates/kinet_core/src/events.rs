//! Event engine.
//!
//! Every event latches the last trigger value it saw. A rising edge creates a
//! [`PendingExecution`] due at `trigger time + delay`; a falling edge cancels
//! the pending executions of non-persistent events. At each processed point
//! the engine fires every due execution, one at a time in priority order, and
//! re-scans triggers after each firing until nothing is left to do.

use crate::compiled::NodeId;
use crate::error::{SimError, SimResult};
use crate::traits::EventOutcome;
use std::cmp::Ordering;
use tracing::{info, trace};

/// An event with its expressions compiled into the model's arena.
#[derive(Debug, Clone)]
pub struct CompiledEvent {
    pub id: String,
    pub trigger: NodeId,
    pub delay: Option<NodeId>,
    pub priority: Option<NodeId>,
    pub persistent: bool,
    pub initial_value: bool,
    pub use_values_from_trigger_time: bool,
    /// `(state index, value)` in declaration order.
    pub assignments: Vec<(usize, NodeId)>,
}

/// Evaluation services the engine needs from the model.
pub trait EventHost {
    /// Makes `(t, y)` the current point, applying assignment rules to `y`.
    fn prepare(&mut self, t: f64, y: &mut [f64]);

    /// Value of `node` at the current point.
    fn value(&mut self, node: NodeId) -> f64;
}

fn truth(value: f64) -> bool {
    value != 0.0 && !value.is_nan()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingExecution {
    /// Index into the event list.
    pub event: usize,
    pub trigger_time: f64,
    pub execution_time: f64,
    /// Assignment values captured at trigger time.
    pub frozen: Option<Vec<f64>>,
    sequence: u64,
    /// Firings at the current time that led to this execution being scheduled.
    generation: usize,
}

/// Where one event stands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventPhase {
    /// Trigger is false and nothing is scheduled.
    Untriggered,
    /// At least one execution is waiting; the earliest is due at `execution_time`.
    Scheduled { execution_time: f64 },
    /// Trigger is still true after firing (or was true from the start); it has
    /// to turn false before the event can trigger again.
    Latched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRecordKind {
    Fired,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub event: String,
    pub kind: EventRecordKind,
    pub trigger_time: f64,
    pub execution_time: f64,
    /// Priority evaluated at execution time; `None` for events without one
    /// and for cancellations.
    pub priority: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct EventEngine {
    latches: Vec<bool>,
    pending: Vec<PendingExecution>,
    next_sequence: u64,
    max_cascade: usize,
    log: Vec<EventRecord>,
}

impl EventEngine {
    pub fn new(event_count: usize, max_cascade: usize) -> Self {
        Self {
            latches: vec![false; event_count],
            pending: Vec::new(),
            next_sequence: 0,
            max_cascade: max_cascade.max(1),
            log: Vec::new(),
        }
    }

    pub fn set_max_cascade(&mut self, max_cascade: usize) {
        self.max_cascade = max_cascade.max(1);
    }

    /// Firings and cancellations so far, in the order they happened.
    pub fn log(&self) -> &[EventRecord] {
        &self.log
    }

    pub fn pending(&self) -> &[PendingExecution] {
        &self.pending
    }

    pub fn phase(&self, event: usize) -> EventPhase {
        let earliest = self
            .pending
            .iter()
            .filter(|p| p.event == event)
            .map(|p| p.execution_time)
            .min_by(f64::total_cmp);
        match earliest {
            Some(execution_time) => EventPhase::Scheduled { execution_time },
            None if self.latches[event] => EventPhase::Latched,
            None => EventPhase::Untriggered,
        }
    }

    /// Earliest scheduled execution.
    pub fn next_scheduled_time(&self) -> Option<f64> {
        self.pending
            .iter()
            .map(|p| p.execution_time)
            .min_by(f64::total_cmp)
    }

    /// Resets every latch to the event's `initial_value` and processes the
    /// start point.
    pub fn initialize<H: EventHost + ?Sized>(
        &mut self,
        events: &[CompiledEvent],
        host: &mut H,
        t: f64,
        y: &mut [f64],
    ) -> SimResult<EventOutcome> {
        self.latches = events.iter().map(|e| e.initial_value).collect();
        self.pending.clear();
        self.log.clear();
        self.next_sequence = 0;
        self.process(events, host, t, y)
    }

    /// Whether any trigger at `(t, y)` differs from its latch.
    pub fn triggers_changed<H: EventHost + ?Sized>(
        &self,
        events: &[CompiledEvent],
        host: &mut H,
        t: f64,
        y: &mut [f64],
    ) -> bool {
        host.prepare(t, y);
        events
            .iter()
            .zip(&self.latches)
            .any(|(event, &latch)| truth(host.value(event.trigger)) != latch)
    }

    /// Whether processing `(t, y)` would fire something.
    pub fn has_pending<H: EventHost + ?Sized>(
        &self,
        events: &[CompiledEvent],
        host: &mut H,
        t: f64,
        y: &mut [f64],
    ) -> bool {
        if self.pending.iter().any(|p| p.execution_time <= t) {
            return true;
        }
        host.prepare(t, y);
        events.iter().zip(&self.latches).any(|(event, &latch)| {
            !latch
                && truth(host.value(event.trigger))
                && event.delay.map_or(true, |node| host.value(node) <= 0.0)
        })
    }

    /// Scans triggers at `(t, y)` and fires everything due, cascading until
    /// no execution is eligible.
    ///
    /// Executions eligible at entry form generation 0; an execution scheduled
    /// by the re-scan after a generation-`g` firing belongs to generation
    /// `g + 1`. Firing anything deeper than `max_cascade` fails the cascade.
    pub fn process<H: EventHost + ?Sized>(
        &mut self,
        events: &[CompiledEvent],
        host: &mut H,
        t: f64,
        y: &mut [f64],
    ) -> SimResult<EventOutcome> {
        let mut outcome = EventOutcome::default();
        let mut cascade: Vec<usize> = Vec::new();

        for execution in &mut self.pending {
            execution.generation = 0;
        }
        host.prepare(t, y);
        self.scan(events, host, t, 0)?;

        while let Some(position) = self.select(events, host, t) {
            if self.pending[position].generation > self.max_cascade {
                let mut names: Vec<String> = Vec::new();
                for &index in &cascade {
                    if !names.contains(&events[index].id) {
                        names.push(events[index].id.clone());
                    }
                }
                return Err(SimError::CascadeLimitExceeded {
                    time: t,
                    limit: self.max_cascade,
                    events: names,
                });
            }

            let execution = self.pending.remove(position);
            let event = &events[execution.event];
            let priority = event
                .priority
                .map(|node| host.value(node))
                .filter(|p| !p.is_nan());

            // Every value is computed against the pre-assignment state.
            let values: Vec<f64> = match execution.frozen {
                Some(values) => values,
                None => event
                    .assignments
                    .iter()
                    .map(|&(_, node)| host.value(node))
                    .collect(),
            };
            for (&(target, _), &value) in event.assignments.iter().zip(&values) {
                if y[target].to_bits() != value.to_bits() {
                    y[target] = value;
                    outcome.state_changed = true;
                }
            }

            info!(
                event = %event.id,
                t,
                trigger_time = execution.trigger_time,
                ?priority,
                "event fired"
            );
            self.log.push(EventRecord {
                event: event.id.clone(),
                kind: EventRecordKind::Fired,
                trigger_time: execution.trigger_time,
                execution_time: t,
                priority,
            });
            outcome.fired += 1;
            cascade.push(execution.event);

            host.prepare(t, y);
            self.scan(events, host, t, execution.generation + 1)?;
        }
        Ok(outcome)
    }

    /// Updates latches from the current point, scheduling on rising edges
    /// and cancelling on falling ones.
    fn scan<H: EventHost + ?Sized>(
        &mut self,
        events: &[CompiledEvent],
        host: &mut H,
        t: f64,
        generation: usize,
    ) -> SimResult<()> {
        for (index, event) in events.iter().enumerate() {
            let now = truth(host.value(event.trigger));
            let before = std::mem::replace(&mut self.latches[index], now);
            if now && !before {
                self.schedule(index, event, host, t, generation)?;
            } else if !now && before && !event.persistent {
                self.cancel(index, event, t);
            }
        }
        Ok(())
    }

    fn schedule<H: EventHost + ?Sized>(
        &mut self,
        index: usize,
        event: &CompiledEvent,
        host: &mut H,
        t: f64,
        generation: usize,
    ) -> SimResult<()> {
        let delay = event.delay.map_or(0.0, |node| host.value(node));
        if !(delay >= 0.0 && delay.is_finite()) {
            return Err(SimError::Configuration(format!(
                "event '{}' evaluated an invalid delay {delay} at t = {t}",
                event.id
            )));
        }
        let frozen = event.use_values_from_trigger_time.then(|| {
            event
                .assignments
                .iter()
                .map(|&(_, node)| host.value(node))
                .collect()
        });
        trace!(event = %event.id, t, delay, "event triggered");
        self.pending.push(PendingExecution {
            event: index,
            trigger_time: t,
            execution_time: t + delay,
            frozen,
            sequence: self.next_sequence,
            generation,
        });
        self.next_sequence += 1;
        Ok(())
    }

    fn cancel(&mut self, index: usize, event: &CompiledEvent, t: f64) {
        let log = &mut self.log;
        self.pending.retain(|p| {
            if p.event != index {
                return true;
            }
            trace!(event = %event.id, t, scheduled = p.execution_time, "event cancelled");
            log.push(EventRecord {
                event: event.id.clone(),
                kind: EventRecordKind::Cancelled,
                trigger_time: p.trigger_time,
                execution_time: p.execution_time,
                priority: None,
            });
            false
        });
    }

    /// Position of the next execution to fire at `t`: highest priority, then
    /// declaration order, then scheduling order.
    fn select<H: EventHost + ?Sized>(
        &self,
        events: &[CompiledEvent],
        host: &mut H,
        t: f64,
    ) -> Option<usize> {
        let rank = |host: &mut H, p: &PendingExecution| {
            events[p.event]
                .priority
                .map(|node| host.value(node))
                .filter(|v| !v.is_nan())
                .unwrap_or(f64::NEG_INFINITY)
        };
        let mut best: Option<(usize, f64)> = None;
        for (position, execution) in self.pending.iter().enumerate() {
            if execution.execution_time > t {
                continue;
            }
            let priority = rank(host, execution);
            let better = match best {
                None => true,
                Some((current, current_priority)) => {
                    let incumbent = &self.pending[current];
                    match priority.total_cmp(&current_priority) {
                        Ordering::Greater => true,
                        Ordering::Less => false,
                        Ordering::Equal => {
                            (execution.event, execution.sequence)
                                < (incumbent.event, incumbent.sequence)
                        }
                    }
                }
            };
            if better {
                best = Some((position, priority));
            }
        }
        best.map(|(position, _)| position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiled::{Env, NoHistory, NodeArena, NodeCache, SymbolTable};
    use crate::equation_engine::parse;

    /// Host over a bare arena: state `x`, `y`, `z`, no rules.
    struct Host {
        arena: NodeArena,
        cache: NodeCache,
        time: f64,
        state: Vec<f64>,
    }

    impl Host {
        fn new() -> (Self, SymbolTable) {
            let symbols = SymbolTable::new(&["x".to_string(), "y".to_string(), "z".to_string()], &[]);
            let arena = NodeArena::new(3, 0);
            let cache = arena.new_cache();
            let host = Self {
                arena,
                cache,
                time: 0.0,
                state: vec![0.0; 3],
            };
            (host, symbols)
        }

        fn node(&mut self, symbols: &SymbolTable, text: &str) -> NodeId {
            self.arena.compile(&parse(text).unwrap(), symbols).unwrap()
        }

        fn event(&mut self, symbols: &SymbolTable, id: &str, trigger: &str) -> CompiledEvent {
            CompiledEvent {
                id: id.into(),
                trigger: self.node(symbols, trigger),
                delay: None,
                priority: None,
                persistent: true,
                initial_value: false,
                use_values_from_trigger_time: true,
                assignments: Vec::new(),
            }
        }

        fn finish(&mut self) {
            self.cache = self.arena.new_cache();
        }
    }

    impl EventHost for Host {
        fn prepare(&mut self, t: f64, y: &mut [f64]) {
            self.time = t;
            self.state.copy_from_slice(y);
            self.cache.invalidate_all();
        }

        fn value(&mut self, node: NodeId) -> f64 {
            let env = Env {
                time: self.time,
                state: &self.state,
                parameters: &[],
                delays: &NoHistory,
            };
            self.cache.evaluate(&self.arena, node, &env)
        }
    }

    #[test]
    fn rising_edge_fires_once_until_rearmed() {
        let (mut host, symbols) = Host::new();
        let mut event = host.event(&symbols, "bump", "x > 1");
        event.assignments.push((1, host.node(&symbols, "y + 1")));
        host.finish();
        let events = vec![event];
        let mut engine = EventEngine::new(1, 10);
        let mut y = vec![0.0, 0.0, 0.0];
        engine.initialize(&events, &mut host, 0.0, &mut y).unwrap();

        y[0] = 2.0;
        let outcome = engine.process(&events, &mut host, 1.0, &mut y).unwrap();
        assert_eq!(outcome, EventOutcome { fired: 1, state_changed: true });
        assert_eq!(y[1], 1.0);
        assert_eq!(engine.phase(0), EventPhase::Latched);

        // Still true: no second firing.
        let outcome = engine.process(&events, &mut host, 2.0, &mut y).unwrap();
        assert_eq!(outcome.fired, 0);

        y[0] = 0.0;
        engine.process(&events, &mut host, 3.0, &mut y).unwrap();
        assert_eq!(engine.phase(0), EventPhase::Untriggered);
        y[0] = 2.0;
        engine.process(&events, &mut host, 4.0, &mut y).unwrap();
        assert_eq!(y[1], 2.0);
    }

    #[test]
    fn trigger_true_at_start_respects_initial_value() {
        let (mut host, symbols) = Host::new();
        let mut armed = host.event(&symbols, "armed", "x >= 0");
        armed.assignments.push((1, host.node(&symbols, "5")));
        let mut latched = host.event(&symbols, "latched", "x >= 0");
        latched.initial_value = true;
        latched.assignments.push((2, host.node(&symbols, "7")));
        host.finish();
        let events = vec![armed, latched];

        let mut engine = EventEngine::new(2, 10);
        let mut y = vec![0.0, 0.0, 0.0];
        let outcome = engine.initialize(&events, &mut host, 0.0, &mut y).unwrap();
        assert_eq!(outcome.fired, 1);
        assert_eq!(y, vec![0.0, 5.0, 0.0]);
    }

    #[test]
    fn non_persistent_execution_is_cancelled_when_trigger_drops() {
        let (mut host, symbols) = Host::new();
        let mut event = host.event(&symbols, "pulse", "x > 0.5");
        event.persistent = false;
        event.delay = Some(host.node(&symbols, "2"));
        event.assignments.push((1, host.node(&symbols, "1")));
        host.finish();
        let events = vec![event];
        let mut engine = EventEngine::new(1, 10);
        let mut y = vec![0.0, 0.0, 0.0];
        engine.initialize(&events, &mut host, 0.0, &mut y).unwrap();

        y[0] = 1.0;
        engine.process(&events, &mut host, 1.0, &mut y).unwrap();
        assert_eq!(engine.next_scheduled_time(), Some(3.0));
        assert_eq!(engine.phase(0), EventPhase::Scheduled { execution_time: 3.0 });

        y[0] = 0.0;
        engine.process(&events, &mut host, 2.0, &mut y).unwrap();
        assert_eq!(engine.next_scheduled_time(), None);
        let outcome = engine.process(&events, &mut host, 3.0, &mut y).unwrap();
        assert_eq!(outcome.fired, 0);
        assert_eq!(y[1], 0.0);
        assert_eq!(engine.log()[0].kind, EventRecordKind::Cancelled);
    }

    #[test]
    fn persistent_execution_survives_trigger_drop() {
        let (mut host, symbols) = Host::new();
        let mut event = host.event(&symbols, "pulse", "x > 0.5");
        event.delay = Some(host.node(&symbols, "2"));
        event.assignments.push((1, host.node(&symbols, "1")));
        host.finish();
        let events = vec![event];
        let mut engine = EventEngine::new(1, 10);
        let mut y = vec![0.0, 0.0, 0.0];
        engine.initialize(&events, &mut host, 0.0, &mut y).unwrap();

        y[0] = 1.0;
        engine.process(&events, &mut host, 1.0, &mut y).unwrap();
        y[0] = 0.0;
        engine.process(&events, &mut host, 2.0, &mut y).unwrap();
        let outcome = engine.process(&events, &mut host, 3.0, &mut y).unwrap();
        assert_eq!(outcome.fired, 1);
        assert_eq!(y[1], 1.0);
        let record = &engine.log()[0];
        assert_eq!((record.trigger_time, record.execution_time), (1.0, 3.0));
    }

    #[test]
    fn simultaneous_events_fire_by_priority_then_declaration() {
        let (mut host, symbols) = Host::new();
        let mut low = host.event(&symbols, "low", "x > 0");
        low.priority = Some(host.node(&symbols, "1"));
        low.assignments.push((1, host.node(&symbols, "y * 10 + 1")));
        let mut unranked = host.event(&symbols, "unranked", "x > 0");
        unranked.assignments.push((1, host.node(&symbols, "y * 10 + 2")));
        let mut high = host.event(&symbols, "high", "x > 0");
        high.priority = Some(host.node(&symbols, "5"));
        high.assignments.push((1, host.node(&symbols, "y * 10 + 3")));
        let mut also_high = host.event(&symbols, "also_high", "x > 0");
        also_high.priority = Some(host.node(&symbols, "5"));
        also_high.use_values_from_trigger_time = false;
        also_high.assignments.push((1, host.node(&symbols, "y * 10 + 4")));
        host.finish();
        let events = vec![low, unranked, high, also_high];

        let mut engine = EventEngine::new(4, 10);
        let mut y = vec![0.0, 0.0, 0.0];
        engine.initialize(&events, &mut host, 0.0, &mut y).unwrap();
        y[0] = 1.0;
        engine.process(&events, &mut host, 1.0, &mut y).unwrap();

        let order: Vec<&str> = engine.log().iter().map(|r| r.event.as_str()).collect();
        assert_eq!(order, ["high", "also_high", "low", "unranked"]);
        // Frozen values (y was 0 at trigger time) except also_high, which
        // reads y after high fired.
        assert_eq!(y[1], 2.0);
        assert_eq!(engine.log()[1].priority, Some(5.0));
        assert_eq!(engine.log()[3].priority, None);
    }

    #[test]
    fn assignments_read_the_pre_assignment_state() {
        let (mut host, symbols) = Host::new();
        let mut swap = host.event(&symbols, "swap", "z > 0");
        swap.use_values_from_trigger_time = false;
        swap.assignments.push((0, host.node(&symbols, "y")));
        swap.assignments.push((1, host.node(&symbols, "x")));
        host.finish();
        let events = vec![swap];
        let mut engine = EventEngine::new(1, 10);
        let mut y = vec![1.0, 2.0, 0.0];
        engine.initialize(&events, &mut host, 0.0, &mut y).unwrap();
        y[2] = 1.0;
        engine.process(&events, &mut host, 1.0, &mut y).unwrap();
        assert_eq!(&y[..2], &[2.0, 1.0]);
    }

    #[test]
    fn cascades_reach_a_fixed_point() {
        let (mut host, symbols) = Host::new();
        let mut first = host.event(&symbols, "first", "x > 0");
        first.assignments.push((1, host.node(&symbols, "1")));
        let mut second = host.event(&symbols, "second", "y > 0");
        second.assignments.push((2, host.node(&symbols, "1")));
        host.finish();
        let events = vec![first, second];
        let mut engine = EventEngine::new(2, 10);
        let mut y = vec![0.0, 0.0, 0.0];
        engine.initialize(&events, &mut host, 0.0, &mut y).unwrap();
        y[0] = 1.0;
        let outcome = engine.process(&events, &mut host, 1.0, &mut y).unwrap();
        assert_eq!(outcome.fired, 2);
        assert_eq!(y, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn oscillating_events_hit_the_cascade_limit() {
        let (mut host, symbols) = Host::new();
        let mut on = host.event(&symbols, "on", "x < 0.5");
        on.assignments.push((0, host.node(&symbols, "1")));
        let mut off = host.event(&symbols, "off", "x > 0.5");
        off.assignments.push((0, host.node(&symbols, "0")));
        host.finish();
        let events = vec![on, off];
        let mut y = vec![1.0, 0.0, 0.0];
        let mut engine = EventEngine::new(2, 20);
        let err = engine.initialize(&events, &mut host, 0.0, &mut y).unwrap_err();
        match err {
            SimError::CascadeLimitExceeded { limit, events, .. } => {
                assert_eq!(limit, 20);
                assert_eq!(events, vec!["off".to_string(), "on".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn independent_simultaneous_events_are_not_a_cascade() {
        let (mut host, symbols) = Host::new();
        let mut left = host.event(&symbols, "left", "x > 0");
        left.assignments.push((1, host.node(&symbols, "1")));
        let mut right = host.event(&symbols, "right", "x > 0");
        right.assignments.push((2, host.node(&symbols, "1")));
        host.finish();
        let events = vec![left, right];
        let mut engine = EventEngine::new(2, 1);
        let mut y = vec![0.0, 0.0, 0.0];
        engine.initialize(&events, &mut host, 0.0, &mut y).unwrap();
        y[0] = 1.0;
        let outcome = engine.process(&events, &mut host, 1.0, &mut y).unwrap();
        assert_eq!(outcome.fired, 2);
        assert_eq!(y, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn cascade_depth_counts_chained_firings() {
        let (mut host, symbols) = Host::new();
        let mut first = host.event(&symbols, "first", "x > 0");
        first.assignments.push((1, host.node(&symbols, "1")));
        let mut second = host.event(&symbols, "second", "y > 0");
        second.assignments.push((2, host.node(&symbols, "1")));
        let mut third = host.event(&symbols, "third", "z > 0");
        third.assignments.push((0, host.node(&symbols, "2")));
        host.finish();
        let events = vec![first, second, third];

        let mut y = vec![0.0, 0.0, 0.0];
        let mut engine = EventEngine::new(3, 2);
        engine.initialize(&events, &mut host, 0.0, &mut y).unwrap();
        y[0] = 1.0;
        let outcome = engine.process(&events, &mut host, 1.0, &mut y).unwrap();
        assert_eq!(outcome.fired, 3);

        let mut y = vec![0.0, 0.0, 0.0];
        let mut engine = EventEngine::new(3, 1);
        engine.initialize(&events, &mut host, 0.0, &mut y).unwrap();
        y[0] = 1.0;
        let err = engine.process(&events, &mut host, 1.0, &mut y).unwrap_err();
        match err {
            SimError::CascadeLimitExceeded { limit, events, .. } => {
                assert_eq!(limit, 1);
                assert_eq!(events, vec!["first".to_string(), "second".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn negative_delay_is_rejected() {
        let (mut host, symbols) = Host::new();
        let mut event = host.event(&symbols, "bad", "x > 0");
        event.delay = Some(host.node(&symbols, "-1"));
        host.finish();
        let events = vec![event];
        let mut engine = EventEngine::new(1, 10);
        let mut y = vec![1.0, 0.0, 0.0];
        let err = engine.initialize(&events, &mut host, 0.0, &mut y).unwrap_err();
        assert!(err.to_string().contains("invalid delay"));
    }
}
