//! Deterministic event scheduler for simulation.
//!
//! The scheduler processes events in a deterministic order based on:
//! 1. Event timestamp (earlier first)
//! 2. Event ID, i.e. scheduling order, for events sharing a timestamp

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet},
    time::Duration,
};

use serde::Serialize;

use super::time::{duration_to_nanos, TimeSource, VirtualTime};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EventId(u64);

impl EventId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// A scheduled event in the simulation.
#[derive(Debug, Clone)]
pub struct Event<E> {
    /// When this event should be processed (virtual nanos)
    pub timestamp: u64,
    /// Unique identifier for ordering ties
    pub id: EventId,
    /// The event payload
    pub payload: E,
}

impl<E> PartialEq for Event<E> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<E> Eq for Event<E> {}

impl<E> PartialOrd for Event<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Event<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: reverse ordering so smallest timestamp comes first,
        // ties broken by registration order (smaller ID = scheduled earlier)
        match other.timestamp.cmp(&self.timestamp) {
            Ordering::Equal => other.id.0.cmp(&self.id.0),
            ord => ord,
        }
    }
}

/// Configuration for the scheduler.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Maximum events to process per `run_until` call (0 = unlimited)
    pub max_events_per_step: usize,
    /// Whether to log events as they're processed
    pub trace_events: bool,
    /// Whether to keep processed events for replay verification
    pub record_events: bool,
}

/// Deterministic event scheduler for simulation.
///
/// Processes events in timestamp order; events sharing a timestamp run in the
/// order they were scheduled.
pub struct Scheduler<E> {
    time: VirtualTime,
    pending_events: BinaryHeap<Event<E>>,
    /// Ids still waiting in the heap. Cancelled events are dropped lazily on pop.
    live_ids: HashSet<EventId>,
    next_event_id: u64,
    event_log: Vec<Event<E>>,
    config: SchedulerConfig,
}

impl<E: Clone + std::fmt::Debug> Scheduler<E> {
    /// Creates a new scheduler starting at time zero.
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Creates a new scheduler with the given configuration.
    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            time: VirtualTime::new(),
            pending_events: BinaryHeap::new(),
            live_ids: HashSet::new(),
            next_event_id: 0,
            event_log: Vec::new(),
            config,
        }
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn now(&self) -> u64 {
        self.time.now_nanos()
    }

    /// Returns the number of pending events.
    pub fn pending_count(&self) -> usize {
        self.live_ids.len()
    }

    /// Returns the event log for replay verification.
    pub fn event_log(&self) -> &[Event<E>] {
        &self.event_log
    }

    /// Schedules an event at the given absolute timestamp.
    ///
    /// Timestamps in the past are clamped to now.
    pub fn schedule_at(&mut self, timestamp: u64, payload: E) -> EventId {
        let id = EventId(self.next_event_id);
        self.next_event_id += 1;

        let timestamp = timestamp.max(self.now());
        self.pending_events.push(Event {
            timestamp,
            id,
            payload,
        });
        self.live_ids.insert(id);
        id
    }

    /// Schedules an event after the given delay from now.
    pub fn schedule_after(&mut self, delay: Duration, payload: E) -> EventId {
        let timestamp = self.now().saturating_add(duration_to_nanos(delay));
        self.schedule_at(timestamp, payload)
    }

    /// Schedules an event at the current time.
    pub fn schedule_now(&mut self, payload: E) -> EventId {
        self.schedule_at(self.now(), payload)
    }

    /// Cancels a pending event by ID.
    ///
    /// Returns true if the event was found and cancelled.
    pub fn cancel(&mut self, id: EventId) -> bool {
        self.live_ids.remove(&id)
    }

    /// Returns the timestamp of the next pending event, if any.
    pub fn next_event_time(&mut self) -> Option<u64> {
        self.discard_cancelled();
        self.pending_events.peek().map(|e| e.timestamp)
    }

    /// Processes the next pending event, advancing time if necessary.
    ///
    /// Returns the processed event, or None if no events are pending.
    pub fn step(&mut self) -> Option<Event<E>> {
        self.discard_cancelled();
        let event = self.pending_events.pop()?;
        self.live_ids.remove(&event.id);

        if event.timestamp > self.now() {
            self.time.advance_to(event.timestamp);
        }

        if self.config.trace_events {
            tracing::trace!(
                timestamp = event.timestamp,
                id = event.id.0,
                payload = ?event.payload,
                "Processing event"
            );
        }

        if self.config.record_events {
            self.event_log.push(event.clone());
        }
        Some(event)
    }

    /// Advances the clock to `target_time` if it is still in the future.
    pub fn advance_to(&mut self, target_time: u64) {
        self.time.advance_to(target_time);
    }

    /// Returns the configured per-call event budget (0 = unlimited).
    pub fn max_events_per_step(&self) -> usize {
        self.config.max_events_per_step
    }

    fn discard_cancelled(&mut self) {
        while let Some(head) = self.pending_events.peek() {
            if self.live_ids.contains(&head.id) {
                break;
            }
            self.pending_events.pop();
        }
    }
}

impl<E: Clone + std::fmt::Debug> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Scheduler<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("now", &self.time.now_nanos())
            .field("pending_count", &self.live_ids.len())
            .field("event_log_len", &self.event_log.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> Scheduler<u32> {
        Scheduler::with_config(SchedulerConfig {
            record_events: true,
            ..Default::default()
        })
    }

    #[test]
    fn test_scheduler_basic() {
        let mut scheduler = Scheduler::new();

        scheduler.schedule_at(100, 1u32);
        scheduler.schedule_at(50, 2);
        scheduler.schedule_at(200, 3);

        let e1 = scheduler.step().unwrap();
        assert_eq!(e1.timestamp, 50);

        let e2 = scheduler.step().unwrap();
        assert_eq!(e2.timestamp, 100);

        let e3 = scheduler.step().unwrap();
        assert_eq!(e3.timestamp, 200);

        assert!(scheduler.step().is_none());
    }

    #[test]
    fn test_scheduler_time_advancement() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_at(1000, ());

        assert_eq!(scheduler.now(), 0);
        scheduler.step();
        assert_eq!(scheduler.now(), 1000);
    }

    #[test]
    fn test_same_time_events_run_fifo() {
        let mut scheduler = Scheduler::new();

        for payload in [30u32, 10, 20, 5] {
            scheduler.schedule_at(100, payload);
        }

        let order: Vec<_> = std::iter::from_fn(|| scheduler.step())
            .map(|e| e.payload)
            .collect();
        assert_eq!(order, vec![30, 10, 20, 5]);
    }

    #[test]
    fn test_scheduler_cancel() {
        let mut scheduler = Scheduler::new();

        let id1 = scheduler.schedule_at(100, 1u32);
        scheduler.schedule_at(200, 2);

        assert!(scheduler.cancel(id1));
        assert!(!scheduler.cancel(id1)); // Already cancelled
        assert_eq!(scheduler.pending_count(), 1);

        let e = scheduler.step().unwrap();
        assert_eq!(e.timestamp, 200);
        assert!(!scheduler.cancel(e.id)); // Already processed
    }

    #[test]
    fn test_past_timestamps_clamped_to_now() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_at(500, 1u32);
        scheduler.step();

        scheduler.schedule_at(100, 2);
        let e = scheduler.step().unwrap();
        assert_eq!(e.timestamp, 500);
        assert_eq!(scheduler.now(), 500);
    }

    #[test]
    fn test_schedule_after() {
        let mut scheduler = Scheduler::new();
        scheduler.advance_to(1_000);
        scheduler.schedule_after(Duration::from_nanos(250), 7u32);
        assert_eq!(scheduler.next_event_time(), Some(1_250));
    }

    #[test]
    fn test_scheduler_event_log() {
        let mut scheduler = recording();

        scheduler.schedule_at(100, 1);
        scheduler.schedule_at(200, 2);
        while scheduler.step().is_some() {}

        let log = scheduler.event_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].timestamp, 100);
        assert_eq!(log[1].timestamp, 200);
    }
}
