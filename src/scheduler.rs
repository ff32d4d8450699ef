//! The deterministic event scheduler.
//!
//! The scheduler owns a single ordered queue of events keyed by
//! `(due_tick, insertion_sequence)`, plus the registry of clocks attached
//! during tree finalization. Events run in non-decreasing tick order and
//! ties are broken first-in-first-out, so two runs with the same
//! configuration produce identical traces.
//!
//! Clock edges are delivered by the scheduler itself. At a given tick the
//! edges of every clock due at that tick are delivered first (in clock
//! registration order), then the queued events of that tick.
//!
//! ```
//! use archsim::clock::Clock;
//! use archsim::scheduler::{Occurrence, Scheduler};
//!
//! let mut sched: Scheduler<&'static str> = Scheduler::new();
//! sched.register_clock(Clock::new("core", 1).unwrap()).unwrap();
//! sched.finalize().unwrap();
//!
//! sched.schedule(5, "late").unwrap();
//! sched.schedule(2, "early").unwrap();
//!
//! let mut seen = Vec::new();
//! sched
//!     .run(None, |_, occ| {
//!         if let Occurrence::Event { payload, .. } = occ {
//!             seen.push(payload);
//!         }
//!         Ok(())
//!     })
//!     .unwrap();
//! assert_eq!(seen, vec!["early", "late"]);
//! ```

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::clock::Clock;
use crate::error::{KernelError, KernelResult};
use crate::types::{ClockId, EventSeq, Tick};

struct Entry<T> {
    due: Tick,
    seq: EventSeq,
    payload: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

struct ClockSlot {
    clock: Clock,
    next_edge: Tick,
}

/// Something the scheduler delivers during a run.
#[derive(Debug, PartialEq)]
pub enum Occurrence<T> {
    /// A clock edge. `cycle` is the clock's local cycle count after the edge.
    Edge { clock: ClockId, tick: Tick, cycle: u64 },
    /// A queued event.
    Event { tick: Tick, seq: EventSeq, payload: T },
}

/// Why a run stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The tick budget was used up.
    Budget,
    /// The queue was empty.
    Drained,
}

/// The bounds of one run.
#[derive(Clone, Copy, Debug)]
pub struct RunBudget {
    start: Tick,
    limit: Option<Tick>,
}

impl RunBudget {
    pub fn start(&self) -> Tick {
        self.start
    }

    /// Absolute tick at which a bounded run ends.
    pub fn limit(&self) -> Option<Tick> {
        self.limit
    }
}

/// Outcome of a run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub start_tick: Tick,
    pub final_tick: Tick,
    pub events_executed: u64,
    pub edges_delivered: u64,
    pub stopped_on_budget: bool,
}

impl RunSummary {
    pub fn stop_reason(&self) -> StopReason {
        if self.stopped_on_budget {
            StopReason::Budget
        } else {
            StopReason::Drained
        }
    }
}

/// Counters kept by the scheduler across runs.
#[derive(Clone, Debug, Default)]
pub struct SchedulerStats {
    pub events_scheduled: u64,
    pub events_executed: u64,
    pub edges_delivered: u64,
    pub peak_queue_depth: usize,
}

/// A deterministic discrete-event scheduler over payloads of type `T`.
pub struct Scheduler<T> {
    queue: BinaryHeap<Reverse<Entry<T>>>,
    current_tick: Tick,
    next_seq: EventSeq,
    clocks: Vec<ClockSlot>,
    finalized: bool,
    stats: SchedulerStats,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            current_tick: 0,
            next_seq: 0,
            clocks: Vec::new(),
            finalized: false,
            stats: SchedulerStats::default(),
        }
    }

    /// Registers a clock. Only allowed before [`Scheduler::finalize`].
    pub fn register_clock(&mut self, clock: Clock) -> KernelResult<ClockId> {
        if self.finalized {
            return Err(KernelError::SchedulerState(format!(
                "cannot register clock '{}' after finalize",
                clock.name()
            )));
        }
        if self.clock_by_name(clock.name()).is_some() {
            return Err(KernelError::DuplicateName {
                parent: "scheduler".to_string(),
                name: clock.name().to_string(),
            });
        }
        let id = self.clocks.len() as ClockId;
        let next_edge = clock.next_edge_after(self.current_tick);
        tracing::debug!(clock = clock.name(), period = clock.period(), id, "clock registered");
        self.clocks.push(ClockSlot { clock, next_edge });
        Ok(id)
    }

    pub fn clock(&self, id: ClockId) -> Option<&Clock> {
        self.clocks.get(id as usize).map(|s| &s.clock)
    }

    pub fn clock_by_name(&self, name: &str) -> Option<ClockId> {
        self.clocks
            .iter()
            .position(|s| s.clock.name() == name)
            .map(|i| i as ClockId)
    }

    pub fn clock_count(&self) -> usize {
        self.clocks.len()
    }

    /// Iterates over registered clocks in registration order.
    pub fn clocks(&self) -> impl Iterator<Item = (ClockId, &Clock)> {
        self.clocks
            .iter()
            .enumerate()
            .map(|(i, s)| (i as ClockId, &s.clock))
    }

    /// Seals the clock registry. Must be called exactly once, before the first run.
    pub fn finalize(&mut self) -> KernelResult<()> {
        if self.finalized {
            return Err(KernelError::SchedulerState(
                "scheduler is already finalized".to_string(),
            ));
        }
        if self.clocks.is_empty() {
            return Err(KernelError::SchedulerState(
                "cannot finalize a scheduler with no registered clocks".to_string(),
            ));
        }
        self.finalized = true;
        tracing::debug!(clocks = self.clocks.len(), "scheduler finalized");
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn current_tick(&self) -> Tick {
        self.current_tick
    }

    /// Inserts an event due at `due`. Back-dating is rejected.
    pub fn schedule(&mut self, due: Tick, payload: T) -> KernelResult<EventSeq> {
        if due < self.current_tick {
            return Err(KernelError::ScheduleInPast {
                due,
                now: self.current_tick,
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse(Entry { due, seq, payload }));
        self.stats.events_scheduled += 1;
        self.stats.peak_queue_depth = self.stats.peak_queue_depth.max(self.queue.len());
        Ok(seq)
    }

    /// Inserts an event `delay` ticks after the current tick.
    pub fn schedule_in(&mut self, delay: Tick, payload: T) -> KernelResult<EventSeq> {
        self.schedule(self.current_tick.saturating_add(delay), payload)
    }

    /// Number of queued events.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Due tick of the earliest queued event.
    pub fn peek_due(&self) -> Option<Tick> {
        self.queue.peek().map(|Reverse(e)| e.due)
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Starts a run of at most `max_ticks` ticks (unbounded when `None`).
    pub fn begin_run(&self, max_ticks: Option<Tick>) -> KernelResult<RunBudget> {
        if !self.finalized {
            return Err(KernelError::SchedulerState(
                "scheduler must be finalized before running".to_string(),
            ));
        }
        Ok(RunBudget {
            start: self.current_tick,
            limit: max_ticks.map(|n| self.current_tick.saturating_add(n)),
        })
    }

    fn earliest_edge(&self) -> Option<(usize, Tick)> {
        let mut best: Option<(usize, Tick)> = None;
        for (i, slot) in self.clocks.iter().enumerate() {
            match best {
                Some((_, t)) if t <= slot.next_edge => {}
                _ => best = Some((i, slot.next_edge)),
            }
        }
        best
    }

    /// Pops the next occurrence within `budget`, advancing the current tick.
    ///
    /// Returns `None` when the run is over: the budget is used up, or (for an
    /// unbounded run) the queue is empty.
    pub fn next(&mut self, budget: &RunBudget) -> Option<Occurrence<T>> {
        let event_due = self.peek_due();
        let edge = self.earliest_edge();

        let horizon = match budget.limit {
            Some(limit) => limit,
            // Idle clocks never keep an unbounded run alive.
            None => event_due?,
        };

        let take_edge = match (edge, event_due) {
            (Some((_, e)), Some(d)) => e <= d && e <= horizon,
            (Some((_, e)), None) => e <= horizon,
            (None, _) => false,
        };

        if take_edge {
            let (idx, tick) = edge?;
            let slot = &mut self.clocks[idx];
            slot.clock.advance();
            slot.next_edge += slot.clock.period();
            self.current_tick = tick;
            self.stats.edges_delivered += 1;
            return Some(Occurrence::Edge {
                clock: idx as ClockId,
                tick,
                cycle: slot.clock.cycle(),
            });
        }

        match event_due {
            Some(d) if d <= horizon => {
                let Reverse(entry) = self.queue.pop()?;
                self.current_tick = entry.due;
                self.stats.events_executed += 1;
                Some(Occurrence::Event {
                    tick: entry.due,
                    seq: entry.seq,
                    payload: entry.payload,
                })
            }
            _ => None,
        }
    }

    /// Closes a run. A bounded run always ends exactly at its limit.
    pub fn end_run(&mut self, budget: &RunBudget) -> StopReason {
        match budget.limit {
            Some(limit) => {
                if self.current_tick < limit {
                    self.current_tick = limit;
                }
                StopReason::Budget
            }
            None => StopReason::Drained,
        }
    }

    /// Runs to completion, handing every occurrence to `handler`.
    ///
    /// The handler receives the scheduler so it can insert follow-up events;
    /// they are ordered by the same `(tick, sequence)` rule.
    pub fn run<F>(&mut self, max_ticks: Option<Tick>, mut handler: F) -> KernelResult<RunSummary>
    where
        F: FnMut(&mut Self, Occurrence<T>) -> KernelResult<()>,
    {
        let budget = self.begin_run(max_ticks)?;
        let mut summary = RunSummary {
            start_tick: budget.start(),
            ..RunSummary::default()
        };
        while let Some(occ) = self.next(&budget) {
            match occ {
                Occurrence::Edge { .. } => summary.edges_delivered += 1,
                Occurrence::Event { .. } => summary.events_executed += 1,
            }
            handler(self, occ)?;
        }
        summary.stopped_on_budget = self.end_run(&budget) == StopReason::Budget;
        summary.final_tick = self.current_tick;
        Ok(summary)
    }

    /// Drops every pending event. Used at teardown.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(periods: &[Tick]) -> Scheduler<u32> {
        let mut s = Scheduler::new();
        for (i, p) in periods.iter().enumerate() {
            s.register_clock(Clock::new(format!("clk{}", i), *p).unwrap())
                .unwrap();
        }
        s.finalize().unwrap();
        s
    }

    fn drain_events(s: &mut Scheduler<u32>, max: Option<Tick>) -> Vec<(Tick, u32)> {
        let mut out = Vec::new();
        s.run(max, |_, occ| {
            if let Occurrence::Event { tick, payload, .. } = occ {
                out.push((tick, payload));
            }
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn test_tick_order_beats_insertion_order() {
        let mut s = ready(&[1]);
        s.schedule(30, 3).unwrap();
        s.schedule(10, 1).unwrap();
        s.schedule(20, 2).unwrap();
        assert_eq!(drain_events(&mut s, None), vec![(10, 1), (20, 2), (30, 3)]);
    }

    #[test]
    fn test_same_tick_is_fifo() {
        let mut s = ready(&[1]);
        for v in 0..10 {
            s.schedule(5, v).unwrap();
        }
        let order: Vec<u32> = drain_events(&mut s, None).into_iter().map(|(_, v)| v).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_no_back_dating() {
        let mut s = ready(&[1]);
        s.schedule(10, 0).unwrap();
        drain_events(&mut s, None);
        assert_eq!(s.current_tick(), 10);
        assert_eq!(
            s.schedule(9, 1),
            Err(KernelError::ScheduleInPast { due: 9, now: 10 })
        );
        assert!(s.schedule(10, 1).is_ok());
    }

    #[test]
    fn test_finalize_rules() {
        let mut s: Scheduler<u32> = Scheduler::new();
        assert!(s.finalize().is_err(), "no clocks registered");
        s.register_clock(Clock::new("c", 1).unwrap()).unwrap();
        s.finalize().unwrap();
        assert!(s.finalize().is_err(), "second finalize");
        assert!(s.register_clock(Clock::new("d", 1).unwrap()).is_err());
    }

    #[test]
    fn test_run_requires_finalize() {
        let mut s: Scheduler<u32> = Scheduler::new();
        assert!(s.run(None, |_, _| Ok(())).is_err());
    }

    #[test]
    fn test_handler_can_schedule_same_tick() {
        let mut s = ready(&[1]);
        s.schedule(1, 0).unwrap();
        s.schedule(1, 1).unwrap();
        let mut seen = Vec::new();
        s.run(None, |sched, occ| {
            if let Occurrence::Event { payload, .. } = occ {
                seen.push(payload);
                if payload == 0 {
                    // Lands behind the already queued event 1.
                    sched.schedule_in(0, 100)?;
                }
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![0, 1, 100]);
    }

    #[test]
    fn test_bounded_run_delivers_edges() {
        let mut s = ready(&[1, 2, 3]);
        let summary = s.run(Some(100), |_, _| Ok(())).unwrap();
        assert_eq!(summary.final_tick, 100);
        assert_eq!(summary.stop_reason(), StopReason::Budget);
        assert_eq!(s.clock(0).unwrap().cycle(), 100);
        assert_eq!(s.clock(1).unwrap().cycle(), 50);
        assert_eq!(s.clock(2).unwrap().cycle(), 33);
        assert_eq!(summary.edges_delivered, 183);
    }

    #[test]
    fn test_unbounded_run_stops_when_queue_drains() {
        let mut s = ready(&[2]);
        s.schedule(7, 1).unwrap();
        let summary = s.run(None, |_, _| Ok(())).unwrap();
        assert_eq!(summary.stop_reason(), StopReason::Drained);
        assert_eq!(summary.final_tick, 7);
        assert_eq!(summary.events_executed, 1);
        // Edges at 2, 4 and 6 precede the event.
        assert_eq!(s.clock(0).unwrap().cycle(), 3);
    }

    #[test]
    fn test_edges_precede_events_on_same_tick() {
        let mut s = ready(&[5]);
        s.schedule(5, 9).unwrap();
        let mut kinds = Vec::new();
        s.run(Some(5), |_, occ| {
            kinds.push(match occ {
                Occurrence::Edge { .. } => "edge",
                Occurrence::Event { .. } => "event",
            });
            Ok(())
        })
        .unwrap();
        assert_eq!(kinds, vec!["edge", "event"]);
    }

    #[test]
    fn test_events_beyond_budget_stay_queued() {
        let mut s = ready(&[1]);
        s.schedule(50, 1).unwrap();
        s.schedule(150, 2).unwrap();
        assert_eq!(drain_events(&mut s, Some(100)), vec![(50, 1)]);
        assert_eq!(s.pending(), 1);
        assert_eq!(drain_events(&mut s, Some(100)), vec![(150, 2)]);
        assert_eq!(s.current_tick(), 200);
    }

    #[test]
    fn test_clear_and_stats() {
        let mut s = ready(&[1]);
        s.schedule(1, 1).unwrap();
        s.schedule(2, 2).unwrap();
        assert_eq!(s.stats().peak_queue_depth, 2);
        assert_eq!(s.clear(), 2);
        assert!(s.is_empty());
    }
}
