//! Scheduler ordering and multi-clock timing.
//!
//! These tests verify:
//! - Events run in tick order, and in insertion order within a tick
//! - Clocks of different periods share one timeline
//! - Identical setups produce identical trace output

use std::sync::Arc;

use archsim::devices::{CycleCounter, SimpleMemory, TrafficGenerator};
use archsim::{Clock, EventPayload, KernelError, Simulation, TapChannel, TapSink, TapTarget, Tick};
use parking_lot::Mutex;

// ============================================================================
// Helpers
// ============================================================================

fn clocked_root() -> Simulation {
    let mut sim = Simulation::new("top").unwrap();
    let root = sim.root();
    sim.set_clock(root, Clock::new("sys", 1).unwrap()).unwrap();
    sim
}

fn finalize(sim: &mut Simulation) {
    sim.enter_configuring().unwrap();
    sim.enter_finalized().unwrap();
    sim.scheduler_mut().finalize().unwrap();
}

fn record(log: &Arc<Mutex<Vec<(Tick, &'static str)>>>, label: &'static str) -> EventPayload {
    let log = log.clone();
    EventPayload::action(move |sim| {
        log.lock().push((sim.current_tick(), label));
        Ok(())
    })
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_tick_order_then_insertion_order() {
    let mut sim = clocked_root();
    finalize(&mut sim);
    let log = Arc::new(Mutex::new(Vec::new()));

    sim.schedule(20, record(&log, "late")).unwrap();
    sim.schedule(5, record(&log, "early-a")).unwrap();
    sim.schedule(5, record(&log, "early-b")).unwrap();
    sim.schedule(10, record(&log, "middle")).unwrap();
    sim.schedule(5, record(&log, "early-c")).unwrap();

    sim.run(None).unwrap();
    assert_eq!(
        *log.lock(),
        vec![(5, "early-a"), (5, "early-b"), (5, "early-c"), (10, "middle"), (20, "late")]
    );
}

#[test]
fn test_action_can_schedule_same_tick() {
    let mut sim = clocked_root();
    finalize(&mut sim);
    let log = Arc::new(Mutex::new(Vec::new()));

    let inner = record(&log, "follow-up");
    let outer_log = log.clone();
    sim.schedule(
        3,
        EventPayload::action(move |sim| {
            outer_log.lock().push((sim.current_tick(), "first"));
            sim.schedule_in(0, inner)
        }),
    )
    .unwrap();
    sim.schedule(3, record(&log, "second")).unwrap();

    sim.run(None).unwrap();
    assert_eq!(*log.lock(), vec![(3, "first"), (3, "second"), (3, "follow-up")]);
}

#[test]
fn test_scheduling_in_the_past_fails() {
    let mut sim = clocked_root();
    finalize(&mut sim);
    sim.run(Some(10)).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    assert!(matches!(
        sim.schedule(9, record(&log, "stale")),
        Err(KernelError::ScheduleInPast { due: 9, now: 10 })
    ));
}

#[test]
fn test_action_error_aborts_run() {
    let mut sim = clocked_root();
    finalize(&mut sim);
    sim.schedule(
        4,
        EventPayload::action(|_| Err(KernelError::device("top", "boom"))),
    )
    .unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    sim.schedule(6, record(&log, "after")).unwrap();

    assert!(matches!(sim.run(None), Err(KernelError::Device { .. })));
    assert_eq!(sim.current_tick(), 4);
    assert!(log.lock().is_empty());
}

// ============================================================================
// Clocks
// ============================================================================

#[test]
fn test_two_clock_domains_over_100_ticks() {
    let mut sim = Simulation::new("top").unwrap();
    let root = sim.root();
    sim.set_clock(root, Clock::new("fast", 1).unwrap()).unwrap();
    let fast = sim.add_child(root, "fast").unwrap();
    let slow = sim.add_child(root, "slow").unwrap();
    sim.set_clock(slow, Clock::new("slow", 4).unwrap()).unwrap();
    let c_fast = sim.add_child(fast, "counter").unwrap();
    let c_slow = sim.add_child(slow, "counter").unwrap();
    sim.attach_device(c_fast, Box::new(CycleCounter::new())).unwrap();
    sim.attach_device(c_slow, Box::new(CycleCounter::new())).unwrap();
    finalize(&mut sim);

    let summary = sim.run(Some(100)).unwrap();
    assert_eq!(summary.final_tick, 100);
    assert!(summary.stopped_on_budget);

    // fast runs at 4x the frequency of slow
    let stats = sim.export_stats();
    assert_eq!(stats["devices"]["top.fast.counter"]["cycles"], 100);
    assert_eq!(stats["devices"]["top.slow.counter"]["cycles"], 25);
    assert_eq!(sim.node_cycle(c_fast), Some(100));
    assert_eq!(sim.node_cycle(c_slow), Some(25));

    let id = sim.scheduler().clock_by_name("slow").unwrap();
    assert_eq!(sim.scheduler().clock(id).unwrap().frequency_ratio(), 0.25);
}

#[test]
fn test_runs_resume_where_they_stopped() {
    let mut sim = clocked_root();
    let root = sim.root();
    let counter = sim.add_child(root, "counter").unwrap();
    sim.attach_device(counter, Box::new(CycleCounter::new())).unwrap();
    finalize(&mut sim);

    for _ in 0..4 {
        sim.run(Some(25)).unwrap();
    }
    assert_eq!(sim.current_tick(), 100);
    assert_eq!(sim.node_cycle(counter), Some(100));
    assert_eq!(sim.stats().run.runs, 4);
}

#[test]
fn test_idle_clocks_do_not_keep_unbounded_run_alive() {
    let mut sim = clocked_root();
    finalize(&mut sim);
    let summary = sim.run(None).unwrap();
    assert_eq!(summary.final_tick, 0);
    assert_eq!(summary.edges_delivered, 0);
}

// ============================================================================
// Determinism
// ============================================================================

fn traced_memory_system(seed: u64) -> (Simulation, archsim::tap::SharedBuffer) {
    let mut sim = clocked_root();
    let root = sim.root();
    let gen = sim.add_child(root, "gen").unwrap();
    let mem = sim.add_child(root, "mem").unwrap();
    sim.attach_device(gen, Box::new(TrafficGenerator::new())).unwrap();
    sim.attach_device(mem, Box::new(SimpleMemory::new(3))).unwrap();
    sim.set_param(gen, "num_iters", 64u64).unwrap();
    sim.set_param(gen, "req_gen_prob", 50u64).unwrap();
    sim.set_param(gen, "seed", seed).unwrap();

    sim.enter_configuring().unwrap();
    sim.bind_paths("top.gen.ports.req_out", "top.mem.ports.req_in").unwrap();
    sim.bind_paths("top.mem.ports.req_credit_out", "top.gen.ports.req_credit_in").unwrap();
    sim.bind_paths("top.mem.ports.resp_out", "top.gen.ports.resp_in").unwrap();
    let (sink, buf) = TapSink::memory();
    sim.attach_tap(TapTarget::Node(root), TapChannel::Trace, sink).unwrap();
    sim.enter_finalized().unwrap();
    sim.scheduler_mut().finalize().unwrap();
    (sim, buf)
}

#[test]
fn test_identical_runs_produce_identical_traces() {
    let (mut first, first_buf) = traced_memory_system(42);
    let (mut second, second_buf) = traced_memory_system(42);
    first.run(None).unwrap();
    second.run(None).unwrap();

    let a = first_buf.lock().clone();
    let b = second_buf.lock().clone();
    assert!(!a.is_empty());
    assert_eq!(a, b);
    assert_eq!(first.current_tick(), second.current_tick());

    let (mut other, other_buf) = traced_memory_system(7);
    other.run(None).unwrap();
    assert_ne!(*other_buf.lock(), a);
}
