//! End-to-end lifecycle of a component tree.
//!
//! These tests verify:
//! - Phase transitions apply to the whole tree, top-down
//! - Finalization validates everything before changing anything
//! - Device hooks run once, in tree order
//! - Teardown is idempotent and flushes taps

use std::sync::Arc;

use archsim::devices::{CycleCounter, TrafficGenerator};
use archsim::port::PortSpec;
use archsim::{
    Clock, Device, DeviceContext, KernelError, KernelResult, Phase, Simulation, TapChannel, TapSink, TapTarget,
};
use parking_lot::Mutex;

// ============================================================================
// Test Devices
// ============================================================================

type Journal = Arc<Mutex<Vec<String>>>;

/// Records every hook invocation into a shared journal.
struct Recorder {
    journal: Journal,
}

impl Device for Recorder {
    fn type_name(&self) -> &str {
        "Recorder"
    }

    fn startup(&mut self, ctx: &mut DeviceContext<'_>) -> KernelResult<()> {
        self.journal.lock().push(format!("startup {} @{}", ctx.path(), ctx.now()));
        Ok(())
    }

    fn teardown(&mut self) {
        self.journal.lock().push("teardown".to_string());
    }
}

fn recorder(journal: &Journal) -> Box<dyn Device> {
    Box::new(Recorder {
        journal: journal.clone(),
    })
}

/// top
/// ├── cpu
/// │   └── core0 (Recorder)
/// └── uncore (Recorder)
fn hierarchy(journal: &Journal) -> Simulation {
    let mut sim = Simulation::new("top").unwrap();
    let root = sim.root();
    sim.set_clock(root, Clock::new("sys", 2).unwrap()).unwrap();
    let cpu = sim.add_child(root, "cpu").unwrap();
    let core = sim.add_child(cpu, "core0").unwrap();
    let uncore = sim.add_child(root, "uncore").unwrap();
    sim.attach_device(core, recorder(journal)).unwrap();
    sim.attach_device(uncore, recorder(journal)).unwrap();
    sim
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_phases_apply_to_whole_tree() {
    let journal = Journal::default();
    let mut sim = hierarchy(&journal);
    let core = sim.find("top.cpu.core0").unwrap();

    assert_eq!(sim.node(core).unwrap().phase(), Phase::Building);
    sim.enter_configuring().unwrap();
    assert_eq!(sim.node(core).unwrap().phase(), Phase::Configuring);
    sim.enter_finalized().unwrap();
    assert!(sim.tree().iter().all(|n| n.phase() == Phase::Finalized));

    assert!(matches!(
        sim.add_child(core, "late"),
        Err(KernelError::WrongPhase { .. })
    ));
    assert!(matches!(
        sim.enter_configuring(),
        Err(KernelError::StateTransition { from: Phase::Finalized, to: Phase::Configuring, .. })
    ));
}

#[test]
fn test_device_hooks_run_once_in_tree_order() {
    let journal = Journal::default();
    let mut sim = hierarchy(&journal);
    sim.enter_configuring().unwrap();
    sim.enter_finalized().unwrap();
    sim.scheduler_mut().finalize().unwrap();

    sim.run(Some(10)).unwrap();
    sim.run(Some(10)).unwrap();
    sim.enter_teardown().unwrap();
    sim.enter_teardown().unwrap();

    assert_eq!(
        *journal.lock(),
        vec![
            "startup top.cpu.core0 @0",
            "startup top.uncore @0",
            "teardown",
            "teardown",
        ]
    );
}

#[test]
fn test_failed_finalize_changes_nothing() {
    let mut sim = Simulation::new("top").unwrap();
    let root = sim.root();
    sim.set_clock(root, Clock::new("sys", 1).unwrap()).unwrap();
    let gen = sim.add_child(root, "gen").unwrap();
    sim.attach_device(gen, Box::new(TrafficGenerator::new())).unwrap();
    sim.set_param(gen, "line_size", 48u64).unwrap();
    sim.enter_configuring().unwrap();

    // Unbound ports are reported first, naming the first port in tree order.
    let err = sim.enter_finalized().unwrap_err();
    assert!(matches!(err, KernelError::Binding { ref port, .. } if port == "top.gen.ports.req_out"));

    let loopback = sim.add_child(root, "mem").unwrap();
    let req_in = sim.add_port(loopback, PortSpec::data_in("req_in", "MemReq")).unwrap();
    let credit_out = sim.add_port(loopback, PortSpec::credit_out("credit_out")).unwrap();
    let resp_out = sim.add_port(loopback, PortSpec::data_out("resp_out", "MemResp")).unwrap();
    let req_out = sim.port_of(gen, "req_out").unwrap();
    let credit_in = sim.port_of(gen, "req_credit_in").unwrap();
    let resp_in = sim.port_of(gen, "resp_in").unwrap();
    sim.bind(req_out, req_in).unwrap();
    sim.bind(credit_out, credit_in).unwrap();
    sim.bind(resp_out, resp_in).unwrap();

    // Now the device rejects its parameters.
    let err = sim.enter_finalized().unwrap_err();
    assert!(matches!(err, KernelError::Device { ref node, .. } if node == "top.gen"));
    assert_eq!(sim.phase(), Phase::Configuring);
    assert!(!sim.params(gen).unwrap().is_locked());
    assert_eq!(sim.scheduler().clock_count(), 0);
    assert!(sim.scheduler().is_empty());

    sim.set_param(gen, "line_size", 64u64).unwrap();
    sim.enter_finalized().unwrap();
    assert!(sim.params(gen).unwrap().is_locked());
}

#[test]
fn test_binding_rules() {
    let mut sim = Simulation::new("top").unwrap();
    let root = sim.root();
    sim.set_clock(root, Clock::new("sys", 1).unwrap()).unwrap();
    let a = sim.add_child(root, "a").unwrap();
    let b = sim.add_child(root, "b").unwrap();
    let out = sim.add_port(a, PortSpec::data_out("out", "u32")).unwrap();
    let other = sim.add_port(a, PortSpec::data_out("other", "u32")).unwrap();
    let inp = sim.add_port(b, PortSpec::data_in("in", "u32")).unwrap();
    let wide = sim.add_port(b, PortSpec::data_in("wide", "u64")).unwrap();
    sim.enter_configuring().unwrap();

    assert!(matches!(sim.bind(inp, out), Err(KernelError::Binding { .. })));
    assert!(matches!(sim.bind(other, wide), Err(KernelError::Binding { .. })));
    sim.bind(out, inp).unwrap();
    assert!(matches!(sim.bind(other, inp), Err(KernelError::Binding { .. })));
    assert!(sim.is_bound(out) && sim.is_bound(inp));
    assert!(!sim.is_bound(other));
}

#[test]
fn test_teardown_flushes_file_taps() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("counter.log");

    let mut sim = Simulation::new("top").unwrap();
    let root = sim.root();
    sim.set_clock(root, Clock::new("sys", 1).unwrap()).unwrap();
    let counter = sim.add_child(root, "counter").unwrap();
    sim.attach_device(counter, Box::new(CycleCounter::new())).unwrap();
    sim.set_param(counter, "report_every", 10u64).unwrap();
    sim.attach_tap(TapTarget::Node(root), TapChannel::Info, TapSink::file(&log))
        .unwrap();
    let (debug_sink, debug_buf) = TapSink::memory();
    sim.attach_tap(TapTarget::Node(counter), TapChannel::Debug, debug_sink)
        .unwrap();

    sim.enter_configuring().unwrap();
    sim.enter_finalized().unwrap();
    sim.scheduler_mut().finalize().unwrap();
    sim.run(Some(50)).unwrap();
    sim.enter_teardown().unwrap();
    assert_eq!(sim.tap_count(), 0);

    let contents = std::fs::read_to_string(&log).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[0], "{0000000010 top.counter info} cycle 10");
    assert_eq!(lines[4], "{0000000050 top.counter info} cycle 50");
    assert!(debug_buf.lock().is_empty());

    assert!(sim
        .attach_tap(TapTarget::Node(root), TapChannel::Info, TapSink::stdout())
        .is_err());
}

#[test]
fn test_detached_subtree_is_gone() {
    let journal = Journal::default();
    let mut sim = hierarchy(&journal);
    let cpu = sim.find("top.cpu").unwrap();
    assert_eq!(sim.detach(cpu).unwrap(), 2);
    assert!(matches!(sim.find("top.cpu.core0"), Err(KernelError::UnknownNode(_))));

    sim.enter_configuring().unwrap();
    sim.enter_finalized().unwrap();
    sim.scheduler_mut().finalize().unwrap();
    sim.run(None).unwrap();
    assert_eq!(*journal.lock(), vec!["startup top.uncore @0"]);
}

/// Accepts writes but never flushes.
struct FullDisk;

impl std::io::Write for FullDisk {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
    }
}

#[test]
fn test_teardown_releases_once_when_tap_flush_fails() {
    let journal = Journal::default();
    let mut sim = hierarchy(&journal);
    let root = sim.root();
    sim.attach_tap(TapTarget::Node(root), TapChannel::Info, TapSink::Writer(Box::new(FullDisk)))
        .unwrap();
    sim.enter_configuring().unwrap();
    sim.enter_finalized().unwrap();
    sim.scheduler_mut().finalize().unwrap();
    sim.run(Some(4)).unwrap();

    let err = sim.enter_teardown().unwrap_err();
    assert!(matches!(err, KernelError::Tap(ref msg) if msg.contains("disk full")));
    assert_eq!(sim.phase(), Phase::Teardown);
    assert_eq!(sim.tap_count(), 0);

    sim.enter_teardown().unwrap();
    let teardowns = journal.lock().iter().filter(|e| *e == "teardown").count();
    assert_eq!(teardowns, 2);
}
