//! Memory System Example
//!
//! A traffic generator issues random reads and writes to a simple memory
//! over a credit-controlled request link:
//!
//! ```text
//!   top (core clock, period 1)
//!   ├── gen   TrafficGenerator  req_out ──────────▶ req_in         ─┐
//!   │                           req_credit_in ◀─── req_credit_out  │ mem (SimpleMemory)
//!   │                           resp_in ◀───────── resp_out       ─┘
//!   └── mem
//! ```
//!
//! The example showcases:
//! - Building a tree from a YAML configuration
//! - Credit-based flow control between two devices
//! - Taps recording the traffic of one port
//! - Statistics export
//!
//! Run with: `cargo run --example memory_system`

use archsim::config::SimConfig;
use archsim::registry::create_default_registry;
use archsim::{TapChannel, TapSink, Timer};

const SYSTEM: &str = r#"
simulation:
  name: top
  log_level: info

clocks:
  - name: core
    period: 1

nodes:
  - path: top.gen
    device: TrafficGenerator
    params:
      num_iters: 500
      req_gen_prob: 80
      size: 4096
  - path: top.mem
    device: SimpleMemory
    attrs:
      latency: "10"
    params:
      queue_depth: 4
      size: 4096

bindings:
  - out: top.gen.ports.req_out
    in: top.mem.ports.req_in
  - out: top.mem.ports.req_credit_out
    in: top.gen.ports.req_credit_in
  - out: top.mem.ports.resp_out
    in: top.gen.ports.resp_in
"#;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = SimConfig::from_yaml(SYSTEM)?;
    archsim::init_logging(&config.simulation.log_level);

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║              Memory System Example                       ║");
    println!("╚══════════════════════════════════════════════════════════╝");
    println!();

    let mut sim = config.build(&create_default_registry())?;
    let (sink, trace) = TapSink::memory();
    sim.attach_tap_path("top.mem.ports.req_in", TapChannel::Trace, sink)?;
    sim.enter_finalized()?;
    sim.scheduler_mut().finalize()?;

    let timer = Timer::start();
    let summary = sim.run(config.simulation.max_ticks)?;
    let elapsed = timer.elapsed_ms();

    let mut stats = sim.stats();
    stats.compute_timing(elapsed);
    stats.write_summary(&mut std::io::stdout())?;

    println!();
    println!("First requests seen by the memory:");
    for line in trace.lock().iter().take(5) {
        println!("  {}", line);
    }
    println!();
    println!(
        "Finished at tick {} after {} events ({:?}).",
        summary.final_tick,
        summary.events_executed,
        summary.stop_reason()
    );

    sim.enter_teardown()?;
    Ok(())
}
