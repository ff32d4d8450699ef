//! # archsim
//!
//! A deterministic discrete-event kernel for hardware-architecture simulation.
//!
//! ## Design Principles
//!
//! - **Component Tree**: A simulated system is a tree of named nodes. Each node
//!   owns typed parameters and ports and may carry a [`Device`] with behaviour.
//! - **Phased Lifecycle**: The whole tree moves through
//!   `Building → Configuring → Finalized → Running → Teardown`. Structure is
//!   mutable only while building or configuring; finalization validates every
//!   binding and locks every parameter.
//! - **One Timeline**: A single scheduler owns the tick counter. Clocks of
//!   different periods are views onto it, and events at equal ticks run in
//!   insertion order, so identical setups replay identically.
//! - **Credit Flow Control**: Links can carry credits; a producer may only send
//!   while it holds one and the consumer hands them back on a credit port.
//! - **Taps**: Named log channels (`info`, `debug`, `trace`) attach to any node
//!   or port and write to a file, a writer or an in-memory buffer.
//! - **Statistics**: Every node owns a set of named counters and histograms
//!   that devices update and [`SimulationStats`] exports.
//!
//! ## Quick Start
//!
//! ```rust
//! use archsim::{Clock, Simulation};
//! use archsim::devices::CycleCounter;
//!
//! let mut sim = Simulation::new("top").unwrap();
//! let root = sim.root();
//! sim.set_clock(root, Clock::new("core", 2).unwrap()).unwrap();
//! let counter = sim.add_child(root, "counter").unwrap();
//! sim.attach_device(counter, Box::new(CycleCounter::new())).unwrap();
//!
//! sim.enter_configuring().unwrap();
//! sim.enter_finalized().unwrap();
//! sim.scheduler_mut().finalize().unwrap();
//!
//! let summary = sim.run(Some(100)).unwrap();
//! assert_eq!(summary.final_tick, 100);
//!
//! let stats = sim.export_stats();
//! println!("Cycles: {}", stats["devices"]["top.counter"]["cycles"]);
//! sim.enter_teardown().unwrap();
//! ```
//!
//! ## Configuration-Driven Setup
//!
//! ```rust,ignore
//! use archsim::config::SimConfig;
//! use archsim::registry::create_default_registry;
//!
//! let config = SimConfig::from_yaml_file("system.yaml")?;
//! let mut sim = config.build(&create_default_registry())?;
//! sim.enter_finalized()?;
//! sim.scheduler_mut().finalize()?;
//! sim.run(config.simulation.max_ticks)?;
//! ```

pub mod types;
pub mod error;
pub mod params;
pub mod clock;
pub mod scheduler;
pub mod tree;
pub mod port;
pub mod event;
pub mod device;
pub mod tap;
pub mod engine;
pub mod stats;
pub mod statistics;
pub mod devices;
pub mod registry;
pub mod config;
pub mod process;
pub mod harness;

// Re-export commonly used types
pub use types::{ClockId, EventSeq, NodeId, PortId, TapId, Tick};
pub use error::{KernelError, KernelResult};
pub use params::{ParamSpec, ParamType, ParamValue, ParameterSet};
pub use clock::Clock;
pub use scheduler::{RunSummary, Scheduler, SchedulerStats, StopReason};
pub use tree::{Phase, Tree, TreeNode};
pub use port::{PortDirection, PortSpec};
pub use event::EventPayload;
pub use device::{Device, DeviceContext};
pub use tap::{TapChannel, TapSink, TapTarget};
pub use engine::Simulation;
pub use stats::{SimulationStats, Timer};
pub use statistics::{Counter, CounterHandle, Histogram, HistogramHandle, StatisticSet};
pub use registry::{create_default_registry, DeviceRegistry};
pub use config::{ConfigError, SimConfig, SimConfigBuilder};
pub use process::ProcessDescriptor;

/// Initialize the tracing subscriber for logging.
///
/// `RUST_LOG` takes precedence over `level` when set.
///
/// # Example
///
/// ```rust,ignore
/// archsim::init_logging("info");
/// ```
pub fn init_logging(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
