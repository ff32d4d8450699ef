//! The `Device` trait and the context handed to devices.
//!
//! A device is the behaviour attached to a tree node: a CPU model, a cache,
//! a memory controller, a traffic generator. It declares its ports and
//! parameters when attached, reads its locked parameters at finalization and
//! then reacts to what the scheduler delivers:
//!
//! - **Startup**: once, at the tick the tree was finalized
//! - **Clock cycles**: every edge of the node's effective clock, if the
//!   device asks for them through [`Device::wants_cycles`]
//! - **Data**: a value arriving on one of its `DataIn` ports
//! - **Credits**: credits arriving on one of its `CreditIn` ports
//! - **Wakeups**: timers the device set for itself

use crate::engine::Simulation;
use crate::error::KernelResult;
use crate::event::EventPayload;
use crate::params::{ParamSpec, ParamValue, ParameterSet};
use crate::port::PortSpec;
use crate::statistics::{CounterHandle, HistogramHandle, StatisticSet};
use crate::tap::TapChannel;
use crate::types::{NodeId, Tick};

/// Behaviour attached to a tree node.
///
/// All callbacks have empty default implementations, so a device only
/// implements what it reacts to.
pub trait Device: Send {
    /// Registry name of this device type.
    fn type_name(&self) -> &str;

    /// Ports created on the node when the device is attached.
    fn ports(&self) -> Vec<PortSpec> {
        Vec::new()
    }

    /// Parameters declared on the node when the device is attached.
    fn params(&self) -> Vec<ParamSpec> {
        Vec::new()
    }

    /// Called during finalization with the node's locked parameters.
    fn finalize(&mut self, _params: &ParameterSet) -> KernelResult<()> {
        Ok(())
    }

    /// Called once, at the first run after finalization.
    fn startup(&mut self, _ctx: &mut DeviceContext<'_>) -> KernelResult<()> {
        Ok(())
    }

    /// Whether `on_cycle` should be called on every clock edge.
    fn wants_cycles(&self) -> bool {
        false
    }

    /// Called on each edge of the node's clock.
    ///
    /// # Arguments
    /// * `cycle` - The clock's cycle count after this edge
    fn on_cycle(&mut self, _ctx: &mut DeviceContext<'_>, _cycle: u64) -> KernelResult<()> {
        Ok(())
    }

    /// Called when data arrives on the `DataIn` port named `port`.
    fn on_data(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _port: &str,
        _data: serde_json::Value,
    ) -> KernelResult<()> {
        Ok(())
    }

    /// Called after credits arriving on `port` were added to the outputs it feeds.
    fn on_credit(&mut self, _ctx: &mut DeviceContext<'_>, _port: &str, _credits: u32) -> KernelResult<()> {
        Ok(())
    }

    /// Called when a timer set with [`DeviceContext::wake_after`] expires.
    fn on_wakeup(&mut self, _ctx: &mut DeviceContext<'_>, _tag: u64) -> KernelResult<()> {
        Ok(())
    }

    /// Called once at teardown.
    fn teardown(&mut self) {}

    /// Device-specific statistics.
    fn stats(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// A device's view of the simulation while one of its callbacks runs.
pub struct DeviceContext<'a> {
    sim: &'a mut Simulation,
    node: NodeId,
}

impl<'a> DeviceContext<'a> {
    pub(crate) fn new(sim: &'a mut Simulation, node: NodeId) -> Self {
        Self { sim, node }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn path(&self) -> String {
        self.sim.tree().path(self.node)
    }

    /// Current scheduler tick.
    pub fn now(&self) -> Tick {
        self.sim.current_tick()
    }

    /// Cycle count of the node's effective clock.
    pub fn cycle(&self) -> u64 {
        self.sim.node_cycle(self.node).unwrap_or(0)
    }

    /// Sends `data` on this node's output port `port`.
    pub fn send(&mut self, port: &str, data: serde_json::Value) -> KernelResult<()> {
        let id = self.sim.port_of(self.node, port)?;
        self.sim.send(id, data)
    }

    pub fn has_credit(&self, port: &str) -> bool {
        self.sim
            .port_of(self.node, port)
            .map(|id| self.sim.has_credit(id))
            .unwrap_or(false)
    }

    /// Credits currently available on a flow-controlled output.
    pub fn credits(&self, port: &str) -> Option<u32> {
        let id = self.sim.port_of(self.node, port).ok()?;
        self.sim.ports().get(id).ok()?.credits().map(|c| c.available)
    }

    /// Returns `credits` to the producer through the `CreditOut` port `port`.
    pub fn return_credit(&mut self, port: &str, credits: u32) -> KernelResult<()> {
        let id = self.sim.port_of(self.node, port)?;
        self.sim.return_credit(id, credits)
    }

    /// Reads one of this node's parameters.
    pub fn param(&self, name: &str) -> KernelResult<ParamValue> {
        self.sim.param(self.node, name)
    }

    /// This node's counters and histograms.
    pub fn statistics(&mut self) -> KernelResult<&mut StatisticSet> {
        self.sim.statistics_mut(self.node)
    }

    pub fn add_counter(&mut self, name: &str, description: &str) -> KernelResult<CounterHandle> {
        self.statistics()?.add_counter(name, description)
    }

    /// Registers a histogram over `[lower, upper]`.
    pub fn add_histogram(
        &mut self,
        name: &str,
        description: &str,
        lower: u64,
        upper: u64,
        values_per_bin: u64,
    ) -> KernelResult<HistogramHandle> {
        self.statistics()?
            .add_histogram(name, description, lower, upper, values_per_bin)
    }

    pub fn increment(&mut self, counter: CounterHandle, n: u64) -> KernelResult<()> {
        self.statistics()?.increment(counter, n);
        Ok(())
    }

    pub fn sample(&mut self, histogram: HistogramHandle, value: u64) -> KernelResult<()> {
        self.statistics()?.sample(histogram, value);
        Ok(())
    }

    /// Schedules a closure `delay` ticks from now.
    pub fn schedule<F>(&mut self, delay: Tick, f: F) -> KernelResult<()>
    where
        F: FnOnce(&mut Simulation) -> KernelResult<()> + Send + 'static,
    {
        self.sim.schedule_in(delay, EventPayload::action(f))
    }

    /// Calls this device's `on_wakeup` with `tag` after `delay` ticks.
    pub fn wake_after(&mut self, delay: Tick, tag: u64) -> KernelResult<()> {
        self.sim.schedule_in(
            delay,
            EventPayload::Wakeup {
                node: self.node,
                tag,
            },
        )
    }

    /// Writes a message on one of this node's tap channels.
    pub fn log(&mut self, channel: TapChannel, text: &str) -> KernelResult<()> {
        self.sim.log(self.node, channel, text)
    }

    pub fn info(&mut self, text: &str) -> KernelResult<()> {
        self.log(TapChannel::Info, text)
    }

    pub fn debug(&mut self, text: &str) -> KernelResult<()> {
        self.log(TapChannel::Debug, text)
    }
}
