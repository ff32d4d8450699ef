//! The simulation context.
//!
//! [`Simulation`] owns everything a run needs: the component tree, the port
//! table, the scheduler and the tap registry. It drives the lifecycle of the
//! whole tree (`Building → Configuring → Finalized → Running → Teardown`),
//! carries port traffic as scheduler events, and dispatches clock edges and
//! arrivals to the devices attached to tree nodes.
//!
//! # Example
//!
//! ```
//! use archsim::{Clock, Simulation};
//! use archsim::port::PortSpec;
//!
//! let mut sim = Simulation::new("top").unwrap();
//! let root = sim.root();
//! sim.set_clock(root, Clock::new("sys", 1).unwrap()).unwrap();
//! let a = sim.add_child(root, "a").unwrap();
//! let b = sim.add_child(root, "b").unwrap();
//! let out = sim.add_port(a, PortSpec::data_out("out", "u32").with_latency(2)).unwrap();
//! let inp = sim.add_port(b, PortSpec::data_in("in", "u32")).unwrap();
//!
//! sim.enter_configuring().unwrap();
//! sim.bind(out, inp).unwrap();
//! sim.enter_finalized().unwrap();
//! sim.scheduler_mut().finalize().unwrap();
//!
//! sim.send(out, serde_json::json!(42)).unwrap();
//! sim.run(None).unwrap();
//! assert_eq!(sim.take_received(inp).unwrap(), vec![(2, serde_json::json!(42))]);
//! sim.enter_teardown().unwrap();
//! ```

use std::collections::{BTreeMap, HashSet};

use crate::clock::Clock;
use crate::device::{Device, DeviceContext};
use crate::error::{KernelError, KernelResult};
use crate::event::{Activation, EventPayload, Transfer};
use crate::params::{ParamSpec, ParamValue, ParameterSet};
use crate::port::{PortDirection, PortSpec, PortTable};
use crate::scheduler::{Occurrence, RunSummary, Scheduler, StopReason};
use crate::statistics::StatisticSet;
use crate::stats::{ClockStats, LinkStats, RunStats, SimulationMetadata, SimulationStats};
use crate::tap::{TapChannel, TapMessage, TapRegistry, TapSink, TapTarget};
use crate::tree::{Phase, Tree, TreeNode};
use crate::types::{ClockId, EventSeq, NodeId, PortId, TapId, Tick};

/// A parameter value to apply when the tree enters Configuring.
#[derive(Clone, Debug, PartialEq)]
struct ParamOverride {
    node: String,
    name: String,
    value: ParamValue,
}

/// The simulation context.
pub struct Simulation {
    tree: Tree,
    root: NodeId,
    ports: PortTable,
    scheduler: Scheduler<EventPayload>,
    taps: TapRegistry,
    overrides: Vec<ParamOverride>,
    /// Devices that receive clock edges, per clock, in tree order
    cycle_subscribers: BTreeMap<ClockId, Vec<NodeId>>,
    runs: u64,
}

impl Simulation {
    /// Creates a simulation whose tree has a single root node named `root`.
    pub fn new(root: impl Into<String>) -> KernelResult<Self> {
        let mut tree = Tree::new();
        let root = tree.create_root(root)?;
        Ok(Self {
            tree,
            root,
            ports: PortTable::new(),
            scheduler: Scheduler::new(),
            taps: TapRegistry::new(),
            overrides: Vec::new(),
            cycle_subscribers: BTreeMap::new(),
            runs: 0,
        })
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn ports(&self) -> &PortTable {
        &self.ports
    }

    pub fn scheduler(&self) -> &Scheduler<EventPayload> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler<EventPayload> {
        &mut self.scheduler
    }

    /// Phase of the root, which is the phase of the whole tree.
    pub fn phase(&self) -> Phase {
        self.tree.get(self.root).map(|n| n.phase()).unwrap_or(Phase::Teardown)
    }

    pub fn current_tick(&self) -> Tick {
        self.scheduler.current_tick()
    }

    pub fn node(&self, id: NodeId) -> KernelResult<&TreeNode> {
        self.tree.get(id)
    }

    /// Looks up a node by dotted path, e.g. `top.cpu0`.
    pub fn find(&self, path: &str) -> KernelResult<NodeId> {
        self.tree
            .find(path)
            .ok_or_else(|| KernelError::UnknownNode(path.to_string()))
    }

    /// Looks up the direct child `name` of `parent`.
    pub fn child(&self, parent: NodeId, name: &str) -> KernelResult<NodeId> {
        let node = self.tree.get(parent)?;
        node.child(name)
            .ok_or_else(|| KernelError::UnknownNode(format!("{}.{}", node.path(), name)))
    }

    /// Looks up a port by full path, e.g. `top.cpu0.ports.req_out`.
    pub fn port_by_path(&self, path: &str) -> KernelResult<PortId> {
        let unknown = || KernelError::UnknownPort(path.to_string());
        let (node_path, name) = path.rsplit_once(".ports.").ok_or_else(unknown)?;
        let node = self.tree.find(node_path).ok_or_else(unknown)?;
        self.port_of(node, name).map_err(|_| unknown())
    }

    /// Looks up a port of `node` by name.
    pub fn port_of(&self, node: NodeId, name: &str) -> KernelResult<PortId> {
        let n = self.tree.get(node)?;
        n.port(name)
            .ok_or_else(|| KernelError::UnknownPort(format!("{}.ports.{}", n.path(), name)))
    }

    fn require_mutable(&self, node: NodeId) -> KernelResult<&TreeNode> {
        let n = self.tree.get(node)?;
        if !n.phase().is_mutable() {
            return Err(KernelError::WrongPhase {
                target: n.path().to_string(),
                required: "building or configuring",
                actual: n.phase(),
            });
        }
        Ok(n)
    }

    fn require_live(&self, port: PortId) -> KernelResult<()> {
        let owner = self.ports.get(port)?.owner();
        let n = self.tree.get(owner)?;
        if !n.phase().is_live() {
            return Err(KernelError::WrongPhase {
                target: self.ports.path(port),
                required: "finalized or running",
                actual: n.phase(),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Adds a child node. The child adopts the parent's phase.
    pub fn add_child(&mut self, parent: NodeId, name: impl Into<String>) -> KernelResult<NodeId> {
        let id = self.tree.add_child(parent, name)?;
        tracing::trace!(path = %self.tree.path(id), "node added");
        Ok(id)
    }

    /// Removes a subtree before finalization, releasing its ports and taps.
    ///
    /// Returns the number of nodes removed.
    pub fn detach(&mut self, node: NodeId) -> KernelResult<usize> {
        let n = self.require_mutable(node)?;
        if node == self.root {
            return Err(KernelError::Validation {
                path: n.path().to_string(),
                reason: "the root node cannot be detached".to_string(),
            });
        }
        let path = n.path().to_string();
        let subtree = self.tree.subtree(node);
        let mut port_ids = HashSet::new();
        for id in &subtree {
            if let Ok(n) = self.tree.get(*id) {
                port_ids.extend(n.ports().iter().copied());
            }
        }
        let nodes: HashSet<NodeId> = subtree.iter().copied().collect();
        self.taps.detach_where(|t| match t {
            TapTarget::Node(n) => nodes.contains(n),
            TapTarget::Port(p) => port_ids.contains(p),
        })?;
        for port in &port_ids {
            self.ports.remove(*port);
        }
        let removed = self.tree.remove_subtree(node);
        tracing::debug!(path = %path, nodes = removed.len(), "subtree detached");
        Ok(removed.len())
    }

    /// Declares a clock on `node`; its subtree inherits it unless overridden.
    pub fn set_clock(&mut self, node: NodeId, clock: Clock) -> KernelResult<()> {
        self.require_mutable(node)?;
        self.tree.get_mut(node)?.clock_decl = Some(clock);
        Ok(())
    }

    /// Declares a port on `node`.
    pub fn add_port(&mut self, node: NodeId, spec: PortSpec) -> KernelResult<PortId> {
        let n = self.require_mutable(node)?;
        if n.port(&spec.name).is_some() || n.child(&spec.name).is_some() {
            return Err(KernelError::DuplicateName {
                parent: n.path().to_string(),
                name: spec.name,
            });
        }
        let owner_path = n.path().to_string();
        let name = spec.name.clone();
        let id = self.ports.insert(node, &owner_path, spec)?;
        let n = self.tree.get_mut(node)?;
        n.ports.push(id);
        n.port_index.insert(name, id);
        Ok(id)
    }

    /// Declares a parameter on `node`.
    pub fn declare_param(&mut self, node: NodeId, spec: &ParamSpec) -> KernelResult<()> {
        self.require_mutable(node)?;
        self.tree.get_mut(node)?.params.declare_spec(spec)
    }

    /// Attaches a device to `node`, creating the ports and parameters it declares.
    pub fn attach_device(&mut self, node: NodeId, device: Box<dyn Device>) -> KernelResult<()> {
        let n = self.require_mutable(node)?;
        if n.has_device() {
            return Err(KernelError::device(n.path(), "node already has a device"));
        }
        for spec in device.params() {
            self.declare_param(node, &spec)?;
        }
        for spec in device.ports() {
            self.add_port(node, spec)?;
        }
        let n = self.tree.get_mut(node)?;
        n.device_type = Some(device.type_name().to_string());
        n.device = Some(device);
        Ok(())
    }

    /// Reads a parameter of `node`.
    pub fn param(&self, node: NodeId, name: &str) -> KernelResult<ParamValue> {
        self.tree.get(node)?.params().get(name).cloned()
    }

    pub fn params(&self, node: NodeId) -> KernelResult<&ParameterSet> {
        Ok(self.tree.get(node)?.params())
    }

    /// Sets a parameter of `node`. Fails with `LockedParameter` once finalized.
    pub fn set_param(&mut self, node: NodeId, name: &str, value: impl Into<ParamValue>) -> KernelResult<()> {
        self.tree.get_mut(node)?.params.set(name, value)
    }

    /// Counters and histograms of `node`.
    pub fn statistics(&self, node: NodeId) -> KernelResult<&StatisticSet> {
        Ok(self.tree.get(node)?.statistics())
    }

    /// Mutable statistics of `node`. Registration is allowed in any phase.
    pub fn statistics_mut(&mut self, node: NodeId) -> KernelResult<&mut StatisticSet> {
        Ok(&mut self.tree.get_mut(node)?.statistics)
    }

    /// Queues a parameter value applied when the tree enters Configuring.
    pub fn override_param(&mut self, node_path: impl Into<String>, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.overrides.push(ParamOverride {
            node: node_path.into(),
            name: name.into(),
            value: value.into(),
        });
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn transition_error(&self, to: Phase) -> KernelError {
        KernelError::StateTransition {
            node: self.tree.path(self.root),
            from: self.phase(),
            to,
        }
    }

    fn set_phase_all(&mut self, phase: Phase) {
        for id in self.tree.subtree(self.root) {
            if let Ok(n) = self.tree.get_mut(id) {
                n.phase = phase;
            }
        }
    }

    /// Building → Configuring. Applies pending parameter overrides.
    pub fn enter_configuring(&mut self) -> KernelResult<()> {
        if self.phase() != Phase::Building {
            return Err(self.transition_error(Phase::Configuring));
        }
        for ov in std::mem::take(&mut self.overrides) {
            let node = self.find(&ov.node)?;
            self.set_param(node, &ov.name, ov.value)?;
        }
        self.set_phase_all(Phase::Configuring);
        tracing::info!(root = %self.tree.path(self.root), "entered configuring");
        Ok(())
    }

    fn check_ports(&self, node: &TreeNode) -> KernelResult<()> {
        for &id in node.ports() {
            let port = self.ports.get(id)?;
            if !port.is_bound() {
                return Err(KernelError::Binding {
                    port: port.path().to_string(),
                    reason: "port is not bound".to_string(),
                });
            }
            let Some(credit_port) = port.spec().credit_port.as_deref() else {
                continue;
            };
            let ok = node
                .port(credit_port)
                .and_then(|c| self.ports.get(c).ok())
                .map(|c| c.direction() == PortDirection::CreditIn)
                .unwrap_or(false);
            if !ok {
                return Err(KernelError::Binding {
                    port: port.path().to_string(),
                    reason: format!("credit return port '{}' is not a credit-in port on this node", credit_port),
                });
            }
        }
        Ok(())
    }

    /// Configuring → Finalized.
    ///
    /// Checks every port binding and required parameter, hands the locked
    /// parameters to devices, locks every parameter set and registers each
    /// declared clock with the scheduler. On error nothing changes and the
    /// tree stays in Configuring.
    pub fn enter_finalized(&mut self) -> KernelResult<()> {
        if self.phase() != Phase::Configuring {
            return Err(self.transition_error(Phase::Finalized));
        }
        if self.scheduler.is_finalized() {
            return Err(KernelError::SchedulerState(
                "scheduler was finalized before the tree".to_string(),
            ));
        }
        let order = self.tree.subtree(self.root);

        // Validate everything before touching any state.
        let mut clock_names = HashSet::new();
        for &id in &order {
            let node = self.tree.get(id)?;
            self.check_ports(node)?;
            node.params().validate()?;
            if let Some(clock) = node.declared_clock() {
                if !clock_names.insert(clock.name().to_string())
                    || self.scheduler.clock_by_name(clock.name()).is_some()
                {
                    return Err(KernelError::DuplicateName {
                        parent: "clocks".to_string(),
                        name: clock.name().to_string(),
                    });
                }
            }
            if self.tree.clock_owner(id).is_none() {
                return Err(KernelError::Validation {
                    path: node.path().to_string(),
                    reason: "no clock declared on this node or any ancestor".to_string(),
                });
            }
        }

        for &id in &order {
            let node = self.tree.get_mut(id)?;
            let path = node.path().to_string();
            if let Some(dev) = node.device.as_mut() {
                let mut locked = node.params.clone();
                locked.lock();
                dev.finalize(&locked).map_err(|e| match e {
                    KernelError::Device { .. }
                    | KernelError::Validation { .. }
                    | KernelError::ParameterType { .. }
                    | KernelError::UnknownParameter { .. } => e,
                    other => KernelError::device(path, other.to_string()),
                })?;
            }
        }

        let mut clock_ids = BTreeMap::new();
        for &id in &order {
            if let Some(clock) = self.tree.get(id)?.declared_clock().cloned() {
                clock_ids.insert(id, self.scheduler.register_clock(clock)?);
            }
        }
        self.cycle_subscribers.clear();
        for &id in &order {
            let owner = self.tree.clock_owner(id);
            let clock = owner.and_then(|o| clock_ids.get(&o).copied());
            let node = self.tree.get_mut(id)?;
            node.params.lock();
            node.clock = clock;
            let wants = node.device.as_ref().map(|d| d.wants_cycles()).unwrap_or(false);
            let has_device = node.device.is_some();
            if let (Some(clock), true) = (clock, wants) {
                self.cycle_subscribers.entry(clock).or_default().push(id);
            }
            if has_device {
                self.scheduler.schedule_in(0, EventPayload::startup(id))?;
            }
        }
        self.set_phase_all(Phase::Finalized);
        tracing::info!(
            root = %self.tree.path(self.root),
            nodes = order.len(),
            ports = self.ports.len(),
            clocks = clock_ids.len(),
            "entered finalized"
        );
        Ok(())
    }

    /// Finalized/Running → Teardown. A second call is a no-op.
    pub fn enter_teardown(&mut self) -> KernelResult<()> {
        match self.phase() {
            Phase::Teardown => {
                tracing::debug!("teardown requested twice, ignoring");
                return Ok(());
            }
            Phase::Finalized | Phase::Running => {}
            _ => return Err(self.transition_error(Phase::Teardown)),
        }
        let flushed = self.taps.detach_all();
        for id in self.tree.subtree(self.root) {
            let Ok(node) = self.tree.get_mut(id) else {
                continue;
            };
            if let Some(dev) = node.device.as_mut() {
                dev.teardown();
            }
            let ports = node.ports().to_vec();
            for port in ports {
                self.ports.unbind(port);
            }
        }
        let dropped = self.scheduler.clear();
        self.cycle_subscribers.clear();
        self.set_phase_all(Phase::Teardown);
        match flushed {
            Ok(taps) => {
                tracing::info!(taps, dropped_events = dropped, "entered teardown");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, dropped_events = dropped, "entered teardown with tap errors");
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Ports
    // ------------------------------------------------------------------

    /// Binds an output port to the matching input port.
    ///
    /// Both owners must be Configuring. A port can be bound once.
    pub fn bind(&mut self, producer: PortId, consumer: PortId) -> KernelResult<()> {
        for id in [producer, consumer] {
            let owner = self.ports.get(id)?.owner();
            let phase = self.tree.get(owner)?.phase();
            if phase != Phase::Configuring {
                return Err(KernelError::WrongPhase {
                    target: self.ports.path(id),
                    required: "configuring",
                    actual: phase,
                });
            }
        }
        self.ports.bind(producer, consumer)?;
        tracing::debug!(
            producer = %self.ports.path(producer),
            consumer = %self.ports.path(consumer),
            "ports bound"
        );
        Ok(())
    }

    /// Binds two ports given by path.
    pub fn bind_paths(&mut self, producer: &str, consumer: &str) -> KernelResult<()> {
        let p = self.port_by_path(producer)?;
        let c = self.port_by_path(consumer)?;
        self.bind(p, c)
    }

    pub fn is_bound(&self, port: PortId) -> bool {
        self.ports.get(port).map(|p| p.is_bound()).unwrap_or(false)
    }

    /// True if a send on `port` would be accepted.
    pub fn has_credit(&self, port: PortId) -> bool {
        self.ports.get(port).map(|p| p.has_credit()).unwrap_or(false)
    }

    /// Sends `data` on a `DataOut` port.
    ///
    /// The value arrives on the bound input `latency` ticks from now. On a
    /// flow-controlled port the send consumes one credit and fails with
    /// `CreditExhausted` when none is left.
    pub fn send(&mut self, port: PortId, data: serde_json::Value) -> KernelResult<()> {
        self.require_live(port)?;
        let p = self.ports.get_mut(port)?;
        if p.direction() != PortDirection::DataOut {
            return Err(KernelError::Binding {
                port: p.path().to_string(),
                reason: format!("cannot send on a {} port", p.direction()),
            });
        }
        let Some(dst) = p.peer else {
            return Err(KernelError::Binding {
                port: p.path().to_string(),
                reason: "port is not bound".to_string(),
            });
        };
        if let Some(credits) = p.credits.as_mut() {
            if credits.available == 0 {
                credits.refused += 1;
                return Err(KernelError::CreditExhausted {
                    port: p.path().to_string(),
                });
            }
            credits.available -= 1;
            credits.sent += 1;
            debug_assert!(credits.is_safe());
        }
        p.messages += 1;
        let latency = p.latency();
        let owner = p.owner();
        if self.taps.listening(TapChannel::Trace) {
            let text = format!("send -> {} {}", self.ports.path(dst), data);
            self.log_port(owner, port, TapChannel::Trace, &text)?;
        }
        self.scheduler
            .schedule_in(latency, EventPayload::deliver(port, dst, data))?;
        Ok(())
    }

    /// Returns `credits` to the producer through a `CreditOut` port.
    pub fn return_credit(&mut self, port: PortId, credits: u32) -> KernelResult<()> {
        self.require_live(port)?;
        let p = self.ports.get_mut(port)?;
        if p.direction() != PortDirection::CreditOut {
            return Err(KernelError::Binding {
                port: p.path().to_string(),
                reason: format!("cannot return credits on a {} port", p.direction()),
            });
        }
        let Some(dst) = p.peer else {
            return Err(KernelError::Binding {
                port: p.path().to_string(),
                reason: "port is not bound".to_string(),
            });
        };
        if credits == 0 {
            return Ok(());
        }
        p.messages += 1;
        let latency = p.latency();
        self.scheduler
            .schedule_in(latency, EventPayload::credit(port, dst, credits))?;
        Ok(())
    }

    /// Drains values buffered on a `DataIn` port of a node without a device.
    pub fn take_received(&mut self, port: PortId) -> KernelResult<Vec<(Tick, serde_json::Value)>> {
        Ok(self.ports.get_mut(port)?.inbox.drain(..).collect())
    }

    /// Credit statistics of every flow-controlled output.
    pub fn link_stats(&self) -> Vec<LinkStats> {
        self.ports
            .iter()
            .filter_map(|p| {
                let c = p.credits()?;
                Some(LinkStats {
                    port: p.path().to_string(),
                    peer: p.peer().map(|peer| self.ports.path(peer)),
                    initial_credits: c.initial,
                    available: c.available,
                    sent: c.sent,
                    returned: c.returned,
                    refused: c.refused,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Scheduling and running
    // ------------------------------------------------------------------

    /// Schedules an event at an absolute tick.
    pub fn schedule(&mut self, due: Tick, payload: EventPayload) -> KernelResult<EventSeq> {
        self.scheduler.schedule(due, payload)
    }

    /// Schedules an event `delay` ticks from now.
    pub fn schedule_in(&mut self, delay: Tick, payload: EventPayload) -> KernelResult<()> {
        self.scheduler.schedule_in(delay, payload).map(|_| ())
    }

    /// Cycle count of the clock driving `node`.
    pub fn node_cycle(&self, node: NodeId) -> Option<u64> {
        let clock = self.tree.get(node).ok()?.clock()?;
        self.scheduler.clock(clock).map(|c| c.cycle())
    }

    /// Runs for at most `max_ticks` ticks, or until the queue drains when `None`.
    ///
    /// Requires a finalized tree and scheduler. The tree is Running during
    /// and after the run. An error from a device or action aborts the run.
    pub fn run(&mut self, max_ticks: Option<Tick>) -> KernelResult<RunSummary> {
        let phase = self.phase();
        if !phase.is_live() {
            return Err(KernelError::WrongPhase {
                target: self.tree.path(self.root),
                required: "finalized or running",
                actual: phase,
            });
        }
        let budget = self.scheduler.begin_run(max_ticks)?;
        self.set_phase_all(Phase::Running);
        self.runs += 1;
        tracing::info!(start = budget.start(), limit = ?budget.limit(), "run started");

        let mut summary = RunSummary {
            start_tick: budget.start(),
            ..RunSummary::default()
        };
        while let Some(occ) = self.scheduler.next(&budget) {
            match occ {
                Occurrence::Edge { clock, cycle, .. } => {
                    summary.edges_delivered += 1;
                    self.deliver_edge(clock, cycle)?;
                }
                Occurrence::Event { payload, .. } => {
                    summary.events_executed += 1;
                    self.dispatch(payload)?;
                }
            }
        }
        summary.stopped_on_budget = self.scheduler.end_run(&budget) == StopReason::Budget;
        summary.final_tick = self.scheduler.current_tick();
        tracing::info!(
            final_tick = summary.final_tick,
            events = summary.events_executed,
            edges = summary.edges_delivered,
            reason = ?summary.stop_reason(),
            "run finished"
        );
        Ok(summary)
    }

    fn with_device<F>(&mut self, node: NodeId, f: F) -> KernelResult<bool>
    where
        F: FnOnce(&mut dyn Device, &mut DeviceContext<'_>) -> KernelResult<()>,
    {
        let Some(mut dev) = self.tree.get_mut(node)?.device.take() else {
            return Ok(false);
        };
        let result = {
            let mut ctx = DeviceContext::new(self, node);
            f(dev.as_mut(), &mut ctx)
        };
        if let Ok(n) = self.tree.get_mut(node) {
            n.device = Some(dev);
        }
        result.map(|_| true)
    }

    fn deliver_edge(&mut self, clock: ClockId, cycle: u64) -> KernelResult<()> {
        let subscribers = match self.cycle_subscribers.get(&clock) {
            Some(s) => s.clone(),
            None => return Ok(()),
        };
        for node in subscribers {
            self.with_device(node, |dev, ctx| dev.on_cycle(ctx, cycle))?;
        }
        Ok(())
    }

    fn dispatch(&mut self, payload: EventPayload) -> KernelResult<()> {
        match payload {
            EventPayload::Deliver(Transfer { src, dst, value: data }) => {
                let now = self.scheduler.current_tick();
                let p = self.ports.get_mut(dst)?;
                p.messages += 1;
                let (owner, name) = (p.owner(), p.name().to_string());
                if self.taps.listening(TapChannel::Trace) {
                    let text = format!("recv <- {} {}", self.ports.path(src), data);
                    self.log_port(owner, dst, TapChannel::Trace, &text)?;
                }
                if self.tree.get(owner)?.has_device() {
                    self.with_device(owner, |dev, ctx| dev.on_data(ctx, &name, data))?;
                } else {
                    self.ports.get_mut(dst)?.inbox.push_back((now, data));
                }
            }
            EventPayload::Credit(Transfer { src, dst, value: credits }) => {
                for target in self.ports.credit_targets(dst) {
                    if let Some(c) = self.ports.get_mut(target)?.credits.as_mut() {
                        c.available = c.available.saturating_add(credits);
                        c.returned += credits as u64;
                    }
                }
                let p = self.ports.get_mut(dst)?;
                p.messages += 1;
                let (owner, name) = (p.owner(), p.name().to_string());
                if self.taps.listening(TapChannel::Trace) {
                    let text = format!("credit <- {} +{}", self.ports.path(src), credits);
                    self.log_port(owner, dst, TapChannel::Trace, &text)?;
                }
                self.with_device(owner, |dev, ctx| dev.on_credit(ctx, &name, credits))?;
            }
            EventPayload::Startup(Activation(node)) => {
                self.with_device(node, |dev, ctx| dev.startup(ctx))?;
            }
            EventPayload::Wakeup { node, tag } => {
                // Timers of detached or torn-down devices are dropped.
                if self.tree.contains(node) {
                    self.with_device(node, |dev, ctx| dev.on_wakeup(ctx, tag))?;
                }
            }
            EventPayload::Action(action) => action(self)?,
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Taps
    // ------------------------------------------------------------------

    /// Attaches a tap. Allowed any time before teardown.
    pub fn attach_tap(&mut self, target: TapTarget, channel: TapChannel, sink: TapSink) -> KernelResult<TapId> {
        if self.phase() == Phase::Teardown {
            return Err(KernelError::Tap("cannot attach a tap after teardown".to_string()));
        }
        match target {
            TapTarget::Node(n) => {
                self.tree.get(n)?;
            }
            TapTarget::Port(p) => {
                self.ports.get(p)?;
            }
        }
        let id = self.taps.attach(target, channel, sink)?;
        tracing::debug!(tap = id, ?target, %channel, "tap attached");
        Ok(id)
    }

    /// Attaches a tap to a node or port given by path.
    ///
    /// `ports` is never a node name, so a `.ports.` segment always names a port.
    pub fn attach_tap_path(&mut self, path: &str, channel: TapChannel, sink: TapSink) -> KernelResult<TapId> {
        let target = if path.contains(".ports.") {
            TapTarget::Port(self.port_by_path(path)?)
        } else {
            TapTarget::Node(self.find(path)?)
        };
        self.attach_tap(target, channel, sink)
    }

    /// Flushes and removes a tap, returning the number of lines it recorded.
    pub fn detach_tap(&mut self, id: TapId) -> KernelResult<u64> {
        self.taps.detach(id)
    }

    pub fn tap_count(&self) -> usize {
        self.taps.len()
    }

    /// Writes `text` on a node's tap channel and forwards it to `tracing`.
    pub fn log(&mut self, node: NodeId, channel: TapChannel, text: &str) -> KernelResult<()> {
        let source = self.tree.path(node);
        self.emit(node, None, &source, channel, text)
    }

    fn log_port(&mut self, node: NodeId, port: PortId, channel: TapChannel, text: &str) -> KernelResult<()> {
        let source = self.ports.path(port);
        self.emit(node, Some(port), &source, channel, text)
    }

    fn emit(&mut self, node: NodeId, port: Option<PortId>, source: &str, channel: TapChannel, text: &str) -> KernelResult<()> {
        let tick = self.scheduler.current_tick();
        match channel {
            TapChannel::Info => tracing::info!(target: "archsim::tap", tick, source, "{}", text),
            TapChannel::Debug => tracing::debug!(target: "archsim::tap", tick, source, "{}", text),
            TapChannel::Trace => tracing::trace!(target: "archsim::tap", tick, source, "{}", text),
        }
        let msg = TapMessage {
            tick,
            node,
            port,
            channel,
            source,
            text,
        };
        self.taps.emit(&self.tree, &msg)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Snapshot of scheduler, clock, link and device statistics.
    pub fn stats(&self) -> SimulationStats {
        let sched = self.scheduler.stats();
        let devices = self
            .tree
            .iter()
            .filter_map(|n| {
                let stats = n.device.as_ref()?.stats();
                (!stats.is_null()).then(|| (n.path().to_string(), stats))
            })
            .collect();
        let statistics = self
            .tree
            .iter()
            .filter(|n| !n.statistics().is_empty())
            .map(|n| (n.path().to_string(), n.statistics().clone()))
            .collect();
        SimulationStats {
            metadata: SimulationMetadata {
                name: self.tree.path(self.root),
                version: env!("CARGO_PKG_VERSION").to_string(),
                phase: self.phase().to_string(),
                node_count: self.tree.len(),
                port_count: self.ports.len(),
                config_file: None,
            },
            run: RunStats {
                final_tick: self.scheduler.current_tick(),
                runs: self.runs,
                events_scheduled: sched.events_scheduled,
                events_executed: sched.events_executed,
                edges_delivered: sched.edges_delivered,
                pending_events: self.scheduler.pending(),
                peak_queue_depth: sched.peak_queue_depth,
            },
            clocks: self
                .scheduler
                .clocks()
                .map(|(_, c)| ClockStats {
                    name: c.name().to_string(),
                    period: c.period(),
                    cycles: c.cycle(),
                })
                .collect(),
            links: self.link_stats(),
            devices,
            statistics,
            timing: Default::default(),
        }
    }

    /// Exports statistics as a JSON value.
    pub fn export_stats(&self) -> serde_json::Value {
        serde_json::to_value(self.stats()).unwrap_or(serde_json::Value::Null)
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("root", &self.tree.path(self.root))
            .field("phase", &self.phase())
            .field("nodes", &self.tree.len())
            .field("ports", &self.ports.len())
            .field("tick", &self.scheduler.current_tick())
            .finish()
    }
}
