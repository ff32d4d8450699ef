//! Ports and the credit-flow protocol.
//!
//! Every port belongs to one tree node and has a direction and a payload type
//! tag. Outputs (`DataOut`, `CreditOut`) bind to exactly one input of the
//! matching kind (`DataIn`, `CreditIn`) with the same payload type.
//!
//! # Credit flow
//!
//! A `DataOut` port declared with [`PortSpec::with_credits`] is flow
//! controlled. It starts with `initial_credits` and each send consumes one.
//! The consumer hands credits back on its `CreditOut` port, which is bound to
//! the producer's `CreditIn` port named by the flow-controlled output. The
//! kernel guarantees, for every flow-controlled output:
//!
//! ```text
//! sent <= initial_credits + credits_returned
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use crate::error::{KernelError, KernelResult};
use crate::types::{NodeId, PortId, Tick};

/// Payload type tag used by credit ports.
pub const CREDIT_PAYLOAD: &str = "credit";

/// Direction of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortDirection {
    DataOut,
    DataIn,
    CreditOut,
    CreditIn,
}

impl PortDirection {
    pub fn is_output(&self) -> bool {
        matches!(self, PortDirection::DataOut | PortDirection::CreditOut)
    }

    /// The direction a bound peer must have.
    pub fn peer(&self) -> PortDirection {
        match self {
            PortDirection::DataOut => PortDirection::DataIn,
            PortDirection::DataIn => PortDirection::DataOut,
            PortDirection::CreditOut => PortDirection::CreditIn,
            PortDirection::CreditIn => PortDirection::CreditOut,
        }
    }
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortDirection::DataOut => "data-out",
            PortDirection::DataIn => "data-in",
            PortDirection::CreditOut => "credit-out",
            PortDirection::CreditIn => "credit-in",
        };
        f.write_str(s)
    }
}

/// Declaration of a port.
///
/// # Example
///
/// ```
/// use archsim::port::{PortDirection, PortSpec};
///
/// // A request output with 2-tick latency, four credits, and its credit return port.
/// let req = PortSpec::data_out("req_out", "MemReq")
///     .with_latency(2)
///     .with_credits(4, "req_credit_in");
/// let credit = PortSpec::credit_in("req_credit_in");
///
/// assert_eq!(req.direction, PortDirection::DataOut);
/// assert_eq!(req.initial_credits, Some(4));
/// assert_eq!(credit.payload_type, "credit");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub direction: PortDirection,
    pub payload_type: String,
    /// Delivery latency in ticks (outputs only).
    #[serde(default)]
    pub latency: Tick,
    /// Initial credits for a flow-controlled `DataOut`.
    #[serde(default)]
    pub initial_credits: Option<u32>,
    /// `CreditIn` port on the same node that replenishes this output.
    #[serde(default)]
    pub credit_port: Option<String>,
}

impl PortSpec {
    pub fn new(name: impl Into<String>, direction: PortDirection, payload_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction,
            payload_type: payload_type.into(),
            latency: 0,
            initial_credits: None,
            credit_port: None,
        }
    }

    pub fn data_out(name: impl Into<String>, payload_type: impl Into<String>) -> Self {
        Self::new(name, PortDirection::DataOut, payload_type)
    }

    pub fn data_in(name: impl Into<String>, payload_type: impl Into<String>) -> Self {
        Self::new(name, PortDirection::DataIn, payload_type)
    }

    pub fn credit_out(name: impl Into<String>) -> Self {
        Self::new(name, PortDirection::CreditOut, CREDIT_PAYLOAD)
    }

    pub fn credit_in(name: impl Into<String>) -> Self {
        Self::new(name, PortDirection::CreditIn, CREDIT_PAYLOAD)
    }

    pub fn with_latency(mut self, latency: Tick) -> Self {
        self.latency = latency;
        self
    }

    /// Makes a `DataOut` flow controlled by the credits arriving on `credit_port`.
    pub fn with_credits(mut self, initial: u32, credit_port: impl Into<String>) -> Self {
        self.initial_credits = Some(initial);
        self.credit_port = Some(credit_port.into());
        self
    }

    pub(crate) fn check(&self) -> KernelResult<()> {
        let flow = self.initial_credits.is_some() || self.credit_port.is_some();
        if flow && self.direction != PortDirection::DataOut {
            return Err(KernelError::Binding {
                port: self.name.clone(),
                reason: format!("only data-out ports can be flow controlled, not {}", self.direction),
            });
        }
        if self.latency > 0 && !self.direction.is_output() {
            return Err(KernelError::Binding {
                port: self.name.clone(),
                reason: "latency applies to output ports only".to_string(),
            });
        }
        Ok(())
    }
}

/// Credit bookkeeping of a flow-controlled output.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditState {
    pub initial: u32,
    pub available: u32,
    pub returned: u64,
    pub sent: u64,
    pub refused: u64,
}

impl CreditState {
    fn new(initial: u32) -> Self {
        Self {
            initial,
            available: initial,
            ..Self::default()
        }
    }

    /// The backpressure safety property of a bounded link.
    pub fn is_safe(&self) -> bool {
        self.sent <= self.initial as u64 + self.returned
    }
}

/// A port instance.
#[derive(Debug)]
pub struct Port {
    id: PortId,
    owner: NodeId,
    path: String,
    spec: PortSpec,
    pub(crate) peer: Option<PortId>,
    pub(crate) credits: Option<CreditState>,
    pub(crate) inbox: VecDeque<(Tick, serde_json::Value)>,
    pub(crate) messages: u64,
}

impl Port {
    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Full path, e.g. `top.cpu0.ports.req_out`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn direction(&self) -> PortDirection {
        self.spec.direction
    }

    pub fn payload_type(&self) -> &str {
        &self.spec.payload_type
    }

    pub fn latency(&self) -> Tick {
        self.spec.latency
    }

    pub fn spec(&self) -> &PortSpec {
        &self.spec
    }

    pub fn peer(&self) -> Option<PortId> {
        self.peer
    }

    pub fn is_bound(&self) -> bool {
        self.peer.is_some()
    }

    pub fn is_flow_controlled(&self) -> bool {
        self.credits.is_some()
    }

    pub fn credits(&self) -> Option<&CreditState> {
        self.credits.as_ref()
    }

    /// True when a send would be accepted. Always true without flow control.
    pub fn has_credit(&self) -> bool {
        self.credits.as_ref().map(|c| c.available > 0).unwrap_or(true)
    }

    /// Messages sent (outputs) or received (inputs).
    pub fn message_count(&self) -> u64 {
        self.messages
    }

    /// Number of buffered, unconsumed arrivals.
    pub fn inbox_len(&self) -> usize {
        self.inbox.len()
    }
}

/// Arena of all ports of a simulation.
#[derive(Debug, Default)]
pub struct PortTable {
    ports: BTreeMap<PortId, Port>,
    next_id: PortId,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, owner: NodeId, owner_path: &str, spec: PortSpec) -> KernelResult<PortId> {
        spec.check()?;
        let id = self.next_id;
        self.next_id += 1;
        let path = format!("{}.ports.{}", owner_path, spec.name);
        let credits = spec.initial_credits.map(CreditState::new);
        self.ports.insert(
            id,
            Port {
                id,
                owner,
                path,
                spec,
                peer: None,
                credits,
                inbox: VecDeque::new(),
                messages: 0,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: PortId) -> KernelResult<&Port> {
        self.ports
            .get(&id)
            .ok_or_else(|| KernelError::UnknownPort(format!("#{}", id)))
    }

    pub(crate) fn get_mut(&mut self, id: PortId) -> KernelResult<&mut Port> {
        self.ports
            .get_mut(&id)
            .ok_or_else(|| KernelError::UnknownPort(format!("#{}", id)))
    }

    pub fn path(&self, id: PortId) -> String {
        self.ports
            .get(&id)
            .map(|p| p.path.clone())
            .unwrap_or_else(|| format!("#{}", id))
    }

    /// Binds `producer` (an output) to `consumer` (the matching input).
    pub(crate) fn bind(&mut self, producer: PortId, consumer: PortId) -> KernelResult<()> {
        let (p, c) = (self.get(producer)?, self.get(consumer)?);
        let fail = |reason: String| KernelError::Binding {
            port: p.path.clone(),
            reason,
        };
        if producer == consumer {
            return Err(fail("cannot bind a port to itself".to_string()));
        }
        if !p.direction().is_output() {
            return Err(fail(format!(
                "producer side must be an output, found {}",
                p.direction()
            )));
        }
        if c.direction() != p.direction().peer() {
            return Err(fail(format!(
                "{} cannot bind to {} port '{}'",
                p.direction(),
                c.direction(),
                c.path
            )));
        }
        if p.payload_type() != c.payload_type() {
            return Err(fail(format!(
                "payload type '{}' does not match '{}' on '{}'",
                p.payload_type(),
                c.payload_type(),
                c.path
            )));
        }
        if let Some(peer) = p.peer {
            return Err(fail(format!("already bound to '{}'", self.path(peer))));
        }
        if let Some(peer) = c.peer {
            return Err(KernelError::Binding {
                port: c.path.clone(),
                reason: format!("already bound to '{}'", self.path(peer)),
            });
        }
        self.get_mut(producer)?.peer = Some(consumer);
        self.get_mut(consumer)?.peer = Some(producer);
        Ok(())
    }

    /// Clears the binding of `id` and of its peer. Returns the former peer.
    pub(crate) fn unbind(&mut self, id: PortId) -> Option<PortId> {
        let peer = self.ports.get_mut(&id)?.peer.take()?;
        if let Some(p) = self.ports.get_mut(&peer) {
            p.peer = None;
        }
        Some(peer)
    }

    pub(crate) fn remove(&mut self, id: PortId) -> Option<Port> {
        self.unbind(id);
        self.ports.remove(&id)
    }

    /// Flow-controlled outputs replenished by the credit input `credit_in`.
    pub(crate) fn credit_targets(&self, credit_in: PortId) -> Vec<PortId> {
        let Some(ci) = self.ports.get(&credit_in) else {
            return Vec::new();
        };
        self.ports
            .values()
            .filter(|p| {
                p.owner == ci.owner
                    && p.credits.is_some()
                    && p.spec.credit_port.as_deref() == Some(ci.name())
            })
            .map(|p| p.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.ports.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> (PortTable, PortId, PortId, PortId, PortId) {
        let mut t = PortTable::new();
        let out = t
            .insert(0, "top.gen", PortSpec::data_out("req_out", "MemReq").with_credits(2, "req_credit_in"))
            .unwrap();
        let cin = t.insert(0, "top.gen", PortSpec::credit_in("req_credit_in")).unwrap();
        let inp = t.insert(1, "top.mem", PortSpec::data_in("req_in", "MemReq")).unwrap();
        let cout = t.insert(1, "top.mem", PortSpec::credit_out("req_credit_out")).unwrap();
        (t, out, cin, inp, cout)
    }

    #[test]
    fn test_port_paths() {
        let (t, out, _, inp, _) = table();
        assert_eq!(t.get(out).unwrap().path(), "top.gen.ports.req_out");
        assert_eq!(t.path(inp), "top.mem.ports.req_in");
        assert_eq!(t.path(99), "#99");
    }

    #[test]
    fn test_bind_compatible() {
        let (mut t, out, cin, inp, cout) = table();
        t.bind(out, inp).unwrap();
        t.bind(cout, cin).unwrap();
        assert_eq!(t.get(out).unwrap().peer(), Some(inp));
        assert_eq!(t.get(inp).unwrap().peer(), Some(out));
        assert!(t.get(cin).unwrap().is_bound());
    }

    #[test]
    fn test_bind_rejects_wrong_direction() {
        let (mut t, out, cin, inp, _) = table();
        // Input on the producer side.
        assert!(matches!(t.bind(inp, out), Err(KernelError::Binding { .. })));
        // Data output to a credit input.
        assert!(matches!(t.bind(out, cin), Err(KernelError::Binding { .. })));
        assert!(!t.get(out).unwrap().is_bound());
    }

    #[test]
    fn test_bind_rejects_payload_mismatch() {
        let (mut t, _, _, inp, _) = table();
        let other = t.insert(2, "top.x", PortSpec::data_out("o", "u32")).unwrap();
        let err = t.bind(other, inp).unwrap_err();
        assert!(err.to_string().contains("payload type 'u32'"));
    }

    #[test]
    fn test_bind_only_once() {
        let (mut t, out, _, inp, _) = table();
        t.bind(out, inp).unwrap();
        let second = t.insert(2, "top.y", PortSpec::data_in("i", "MemReq")).unwrap();
        assert!(t.bind(out, second).is_err());
        assert!(t.get(second).unwrap().peer().is_none());
    }

    #[test]
    fn test_unbind_clears_both_sides() {
        let (mut t, out, _, inp, _) = table();
        t.bind(out, inp).unwrap();
        assert_eq!(t.unbind(inp), Some(out));
        assert!(!t.get(out).unwrap().is_bound());
        assert_eq!(t.unbind(inp), None);
    }

    #[test]
    fn test_credit_state() {
        let (t, out, cin, inp, _) = table();
        let p = t.get(out).unwrap();
        assert!(p.is_flow_controlled());
        assert!(p.has_credit());
        assert_eq!(p.credits().unwrap().available, 2);
        assert!(!t.get(inp).unwrap().is_flow_controlled());
        assert!(t.get(inp).unwrap().has_credit());
        assert_eq!(t.credit_targets(cin), vec![out]);
    }

    #[test]
    fn test_spec_checks() {
        let mut t = PortTable::new();
        let bad = PortSpec::data_in("i", "u32").with_credits(1, "c");
        assert!(t.insert(0, "n", bad).is_err());
        let bad = PortSpec::data_in("i", "u32").with_latency(3);
        assert!(t.insert(0, "n", bad).is_err());
    }

    #[test]
    fn test_safety_property() {
        let mut c = CreditState::new(3);
        c.sent = 3;
        assert!(c.is_safe());
        c.sent = 4;
        assert!(!c.is_safe());
        c.returned = 1;
        assert!(c.is_safe());
    }
}
