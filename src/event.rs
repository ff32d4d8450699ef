//! Events carried by the simulation scheduler.
//!
//! Port sends and credit returns become events due at `now + latency`;
//! arbitrary closures can also be scheduled against the simulation context.

use std::fmt;

use crate::engine::Simulation;
use crate::error::KernelResult;
use crate::types::{NodeId, PortId};

/// A scheduled action run against the simulation context.
pub type Action = Box<dyn FnOnce(&mut Simulation) -> KernelResult<()> + Send>;

/// The payload of a scheduled event.
///
/// Port traffic and startups are queued by the kernel only; their contents
/// can be read but not built outside the crate, so every delivery on a link
/// has gone through `Simulation::send` or `Simulation::return_credit`.
pub enum EventPayload {
    /// Data arriving on a `DataIn` port.
    Deliver(Transfer<serde_json::Value>),

    /// Credits arriving on a `CreditIn` port.
    Credit(Transfer<u32>),

    /// First activation of a device after finalization.
    Startup(Activation),

    /// A timer set by a device through `DeviceContext::wake_after`.
    Wakeup { node: NodeId, tag: u64 },

    /// A user closure.
    Action(Action),
}

/// Something travelling from one bound port to its peer.
///
/// ```compile_fail
/// use archsim::event::{EventPayload, Transfer};
///
/// let forged = EventPayload::Deliver(Transfer { src: 0, dst: 1, value: serde_json::json!(1) });
/// ```
#[derive(Debug)]
pub struct Transfer<T> {
    pub(crate) src: PortId,
    pub(crate) dst: PortId,
    pub(crate) value: T,
}

impl<T> Transfer<T> {
    pub(crate) fn new(src: PortId, dst: PortId, value: T) -> Self {
        Self { src, dst, value }
    }

    pub fn src(&self) -> PortId {
        self.src
    }

    pub fn dst(&self) -> PortId {
        self.dst
    }

    pub fn value(&self) -> &T {
        &self.value
    }
}

/// The node whose device starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Activation(pub(crate) NodeId);

impl Activation {
    pub fn node(&self) -> NodeId {
        self.0
    }
}

impl EventPayload {
    /// Wraps a closure as an event payload.
    pub fn action<F>(f: F) -> Self
    where
        F: FnOnce(&mut Simulation) -> KernelResult<()> + Send + 'static,
    {
        EventPayload::Action(Box::new(f))
    }

    pub(crate) fn deliver(src: PortId, dst: PortId, data: serde_json::Value) -> Self {
        EventPayload::Deliver(Transfer::new(src, dst, data))
    }

    pub(crate) fn credit(src: PortId, dst: PortId, credits: u32) -> Self {
        EventPayload::Credit(Transfer::new(src, dst, credits))
    }

    pub(crate) fn startup(node: NodeId) -> Self {
        EventPayload::Startup(Activation(node))
    }

    /// Returns the destination port for port traffic.
    pub fn dst_port(&self) -> Option<PortId> {
        match self {
            EventPayload::Deliver(t) => Some(t.dst),
            EventPayload::Credit(t) => Some(t.dst),
            _ => None,
        }
    }

    /// Returns the source port for port traffic.
    pub fn src_port(&self) -> Option<PortId> {
        match self {
            EventPayload::Deliver(t) => Some(t.src),
            EventPayload::Credit(t) => Some(t.src),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Deliver(_) => "deliver",
            EventPayload::Credit(_) => "credit",
            EventPayload::Startup(_) => "startup",
            EventPayload::Wakeup { .. } => "wakeup",
            EventPayload::Action(_) => "action",
        }
    }
}

impl fmt::Debug for EventPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPayload::Deliver(t) => f
                .debug_struct("Deliver")
                .field("src", &t.src)
                .field("dst", &t.dst)
                .field("data", &t.value)
                .finish(),
            EventPayload::Credit(t) => f
                .debug_struct("Credit")
                .field("src", &t.src)
                .field("dst", &t.dst)
                .field("credits", &t.value)
                .finish(),
            EventPayload::Startup(a) => f.debug_tuple("Startup").field(&a.0).finish(),
            EventPayload::Wakeup { node, tag } => f
                .debug_struct("Wakeup")
                .field("node", node)
                .field("tag", tag)
                .finish(),
            EventPayload::Action(_) => f.write_str("Action(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_accessors() {
        let ev = EventPayload::deliver(1, 2, serde_json::json!({"addr": 64}));
        assert_eq!(ev.src_port(), Some(1));
        assert_eq!(ev.dst_port(), Some(2));
        assert_eq!(ev.kind(), "deliver");

        let ev = EventPayload::credit(3, 4, 2);
        assert_eq!(ev.dst_port(), Some(4));

        let ev = EventPayload::startup(7);
        assert_eq!(ev.dst_port(), None);
        assert_eq!(format!("{:?}", ev), "Startup(7)");
    }

    #[test]
    fn test_action_debug() {
        let ev = EventPayload::action(|_| Ok(()));
        assert_eq!(ev.kind(), "action");
        assert_eq!(format!("{:?}", ev), "Action(..)");
    }
}
