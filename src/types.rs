//! Core type definitions for the simulation kernel.
//!
//! This module defines the fundamental identifiers used throughout the kernel.

/// Simulation time unit: one scheduler tick.
///
/// All events and clock edges use the same `Tick` representation,
/// giving every clock domain a shared, totally ordered timeline.
pub type Tick = u64;

/// Unique identifier for a node in the component tree.
///
/// Identifiers are never reused within one `Simulation`, even after a
/// subtree is detached.
pub type NodeId = u64;

/// Unique identifier for a port.
pub type PortId = u64;

/// Identifier of a clock registered with the scheduler.
pub type ClockId = u32;

/// Identifier of an attached tap.
pub type TapId = u64;

/// Monotonic insertion sequence number of a scheduled event.
pub type EventSeq = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_aliases() {
        let tick: Tick = 1000;
        let node_id: NodeId = 42;
        let port_id: PortId = 7;
        let clock_id: ClockId = 1;

        assert_eq!(tick, 1000);
        assert_eq!(node_id, 42);
        assert_eq!(port_id, 7);
        assert_eq!(clock_id, 1);
    }
}
