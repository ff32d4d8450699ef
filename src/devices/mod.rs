//! Built-in devices.
//!
//! These devices are small but complete models, used by the demos, the
//! integration tests and the benchmarks, and as references for writing
//! custom devices.
//!
//! # Available Devices
//!
//! - [`TrafficGenerator`] - Issues random, credit-limited memory requests
//! - [`SimpleMemory`] - Answers memory requests and returns request credits
//! - [`CycleCounter`] - Counts the edges of its clock

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

pub mod counter;
pub mod memory;
pub mod tester;

pub use counter::CycleCounter;
pub use memory::SimpleMemory;
pub use tester::TrafficGenerator;

/// Payload type tag of memory requests.
pub const MEM_REQ: &str = "MemReq";

/// Payload type tag of memory responses.
pub const MEM_RESP: &str = "MemResp";

/// Kind of a memory access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemOp {
    Read,
    Write,
}

/// A memory request, carried as JSON on `MemReq` ports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemReq {
    pub id: u64,
    #[serde(default)]
    pub cpuid: u64,
    pub op: MemOp,
    pub addr: u64,
    /// Data to store (writes only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
}

/// A memory response, carried as JSON on `MemResp` ports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemResp {
    pub id: u64,
    pub op: MemOp,
    pub addr: u64,
    /// Data read, or the data written
    pub value: u64,
}

pub(crate) fn encode<T: Serialize>(node: &str, value: &T) -> KernelResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| KernelError::device(node, e.to_string()))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(node: &str, value: serde_json::Value) -> KernelResult<T> {
    serde_json::from_value(value).map_err(|e| KernelError::device(node, format!("malformed payload: {}", e)))
}

/// Deterministic pseudo-random source (xorshift64).
#[derive(Clone, Debug)]
pub(crate) struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0xDEADBEEF } else { seed },
        }
    }

    pub(crate) fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform value in `0..bound` (`bound` must be non-zero).
    pub(crate) fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}
