//! A simple memory responder.

use std::collections::HashMap;

use crate::device::{Device, DeviceContext};
use crate::devices::{decode, encode, MemOp, MemReq, MemResp, MEM_REQ, MEM_RESP};
use crate::error::{KernelError, KernelResult};
use crate::params::{ParamSpec, ParameterSet};
use crate::port::PortSpec;
use crate::statistics::CounterHandle;
use crate::types::Tick;

/// A flat memory that answers every request after a fixed latency.
///
/// At startup it grants `queue_depth` request credits on `req_credit_out`,
/// and hands one credit back for every request it consumes. Accesses
/// outside `[base_addr, base_addr + size)` abort the run.
#[derive(Debug)]
pub struct SimpleMemory {
    latency: Tick,
    base_addr: u64,
    size: u64,
    queue_depth: u32,
    data: HashMap<u64, u64>,
    reads: u64,
    writes: u64,
    stat_reads: Option<CounterHandle>,
    stat_writes: Option<CounterHandle>,
}

impl SimpleMemory {
    /// Creates a memory whose responses take `latency` ticks.
    pub fn new(latency: Tick) -> Self {
        Self {
            latency,
            base_addr: 0,
            size: 0,
            queue_depth: 0,
            data: HashMap::new(),
            reads: 0,
            writes: 0,
            stat_reads: None,
            stat_writes: None,
        }
    }

    /// Reads a word directly, bypassing the ports.
    pub fn peek(&self, addr: u64) -> u64 {
        self.data.get(&addr).copied().unwrap_or(0)
    }

    fn access(&mut self, req: &MemReq) -> u64 {
        match req.op {
            MemOp::Read => {
                self.reads += 1;
                self.peek(req.addr)
            }
            MemOp::Write => {
                self.writes += 1;
                let value = req.value.unwrap_or(0);
                self.data.insert(req.addr, value);
                value
            }
        }
    }
}

impl Default for SimpleMemory {
    fn default() -> Self {
        Self::new(2)
    }
}

impl Device for SimpleMemory {
    fn type_name(&self) -> &str {
        "SimpleMemory"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::data_in("req_in", MEM_REQ),
            PortSpec::credit_out("req_credit_out").with_latency(1),
            PortSpec::data_out("resp_out", MEM_RESP).with_latency(self.latency),
        ]
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("base_addr", 0u64).with_description("Base address of the memory"),
            ParamSpec::new("size", 0x10000u64).with_description("Size of the memory in bytes"),
            ParamSpec::new("queue_depth", 4u64).with_description("Request credits granted at startup"),
        ]
    }

    fn finalize(&mut self, params: &ParameterSet) -> KernelResult<()> {
        self.base_addr = params.get_u64("base_addr")?;
        self.size = params.get_u64("size")?;
        let depth = params.get_u64("queue_depth")?;
        self.queue_depth = u32::try_from(depth).map_err(|_| KernelError::Validation {
            path: format!("{}.params.queue_depth", params.owner()),
            reason: "does not fit in 32 bits".to_string(),
        })?;
        Ok(())
    }

    fn startup(&mut self, ctx: &mut DeviceContext<'_>) -> KernelResult<()> {
        self.stat_reads = Some(ctx.add_counter("reads", "Number of read requests served")?);
        self.stat_writes = Some(ctx.add_counter("writes", "Number of write requests served")?);
        ctx.return_credit("req_credit_out", self.queue_depth)
    }

    fn on_data(&mut self, ctx: &mut DeviceContext<'_>, port: &str, data: serde_json::Value) -> KernelResult<()> {
        if port != "req_in" {
            return Ok(());
        }
        let req: MemReq = decode(&ctx.path(), data)?;
        let end = self.base_addr.saturating_add(self.size);
        if req.addr < self.base_addr || req.addr >= end {
            return Err(KernelError::device(
                ctx.path(),
                format!("invalid memory access at {:#x}", req.addr),
            ));
        }
        ctx.debug(&format!("{:?} {:#x}", req.op, req.addr))?;
        let value = self.access(&req);
        let counter = match req.op {
            MemOp::Read => self.stat_reads,
            MemOp::Write => self.stat_writes,
        };
        if let Some(counter) = counter {
            ctx.increment(counter, 1)?;
        }
        let resp = MemResp {
            id: req.id,
            op: req.op,
            addr: req.addr,
            value,
        };
        let payload = encode(&ctx.path(), &resp)?;
        ctx.send("resp_out", payload)?;
        ctx.return_credit("req_credit_out", 1)
    }

    fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "reads": self.reads,
            "writes": self.writes,
            "resident_words": self.data.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access() {
        let mut mem = SimpleMemory::default();
        let write = MemReq {
            id: 0,
            cpuid: 0,
            op: MemOp::Write,
            addr: 0x80,
            value: Some(5),
        };
        assert_eq!(mem.access(&write), 5);
        let read = MemReq {
            op: MemOp::Read,
            value: None,
            ..write.clone()
        };
        assert_eq!(mem.access(&read), 5);
        assert_eq!(mem.peek(0x100), 0);
        assert_eq!(mem.stats()["reads"], 1);
        assert_eq!(mem.stats()["writes"], 1);
    }

    #[test]
    fn test_response_latency_follows_constructor() {
        let ports = SimpleMemory::new(7).ports();
        let resp = ports.iter().find(|p| p.name == "resp_out").unwrap();
        assert_eq!(resp.latency, 7);
    }
}
