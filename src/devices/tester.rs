//! Random memory traffic generator.

use std::collections::{BTreeMap, HashMap};

use crate::device::{Device, DeviceContext};
use crate::devices::{decode, encode, MemOp, MemReq, MemResp, XorShift64, MEM_REQ, MEM_RESP};
use crate::error::{KernelError, KernelResult};
use crate::params::{ParamSpec, ParameterSet};
use crate::port::PortSpec;
use crate::statistics::{CounterHandle, HistogramHandle};
use crate::types::Tick;

const RETRY: u64 = 1;

/// Issues random read/write requests to a memory and checks the replies.
///
/// Requests go out on `req_out`, which is flow controlled by credits
/// arriving on `req_credit_in`. Responses arrive on `resp_in`. Reads are
/// checked against a shadow copy of everything this generator wrote.
///
/// Each attempt generates a request with probability `req_gen_prob`
/// percent; a failed attempt retries after `1..=req_stride` ticks.
#[derive(Debug)]
pub struct TrafficGenerator {
    initial_credits: u32,
    base_addr: u64,
    size: u64,
    line_size: u64,
    cpuid: u64,
    remaining: u64,
    req_gen_prob: u64,
    req_stride: u64,
    req_queue_size: u64,
    rng: XorShift64,
    next_id: u64,
    /// Request id -> (request, expected read value, issue tick)
    outstanding: BTreeMap<u64, (MemReq, u64, Tick)>,
    shadow: HashMap<u64, u64>,
    retry_pending: bool,
    sent: u64,
    completed: u64,
    retries: u64,
    mismatches: u64,
    stat_completed: Option<CounterHandle>,
    stat_latency: Option<HistogramHandle>,
}

/// Round-trip latencies beyond this many ticks land in the overflow bin.
const LATENCY_RANGE: Tick = 64;

impl TrafficGenerator {
    pub fn new() -> Self {
        Self {
            initial_credits: 0,
            base_addr: 0,
            size: 0,
            line_size: 8,
            cpuid: 0,
            remaining: 0,
            req_gen_prob: 100,
            req_stride: 1,
            req_queue_size: 1,
            rng: XorShift64::new(0),
            next_id: 0,
            outstanding: BTreeMap::new(),
            shadow: HashMap::new(),
            retry_pending: false,
            sent: 0,
            completed: 0,
            retries: 0,
            mismatches: 0,
            stat_completed: None,
            stat_latency: None,
        }
    }

    /// Starts with `n` request credits instead of waiting for the memory to grant them.
    pub fn with_initial_credits(mut self, n: u32) -> Self {
        self.initial_credits = n;
        self
    }

    /// True once every request was issued and answered.
    pub fn is_done(&self) -> bool {
        self.remaining == 0 && self.outstanding.is_empty()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn mismatches(&self) -> u64 {
        self.mismatches
    }

    fn generate(&mut self) -> (MemReq, u64) {
        let line = self.rng.below(self.size) & !(self.line_size - 1);
        let addr = self.base_addr + line;
        let id = self.next_id;
        self.next_id += 1;
        if self.rng.below(2) == 0 {
            let expected = self.shadow.get(&addr).copied().unwrap_or(0);
            let req = MemReq {
                id,
                cpuid: self.cpuid,
                op: MemOp::Read,
                addr,
                value: None,
            };
            (req, expected)
        } else {
            let value = self.rng.next_u64();
            self.shadow.insert(addr, value);
            let req = MemReq {
                id,
                cpuid: self.cpuid,
                op: MemOp::Write,
                addr,
                value: Some(value),
            };
            (req, value)
        }
    }

    fn try_send(&mut self, ctx: &mut DeviceContext<'_>) -> KernelResult<()> {
        while self.remaining > 0
            && (self.outstanding.len() as u64) < self.req_queue_size
            && ctx.has_credit("req_out")
        {
            if self.rng.below(100) >= self.req_gen_prob {
                if !self.retry_pending {
                    self.retry_pending = true;
                    self.retries += 1;
                    let delay = self.rng.below(self.req_stride) + 1;
                    ctx.wake_after(delay, RETRY)?;
                }
                return Ok(());
            }
            let (req, expected) = self.generate();
            let payload = encode(&ctx.path(), &req)?;
            ctx.info(&format!("send req {}", payload))?;
            ctx.send("req_out", payload)?;
            self.outstanding.insert(req.id, (req, expected, ctx.now()));
            self.remaining -= 1;
            self.sent += 1;
        }
        Ok(())
    }
}

impl Default for TrafficGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for TrafficGenerator {
    fn type_name(&self) -> &str {
        "TrafficGenerator"
    }

    fn ports(&self) -> Vec<PortSpec> {
        vec![
            PortSpec::data_out("req_out", MEM_REQ)
                .with_latency(1)
                .with_credits(self.initial_credits, "req_credit_in"),
            PortSpec::credit_in("req_credit_in"),
            PortSpec::data_in("resp_in", MEM_RESP),
        ]
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("base_addr", 0u64).with_description("Base address of the region to test"),
            ParamSpec::new("size", 0x10000u64).with_description("Size of the region to test"),
            ParamSpec::new("line_size", 64u64).with_description("Line size, a power of two"),
            ParamSpec::new("cpuid", 0u64),
            ParamSpec::new("num_iters", 100u64).with_description("Number of requests to issue"),
            ParamSpec::new("seed", 114514u64),
            ParamSpec::new("req_stride", 5u64).with_description("Maximum ticks between two attempts"),
            ParamSpec::new("req_gen_prob", 100u64).with_description("Probability of generating a request, in %"),
            ParamSpec::new("req_queue_size", 32u64).with_description("Maximum outstanding requests"),
        ]
    }

    fn finalize(&mut self, params: &ParameterSet) -> KernelResult<()> {
        self.base_addr = params.get_u64("base_addr")?;
        self.size = params.get_u64("size")?;
        self.line_size = params.get_u64("line_size")?;
        self.cpuid = params.get_u64("cpuid")?;
        self.remaining = params.get_u64("num_iters")?;
        self.req_stride = params.get_u64("req_stride")?;
        self.req_gen_prob = params.get_u64("req_gen_prob")?;
        self.req_queue_size = params.get_u64("req_queue_size")?;
        self.rng = XorShift64::new(params.get_u64("seed")?);

        let invalid = |name: &str, reason: &str| KernelError::Validation {
            path: format!("{}.params.{}", params.owner(), name),
            reason: reason.to_string(),
        };
        if !self.line_size.is_power_of_two() {
            return Err(invalid("line_size", "must be a power of two"));
        }
        if self.size < self.line_size {
            return Err(invalid("size", "must cover at least one line"));
        }
        if self.req_gen_prob == 0 || self.req_gen_prob > 100 {
            return Err(invalid("req_gen_prob", "must be within 1..=100"));
        }
        if self.req_stride == 0 {
            return Err(invalid("req_stride", "must be at least 1"));
        }
        if self.req_queue_size == 0 {
            return Err(invalid("req_queue_size", "must be at least 1"));
        }
        Ok(())
    }

    fn startup(&mut self, ctx: &mut DeviceContext<'_>) -> KernelResult<()> {
        self.stat_completed = Some(ctx.add_counter("requests_completed", "Number of answered requests")?);
        self.stat_latency = Some(ctx.add_histogram(
            "request_latency",
            "Ticks from issue to response",
            0,
            LATENCY_RANGE,
            4,
        )?);
        ctx.debug(&format!("starting, {} requests to issue", self.remaining))?;
        self.try_send(ctx)
    }

    fn on_data(&mut self, ctx: &mut DeviceContext<'_>, port: &str, data: serde_json::Value) -> KernelResult<()> {
        if port != "resp_in" {
            return Ok(());
        }
        let resp: MemResp = decode(&ctx.path(), data)?;
        let Some((req, expected, issued)) = self.outstanding.remove(&resp.id) else {
            return Err(KernelError::device(
                ctx.path(),
                format!("response to unknown request {}", resp.id),
            ));
        };
        if req.op == MemOp::Read && resp.value != expected {
            self.mismatches += 1;
            ctx.info(&format!(
                "read mismatch at {:#x}: expected {:#x}, got {:#x}",
                req.addr, expected, resp.value
            ))?;
        }
        self.completed += 1;
        if let Some(counter) = self.stat_completed {
            ctx.increment(counter, 1)?;
        }
        if let Some(latency) = self.stat_latency {
            let elapsed = ctx.now() - issued;
            ctx.sample(latency, elapsed)?;
        }
        self.try_send(ctx)
    }

    fn on_credit(&mut self, ctx: &mut DeviceContext<'_>, _port: &str, _credits: u32) -> KernelResult<()> {
        self.try_send(ctx)
    }

    fn on_wakeup(&mut self, ctx: &mut DeviceContext<'_>, tag: u64) -> KernelResult<()> {
        if tag == RETRY {
            self.retry_pending = false;
            self.try_send(ctx)?;
        }
        Ok(())
    }

    fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "sent": self.sent,
            "completed": self.completed,
            "outstanding": self.outstanding.len(),
            "retries": self.retries,
            "mismatches": self.mismatches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(overrides: &[(&str, u64)]) -> ParameterSet {
        let gen = TrafficGenerator::new();
        let mut set = ParameterSet::new("top.gen");
        for spec in gen.params() {
            set.declare_spec(&spec).unwrap();
        }
        for (name, value) in overrides {
            set.set(name, *value).unwrap();
        }
        set.lock();
        set
    }

    #[test]
    fn test_finalize_reads_params() {
        let mut gen = TrafficGenerator::new();
        gen.finalize(&params(&[("num_iters", 7), ("seed", 1)])).unwrap();
        assert_eq!(gen.remaining, 7);
        assert!(!gen.is_done());
    }

    #[test]
    fn test_finalize_rejects_bad_params() {
        let mut gen = TrafficGenerator::new();
        let err = gen.finalize(&params(&[("line_size", 48)])).unwrap_err();
        assert!(matches!(err, KernelError::Validation { ref path, .. } if path == "top.gen.params.line_size"));
        assert!(gen.finalize(&params(&[("req_gen_prob", 0)])).is_err());
    }

    #[test]
    fn test_generated_addresses_are_aligned_and_in_range() {
        let mut gen = TrafficGenerator::new();
        gen.finalize(&params(&[("base_addr", 0x1000), ("size", 0x400)])).unwrap();
        for _ in 0..200 {
            let (req, _) = gen.generate();
            assert_eq!(req.addr % 64, 0);
            assert!(req.addr >= 0x1000 && req.addr < 0x1400);
        }
    }

    #[test]
    fn test_shadow_tracks_writes() {
        let mut gen = TrafficGenerator::new();
        gen.finalize(&params(&[("size", 64)])).unwrap();
        // A single line: every read must expect the last write.
        let mut last = 0;
        for _ in 0..50 {
            let (req, expected) = gen.generate();
            match req.op {
                MemOp::Write => last = req.value.unwrap(),
                MemOp::Read => assert_eq!(expected, last),
            }
        }
    }

    #[test]
    fn test_ports_declared() {
        let ports = TrafficGenerator::new().with_initial_credits(3).ports();
        assert_eq!(ports.len(), 3);
        assert_eq!(ports[0].initial_credits, Some(3));
        assert_eq!(ports[0].credit_port.as_deref(), Some("req_credit_in"));
    }
}
