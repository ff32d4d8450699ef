//! A device that counts clock edges.

use crate::device::{Device, DeviceContext};
use crate::error::KernelResult;
use crate::params::{ParamSpec, ParameterSet};
use crate::statistics::CounterHandle;
use crate::types::Tick;

/// Counts the edges of its node's clock.
///
/// With `report_every` set to a non-zero value it also writes an `info`
/// line every that many cycles. The count is also kept in the node's
/// `total_cycle` statistic.
#[derive(Debug, Default)]
pub struct CycleCounter {
    cycles: u64,
    last_tick: Tick,
    report_every: u64,
    total_cycle: Option<CounterHandle>,
}

impl CycleCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Edges observed so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }
}

impl Device for CycleCounter {
    fn type_name(&self) -> &str {
        "CycleCounter"
    }

    fn params(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::new("report_every", 0u64).with_description("Cycles between two info lines, 0 for none")]
    }

    fn finalize(&mut self, params: &ParameterSet) -> KernelResult<()> {
        self.report_every = params.get_u64("report_every")?;
        Ok(())
    }

    fn startup(&mut self, ctx: &mut DeviceContext<'_>) -> KernelResult<()> {
        self.total_cycle = Some(ctx.add_counter("total_cycle", "Number of cycles elapsed")?);
        Ok(())
    }

    fn wants_cycles(&self) -> bool {
        true
    }

    fn on_cycle(&mut self, ctx: &mut DeviceContext<'_>, cycle: u64) -> KernelResult<()> {
        self.cycles += 1;
        self.last_tick = ctx.now();
        if let Some(counter) = self.total_cycle {
            ctx.increment(counter, 1)?;
        }
        if self.report_every > 0 && cycle % self.report_every == 0 {
            ctx.info(&format!("cycle {}", cycle))?;
        }
        Ok(())
    }

    fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "cycles": self.cycles,
            "last_tick": self.last_tick,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declares_report_param() {
        let mut counter = CycleCounter::new();
        let mut set = ParameterSet::new("top.counter");
        for spec in counter.params() {
            set.declare_spec(&spec).unwrap();
        }
        set.set("report_every", 10u64).unwrap();
        counter.finalize(&set).unwrap();
        assert_eq!(counter.report_every, 10);
        assert!(counter.wants_cycles());
        assert_eq!(counter.stats()["cycles"], 0);
    }
}
