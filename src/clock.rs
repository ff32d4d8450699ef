//! Clock domains.
//!
//! A clock is a named time base expressed as a period in scheduler ticks.
//! Its frequency relative to the scheduler's global tick is `1 / period`.
//! Clocks never advance on their own: the scheduler delivers each edge
//! (see [`crate::scheduler::Scheduler`]), and the local cycle counter counts
//! delivered edges.

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::types::Tick;

/// A named clock domain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clock {
    name: String,
    period: Tick,
    #[serde(skip)]
    cycle: u64,
}

impl Clock {
    /// Creates a clock with an edge every `period` ticks.
    pub fn new(name: impl Into<String>, period: Tick) -> KernelResult<Self> {
        let name = name.into();
        if period == 0 {
            return Err(KernelError::Validation {
                path: name,
                reason: "clock period must be at least one tick".to_string(),
            });
        }
        Ok(Self {
            name,
            period,
            cycle: 0,
        })
    }

    /// Derives a clock from a frequency, given the scheduler's base frequency.
    ///
    /// The base frequency must be an integer multiple of `freq`.
    pub fn from_frequency(name: impl Into<String>, freq: u64, base_freq: u64) -> KernelResult<Self> {
        let name = name.into();
        if freq == 0 || base_freq % freq != 0 {
            return Err(KernelError::Validation {
                path: name,
                reason: format!(
                    "frequency {} does not divide the scheduler frequency {}",
                    freq, base_freq
                ),
            });
        }
        Self::new(name, base_freq / freq)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ticks between two edges.
    pub fn period(&self) -> Tick {
        self.period
    }

    /// Number of edges delivered so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Frequency relative to the scheduler tick.
    pub fn frequency_ratio(&self) -> f64 {
        1.0 / self.period as f64
    }

    /// First edge strictly after `tick`.
    #[inline]
    pub fn next_edge_after(&self, tick: Tick) -> Tick {
        (tick / self.period + 1) * self.period
    }

    /// Converts a number of cycles of this clock to ticks.
    #[inline]
    pub fn cycles_to_ticks(&self, cycles: u64) -> Tick {
        cycles * self.period
    }

    pub(crate) fn advance(&mut self) {
        self.cycle += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_creation() {
        let clk = Clock::new("core", 2).unwrap();
        assert_eq!(clk.name(), "core");
        assert_eq!(clk.period(), 2);
        assert_eq!(clk.cycle(), 0);
        assert_eq!(clk.frequency_ratio(), 0.5);
    }

    #[test]
    fn test_zero_period_rejected() {
        assert!(Clock::new("bad", 0).is_err());
    }

    #[test]
    fn test_from_frequency() {
        let clk = Clock::from_frequency("mem", 250, 1000).unwrap();
        assert_eq!(clk.period(), 4);
        assert!(Clock::from_frequency("odd", 300, 1000).is_err());
        assert!(Clock::from_frequency("zero", 0, 1000).is_err());
    }

    #[test]
    fn test_edges() {
        let clk = Clock::new("c", 10).unwrap();
        assert_eq!(clk.next_edge_after(0), 10);
        assert_eq!(clk.next_edge_after(9), 10);
        assert_eq!(clk.next_edge_after(10), 20);
        assert_eq!(clk.cycles_to_ticks(3), 30);
    }
}
