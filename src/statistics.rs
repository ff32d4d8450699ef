//! Per-node statistic sets.
//!
//! Every tree node owns a [`StatisticSet`]: named counters and histograms,
//! each with a description. Devices register them through
//! [`crate::DeviceContext`] and update them through the returned handles.
//! [`crate::Simulation::stats`] exports every non-empty set by node path.
//!
//! # Example
//!
//! ```
//! use archsim::statistics::StatisticSet;
//!
//! let mut set = StatisticSet::new("top.cpu0");
//! let retired = set.add_counter("total_inst_retired", "Number of retired instructions").unwrap();
//! let latency = set.add_histogram("load_latency", "Load latency in ticks", 0, 40, 10).unwrap();
//!
//! set.increment(retired, 3);
//! set.sample(latency, 12);
//! set.sample(latency, 90);
//!
//! assert_eq!(set.counter(retired).unwrap().value(), 3);
//! let hist = set.histogram(latency).unwrap();
//! assert_eq!(hist.regular_bins(), &[0, 1, 0, 0]);
//! assert_eq!(hist.overflow_bin(), 1);
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// How a counter's value is meant to be read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterBehavior {
    /// A running count of occurrences
    #[default]
    Normal,
    /// A quantity summed every cycle, e.g. queue occupancy
    Integral,
    /// The latest value written with `set`
    Latest,
}

/// A named 64-bit counter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    name: String,
    description: String,
    #[serde(default)]
    behavior: CounterBehavior,
    value: u64,
}

impl Counter {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            behavior: CounterBehavior::Normal,
            value: 0,
        }
    }

    pub fn with_behavior(mut self, behavior: CounterBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn behavior(&self) -> CounterBehavior {
        self.behavior
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// Adds `n`, saturating at `u64::MAX`.
    pub fn increment(&mut self, n: u64) {
        self.value = self.value.saturating_add(n);
    }

    pub fn set(&mut self, value: u64) {
        self.value = value;
    }
}

/// A fixed-range histogram with underflow and overflow bins.
///
/// `[lower, upper]` is split into `(upper - lower) / values_per_bin` regular
/// bins. A sample equal to `upper` lands in the last regular bin; samples
/// below `lower` or above `upper` go to the underflow or overflow bin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram {
    name: String,
    description: String,
    lower: u64,
    upper: u64,
    values_per_bin: u64,
    bins: Vec<u64>,
    underflow: u64,
    overflow: u64,
}

impl Histogram {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        lower: u64,
        upper: u64,
        values_per_bin: u64,
    ) -> KernelResult<Self> {
        let name = name.into();
        let invalid = |reason: String| KernelError::Validation {
            path: name.clone(),
            reason,
        };
        if upper <= lower {
            return Err(invalid(format!("upper bound {} must exceed lower bound {}", upper, lower)));
        }
        if values_per_bin == 0 {
            return Err(invalid("values_per_bin must be at least 1".to_string()));
        }
        if (upper - lower) % values_per_bin != 0 {
            return Err(invalid(format!(
                "range {}..={} is not a multiple of {} values per bin",
                lower, upper, values_per_bin
            )));
        }
        let num_bins = ((upper - lower) / values_per_bin) as usize;
        Ok(Self {
            name,
            description: description.into(),
            lower,
            upper,
            values_per_bin,
            bins: vec![0; num_bins],
            underflow: 0,
            overflow: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn sample(&mut self, value: u64) {
        if value < self.lower {
            self.underflow += 1;
        } else if value > self.upper {
            self.overflow += 1;
        } else {
            let idx = ((value - self.lower) / self.values_per_bin) as usize;
            let last = self.bins.len() - 1;
            self.bins[idx.min(last)] += 1;
        }
    }

    pub fn lower_value(&self) -> u64 {
        self.lower
    }

    pub fn upper_value(&self) -> u64 {
        self.upper
    }

    pub fn values_per_bin(&self) -> u64 {
        self.values_per_bin
    }

    /// Number of regular bins.
    pub fn num_bins(&self) -> usize {
        self.bins.len()
    }

    pub fn regular_bins(&self) -> &[u64] {
        &self.bins
    }

    pub fn underflow_bin(&self) -> u64 {
        self.underflow
    }

    pub fn overflow_bin(&self) -> u64 {
        self.overflow
    }

    /// Every bin in order: underflow, the regular bins, overflow.
    pub fn agg_values(&self) -> Vec<u64> {
        let mut all = Vec::with_capacity(self.bins.len() + 2);
        all.push(self.underflow);
        all.extend_from_slice(&self.bins);
        all.push(self.overflow);
        all
    }

    /// Samples taken, including under- and overflows.
    pub fn total(&self) -> u64 {
        self.underflow + self.overflow + self.bins.iter().sum::<u64>()
    }

    fn fraction(&self, n: u64) -> f64 {
        match self.total() {
            0 => 0.0,
            total => n as f64 / total as f64,
        }
    }

    pub fn underflow_probability(&self) -> f64 {
        self.fraction(self.underflow)
    }

    pub fn overflow_probability(&self) -> f64 {
        self.fraction(self.overflow)
    }

    /// Share of all samples in each regular bin.
    pub fn regular_bin_probabilities(&self) -> Vec<f64> {
        self.bins.iter().map(|&n| self.fraction(n)).collect()
    }

    /// Mean sample count of the regular bins.
    pub fn mean_bin_count(&self) -> f64 {
        self.bins.iter().sum::<u64>() as f64 / self.bins.len() as f64
    }

    /// Population standard deviation of the regular bin counts.
    pub fn standard_deviation(&self) -> f64 {
        let mean = self.mean_bin_count();
        let var = self
            .bins
            .iter()
            .map(|&n| {
                let d = n as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / self.bins.len() as f64;
        var.sqrt()
    }
}

/// Handle to a counter of one [`StatisticSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CounterHandle(usize);

/// Handle to a histogram of one [`StatisticSet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HistogramHandle(usize);

/// The counters and histograms of one node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticSet {
    /// Path of the owning node
    owner: String,
    counters: Vec<Counter>,
    histograms: Vec<Histogram>,
    #[serde(skip)]
    names: BTreeSet<String>,
}

impl StatisticSet {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..Default::default()
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty() && self.histograms.is_empty()
    }

    fn claim(&mut self, name: &str) -> KernelResult<()> {
        if !self.names.insert(name.to_string()) {
            return Err(KernelError::DuplicateName {
                parent: format!("{}.stats", self.owner),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub fn add_counter(&mut self, name: &str, description: &str) -> KernelResult<CounterHandle> {
        self.insert_counter(Counter::new(name, description))
    }

    /// Registers a prepared counter, e.g. one with a non-default behavior.
    pub fn insert_counter(&mut self, counter: Counter) -> KernelResult<CounterHandle> {
        self.claim(counter.name())?;
        self.counters.push(counter);
        Ok(CounterHandle(self.counters.len() - 1))
    }

    pub fn add_histogram(
        &mut self,
        name: &str,
        description: &str,
        lower: u64,
        upper: u64,
        values_per_bin: u64,
    ) -> KernelResult<HistogramHandle> {
        let hist = Histogram::new(name, description, lower, upper, values_per_bin).map_err(|e| match e {
            KernelError::Validation { reason, .. } => KernelError::Validation {
                path: format!("{}.stats.{}", self.owner, name),
                reason,
            },
            other => other,
        })?;
        self.claim(name)?;
        self.histograms.push(hist);
        Ok(HistogramHandle(self.histograms.len() - 1))
    }

    pub fn counter(&self, handle: CounterHandle) -> Option<&Counter> {
        self.counters.get(handle.0)
    }

    pub fn histogram(&self, handle: HistogramHandle) -> Option<&Histogram> {
        self.histograms.get(handle.0)
    }

    /// Adds `n` to a counter. Handles from another set are ignored.
    pub fn increment(&mut self, handle: CounterHandle, n: u64) {
        if let Some(c) = self.counters.get_mut(handle.0) {
            c.increment(n);
        }
    }

    pub fn set(&mut self, handle: CounterHandle, value: u64) {
        if let Some(c) = self.counters.get_mut(handle.0) {
            c.set(value);
        }
    }

    /// Records one sample. Handles from another set are ignored.
    pub fn sample(&mut self, handle: HistogramHandle, value: u64) {
        if let Some(h) = self.histograms.get_mut(handle.0) {
            h.sample(value);
        }
    }

    pub fn find_counter(&self, name: &str) -> Option<&Counter> {
        self.counters.iter().find(|c| c.name() == name)
    }

    pub fn find_histogram(&self, name: &str) -> Option<&Histogram> {
        self.histograms.iter().find(|h| h.name() == name)
    }

    /// Counters in registration order.
    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    /// Histograms in registration order.
    pub fn histograms(&self) -> &[Histogram] {
        &self.histograms
    }
}
