//! Statistics collection and export.
//!
//! A [`SimulationStats`] snapshot is taken from a [`crate::Simulation`] with
//! [`crate::Simulation::stats`] and can be exported as JSON or CSV.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::statistics::StatisticSet;
use crate::types::Tick;

/// Aggregate statistics for a simulation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SimulationStats {
    pub metadata: SimulationMetadata,
    pub run: RunStats,
    /// Clocks in registration order
    pub clocks: Vec<ClockStats>,
    /// Flow-controlled links, by producer port path
    pub links: Vec<LinkStats>,
    /// Device-specific statistics, by node path
    pub devices: BTreeMap<String, serde_json::Value>,
    /// Registered counters and histograms, by node path
    #[serde(default)]
    pub statistics: BTreeMap<String, StatisticSet>,
    pub timing: TimingStats,
}

/// Metadata about the simulation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SimulationMetadata {
    /// Name of the root node
    pub name: String,
    pub version: String,
    /// Lifecycle phase when the snapshot was taken
    pub phase: String,
    pub node_count: usize,
    pub port_count: usize,
    /// Configuration file used, if any
    pub config_file: Option<String>,
}

/// Scheduler counters, accumulated across runs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub final_tick: Tick,
    pub runs: u64,
    pub events_scheduled: u64,
    pub events_executed: u64,
    pub edges_delivered: u64,
    pub pending_events: usize,
    pub peak_queue_depth: usize,
}

/// One clock domain.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClockStats {
    pub name: String,
    pub period: Tick,
    pub cycles: u64,
}

/// Credit bookkeeping of one flow-controlled link.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    /// Producer `DataOut` port path
    pub port: String,
    /// Consumer `DataIn` port path
    pub peer: Option<String>,
    pub initial_credits: u32,
    pub available: u32,
    pub sent: u64,
    pub returned: u64,
    /// Sends refused for lack of credit
    pub refused: u64,
}

impl LinkStats {
    /// `sent <= initial_credits + returned`.
    pub fn is_safe(&self) -> bool {
        self.sent <= self.initial_credits as u64 + self.returned
    }
}

/// Wall-clock statistics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TimingStats {
    pub total_wall_time_ms: f64,
    pub ticks_per_second: f64,
    pub events_per_second: f64,
}

impl SimulationStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates timing statistics based on wall clock time.
    pub fn compute_timing(&mut self, wall_time_ms: f64) {
        self.timing.total_wall_time_ms = wall_time_ms;

        if wall_time_ms > 0.0 {
            let seconds = wall_time_ms / 1000.0;
            self.timing.ticks_per_second = self.run.final_tick as f64 / seconds;
            self.timing.events_per_second = self.run.events_executed as f64 / seconds;
        }
    }

    /// True if every link respects its credit bound.
    pub fn links_safe(&self) -> bool {
        self.links.iter().all(LinkStats::is_safe)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let json = self
            .to_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Exports summary statistics to CSV.
    pub fn to_csv(&self) -> String {
        let mut csv = String::new();
        csv.push_str("metric,value\n");
        csv.push_str(&format!("final_tick,{}\n", self.run.final_tick));
        csv.push_str(&format!("runs,{}\n", self.run.runs));
        csv.push_str(&format!("events_scheduled,{}\n", self.run.events_scheduled));
        csv.push_str(&format!("events_executed,{}\n", self.run.events_executed));
        csv.push_str(&format!("edges_delivered,{}\n", self.run.edges_delivered));
        csv.push_str(&format!("peak_queue_depth,{}\n", self.run.peak_queue_depth));
        for clock in &self.clocks {
            csv.push_str(&format!("clock.{}.cycles,{}\n", clock.name, clock.cycles));
        }
        for (path, set) in &self.statistics {
            for c in set.counters() {
                csv.push_str(&format!("{}.{},{}\n", path, c.name(), c.value()));
            }
            for h in set.histograms() {
                csv.push_str(&format!("{}.{}.total,{}\n", path, h.name(), h.total()));
                csv.push_str(&format!("{}.{}.mean_bin_count,{:.4}\n", path, h.name(), h.mean_bin_count()));
            }
        }
        csv.push_str(&format!("wall_time_ms,{:.2}\n", self.timing.total_wall_time_ms));
        csv
    }

    pub fn to_csv_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        std::fs::write(path, self.to_csv())
    }

    /// Exports per-link credit statistics to CSV.
    pub fn links_to_csv(&self) -> String {
        let mut csv = String::new();
        csv.push_str("port,peer,initial_credits,available,sent,returned,refused\n");
        for link in &self.links {
            csv.push_str(&format!(
                "{},{},{},{},{},{},{}\n",
                link.port,
                link.peer.as_deref().unwrap_or_default(),
                link.initial_credits,
                link.available,
                link.sent,
                link.returned,
                link.refused,
            ));
        }
        csv
    }

    /// Writes a human-readable summary.
    pub fn write_summary<W: Write>(&self, mut w: W) -> std::io::Result<()> {
        writeln!(w, "=== Simulation Statistics ===")?;
        if !self.metadata.name.is_empty() {
            writeln!(w, "Name: {}", self.metadata.name)?;
        }
        writeln!(w, "Phase: {}", self.metadata.phase)?;
        writeln!(w)?;

        writeln!(w, "--- Scheduler ---")?;
        writeln!(w, "Final tick: {}", self.run.final_tick)?;
        writeln!(w, "Events executed: {}", self.run.events_executed)?;
        writeln!(w, "Clock edges: {}", self.run.edges_delivered)?;
        writeln!(w, "Pending events: {}", self.run.pending_events)?;
        writeln!(w)?;

        writeln!(w, "--- Clocks ---")?;
        for clock in &self.clocks {
            writeln!(w, "{} (period {}): {} cycles", clock.name, clock.period, clock.cycles)?;
        }

        if !self.statistics.is_empty() {
            writeln!(w)?;
            writeln!(w, "--- Statistics ---")?;
            for (path, set) in &self.statistics {
                for c in set.counters() {
                    writeln!(w, "{}.{}: {} ({})", path, c.name(), c.value(), c.description())?;
                }
                for h in set.histograms() {
                    writeln!(
                        w,
                        "{}.{}: {} samples, bins {:?}, underflow {}, overflow {}, stddev {:.3}",
                        path,
                        h.name(),
                        h.total(),
                        h.regular_bins(),
                        h.underflow_bin(),
                        h.overflow_bin(),
                        h.standard_deviation()
                    )?;
                }
            }
        }

        if !self.links.is_empty() {
            writeln!(w)?;
            writeln!(w, "--- Links ---")?;
            for link in &self.links {
                writeln!(
                    w,
                    "{}: sent {}, returned {}, initial {}, refused {}",
                    link.port, link.sent, link.returned, link.initial_credits, link.refused
                )?;
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> String {
        let mut buf = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.write_summary(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// A simple timer for measuring wall-clock time.
#[derive(Debug)]
pub struct Timer {
    start: std::time::Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SimulationStats {
        let mut stats = SimulationStats::new();
        stats.metadata.name = "top".to_string();
        stats.run.final_tick = 100;
        stats.run.events_executed = 40;
        stats.clocks.push(ClockStats {
            name: "core".to_string(),
            period: 1,
            cycles: 100,
        });
        stats.links.push(LinkStats {
            port: "top.gen.ports.req_out".to_string(),
            peer: Some("top.mem.ports.req_in".to_string()),
            initial_credits: 3,
            available: 1,
            sent: 5,
            returned: 3,
            refused: 1,
        });
        stats
    }

    #[test]
    fn test_json_export() {
        let json = sample().to_json().unwrap();
        let back: SimulationStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run.final_tick, 100);
        assert_eq!(back.links[0].sent, 5);
    }

    #[test]
    fn test_csv_export() {
        let stats = sample();
        let csv = stats.to_csv();
        assert!(csv.starts_with("metric,value\n"));
        assert!(csv.contains("final_tick,100\n"));
        assert!(csv.contains("clock.core.cycles,100\n"));

        let links = stats.links_to_csv();
        assert_eq!(links.lines().count(), 2);
        assert!(links.contains("top.gen.ports.req_out,top.mem.ports.req_in,3,1,5,3,1"));
    }

    #[test]
    fn test_link_safety() {
        let mut stats = sample();
        assert!(stats.links_safe());
        stats.links[0].sent = 7;
        assert!(!stats.links_safe());
    }

    #[test]
    fn test_timing() {
        let mut stats = sample();
        stats.compute_timing(1000.0);
        assert_eq!(stats.timing.ticks_per_second, 100.0);
        assert_eq!(stats.timing.events_per_second, 40.0);
    }

    #[test]
    fn test_summary() {
        let text = sample().summary();
        assert!(text.contains("Final tick: 100"));
        assert!(text.contains("core (period 1): 100 cycles"));
    }

    #[test]
    fn test_statistics_export() {
        let mut stats = sample();
        let mut set = StatisticSet::new("top.cpu0");
        let c = set.add_counter("total_cycle", "Number of cycles elapsed").unwrap();
        let h = set.add_histogram("lat", "Latency", 0, 4, 2).unwrap();
        set.increment(c, 12);
        set.sample(h, 1);
        stats.statistics.insert("top.cpu0".to_string(), set);

        let csv = stats.to_csv();
        assert!(csv.contains("top.cpu0.total_cycle,12\n"));
        assert!(csv.contains("top.cpu0.lat.total,1\n"));
        assert!(stats.summary().contains("top.cpu0.total_cycle: 12 (Number of cycles elapsed)"));

        let back: SimulationStats = serde_json::from_str(&stats.to_json().unwrap()).unwrap();
        let set = &back.statistics["top.cpu0"];
        assert_eq!(set.find_counter("total_cycle").unwrap().value(), 12);
        assert_eq!(set.find_histogram("lat").unwrap().regular_bins(), &[1, 0]);
    }

    #[test]
    fn test_csv_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.csv");
        sample().to_csv_file(&path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("runs,0"));
    }
}
