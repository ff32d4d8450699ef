//! Configuration system.
//!
//! A simulation can be described declaratively in YAML or JSON and built
//! against a [`DeviceRegistry`].
//!
//! # Configuration File Structure
//!
//! ```yaml
//! simulation:
//!   name: top
//!   max_ticks: 1000
//!   log_level: info
//!
//! clocks:
//!   - name: core
//!     period: 1
//!     node: top
//!
//! nodes:
//!   - path: top.gen
//!     device: TrafficGenerator
//!     params:
//!       num_iters: 50
//!   - path: top.mem
//!     device: SimpleMemory
//!     attrs:
//!       latency: "3"
//!
//! bindings:
//!   - out: top.gen.ports.req_out
//!     in: top.mem.ports.req_in
//!
//! taps:
//!   - target: top
//!     channel: info
//!     file: run.log
//!
//! workloads:
//!   - name: hello
//!     executable: /root/hello_riscv
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::clock::Clock;
use crate::engine::Simulation;
use crate::error::KernelError;
use crate::params::ParamValue;
use crate::process::ProcessDescriptor;
use crate::registry::DeviceRegistry;
use crate::tap::{TapChannel, TapSink};
use crate::types::Tick;

/// Errors that can occur while loading or building a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown file format: {0}")]
    UnknownFormat(String),

    #[error("Unknown device type '{0}'")]
    UnknownDevice(String),

    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Global simulation parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Name of the root node
    #[serde(default = "default_root_name")]
    pub name: String,

    /// Tick budget of a run; unbounded when absent
    #[serde(default)]
    pub max_ticks: Option<Tick>,

    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Attach a `trace` tap on the root, written to stdout
    #[serde(default)]
    pub trace: bool,
}

fn default_root_name() -> String {
    "top".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            name: default_root_name(),
            max_ticks: None,
            log_level: default_log_level(),
            trace: false,
        }
    }
}

/// A clock declared on a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockConfig {
    pub name: String,
    /// Ticks between two edges
    pub period: Tick,
    /// Path of the node declaring the clock; the root when absent
    #[serde(default)]
    pub node: Option<String>,
}

/// A tree node, optionally with a device.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Dotted path; the parent must be the root or listed earlier
    pub path: String,

    /// Registered device type name
    #[serde(default)]
    pub device: Option<String>,

    /// Construction attributes passed to the device factory
    #[serde(default)]
    pub attrs: HashMap<String, String>,

    /// Parameter values applied when the tree enters Configuring
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
}

/// A port binding, producer first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingConfig {
    pub out: String,
    #[serde(rename = "in")]
    pub input: String,
}

/// A tap on a node or port path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapConfig {
    pub target: String,
    pub channel: TapChannel,
    /// Output file; stdout when absent
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Complete simulation configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub simulation: SimulationParams,

    #[serde(default)]
    pub clocks: Vec<ClockConfig>,

    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    #[serde(default)]
    pub bindings: Vec<BindingConfig>,

    #[serde(default)]
    pub taps: Vec<TapConfig>,

    #[serde(default)]
    pub workloads: Vec<ProcessDescriptor>,
}

fn parent_path(path: &str) -> Option<&str> {
    path.rsplit_once('.').map(|(parent, _)| parent)
}

impl SimConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        let config: SimConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: SimConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a file, auto-detecting format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext.to_lowercase().as_str() {
            "yaml" | "yml" => Self::from_yaml_file(path),
            "json" => Self::from_json_file(path),
            _ => Err(ConfigError::UnknownFormat(ext.to_string())),
        }
    }

    /// Validates the structure of the configuration.
    ///
    /// Port names depend on the devices and are checked when building.
    pub fn validate(&self) -> ConfigResult<()> {
        let root = self.simulation.name.as_str();
        if root.is_empty() || root.contains('.') {
            return Err(ConfigError::Validation(format!("invalid root name '{}'", root)));
        }

        let mut paths: HashSet<&str> = HashSet::new();
        paths.insert(root);
        for node in &self.nodes {
            if node.path == root {
                continue;
            }
            let parent = parent_path(&node.path).ok_or_else(|| {
                ConfigError::Validation(format!("node '{}' is not below the root '{}'", node.path, root))
            })?;
            if !paths.contains(parent) {
                return Err(ConfigError::Validation(format!(
                    "parent of node '{}' must be the root or listed before it",
                    node.path
                )));
            }
            if !paths.insert(node.path.as_str()) {
                return Err(ConfigError::Validation(format!("duplicate node path: {}", node.path)));
            }
        }

        let mut clock_names = HashSet::new();
        let mut clocked_nodes = HashSet::new();
        for clock in &self.clocks {
            if clock.period == 0 {
                return Err(ConfigError::Validation(format!(
                    "clock '{}' must have a non-zero period",
                    clock.name
                )));
            }
            if !clock_names.insert(clock.name.as_str()) {
                return Err(ConfigError::Validation(format!("duplicate clock name: {}", clock.name)));
            }
            let node = clock.node.as_deref().unwrap_or(root);
            if !paths.contains(node) {
                return Err(ConfigError::Validation(format!(
                    "clock '{}' references non-existent node: {}",
                    clock.name, node
                )));
            }
            if !clocked_nodes.insert(node) {
                return Err(ConfigError::Validation(format!("node '{}' declares two clocks", node)));
            }
        }

        for b in &self.bindings {
            for port in [&b.out, &b.input] {
                let owner = port.rsplit_once(".ports.").map(|(n, _)| n);
                if !owner.map(|n| paths.contains(n)).unwrap_or(false) {
                    return Err(ConfigError::Validation(format!(
                        "binding references unknown port path: {}",
                        port
                    )));
                }
            }
        }

        for tap in &self.taps {
            let node = tap.target.split(".ports.").next().unwrap_or("");
            if !paths.contains(node) {
                return Err(ConfigError::Validation(format!(
                    "tap references non-existent target: {}",
                    tap.target
                )));
            }
        }

        let mut names = HashSet::new();
        for w in &self.workloads {
            w.validate()?;
            if !names.insert(w.name.as_str()) {
                return Err(ConfigError::Validation(format!("duplicate workload name: {}", w.name)));
            }
        }

        Ok(())
    }

    /// Builds a Configuring-state simulation with every binding and tap in place.
    pub fn build(&self, registry: &DeviceRegistry) -> ConfigResult<Simulation> {
        self.validate()?;
        let mut sim = Simulation::new(self.simulation.name.clone())?;

        for node in &self.nodes {
            let id = match parent_path(&node.path) {
                Some(parent) if node.path != self.simulation.name => {
                    let parent = sim.find(parent)?;
                    let name = node.path.rsplit('.').next().unwrap_or(&node.path);
                    sim.add_child(parent, name)?
                }
                _ => sim.root(),
            };
            if let Some(device_type) = &node.device {
                let device = registry
                    .create(device_type, &node.attrs)?
                    .ok_or_else(|| ConfigError::UnknownDevice(device_type.clone()))?;
                sim.attach_device(id, device)?;
            }
            for (name, value) in &node.params {
                sim.override_param(node.path.clone(), name.clone(), value.clone());
            }
        }

        for clock in &self.clocks {
            let node = match &clock.node {
                Some(path) => sim.find(path)?,
                None => sim.root(),
            };
            sim.set_clock(node, Clock::new(clock.name.clone(), clock.period)?)?;
        }

        sim.enter_configuring()?;

        for b in &self.bindings {
            sim.bind_paths(&b.out, &b.input)?;
        }

        for tap in &self.taps {
            let sink = match &tap.file {
                Some(path) => TapSink::file(path),
                None => TapSink::stdout(),
            };
            sim.attach_tap_path(&tap.target, tap.channel, sink)?;
        }
        if self.simulation.trace {
            let root = sim.root();
            sim.attach_tap(crate::tap::TapTarget::Node(root), TapChannel::Trace, TapSink::stdout())?;
        }

        tracing::info!(
            root = %self.simulation.name,
            nodes = sim.tree().len(),
            bindings = self.bindings.len(),
            "simulation built from configuration"
        );
        Ok(sim)
    }

    pub fn to_yaml_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn to_json(&self) -> ConfigResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn find_node(&self, path: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.path == path)
    }
}

/// Builder for creating a `SimConfig` programmatically.
#[derive(Default)]
pub struct SimConfigBuilder {
    config: SimConfig,
}

impl SimConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the root node name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.simulation.name = name.into();
        self
    }

    pub fn max_ticks(mut self, ticks: Tick) -> Self {
        self.config.simulation.max_ticks = Some(ticks);
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.simulation.log_level = level.into();
        self
    }

    pub fn trace(mut self, enable: bool) -> Self {
        self.config.simulation.trace = enable;
        self
    }

    /// Declares a clock on the node at `node`.
    pub fn add_clock(mut self, name: impl Into<String>, period: Tick, node: impl Into<String>) -> Self {
        self.config.clocks.push(ClockConfig {
            name: name.into(),
            period,
            node: Some(node.into()),
        });
        self
    }

    /// Adds a node without a device.
    pub fn add_node(mut self, path: impl Into<String>) -> Self {
        self.config.nodes.push(NodeConfig {
            path: path.into(),
            ..NodeConfig::default()
        });
        self
    }

    /// Adds a node with a device.
    pub fn add_device(mut self, path: impl Into<String>, device: impl Into<String>) -> Self {
        self.config.nodes.push(NodeConfig {
            path: path.into(),
            device: Some(device.into()),
            ..NodeConfig::default()
        });
        self
    }

    /// Sets a construction attribute on the most recently added node.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let Some(node) = self.config.nodes.last_mut() {
            node.attrs.insert(name.into(), value.into());
        }
        self
    }

    /// Sets a parameter on the most recently added node.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        if let Some(node) = self.config.nodes.last_mut() {
            node.params.insert(name.into(), value.into());
        }
        self
    }

    pub fn bind(mut self, out: impl Into<String>, input: impl Into<String>) -> Self {
        self.config.bindings.push(BindingConfig {
            out: out.into(),
            input: input.into(),
        });
        self
    }

    pub fn tap(mut self, target: impl Into<String>, channel: TapChannel, file: Option<PathBuf>) -> Self {
        self.config.taps.push(TapConfig {
            target: target.into(),
            channel,
            file,
        });
        self
    }

    pub fn add_workload(mut self, process: ProcessDescriptor) -> Self {
        self.config.workloads.push(process);
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> ConfigResult<SimConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
