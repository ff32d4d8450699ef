//! Workload process descriptors.
//!
//! A process descriptor names a guest program to run on the simulated
//! system: its executable, arguments and how many hardware threads it needs.
//! Descriptors are carried in configuration files under `workloads` and get
//! their process id from their position in that list.

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// Hardware thread identifier.
pub type HartId = u32;

/// A guest program to run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    pub name: String,
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Hardware threads the program may use
    #[serde(default = "default_max_harts")]
    pub max_harts: HartId,
    /// Hart the program boots on
    #[serde(default)]
    pub boot_hart: HartId,
}

fn default_max_harts() -> HartId {
    1
}

impl ProcessDescriptor {
    pub fn new(name: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            arguments: Vec::new(),
            max_harts: default_max_harts(),
            boot_hart: 0,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_harts(mut self, harts: HartId) -> Self {
        self.max_harts = harts;
        self
    }

    pub fn with_boot_hart(mut self, hart: HartId) -> Self {
        self.boot_hart = hart;
        self
    }

    pub fn validate(&self) -> KernelResult<()> {
        let invalid = |reason: String| KernelError::Validation {
            path: format!("workloads.{}", self.name),
            reason,
        };
        if self.name.is_empty() {
            return Err(KernelError::Validation {
                path: "workloads".to_string(),
                reason: "process name must not be empty".to_string(),
            });
        }
        if self.executable.trim().is_empty() {
            return Err(invalid("executable must not be empty".to_string()));
        }
        if self.max_harts == 0 {
            return Err(invalid("max_harts must be at least 1".to_string()));
        }
        if self.boot_hart >= self.max_harts {
            return Err(invalid(format!(
                "boot_hart {} is outside the {} available harts",
                self.boot_hart, self.max_harts
            )));
        }
        Ok(())
    }

    /// `key=value` arguments handed to the instruction-set simulator's
    /// instrumentation plugin for process `pid`.
    pub fn plugin_args(&self, pid: u32) -> Vec<String> {
        vec![
            format!("AppName={}", self.name),
            format!("ProcessID={}", pid),
            format!("BootHart={}", self.boot_hart),
            format!("MaxHarts={}", self.max_harts),
        ]
    }

    /// The guest command line.
    pub fn command_line(&self) -> Vec<&str> {
        std::iter::once(self.executable.as_str())
            .chain(self.arguments.iter().map(String::as_str))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        let p = ProcessDescriptor::new("libquantum", "/bench/libquantum").with_args(["33", "5"]);
        assert!(p.validate().is_ok());
        assert_eq!(p.command_line(), vec!["/bench/libquantum", "33", "5"]);

        assert!(p.clone().with_max_harts(0).validate().is_err());
        assert!(ProcessDescriptor::new("x", " ").validate().is_err());
        assert!(ProcessDescriptor::new("", "/bin/true").validate().is_err());
        let err = p.with_max_harts(2).with_boot_hart(2).validate().unwrap_err();
        assert!(err.to_string().contains("workloads.libquantum"));
    }

    #[test]
    fn test_plugin_args() {
        let p = ProcessDescriptor::new("blackscholes", "/bench/bs").with_max_harts(5);
        assert_eq!(
            p.plugin_args(3),
            vec!["AppName=blackscholes", "ProcessID=3", "BootHart=0", "MaxHarts=5"]
        );
    }

    #[test]
    fn test_yaml_defaults() {
        let p: ProcessDescriptor = serde_yaml::from_str("name: hello\nexecutable: /root/hello_riscv\n").unwrap();
        assert_eq!(p.max_harts, 1);
        assert!(p.arguments.is_empty());
    }
}
