//! Device factory registry for configuration-driven setup.
//!
//! The registry maps a device type name to a factory, so configuration files
//! can say `device: SimpleMemory` instead of constructing devices in code.
//!
//! # Example
//!
//! ```
//! use archsim::registry::DeviceRegistry;
//! use archsim::device::Device;
//! use std::collections::HashMap;
//!
//! struct Blinky;
//! impl Device for Blinky {
//!     fn type_name(&self) -> &str { "Blinky" }
//! }
//!
//! let mut registry = DeviceRegistry::new();
//! registry.register("Blinky", |_attrs| Ok(Box::new(Blinky)));
//!
//! let dev = registry.create("Blinky", &HashMap::new()).unwrap();
//! assert_eq!(dev.unwrap().type_name(), "Blinky");
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::device::Device;
use crate::devices::{CycleCounter, SimpleMemory, TrafficGenerator};
use crate::error::{KernelError, KernelResult};

/// Construction-time attributes of a device (things that shape its ports,
/// as opposed to parameters, which are set on the tree).
pub type DeviceAttrs = HashMap<String, String>;

/// Type alias for device factory functions.
pub type DeviceFactory = Arc<dyn Fn(&DeviceAttrs) -> KernelResult<Box<dyn Device>> + Send + Sync>;

/// A registry of device factories.
#[derive(Default, Clone)]
pub struct DeviceRegistry {
    factories: HashMap<String, DeviceFactory>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device factory under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&DeviceAttrs) -> KernelResult<Box<dyn Device>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Creates a device by type name.
    ///
    /// # Returns
    /// `Ok(None)` if the type is not registered, the factory's error if the
    /// attributes are invalid.
    pub fn create(&self, type_name: &str, attrs: &DeviceAttrs) -> KernelResult<Option<Box<dyn Device>>> {
        match self.factories.get(type_name) {
            Some(f) => f(attrs).map(Some),
            None => Ok(None),
        }
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn unregister(&mut self, type_name: &str) -> bool {
        self.factories.remove(type_name).is_some()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("registered_types", &self.type_names())
            .finish()
    }
}

/// Parses an optional numeric attribute.
pub fn attr_u64(attrs: &DeviceAttrs, name: &str, default: u64) -> KernelResult<u64> {
    match attrs.get(name) {
        None => Ok(default),
        Some(s) => {
            let parsed = match s.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => s.parse(),
            };
            parsed.map_err(|_| KernelError::Validation {
                path: format!("attrs.{}", name),
                reason: format!("'{}' is not an unsigned integer", s),
            })
        }
    }
}

/// Creates a registry with the built-in devices.
///
/// Includes:
/// - `TrafficGenerator` - attrs: `initial_credits`
/// - `SimpleMemory` - attrs: `latency`
/// - `CycleCounter`
pub fn create_default_registry() -> DeviceRegistry {
    let mut registry = DeviceRegistry::new();

    registry.register("TrafficGenerator", |attrs| {
        let credits = attr_u64(attrs, "initial_credits", 0)?;
        let credits = u32::try_from(credits).map_err(|_| KernelError::Validation {
            path: "attrs.initial_credits".to_string(),
            reason: "does not fit in 32 bits".to_string(),
        })?;
        Ok(Box::new(TrafficGenerator::new().with_initial_credits(credits)))
    });

    registry.register("SimpleMemory", |attrs| {
        let latency = attr_u64(attrs, "latency", 2)?;
        Ok(Box::new(SimpleMemory::new(latency)))
    });

    registry.register("CycleCounter", |_| Ok(Box::new(CycleCounter::new())));

    registry
}
