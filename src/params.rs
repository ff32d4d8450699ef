//! Typed parameter sets attached to tree nodes.
//!
//! A parameter set is mutable while its node is being built or configured.
//! Finalization locks it; any later mutation fails with
//! [`KernelError::LockedParameter`].
//!
//! ```
//! use archsim::params::{ParameterSet, ParamType, ParamValue};
//!
//! let mut params = ParameterSet::new("top.mem");
//! params.declare("latency", ParamType::UInt, Some(ParamValue::UInt(4))).unwrap();
//! params.set("latency", ParamValue::UInt(8)).unwrap();
//! assert_eq!(params.get_u64("latency").unwrap(), 8);
//!
//! params.lock();
//! assert!(params.set("latency", ParamValue::UInt(2)).is_err());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{KernelError, KernelResult};

/// The declared type of a parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Bool,
    Int,
    UInt,
    Float,
    Str,
}

impl ParamType {
    pub fn name(&self) -> &'static str {
        match self {
            ParamType::Bool => "bool",
            ParamType::Int => "int",
            ParamType::UInt => "uint",
            ParamType::Float => "float",
            ParamType::Str => "string",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parameter value.
///
/// Serialized untagged, so configuration files can write plain scalars.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    /// Returns the natural type of this value.
    pub fn param_type(&self) -> ParamType {
        match self {
            ParamValue::Bool(_) => ParamType::Bool,
            ParamValue::UInt(_) => ParamType::UInt,
            ParamValue::Int(_) => ParamType::Int,
            ParamValue::Float(_) => ParamType::Float,
            ParamValue::Str(_) => ParamType::Str,
        }
    }

    /// Converts this value to `ty` where the conversion is lossless.
    ///
    /// Configuration files cannot distinguish `3` as int from `3` as uint,
    /// so non-negative integers are accepted for either, and integers are
    /// accepted for floats.
    pub fn coerce(self, ty: ParamType) -> Option<ParamValue> {
        match (self, ty) {
            (v @ ParamValue::Bool(_), ParamType::Bool) => Some(v),
            (v @ ParamValue::UInt(_), ParamType::UInt) => Some(v),
            (v @ ParamValue::Int(_), ParamType::Int) => Some(v),
            (v @ ParamValue::Float(_), ParamType::Float) => Some(v),
            (v @ ParamValue::Str(_), ParamType::Str) => Some(v),
            (ParamValue::UInt(u), ParamType::Int) => i64::try_from(u).ok().map(ParamValue::Int),
            (ParamValue::Int(i), ParamType::UInt) => u64::try_from(i).ok().map(ParamValue::UInt),
            (ParamValue::UInt(u), ParamType::Float) => Some(ParamValue::Float(u as f64)),
            (ParamValue::Int(i), ParamType::Float) => Some(ParamValue::Float(i as f64)),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::UInt(v) => write!(f, "{}", v),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Str(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        ParamValue::UInt(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::UInt(v as u64)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

/// Declaration of a parameter, as published by a device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    #[serde(default)]
    pub default: Option<ParamValue>,
    #[serde(default)]
    pub description: String,
}

impl ParamSpec {
    /// Declares an optional parameter with a default value.
    pub fn new(name: impl Into<String>, default: impl Into<ParamValue>) -> Self {
        let default = default.into();
        Self {
            name: name.into(),
            ty: default.param_type(),
            default: Some(default),
            description: String::new(),
        }
    }

    /// Declares a parameter with no default. It must be set before finalization.
    pub fn required(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Parameter {
    ty: ParamType,
    value: Option<ParamValue>,
    description: String,
}

/// A typed, named key/value store owned by one tree node.
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterSet {
    /// Dotted path of the owning node, used in error messages.
    owner: String,
    params: BTreeMap<String, Parameter>,
    locked: bool,
}

impl ParameterSet {
    /// Creates an empty, unlocked parameter set for the node at `owner`.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            params: BTreeMap::new(),
            locked: false,
        }
    }

    /// Dotted path of the owning node.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn path(&self, name: &str) -> String {
        if self.owner.is_empty() {
            name.to_string()
        } else {
            format!("{}.params.{}", self.owner, name)
        }
    }

    fn check_unlocked(&self, name: &str) -> KernelResult<()> {
        if self.locked {
            return Err(KernelError::LockedParameter {
                path: self.path(name),
            });
        }
        Ok(())
    }

    fn coerce(&self, name: &str, ty: ParamType, value: ParamValue) -> KernelResult<ParamValue> {
        let actual = value.param_type().name();
        value.coerce(ty).ok_or_else(|| KernelError::ParameterType {
            path: self.path(name),
            expected: ty.name(),
            actual,
        })
    }

    /// Declares a parameter. Redeclaring an existing name is an error.
    pub fn declare(
        &mut self,
        name: impl Into<String>,
        ty: ParamType,
        default: Option<ParamValue>,
    ) -> KernelResult<()> {
        let name = name.into();
        self.check_unlocked(&name)?;
        if self.params.contains_key(&name) {
            return Err(KernelError::DuplicateName {
                parent: format!("{}.params", self.owner),
                name,
            });
        }
        let value = match default {
            Some(v) => Some(self.coerce(&name, ty, v)?),
            None => None,
        };
        self.params.insert(
            name,
            Parameter {
                ty,
                value,
                description: String::new(),
            },
        );
        Ok(())
    }

    /// Declares a parameter from a device-published spec.
    pub fn declare_spec(&mut self, spec: &ParamSpec) -> KernelResult<()> {
        self.declare(spec.name.clone(), spec.ty, spec.default.clone())?;
        if let Some(p) = self.params.get_mut(&spec.name) {
            p.description = spec.description.clone();
        }
        Ok(())
    }

    /// Sets a parameter value, type-checked against its declaration.
    pub fn set(&mut self, name: &str, value: impl Into<ParamValue>) -> KernelResult<()> {
        self.check_unlocked(name)?;
        let ty = self
            .params
            .get(name)
            .map(|p| p.ty)
            .ok_or_else(|| KernelError::UnknownParameter {
                path: self.path(name),
            })?;
        let value = self.coerce(name, ty, value.into())?;
        if let Some(p) = self.params.get_mut(name) {
            p.value = Some(value);
        }
        Ok(())
    }

    /// Returns the current value of a parameter.
    pub fn get(&self, name: &str) -> KernelResult<&ParamValue> {
        let param = self
            .params
            .get(name)
            .ok_or_else(|| KernelError::UnknownParameter {
                path: self.path(name),
            })?;
        param.value.as_ref().ok_or_else(|| KernelError::Validation {
            path: self.path(name),
            reason: "required parameter was never set".to_string(),
        })
    }

    fn type_error(&self, name: &str, expected: ParamType, actual: &ParamValue) -> KernelError {
        KernelError::ParameterType {
            path: self.path(name),
            expected: expected.name(),
            actual: actual.param_type().name(),
        }
    }

    pub fn get_bool(&self, name: &str) -> KernelResult<bool> {
        match self.get(name)? {
            ParamValue::Bool(v) => Ok(*v),
            other => Err(self.type_error(name, ParamType::Bool, other)),
        }
    }

    pub fn get_u64(&self, name: &str) -> KernelResult<u64> {
        match self.get(name)? {
            ParamValue::UInt(v) => Ok(*v),
            other => Err(self.type_error(name, ParamType::UInt, other)),
        }
    }

    pub fn get_i64(&self, name: &str) -> KernelResult<i64> {
        match self.get(name)? {
            ParamValue::Int(v) => Ok(*v),
            other => Err(self.type_error(name, ParamType::Int, other)),
        }
    }

    pub fn get_f64(&self, name: &str) -> KernelResult<f64> {
        match self.get(name)? {
            ParamValue::Float(v) => Ok(*v),
            other => Err(self.type_error(name, ParamType::Float, other)),
        }
    }

    pub fn get_str(&self, name: &str) -> KernelResult<&str> {
        match self.get(name)? {
            ParamValue::Str(v) => Ok(v),
            other => Err(self.type_error(name, ParamType::Str, other)),
        }
    }

    /// Returns the declared type of a parameter.
    pub fn param_type(&self, name: &str) -> Option<ParamType> {
        self.params.get(name).map(|p| p.ty)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Returns true if the parameter has a value (default or explicitly set).
    pub fn is_set(&self, name: &str) -> bool {
        self.params
            .get(name)
            .map(|p| p.value.is_some())
            .unwrap_or(false)
    }

    /// Checks that every required parameter has a value.
    pub fn validate(&self) -> KernelResult<()> {
        for (name, param) in &self.params {
            if param.value.is_none() {
                return Err(KernelError::Validation {
                    path: self.path(name),
                    reason: format!("required {} parameter was never set", param.ty),
                });
            }
        }
        Ok(())
    }

    /// Locks the set. Locking is one-way.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Iterates over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&ParamValue>)> {
        self.params
            .iter()
            .map(|(name, p)| (name.as_str(), p.value.as_ref()))
    }

    pub fn description(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|p| p.description.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParameterSet {
        let mut ps = ParameterSet::new("top.tester");
        ps.declare("num_iters", ParamType::UInt, Some(ParamValue::UInt(10)))
            .unwrap();
        ps.declare("seed", ParamType::UInt, None).unwrap();
        ps.declare("name", ParamType::Str, Some("gen".into()))
            .unwrap();
        ps
    }

    #[test]
    fn test_declare_and_get() {
        let ps = sample();
        assert_eq!(ps.get_u64("num_iters").unwrap(), 10);
        assert_eq!(ps.get_str("name").unwrap(), "gen");
        assert!(!ps.is_set("seed"));
        assert_eq!(ps.len(), 3);
    }

    #[test]
    fn test_type_checked_set() {
        let mut ps = sample();
        let err = ps.set("num_iters", "ten").unwrap_err();
        assert!(matches!(err, KernelError::ParameterType { expected: "uint", .. }));

        ps.set("num_iters", ParamValue::Int(12)).unwrap();
        assert_eq!(ps.get_u64("num_iters").unwrap(), 12);

        let err = ps.set("num_iters", ParamValue::Int(-1)).unwrap_err();
        assert!(matches!(err, KernelError::ParameterType { .. }));
    }

    #[test]
    fn test_unknown_parameter() {
        let mut ps = sample();
        assert!(matches!(
            ps.set("missing", 1u64),
            Err(KernelError::UnknownParameter { .. })
        ));
        assert!(matches!(
            ps.get("missing"),
            Err(KernelError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn test_validate_reports_missing_required() {
        let mut ps = sample();
        let err = ps.validate().unwrap_err();
        match err {
            KernelError::Validation { path, .. } => assert_eq!(path, "top.tester.params.seed"),
            other => panic!("unexpected error: {other:?}"),
        }
        ps.set("seed", 7u64).unwrap();
        ps.validate().unwrap();
    }

    #[test]
    fn test_locked_set_fails() {
        let mut ps = sample();
        ps.lock();
        assert!(ps.is_locked());
        assert!(matches!(
            ps.set("num_iters", 3u64),
            Err(KernelError::LockedParameter { .. })
        ));
        assert!(ps
            .declare("late", ParamType::Bool, Some(true.into()))
            .is_err());
        assert_eq!(ps.get_u64("num_iters").unwrap(), 10);
    }

    #[test]
    fn test_duplicate_declaration() {
        let mut ps = sample();
        assert!(matches!(
            ps.declare("seed", ParamType::UInt, None),
            Err(KernelError::DuplicateName { .. })
        ));
    }

    #[test]
    fn test_value_deserializes_untagged() {
        let v: ParamValue = serde_yaml::from_str("42").unwrap();
        assert_eq!(v, ParamValue::UInt(42));
        let v: ParamValue = serde_yaml::from_str("-3").unwrap();
        assert_eq!(v, ParamValue::Int(-3));
        let v: ParamValue = serde_yaml::from_str("true").unwrap();
        assert_eq!(v, ParamValue::Bool(true));
        let v: ParamValue = serde_yaml::from_str("hello").unwrap();
        assert_eq!(v, ParamValue::Str("hello".into()));
    }

    #[test]
    fn test_spec_helpers() {
        let spec = ParamSpec::new("latency", 4u64).with_description("response latency");
        assert_eq!(spec.ty, ParamType::UInt);

        let mut ps = ParameterSet::new("m");
        ps.declare_spec(&spec).unwrap();
        ps.declare_spec(&ParamSpec::required("base", ParamType::UInt))
            .unwrap();
        assert_eq!(ps.description("latency"), Some("response latency"));
        assert!(ps.validate().is_err());
    }
}
