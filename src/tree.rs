//! The component tree and its lifecycle phases.
//!
//! Nodes live in an arena owned by the [`crate::Simulation`]; parents refer to
//! children through an explicit name → id registry, and children refer back
//! to their parent by id. Lifecycle transitions are driven by the simulation
//! context, which applies them top-down over a subtree.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::clock::Clock;
use crate::device::Device;
use crate::error::{KernelError, KernelResult};
use crate::params::ParameterSet;
use crate::statistics::StatisticSet;
use crate::types::{ClockId, NodeId, PortId};

/// Lifecycle phase of a tree node.
///
/// Phases are totally ordered; a node only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Building,
    Configuring,
    Finalized,
    Running,
    Teardown,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Building => "building",
            Phase::Configuring => "configuring",
            Phase::Finalized => "finalized",
            Phase::Running => "running",
            Phase::Teardown => "teardown",
        }
    }

    /// Parameters and topology may change only in these phases.
    pub fn is_mutable(&self) -> bool {
        matches!(self, Phase::Building | Phase::Configuring)
    }

    /// Ports may carry traffic only in these phases.
    pub fn is_live(&self) -> bool {
        matches!(self, Phase::Finalized | Phase::Running)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One node of the component tree.
pub struct TreeNode {
    id: NodeId,
    name: String,
    path: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    child_index: HashMap<String, NodeId>,
    pub(crate) params: ParameterSet,
    pub(crate) statistics: StatisticSet,
    pub(crate) ports: Vec<PortId>,
    pub(crate) port_index: HashMap<String, PortId>,
    pub(crate) phase: Phase,
    /// Clock declared on this node, inherited by its subtree.
    pub(crate) clock_decl: Option<Clock>,
    /// Effective clock, resolved at finalization.
    pub(crate) clock: Option<ClockId>,
    pub(crate) device: Option<Box<dyn Device>>,
    pub(crate) device_type: Option<String>,
}

impl TreeNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted path from the root, e.g. `top.cpu0`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in insertion order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn child(&self, name: &str) -> Option<NodeId> {
        self.child_index.get(name).copied()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn statistics(&self) -> &StatisticSet {
        &self.statistics
    }

    /// Ports in declaration order.
    pub fn ports(&self) -> &[PortId] {
        &self.ports
    }

    pub fn port(&self, name: &str) -> Option<PortId> {
        self.port_index.get(name).copied()
    }

    /// Clock declared directly on this node, if any.
    pub fn declared_clock(&self) -> Option<&Clock> {
        self.clock_decl.as_ref()
    }

    /// Effective clock id, available once finalized.
    pub fn clock(&self) -> Option<ClockId> {
        self.clock
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    /// Registry name of the attached device, when built from a registry.
    pub fn device_type(&self) -> Option<&str> {
        self.device_type.as_deref()
    }
}

impl fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeNode")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("phase", &self.phase)
            .field("children", &self.children)
            .field("ports", &self.ports)
            .field("has_device", &self.device.is_some())
            .finish()
    }
}

/// Arena of tree nodes.
#[derive(Default)]
pub struct Tree {
    nodes: BTreeMap<NodeId, TreeNode>,
    next_id: NodeId,
    root: Option<NodeId>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, name: String, path: String, parent: Option<NodeId>, phase: Phase) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        let params = ParameterSet::new(path.clone());
        let statistics = StatisticSet::new(path.clone());
        self.nodes.insert(
            id,
            TreeNode {
                id,
                name,
                path,
                parent,
                children: Vec::new(),
                child_index: HashMap::new(),
                params,
                statistics,
                ports: Vec::new(),
                port_index: HashMap::new(),
                phase,
                clock_decl: None,
                clock: None,
                device: None,
                device_type: None,
            },
        );
        id
    }

    /// Creates the root node. A tree has exactly one root.
    pub fn create_root(&mut self, name: impl Into<String>) -> KernelResult<NodeId> {
        let name = name.into();
        validate_name(&name)?;
        if let Some(root) = self.root {
            return Err(KernelError::DuplicateName {
                parent: "<tree>".to_string(),
                name: self.path(root),
            });
        }
        let id = self.alloc(name.clone(), name, None, Phase::Building);
        self.root = Some(id);
        Ok(id)
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    /// Adds a child under `parent`. The child adopts the parent's phase.
    pub fn add_child(&mut self, parent: NodeId, name: impl Into<String>) -> KernelResult<NodeId> {
        let name = name.into();
        validate_name(&name)?;
        let p = self.get(parent)?;
        if !p.phase.is_mutable() {
            return Err(KernelError::WrongPhase {
                target: p.path.clone(),
                required: "building or configuring",
                actual: p.phase,
            });
        }
        if p.child_index.contains_key(&name) || p.port_index.contains_key(&name) {
            return Err(KernelError::DuplicateName {
                parent: p.path.clone(),
                name,
            });
        }
        let path = format!("{}.{}", p.path, name);
        let phase = p.phase;
        let id = self.alloc(name.clone(), path, Some(parent), phase);
        let p = self.get_mut(parent)?;
        p.children.push(id);
        p.child_index.insert(name, id);
        Ok(id)
    }

    pub fn get(&self, id: NodeId) -> KernelResult<&TreeNode> {
        self.nodes
            .get(&id)
            .ok_or_else(|| KernelError::UnknownNode(format!("#{}", id)))
    }

    pub fn get_mut(&mut self, id: NodeId) -> KernelResult<&mut TreeNode> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| KernelError::UnknownNode(format!("#{}", id)))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Path of a node, or `#id` if it does not exist.
    pub fn path(&self, id: NodeId) -> String {
        self.nodes
            .get(&id)
            .map(|n| n.path.clone())
            .unwrap_or_else(|| format!("#{}", id))
    }

    /// Looks up a node by dotted path starting at the root name.
    pub fn find(&self, path: &str) -> Option<NodeId> {
        let mut parts = path.split('.');
        let root = self.root?;
        if parts.next()? != self.nodes.get(&root)?.name {
            return None;
        }
        let mut cur = root;
        for part in parts {
            cur = self.nodes.get(&cur)?.child(part)?;
        }
        Some(cur)
    }

    /// Returns `id` and all its descendants in pre-order (parents before children).
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            if let Some(node) = self.nodes.get(&n) {
                out.push(n);
                stack.extend(node.children.iter().rev());
            }
        }
        out
    }

    /// Returns true if `node` is `ancestor` or lies beneath it.
    pub fn is_within(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut cur = Some(node);
        while let Some(n) = cur {
            if n == ancestor {
                return true;
            }
            cur = self.nodes.get(&n).and_then(|x| x.parent);
        }
        false
    }

    /// Finds the nearest node at or above `id` that declares a clock.
    pub fn clock_owner(&self, id: NodeId) -> Option<NodeId> {
        let mut cur = Some(id);
        while let Some(n) = cur {
            let node = self.nodes.get(&n)?;
            if node.clock_decl.is_some() {
                return Some(n);
            }
            cur = node.parent;
        }
        None
    }

    /// Removes a subtree from the arena and returns the removed nodes.
    pub(crate) fn remove_subtree(&mut self, id: NodeId) -> Vec<TreeNode> {
        let ids = self.subtree(id);
        if let Some(parent) = self.nodes.get(&id).and_then(|n| n.parent) {
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.children.retain(|c| *c != id);
                p.child_index.retain(|_, c| *c != id);
            }
        }
        if self.root == Some(id) {
            self.root = None;
        }
        ids.into_iter()
            .filter_map(|n| self.nodes.remove(&n))
            .collect()
    }

    /// Iterates over all nodes in id order.
    pub fn iter(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes.values()
    }
}

/// Path segments that separate a node path from a port or parameter name.
const RESERVED_NAMES: [&str; 2] = ["ports", "params"];

fn validate_name(name: &str) -> KernelResult<()> {
    if name.is_empty() || name.contains('.') || name.contains(char::is_whitespace) {
        return Err(KernelError::Validation {
            path: name.to_string(),
            reason: "node names must be non-empty and contain no dots or whitespace".to_string(),
        });
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(KernelError::Validation {
            path: name.to_string(),
            reason: format!("'{}' is reserved for port and parameter paths", name),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Tree, NodeId, NodeId, NodeId) {
        let mut tree = Tree::new();
        let top = tree.create_root("top").unwrap();
        let cpu = tree.add_child(top, "cpu0").unwrap();
        let l1 = tree.add_child(cpu, "l1").unwrap();
        (tree, top, cpu, l1)
    }

    #[test]
    fn test_phase_ordering() {
        assert!(Phase::Building < Phase::Configuring);
        assert!(Phase::Configuring < Phase::Finalized);
        assert!(Phase::Finalized < Phase::Running);
        assert!(Phase::Running < Phase::Teardown);
        assert!(Phase::Configuring.is_mutable());
        assert!(!Phase::Finalized.is_mutable());
        assert!(Phase::Running.is_live());
    }

    #[test]
    fn test_paths_and_lookup() {
        let (tree, top, cpu, l1) = sample();
        assert_eq!(tree.path(l1), "top.cpu0.l1");
        assert_eq!(tree.find("top"), Some(top));
        assert_eq!(tree.find("top.cpu0"), Some(cpu));
        assert_eq!(tree.find("top.cpu0.l1"), Some(l1));
        assert_eq!(tree.find("top.cpu1"), None);
        assert_eq!(tree.find("other.cpu0"), None);
        assert_eq!(tree.get(top).unwrap().child("cpu0"), Some(cpu));
    }

    #[test]
    fn test_sibling_names_unique() {
        let (mut tree, top, _, _) = sample();
        assert!(matches!(
            tree.add_child(top, "cpu0"),
            Err(KernelError::DuplicateName { .. })
        ));
        assert!(tree.add_child(top, "bad.name").is_err());
        assert!(tree.add_child(top, "").is_err());
        assert!(matches!(
            tree.add_child(top, "ports"),
            Err(KernelError::Validation { .. })
        ));
        assert!(tree.add_child(top, "params").is_err());
    }

    #[test]
    fn test_single_root() {
        let (mut tree, _, _, _) = sample();
        assert!(tree.create_root("again").is_err());
    }

    #[test]
    fn test_subtree_preorder() {
        let (mut tree, top, cpu, l1) = sample();
        let mem = tree.add_child(top, "mem").unwrap();
        assert_eq!(tree.subtree(top), vec![top, cpu, l1, mem]);
        assert!(tree.is_within(l1, top));
        assert!(!tree.is_within(mem, cpu));
    }

    #[test]
    fn test_clock_owner_inheritance() {
        let (mut tree, top, cpu, l1) = sample();
        assert_eq!(tree.clock_owner(l1), None);
        tree.get_mut(top).unwrap().clock_decl = Some(Clock::new("sys", 1).unwrap());
        assert_eq!(tree.clock_owner(l1), Some(top));
        tree.get_mut(cpu).unwrap().clock_decl = Some(Clock::new("core", 2).unwrap());
        assert_eq!(tree.clock_owner(l1), Some(cpu));
    }

    #[test]
    fn test_remove_subtree() {
        let (mut tree, top, cpu, _) = sample();
        let removed = tree.remove_subtree(cpu);
        assert_eq!(removed.len(), 2);
        assert_eq!(tree.len(), 1);
        assert!(tree.get(top).unwrap().children().is_empty());
        assert_eq!(tree.find("top.cpu0"), None);
    }

    #[test]
    fn test_child_adopts_parent_phase() {
        let (mut tree, top, _, _) = sample();
        tree.get_mut(top).unwrap().phase = Phase::Configuring;
        let late = tree.add_child(top, "late").unwrap();
        assert_eq!(tree.get(late).unwrap().phase(), Phase::Configuring);

        tree.get_mut(top).unwrap().phase = Phase::Finalized;
        assert!(matches!(
            tree.add_child(top, "too_late"),
            Err(KernelError::WrongPhase { .. })
        ));
    }
}
