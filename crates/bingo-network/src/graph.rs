//! Node graph of the join network
//!
//! The graph is an arena of [`NetworkNode`]s addressed by [`NodeId`]. Every node
//! except an input adapter has exactly one left source; fan-out is expressed by a
//! node holding several sinks. A right input adapter closes a sub-network whose
//! output feeds the right input of a beta node in the parent path.
//!
//! ```text
//! LIA(Order) ── Join(Customer) ──┬── Exists(⟵ RIA) ── Terminal(rule 1)
//!                                └── Join(Item) ── RIA
//! ```

use crate::constraint::BetaConstraint;
use crate::error::{NetworkError, NetworkResult};
use crate::types::{NodeId, NodeType, RuleId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Where a beta node's right input comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RightInput {
    /// Facts of one object type
    ObjectType(String),
    /// Output of a sub-network, identified by its right input adapter
    Subnetwork(NodeId),
}

/// Static description of a beta node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BetaNodeSpec {
    pub right_input: RightInput,
    pub constraints: Vec<BetaConstraint>,
    /// A passive right input never triggers evaluation on its own
    pub right_input_passive: bool,
}

impl BetaNodeSpec {
    pub fn new(right_input: RightInput, constraints: Vec<BetaConstraint>) -> Self {
        Self { right_input, constraints, right_input_passive: false }
    }

    pub fn object_type(object_type: impl Into<String>, constraints: Vec<BetaConstraint>) -> Self {
        Self::new(RightInput::ObjectType(object_type.into()), constraints)
    }

    pub fn passive(mut self) -> Self {
        self.right_input_passive = true;
        self
    }

    pub fn subnetwork(&self) -> Option<NodeId> {
        match self.right_input {
            RightInput::Subnetwork(ria) => Some(ria),
            RightInput::ObjectType(_) => None,
        }
    }
}

/// Node kinds known to the segment builder
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    LeftInputAdapter { object_type: String },
    Join(BetaNodeSpec),
    Not(BetaNodeSpec),
    Exists(BetaNodeSpec),
    Accumulate(BetaNodeSpec),
    Timer,
    Query { abductive: bool },
    AsyncReceive,
    ReactiveFrom,
    ConditionalBranch,
    RuleTerminal { rule: RuleId, salience: i32 },
    QueryTerminal { rule: RuleId },
    RightInputAdapter { start_source: NodeId },
    Other,
}

impl NodeKind {
    pub fn beta_spec(&self) -> Option<&BetaNodeSpec> {
        match self {
            NodeKind::Join(spec) | NodeKind::Not(spec) | NodeKind::Exists(spec) | NodeKind::Accumulate(spec) => {
                Some(spec)
            }
            _ => None,
        }
    }

    pub fn is_beta(&self) -> bool {
        self.beta_spec().is_some()
    }

    /// Node type used by index selection; `None` for non-beta nodes
    pub fn node_type(&self) -> Option<NodeType> {
        match self {
            NodeKind::Join(_) => Some(NodeType::Join),
            NodeKind::Not(_) => Some(NodeType::Not),
            NodeKind::Exists(_) => Some(NodeType::Exists),
            NodeKind::Accumulate(_) => Some(NodeType::Accumulate),
            _ => None,
        }
    }

    pub fn is_left_input_adapter(&self) -> bool {
        matches!(self, NodeKind::LeftInputAdapter { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeKind::RuleTerminal { .. } | NodeKind::QueryTerminal { .. })
    }

    /// Terminals and right input adapters end a path
    pub fn is_end_node(&self) -> bool {
        self.is_terminal() || matches!(self, NodeKind::RightInputAdapter { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::LeftInputAdapter { .. } => "LeftInputAdapter",
            NodeKind::Join(_) => "Join",
            NodeKind::Not(_) => "Not",
            NodeKind::Exists(_) => "Exists",
            NodeKind::Accumulate(_) => "Accumulate",
            NodeKind::Timer => "Timer",
            NodeKind::Query { .. } => "Query",
            NodeKind::AsyncReceive => "AsyncReceive",
            NodeKind::ReactiveFrom => "ReactiveFrom",
            NodeKind::ConditionalBranch => "ConditionalBranch",
            NodeKind::RuleTerminal { .. } => "RuleTerminal",
            NodeKind::QueryTerminal { .. } => "QueryTerminal",
            NodeKind::RightInputAdapter { .. } => "RightInputAdapter",
            NodeKind::Other => "Other",
        }
    }
}

/// A node in the arena
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub left_source: Option<NodeId>,
    /// Left tuple sinks in attachment order
    pub sinks: Vec<NodeId>,
    /// Rules whose paths run through this node
    pub associated_rules: BTreeSet<RuleId>,
}

impl NetworkNode {
    pub fn is_associated_with(&self, rule: RuleId) -> bool {
        self.associated_rules.contains(&rule)
    }

    pub fn association_count(&self) -> usize {
        self.associated_rules.len()
    }
}

/// Arena of network nodes
#[derive(Debug, Clone, Default)]
pub struct NetworkGraph {
    nodes: BTreeMap<NodeId, NetworkNode>,
    next_id: NodeId,
}

impl NetworkGraph {
    pub fn new() -> Self {
        Self { nodes: BTreeMap::new(), next_id: 1 }
    }

    /// Add a node below `left_source`; adapters take no source
    pub fn add_node(&mut self, kind: NodeKind, left_source: Option<NodeId>) -> NetworkResult<NodeId> {
        match (&kind, left_source) {
            (NodeKind::LeftInputAdapter { .. }, Some(source)) => {
                return Err(NetworkError::Structure {
                    message: "left input adapters cannot have a left source".to_string(),
                    node_id: Some(source),
                    details: None,
                });
            }
            (NodeKind::LeftInputAdapter { .. }, None) => {}
            (_, None) => {
                return Err(NetworkError::structure(format!("{} node requires a left source", kind.name())));
            }
            (_, Some(source)) => {
                let source_node = self.node(source)?;
                if source_node.kind.is_end_node() {
                    return Err(NetworkError::Structure {
                        message: "end nodes cannot have sinks".to_string(),
                        node_id: Some(source),
                        details: Some(kind.name().to_string()),
                    });
                }
            }
        }

        let id = self.next_id.max(1);
        self.next_id = id + 1;
        if let Some(source) = left_source {
            if let Some(source_node) = self.nodes.get_mut(&source) {
                source_node.sinks.push(id);
            }
        }
        self.nodes.insert(
            id,
            NetworkNode { id, kind, left_source, sinks: Vec::new(), associated_rules: BTreeSet::new() },
        );
        Ok(id)
    }

    /// Detach a node from its source. The node must not have sinks.
    pub fn remove_node(&mut self, id: NodeId) -> NetworkResult<NetworkNode> {
        let node = self.node(id)?;
        if !node.sinks.is_empty() {
            return Err(NetworkError::Structure {
                message: "cannot remove a node that still has sinks".to_string(),
                node_id: Some(id),
                details: Some(format!("sinks: {:?}", node.sinks)),
            });
        }
        let node = self.nodes.remove(&id).ok_or_else(|| NetworkError::unknown_node(id))?;
        if let Some(source) = node.left_source {
            if let Some(source_node) = self.nodes.get_mut(&source) {
                source_node.sinks.retain(|&sink| sink != id);
            }
        }
        Ok(node)
    }

    pub fn node(&self, id: NodeId) -> NetworkResult<&NetworkNode> {
        self.nodes.get(&id).ok_or_else(|| NetworkError::unknown_node(id))
    }

    pub fn get(&self, id: NodeId) -> Option<&NetworkNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn associate(&mut self, id: NodeId, rule: RuleId) -> NetworkResult<()> {
        let node = self.nodes.get_mut(&id).ok_or_else(|| NetworkError::unknown_node(id))?;
        node.associated_rules.insert(rule);
        Ok(())
    }

    /// Returns the number of rules still associated with the node
    pub fn dissociate(&mut self, id: NodeId, rule: RuleId) -> NetworkResult<usize> {
        let node = self.nodes.get_mut(&id).ok_or_else(|| NetworkError::unknown_node(id))?;
        node.associated_rules.remove(&rule);
        Ok(node.associated_rules.len())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NetworkNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Terminals and right input adapters
    pub fn end_nodes(&self) -> Vec<NodeId> {
        self.nodes.values().filter(|n| n.kind.is_end_node()).map(|n| n.id).collect()
    }

    /// Nodes from the end node's left source up to the adapter, or up to (excluding)
    /// the start of a sub-network
    pub fn path_nodes(&self, end: NodeId) -> NetworkResult<Vec<NodeId>> {
        let end_node = self.node(end)?;
        let stop = match end_node.kind {
            NodeKind::RightInputAdapter { start_source } => Some(start_source),
            _ => None,
        };
        let mut nodes = Vec::new();
        let mut current = end_node.left_source;
        while let Some(id) = current {
            if Some(id) == stop {
                break;
            }
            let node = self.node(id)?;
            nodes.push(id);
            current = node.left_source;
        }
        Ok(nodes)
    }

    /// Whether `node` lies on the path that ends at `end`
    pub fn is_on_path(&self, end: NodeId, node: NodeId) -> bool {
        self.path_nodes(end).map(|nodes| nodes.contains(&node)).unwrap_or(false)
    }

    /// The parent beta node fed by a right input adapter
    pub fn subnetwork_parent(&self, ria: NodeId) -> Option<NodeId> {
        self.nodes
            .values()
            .find(|n| n.kind.beta_spec().and_then(BetaNodeSpec::subnetwork) == Some(ria))
            .map(|n| n.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lia(object_type: &str) -> NodeKind {
        NodeKind::LeftInputAdapter { object_type: object_type.to_string() }
    }

    #[test]
    fn test_nodes_link_to_their_source() {
        let mut graph = NetworkGraph::new();
        let root = graph.add_node(lia("Order"), None).unwrap();
        let join = graph
            .add_node(NodeKind::Join(BetaNodeSpec::object_type("Customer", vec![])), Some(root))
            .unwrap();
        let terminal = graph.add_node(NodeKind::RuleTerminal { rule: 1, salience: 0 }, Some(join)).unwrap();

        assert_eq!(graph.node(root).unwrap().sinks, vec![join]);
        assert_eq!(graph.path_nodes(terminal).unwrap(), vec![join, root]);
        assert!(graph.is_on_path(terminal, root));
        assert_eq!(graph.end_nodes(), vec![terminal]);
    }

    #[test]
    fn test_structural_misuse_is_rejected() {
        let mut graph = NetworkGraph::new();
        assert!(graph.add_node(NodeKind::Timer, None).is_err());
        assert!(graph.add_node(NodeKind::Timer, Some(99)).is_err());

        let root = graph.add_node(lia("A"), None).unwrap();
        let terminal = graph.add_node(NodeKind::RuleTerminal { rule: 1, salience: 0 }, Some(root)).unwrap();
        assert!(graph.add_node(NodeKind::Timer, Some(terminal)).is_err());
        assert!(graph.remove_node(root).is_err());

        graph.remove_node(terminal).unwrap();
        assert!(graph.node(root).unwrap().sinks.is_empty());
    }

    #[test]
    fn test_subnetwork_path_stops_at_start_source() {
        let mut graph = NetworkGraph::new();
        let root = graph.add_node(lia("A"), None).unwrap();
        let sub = graph
            .add_node(NodeKind::Join(BetaNodeSpec::object_type("B", vec![])), Some(root))
            .unwrap();
        let ria = graph.add_node(NodeKind::RightInputAdapter { start_source: root }, Some(sub)).unwrap();
        let exists = graph
            .add_node(
                NodeKind::Exists(BetaNodeSpec::new(RightInput::Subnetwork(ria), vec![])),
                Some(root),
            )
            .unwrap();

        assert_eq!(graph.path_nodes(ria).unwrap(), vec![sub]);
        assert_eq!(graph.subnetwork_parent(ria), Some(exists));
    }
}
