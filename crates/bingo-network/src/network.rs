//! Rule network construction and incremental editing
//!
//! Rules compile into chains of beta nodes hanging from one left input adapter per
//! root object type. Nodes with an identical kind under the same parent are shared.
//! Every edit recomputes the segment layout of the rules rooted at the same adapter,
//! since only those can share a segment with the edited rule, and reports the result
//! as a [`NetworkChange`] for the session to apply to its runtime memories.

use crate::config::NetworkConfig;
use crate::constraint::BetaConstraint;
use crate::error::{NetworkError, NetworkResult};
use crate::graph::{BetaNodeSpec, NetworkGraph, NodeKind, RightInput};
use crate::linking::PathKind;
use crate::segment::{PathBuild, PathLayout, SegmentBuilder, SegmentPrototype};
use crate::types::{NodeId, PathId, RuleId, SegmentId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, instrument};

/// One pattern over facts of a single object type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub object_type: String,
    pub constraints: Vec<BetaConstraint>,
    /// Facts arriving on a passive pattern never trigger evaluation by themselves
    #[serde(default)]
    pub passive: bool,
}

impl Pattern {
    pub fn new(object_type: impl Into<String>, constraints: Vec<BetaConstraint>) -> Self {
        Self { object_type: object_type.into(), constraints, passive: false }
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    fn spec(&self) -> BetaNodeSpec {
        let spec = BetaNodeSpec::object_type(self.object_type.clone(), self.constraints.clone());
        if self.passive { spec.passive() } else { spec }
    }
}

/// A condition following the root pattern of a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Join(Pattern),
    Not(Pattern),
    Exists(Pattern),
    /// Pass-through node; accumulate functions are evaluated elsewhere
    Accumulate(Pattern),
    /// No combination of the patterns matches
    NotAll(Vec<Pattern>),
    /// Some combination of the patterns matches
    ExistsAll(Vec<Pattern>),
}

/// A rule as handed to the network: a root object type followed by conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: RuleId,
    pub name: String,
    #[serde(default)]
    pub salience: i32,
    /// Object type of the root pattern
    pub object_type: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl RuleDefinition {
    pub fn new(id: RuleId, name: impl Into<String>, object_type: impl Into<String>) -> Self {
        Self { id, name: name.into(), salience: 0, object_type: object_type.into(), conditions: Vec::new() }
    }

    pub fn with_salience(mut self, salience: i32) -> Self {
        self.salience = salience;
        self
    }

    pub fn join(mut self, object_type: &str, constraints: Vec<BetaConstraint>) -> Self {
        self.conditions.push(Condition::Join(Pattern::new(object_type, constraints)));
        self
    }

    pub fn not(mut self, object_type: &str, constraints: Vec<BetaConstraint>) -> Self {
        self.conditions.push(Condition::Not(Pattern::new(object_type, constraints)));
        self
    }

    pub fn exists(mut self, object_type: &str, constraints: Vec<BetaConstraint>) -> Self {
        self.conditions.push(Condition::Exists(Pattern::new(object_type, constraints)));
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }
}

/// What the session must apply after a rule was added or removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkChange {
    pub rule: RuleId,
    /// Paths whose memories must be detached before the new layouts are attached
    pub detached_paths: Vec<PathId>,
    /// New layouts, sub-network paths before the paths that depend on them
    pub build: PathBuild,
    pub added_nodes: Vec<NodeId>,
    pub removed_nodes: Vec<NodeId>,
}

#[derive(Debug, Clone)]
struct RuleEntry {
    definition: RuleDefinition,
    root: NodeId,
    terminal: NodeId,
    /// Paths the rule depends on, its own terminal path last
    paths: Vec<PathId>,
}

/// The compiled rule network with its current segment layouts
#[derive(Debug, Clone)]
pub struct ReteNetwork {
    config: NetworkConfig,
    graph: NetworkGraph,
    rules: BTreeMap<RuleId, RuleEntry>,
    layouts: BTreeMap<PathId, PathLayout>,
    prototypes: BTreeMap<SegmentId, SegmentPrototype>,
    /// Object type to the adapters and beta nodes that read it
    type_index: HashMap<String, Vec<NodeId>>,
}

impl ReteNetwork {
    #[instrument]
    pub fn new(config: NetworkConfig) -> NetworkResult<Self> {
        config.validate()?;
        info!("Creating new join network");
        Ok(Self {
            config,
            graph: NetworkGraph::new(),
            rules: BTreeMap::new(),
            layouts: BTreeMap::new(),
            prototypes: BTreeMap::new(),
            type_index: HashMap::new(),
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn graph(&self) -> &NetworkGraph {
        &self.graph
    }

    /// Compile a rule into the network, sharing existing nodes where possible
    #[instrument(skip(self, rule), fields(rule_id = rule.id))]
    pub fn add_rule(&mut self, rule: RuleDefinition) -> NetworkResult<NetworkChange> {
        let rule_id = rule.id;
        if self.rules.contains_key(&rule_id) {
            return Err(NetworkError::structure(format!("rule {rule_id} is already in the network")));
        }
        for condition in &rule.conditions {
            if let Condition::NotAll(patterns) | Condition::ExistsAll(patterns) = condition {
                if patterns.is_empty() {
                    return Err(NetworkError::structure(format!("rule {rule_id} has an empty sub-network")));
                }
            }
        }
        info!(rule_id, name = %rule.name, "Adding rule to network");

        let mut added = Vec::new();
        let root = match self.find_adapter(&rule.object_type) {
            Some(id) => id,
            None => {
                let id = self
                    .graph
                    .add_node(NodeKind::LeftInputAdapter { object_type: rule.object_type.clone() }, None)?;
                added.push(id);
                id
            }
        };

        let mut rule_nodes = vec![root];
        let mut current = root;
        for condition in &rule.conditions {
            let kind = match condition {
                Condition::Join(p) => NodeKind::Join(p.spec()),
                Condition::Not(p) => NodeKind::Not(p.spec()),
                Condition::Exists(p) => NodeKind::Exists(p.spec()),
                Condition::Accumulate(p) => NodeKind::Accumulate(p.spec()),
                Condition::NotAll(patterns) | Condition::ExistsAll(patterns) => {
                    let mut sub = current;
                    for pattern in patterns {
                        sub = self.share_or_add(sub, NodeKind::Join(pattern.spec()), &mut added)?;
                        rule_nodes.push(sub);
                    }
                    let ria = self.share_or_add(sub, NodeKind::RightInputAdapter { start_source: current }, &mut added)?;
                    rule_nodes.push(ria);
                    let spec = BetaNodeSpec::new(RightInput::Subnetwork(ria), Vec::new());
                    match condition {
                        Condition::NotAll(_) => NodeKind::Not(spec),
                        _ => NodeKind::Exists(spec),
                    }
                }
            };
            current = self.share_or_add(current, kind, &mut added)?;
            rule_nodes.push(current);
        }

        let terminal = self
            .graph
            .add_node(NodeKind::RuleTerminal { rule: rule_id, salience: rule.salience }, Some(current))?;
        added.push(terminal);
        rule_nodes.push(terminal);
        for node in &rule_nodes {
            self.graph.associate(*node, rule_id)?;
        }

        let detached = self.paths_rooted_at(root);
        self.rules.insert(rule_id, RuleEntry { definition: rule, root, terminal, paths: Vec::new() });
        let affected = self.rules_rooted_at(root);
        let build = self.build_paths(&affected, None)?;
        self.install_build(&detached, &build);
        self.rebuild_type_index();

        debug!(rule_id, added = added.len(), shared = rule_nodes.len() - added.len(), "Rule compiled");
        Ok(NetworkChange { rule: rule_id, detached_paths: detached, build, added_nodes: added, removed_nodes: Vec::new() })
    }

    /// Remove a rule and prune the nodes no other rule uses
    #[instrument(skip(self))]
    pub fn remove_rule(&mut self, rule_id: RuleId) -> NetworkResult<NetworkChange> {
        let entry = self
            .rules
            .get(&rule_id)
            .cloned()
            .ok_or_else(|| NetworkError::structure(format!("rule {rule_id} is not in the network")))?;
        info!(rule_id, name = %entry.definition.name, "Removing rule from network");

        let detached = self.paths_rooted_at(entry.root);
        let affected: Vec<RuleId> = self.rules_rooted_at(entry.root).into_iter().filter(|&r| r != rule_id).collect();
        // boundaries are computed while the rule's nodes are still in the graph
        let build = self.build_paths(&affected, Some(entry.terminal))?;

        let rule_nodes: Vec<NodeId> =
            self.graph.nodes().filter(|n| n.is_associated_with(rule_id)).map(|n| n.id).collect();
        let mut orphaned = Vec::new();
        for node in rule_nodes {
            if self.graph.dissociate(node, rule_id)? == 0 {
                orphaned.push(node);
            }
        }
        let removed = self.prune(orphaned)?;

        self.rules.remove(&rule_id);
        self.install_build(&detached, &build);
        self.rebuild_type_index();

        debug!(rule_id, removed = removed.len(), "Rule removed");
        Ok(NetworkChange { rule: rule_id, detached_paths: detached, build, added_nodes: Vec::new(), removed_nodes: removed })
    }

    fn find_adapter(&self, object_type: &str) -> Option<NodeId> {
        self.graph
            .nodes()
            .find(|n| matches!(&n.kind, NodeKind::LeftInputAdapter { object_type: ot } if ot == object_type))
            .map(|n| n.id)
    }

    fn share_or_add(&mut self, parent: NodeId, kind: NodeKind, added: &mut Vec<NodeId>) -> NetworkResult<NodeId> {
        let existing = self.graph.node(parent)?.sinks.iter().copied().find(|&sink| {
            self.graph.get(sink).is_some_and(|n| n.kind == kind && !n.kind.is_terminal())
        });
        if let Some(id) = existing {
            return Ok(id);
        }
        let id = self.graph.add_node(kind, Some(parent))?;
        added.push(id);
        Ok(id)
    }

    /// Remove unassociated nodes leaf first
    fn prune(&mut self, mut orphaned: Vec<NodeId>) -> NetworkResult<Vec<NodeId>> {
        let mut removed = Vec::with_capacity(orphaned.len());
        while !orphaned.is_empty() {
            let before = orphaned.len();
            let mut remaining = Vec::with_capacity(before);
            for node in orphaned {
                if self.graph.node(node)?.sinks.is_empty() {
                    self.graph.remove_node(node)?;
                    removed.push(node);
                } else {
                    remaining.push(node);
                }
            }
            if remaining.len() == before {
                return Err(NetworkError::Structure {
                    message: "unassociated nodes still feed other nodes".to_string(),
                    node_id: remaining.first().copied(),
                    details: Some(format!("nodes: {remaining:?}")),
                });
            }
            orphaned = remaining;
        }
        Ok(removed)
    }

    fn rules_rooted_at(&self, root: NodeId) -> Vec<RuleId> {
        self.rules.iter().filter(|(_, e)| e.root == root).map(|(id, _)| *id).collect()
    }

    fn paths_rooted_at(&self, root: NodeId) -> Vec<PathId> {
        let mut paths = Vec::new();
        for entry in self.rules.values().filter(|e| e.root == root) {
            for path in &entry.paths {
                if !paths.contains(path) {
                    paths.push(*path);
                }
            }
        }
        paths
    }

    fn build_paths(&mut self, rules: &[RuleId], removing: Option<NodeId>) -> NetworkResult<PathBuild> {
        let builder = match removing {
            Some(terminal) => SegmentBuilder::discounting(&self.graph, terminal),
            None => SegmentBuilder::new(&self.graph),
        };
        let mut combined = PathBuild::default();
        let mut seen = HashSet::new();
        let mut rule_paths = Vec::with_capacity(rules.len());
        for rule in rules {
            let Some(entry) = self.rules.get(rule) else {
                continue;
            };
            let build = builder.create_path_memories(entry.terminal)?;
            rule_paths.push((*rule, build.paths.iter().map(|p| p.end).collect::<Vec<_>>()));
            for layout in build.paths {
                if seen.insert(layout.end) {
                    combined.paths.push(layout);
                }
            }
            combined.segments.extend(build.segments);
        }
        for (rule, paths) in rule_paths {
            if let Some(entry) = self.rules.get_mut(&rule) {
                entry.paths = paths;
            }
        }
        Ok(combined)
    }

    fn install_build(&mut self, detached: &[PathId], build: &PathBuild) {
        for path in detached {
            self.layouts.remove(path);
        }
        for layout in &build.paths {
            self.layouts.insert(layout.end, layout.clone());
        }
        for (root, prototype) in &build.segments {
            self.prototypes.insert(*root, prototype.clone());
        }
        let referenced: HashSet<SegmentId> = self.layouts.values().flat_map(|l| l.segments.iter().copied()).collect();
        self.prototypes.retain(|root, _| referenced.contains(root));
    }

    fn rebuild_type_index(&mut self) {
        self.type_index.clear();
        for node in self.graph.nodes() {
            let object_type = match &node.kind {
                NodeKind::LeftInputAdapter { object_type } => object_type,
                kind => match kind.beta_spec().map(|s| &s.right_input) {
                    Some(RightInput::ObjectType(object_type)) => object_type,
                    _ => continue,
                },
            };
            self.type_index.entry(object_type.clone()).or_default().push(node.id);
        }
    }

    /// Adapters and beta nodes fed by facts of `object_type`
    pub fn nodes_for_object_type(&self, object_type: &str) -> &[NodeId] {
        self.type_index.get(object_type).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rule(&self, rule_id: RuleId) -> Option<&RuleDefinition> {
        self.rules.get(&rule_id).map(|e| &e.definition)
    }

    pub fn terminal(&self, rule_id: RuleId) -> Option<NodeId> {
        self.rules.get(&rule_id).map(|e| e.terminal)
    }

    /// Paths the rule depends on; sub-network paths come before its terminal path
    pub fn rule_paths(&self, rule_id: RuleId) -> &[PathId] {
        self.rules.get(&rule_id).map(|e| e.paths.as_slice()).unwrap_or(&[])
    }

    pub fn rule_ids(&self) -> Vec<RuleId> {
        self.rules.keys().copied().collect()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn layout(&self, path: PathId) -> Option<&PathLayout> {
        self.layouts.get(&path)
    }

    pub fn layouts(&self) -> impl Iterator<Item = &PathLayout> {
        self.layouts.values()
    }

    pub fn prototype(&self, segment: SegmentId) -> Option<&SegmentPrototype> {
        self.prototypes.get(&segment)
    }

    pub fn prototypes(&self) -> impl Iterator<Item = &SegmentPrototype> {
        self.prototypes.values()
    }

    /// Rule or sub-network role of a path
    pub fn path_kind(&self, layout: &PathLayout) -> NetworkResult<PathKind> {
        let node = self.graph.node(layout.end)?;
        match node.kind {
            NodeKind::RuleTerminal { rule, .. } | NodeKind::QueryTerminal { rule } => Ok(PathKind::Rule(rule)),
            NodeKind::RightInputAdapter { .. } => {
                let parent = layout
                    .subnetwork_parent
                    .or_else(|| self.graph.subnetwork_parent(layout.end))
                    .ok_or_else(|| NetworkError::Structure {
                        message: "sub-network does not feed any node".to_string(),
                        node_id: Some(layout.end),
                        details: None,
                    })?;
                Ok(PathKind::Subnetwork { parent })
            }
            _ => Err(NetworkError::structure(format!("node {} does not end a path", layout.end))),
        }
    }

    /// Rules grouped into structurally disjoint sub-graphs
    pub fn partitions(&self) -> Vec<Vec<RuleId>> {
        let mut by_root: BTreeMap<NodeId, Vec<RuleId>> = BTreeMap::new();
        for (id, entry) in &self.rules {
            by_root.entry(entry.root).or_default().push(*id);
        }
        by_root.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bingo_types::ValueType;

    fn network() -> ReteNetwork {
        ReteNetwork::new(NetworkConfig::default()).unwrap()
    }

    fn order_customer(id: RuleId) -> RuleDefinition {
        RuleDefinition::new(id, format!("rule-{id}"), "Order")
            .join("Customer", vec![BetaConstraint::equal(0, "customer_id", "id", ValueType::Integer)])
    }

    #[test]
    fn test_identical_prefixes_are_shared() {
        let mut network = network();
        let first = network.add_rule(order_customer(1)).unwrap();
        assert_eq!(first.added_nodes.len(), 3);

        let second = network
            .add_rule(order_customer(2).exists("Payment", vec![BetaConstraint::equal(0, "id", "order_id", ValueType::Integer)]))
            .unwrap();
        // exists node and terminal only
        assert_eq!(second.added_nodes.len(), 2);
        assert_eq!(second.detached_paths, vec![network.terminal(1).unwrap()]);

        let join = network.graph().node(first.added_nodes[1]).unwrap();
        assert_eq!(join.association_count(), 2);
        assert_eq!(network.nodes_for_object_type("Customer"), &[join.id]);
    }

    #[test]
    fn test_adding_a_branch_splits_the_shared_segment() {
        let mut network = network();
        network.add_rule(order_customer(1)).unwrap();
        let t1 = network.terminal(1).unwrap();
        assert_eq!(network.layout(t1).unwrap().segments.len(), 1);

        network.add_rule(RuleDefinition::new(2, "orders", "Order").not("Hold", vec![])).unwrap();
        assert_eq!(network.layout(t1).unwrap().segments.len(), 2);
        assert_eq!(network.prototypes().count(), 3);
    }

    #[test]
    fn test_remove_rule_prunes_exclusive_nodes() {
        let mut network = network();
        network.add_rule(order_customer(1)).unwrap();
        network.add_rule(RuleDefinition::new(2, "orders", "Order").not("Hold", vec![])).unwrap();
        let nodes_before = network.graph().len();

        let change = network.remove_rule(2).unwrap();
        assert_eq!(change.removed_nodes.len(), 2);
        assert_eq!(network.graph().len(), nodes_before - 2);

        let t1 = network.terminal(1).unwrap();
        assert_eq!(network.layout(t1).unwrap().segments.len(), 1);
        assert_eq!(network.prototypes().count(), 1);
        assert!(network.remove_rule(2).is_err());
    }

    #[test]
    fn test_subnetwork_condition_builds_adapter_path() {
        let mut network = network();
        let rule = RuleDefinition::new(1, "no open items", "Order").condition(Condition::NotAll(vec![
            Pattern::new("Item", vec![BetaConstraint::equal(0, "id", "order_id", ValueType::Integer)]),
            Pattern::new("Hold", vec![]),
        ]));
        let change = network.add_rule(rule).unwrap();
        assert_eq!(change.build.paths.len(), 2);

        let sub = &change.build.paths[0];
        assert!(matches!(network.path_kind(sub).unwrap(), PathKind::Subnetwork { .. }));
        assert_eq!(network.rule_paths(1).len(), 2);
        assert_eq!(network.rule_paths(1)[1], network.terminal(1).unwrap());

        assert!(network
            .add_rule(RuleDefinition::new(2, "empty", "Order").condition(Condition::ExistsAll(vec![])))
            .is_err());
    }

    #[test]
    fn test_partitions_follow_root_types() {
        let mut network = network();
        network.add_rule(order_customer(1)).unwrap();
        network.add_rule(order_customer(2)).unwrap();
        network.add_rule(RuleDefinition::new(3, "alerts", "Alert")).unwrap();
        assert_eq!(network.partitions(), vec![vec![1, 2], vec![3]]);
        assert!(network.add_rule(order_customer(3)).is_err());
    }
}
