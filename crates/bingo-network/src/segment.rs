//! Segment construction
//!
//! A segment is a maximal run of left tuple sources with single input and single
//! output. Its root is an input adapter or a node whose source fans out; its tip is
//! a fan-out point or the last node before a path end. Every node in a segment gets
//! a position bit, and the bits of the nodes that can be disabled make up the
//! segment's all-linked test mask.
//!
//! Segments are numbered along a path by counting the fan-out points between the
//! segment root and the input adapter. A [`PathMemSpec`] holds the path's own
//! all-linked mask over those segment bits.
//!
//! The builder can discount a rule that is being removed, so boundaries can be
//! recomputed before its nodes leave the graph.

use crate::error::{NetworkError, NetworkResult};
use crate::graph::{BetaNodeSpec, NetworkGraph, NetworkNode, NodeKind};
use crate::types::{NodeId, NodeType, RuleId, SegmentId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, instrument};

/// Next position bit. Once the top bit is reached every further item shares it,
/// so linking any of them counts for all of them.
pub fn next_node_pos_mask(mask: u64) -> u64 {
    if mask == 0 {
        return 1;
    }
    match mask.checked_shl(1) {
        Some(next) if next != 0 => next,
        _ => mask,
    }
}

/// Memory placeholder registered for a node of a segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeMemoryPrototype {
    LeftInputAdapter { node: NodeId, pos_mask: u64 },
    Beta { node: NodeId, pos_mask: u64, node_type: NodeType, subnetwork: Option<NodeId> },
    Timer { node: NodeId, pos_mask: u64 },
    Query { node: NodeId, pos_mask: u64 },
    AsyncReceive { node: NodeId, pos_mask: u64 },
    ReactiveFrom { node: NodeId, pos_mask: u64 },
}

impl NodeMemoryPrototype {
    pub fn node(&self) -> NodeId {
        match self {
            NodeMemoryPrototype::LeftInputAdapter { node, .. }
            | NodeMemoryPrototype::Beta { node, .. }
            | NodeMemoryPrototype::Timer { node, .. }
            | NodeMemoryPrototype::Query { node, .. }
            | NodeMemoryPrototype::AsyncReceive { node, .. }
            | NodeMemoryPrototype::ReactiveFrom { node, .. } => *node,
        }
    }
}

/// Static layout of one segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentPrototype {
    pub root: NodeId,
    pub tip: NodeId,
    /// Nodes root to tip with their position bits
    pub nodes: Vec<(NodeId, u64)>,
    pub memories: Vec<NodeMemoryPrototype>,
    pub all_linked_mask_test: u64,
    /// Bit of this segment within the paths running through it
    pub segment_pos_mask_bit: u64,
    /// Number of fan-out points between the segment and the adapter
    pub pos: usize,
}

impl SegmentPrototype {
    pub fn id(&self) -> SegmentId {
        self.root
    }

    pub fn node_mask(&self, node: NodeId) -> Option<u64> {
        self.nodes.iter().find(|(id, _)| *id == node).map(|(_, mask)| *mask)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.iter().any(|(id, _)| *id == node)
    }

    /// Same boundaries and masks; runtime state of a matching segment can be kept
    pub fn same_layout(&self, other: &SegmentPrototype) -> bool {
        self.root == other.root
            && self.tip == other.tip
            && self.nodes == other.nodes
            && self.all_linked_mask_test == other.all_linked_mask_test
            && self.segment_pos_mask_bit == other.segment_pos_mask_bit
    }
}

/// All-linked test over the segment bits of a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMemSpec {
    pub all_linked_test_mask: u64,
    pub segment_count: usize,
}

impl PathMemSpec {
    /// A sub-network whose mask is empty never reacts to input on its own
    pub fn is_reactive(&self) -> bool {
        self.all_linked_test_mask > 0
    }
}

/// Segment layout of one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathLayout {
    pub end: NodeId,
    pub spec: PathMemSpec,
    /// Segment roots ordered from the adapter side
    pub segments: Vec<SegmentId>,
    /// For sub-network paths, the beta node fed by the adapter
    pub subnetwork_parent: Option<NodeId>,
}

/// Layouts produced for one end node, sub-network paths first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathBuild {
    pub paths: Vec<PathLayout>,
    pub segments: BTreeMap<SegmentId, SegmentPrototype>,
}

/// Computes segment boundaries and prototypes over a static graph
pub struct SegmentBuilder<'g> {
    graph: &'g NetworkGraph,
    /// Terminal of a rule being removed; its exclusive nodes are ignored
    removing: Option<NodeId>,
}

impl<'g> SegmentBuilder<'g> {
    pub fn new(graph: &'g NetworkGraph) -> Self {
        Self { graph, removing: None }
    }

    /// Compute boundaries as if the rule ending at `terminal` were already gone
    pub fn discounting(graph: &'g NetworkGraph, terminal: NodeId) -> Self {
        Self { graph, removing: Some(terminal) }
    }

    fn node(&self, id: NodeId) -> NetworkResult<&'g NetworkNode> {
        self.graph.node(id)
    }

    fn removing_rule(&self) -> Option<RuleId> {
        let terminal = self.graph.get(self.removing?)?;
        match terminal.kind {
            NodeKind::RuleTerminal { rule, .. } | NodeKind::QueryTerminal { rule } => Some(rule),
            _ => None,
        }
    }

    /// Adapters always start a segment; so does any node whose source fans out
    pub fn is_root_node(&self, id: NodeId) -> NetworkResult<bool> {
        let node = self.node(id)?;
        if node.kind.is_left_input_adapter() {
            return Ok(true);
        }
        match node.left_source {
            Some(source) => self.is_non_terminal_tip_node(source),
            None => Ok(false),
        }
    }

    /// End nodes always end a segment; so does any fan-out point
    pub fn is_tip_node(&self, id: NodeId) -> NetworkResult<bool> {
        let node = self.node(id)?;
        if node.kind.is_end_node() {
            return Ok(true);
        }
        self.is_non_terminal_tip_node(id)
    }

    /// More than one sink once the removing rule's exclusive sinks are discounted
    pub fn is_non_terminal_tip_node(&self, id: NodeId) -> NetworkResult<bool> {
        let node = self.node(id)?;
        let Some(terminal) = self.removing else {
            return Ok(node.sinks.len() > 1);
        };
        if node.sinks.len() <= 1 {
            return Ok(false);
        }
        let mut count = 0;
        for &sink in &node.sinks {
            if self.sink_not_exclusive_to(terminal, sink)? {
                count += 1;
                if count > 1 {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn sink_not_exclusive_to(&self, terminal: NodeId, sink: NodeId) -> NetworkResult<bool> {
        let sink_node = self.node(sink)?;
        let associated = self.removing_rule().is_some_and(|rule| sink_node.is_associated_with(rule));
        Ok(sink_node.association_count() > 1
            || !associated
            || !(sink == terminal || self.graph.is_on_path(terminal, sink))
            || self.has_terminals_other_than(sink, terminal)?)
    }

    fn has_terminals_other_than(&self, id: NodeId, terminal: NodeId) -> NetworkResult<bool> {
        let node = self.node(id)?;
        for &sink in &node.sinks {
            let sink_node = self.node(sink)?;
            if sink_node.kind.is_terminal() {
                if sink != terminal {
                    return Ok(true);
                }
            } else if self.has_terminals_other_than(sink, terminal)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Build the prototype of the segment `root..=tip`
    #[instrument(skip(self))]
    pub fn build_segment(&self, root: NodeId, tip: NodeId) -> NetworkResult<SegmentPrototype> {
        let chain = self.chain(root, tip)?;

        let mut nodes = Vec::with_capacity(chain.len());
        let mut memories = Vec::new();
        let mut pos_mask = 1u64;
        let mut all_linked_mask_test = 0u64;
        // nodes after a branch can notify, but cannot affect linking
        let mut update_node_bit = true;

        for &id in &chain {
            let node = self.node(id)?;
            nodes.push((id, pos_mask));
            match &node.kind {
                NodeKind::LeftInputAdapter { .. } => {
                    memories.push(NodeMemoryPrototype::LeftInputAdapter { node: id, pos_mask });
                    all_linked_mask_test |= pos_mask;
                }
                NodeKind::Join(spec) | NodeKind::Not(spec) | NodeKind::Exists(spec) | NodeKind::Accumulate(spec) => {
                    let node_type = node.kind.node_type().unwrap_or(NodeType::Other);
                    let disableable = update_node_bit && can_be_disabled(node_type, spec);
                    let participates = match spec.subnetwork() {
                        // only reactive sub-networks can disable their parent
                        Some(ria) => disableable && self.path_mem_spec(ria)?.is_reactive(),
                        None => disableable,
                    };
                    if participates {
                        all_linked_mask_test |= pos_mask;
                    }
                    memories.push(NodeMemoryPrototype::Beta {
                        node: id,
                        pos_mask,
                        node_type,
                        subnetwork: spec.subnetwork(),
                    });
                }
                NodeKind::ConditionalBranch => update_node_bit = false,
                NodeKind::ReactiveFrom => memories.push(NodeMemoryPrototype::ReactiveFrom { node: id, pos_mask }),
                NodeKind::Timer => memories.push(NodeMemoryPrototype::Timer { node: id, pos_mask }),
                NodeKind::AsyncReceive => memories.push(NodeMemoryPrototype::AsyncReceive { node: id, pos_mask }),
                NodeKind::Query { abductive } => {
                    memories.push(NodeMemoryPrototype::Query { node: id, pos_mask });
                    update_node_bit = !abductive;
                }
                NodeKind::RuleTerminal { .. }
                | NodeKind::QueryTerminal { .. }
                | NodeKind::RightInputAdapter { .. }
                | NodeKind::Other => {}
            }
            pos_mask = next_node_pos_mask(pos_mask);
        }

        let (segment_pos_mask_bit, pos) = self.segment_position(root)?;
        debug!(
            root,
            tip,
            nodes = nodes.len(),
            all_linked_mask_test,
            segment_pos_mask_bit,
            "Built segment prototype"
        );
        Ok(SegmentPrototype { root, tip, nodes, memories, all_linked_mask_test, segment_pos_mask_bit, pos })
    }

    /// Nodes from root to tip, found by walking up from the tip
    fn chain(&self, root: NodeId, tip: NodeId) -> NetworkResult<Vec<NodeId>> {
        let mut chain = vec![tip];
        let mut current = tip;
        while current != root {
            let node = self.node(current)?;
            current = node.left_source.ok_or_else(|| NetworkError::Structure {
                message: format!("node {root} is not upstream of node {tip}"),
                node_id: Some(root),
                details: Some(format!("walk ended at node {}", node.id)),
            })?;
            chain.push(current);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Segment bit and index, counting fan-out points up to the adapter
    fn segment_position(&self, root: NodeId) -> NetworkResult<(u64, usize)> {
        let mut mask = 1u64;
        let mut counter = 0;
        let mut current = self.node(root)?;
        while !current.kind.is_left_input_adapter() {
            let Some(source) = current.left_source else {
                break;
            };
            if self.is_non_terminal_tip_node(source)? {
                mask = next_node_pos_mask(mask);
                counter += 1;
            }
            current = self.node(source)?;
        }
        Ok((mask, counter))
    }

    /// Walk up from `lts` to the adapter (or to `stop`), returning segment roots and tips
    fn segment_bounds(&self, lts: NodeId, stop: Option<NodeId>) -> NetworkResult<Vec<(NodeId, NodeId)>> {
        let mut bounds = Vec::new();
        if Some(lts) == stop {
            return Ok(bounds);
        }
        let mut tip = lts;
        loop {
            let mut root = tip;
            while !self.is_root_node(root)? {
                root = self.node(root)?.left_source.ok_or_else(|| NetworkError::unknown_node(root))?;
            }
            bounds.push((root, tip));

            let root_node = self.node(root)?;
            if root_node.kind.is_left_input_adapter() {
                break;
            }
            match root_node.left_source {
                Some(next) if Some(next) != stop => tip = next,
                _ => break,
            }
        }
        bounds.reverse();
        Ok(bounds)
    }

    /// Path spec of the path ending at `end`. A segment takes part when it holds the
    /// adapter or a beta node with a reactive right input.
    pub fn path_mem_spec(&self, end: NodeId) -> NetworkResult<PathMemSpec> {
        let (lts, stop) = self.path_start(end)?;
        let Some(lts) = lts else {
            return Ok(PathMemSpec { all_linked_test_mask: 0, segment_count: 0 });
        };
        let bounds = self.segment_bounds(lts, stop)?;
        let mut all_linked_test_mask = 0;
        for &(root, tip) in &bounds {
            if self.segment_is_reactive(root, tip)? {
                all_linked_test_mask |= self.segment_position(root)?.0;
            }
        }
        Ok(PathMemSpec { all_linked_test_mask, segment_count: bounds.len() })
    }

    fn segment_is_reactive(&self, root: NodeId, tip: NodeId) -> NetworkResult<bool> {
        for id in self.chain(root, tip)? {
            let node = self.node(id)?;
            if node.kind.is_left_input_adapter() {
                return Ok(true);
            }
            if node.kind.beta_spec().is_some_and(|spec| !spec.right_input_passive) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn path_start(&self, end: NodeId) -> NetworkResult<(Option<NodeId>, Option<NodeId>)> {
        let node = self.node(end)?;
        if !node.kind.is_end_node() {
            return Err(NetworkError::Structure {
                message: format!("{} node cannot end a path", node.kind.name()),
                node_id: Some(end),
                details: None,
            });
        }
        let stop = match node.kind {
            NodeKind::RightInputAdapter { start_source } => Some(start_source),
            _ => None,
        };
        Ok((node.left_source, stop))
    }

    /// Prototypes for every segment of the path ending at `end`, including the
    /// paths of the sub-networks it depends on
    #[instrument(skip(self))]
    pub fn create_path_memories(&self, end: NodeId) -> NetworkResult<PathBuild> {
        let mut build = PathBuild::default();
        let mut visited = HashSet::new();
        self.collect_path(end, &mut build, &mut visited)?;
        debug!(end, paths = build.paths.len(), segments = build.segments.len(), "Created path memories");
        Ok(build)
    }

    fn collect_path(&self, end: NodeId, build: &mut PathBuild, visited: &mut HashSet<NodeId>) -> NetworkResult<()> {
        if !visited.insert(end) {
            return Ok(());
        }
        let (lts, stop) = self.path_start(end)?;
        let mut segments = Vec::new();
        if let Some(lts) = lts {
            for (root, tip) in self.segment_bounds(lts, stop)? {
                let prototype = self.build_segment(root, tip)?;
                for memory in &prototype.memories {
                    if let NodeMemoryPrototype::Beta { subnetwork: Some(ria), .. } = memory {
                        self.collect_path(*ria, build, visited)?;
                    }
                }
                segments.push(root);
                build.segments.insert(root, prototype);
            }
        }

        let subnetwork_parent = match self.node(end)?.kind {
            NodeKind::RightInputAdapter { .. } => self.graph.subnetwork_parent(end),
            _ => None,
        };
        build.paths.push(PathLayout { end, spec: self.path_mem_spec(end)?, segments, subnetwork_parent });
        Ok(())
    }
}

/// Non-empty not nodes and accumulates always evaluate; so does a passive right
/// input and a not node over a sub-network
fn can_be_disabled(node_type: NodeType, spec: &BetaNodeSpec) -> bool {
    let non_empty_not = node_type == NodeType::Not && (!spec.constraints.is_empty() || spec.subnetwork().is_some());
    !non_empty_not && node_type != NodeType::Accumulate && !spec.right_input_passive
}

/// Convenience wrapper over [`SegmentBuilder::build_segment`]
pub fn build_segment(graph: &NetworkGraph, root: NodeId, tip: NodeId) -> NetworkResult<SegmentPrototype> {
    SegmentBuilder::new(graph).build_segment(root, tip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::BetaConstraint;
    use crate::graph::RightInput;
    use crate::linking::LinkingArena;
    use bingo_types::ValueType;

    fn lia(graph: &mut NetworkGraph, object_type: &str) -> NodeId {
        graph.add_node(NodeKind::LeftInputAdapter { object_type: object_type.to_string() }, None).unwrap()
    }

    fn join(graph: &mut NetworkGraph, source: NodeId, object_type: &str) -> NodeId {
        graph
            .add_node(NodeKind::Join(BetaNodeSpec::object_type(object_type, vec![])), Some(source))
            .unwrap()
    }

    fn terminal(graph: &mut NetworkGraph, source: NodeId, rule: RuleId) -> NodeId {
        let id = graph.add_node(NodeKind::RuleTerminal { rule, salience: 0 }, Some(source)).unwrap();
        for node in graph.path_nodes(id).unwrap() {
            graph.associate(node, rule).unwrap();
        }
        graph.associate(id, rule).unwrap();
        id
    }

    #[test]
    fn test_next_node_pos_mask_saturates() {
        assert_eq!(next_node_pos_mask(1), 2);
        assert_eq!(next_node_pos_mask(1 << 62), 1 << 63);
        assert_eq!(next_node_pos_mask(1 << 63), 1 << 63);
    }

    #[test]
    fn test_wide_segment_collapses_onto_the_last_bit() {
        let mut graph = NetworkGraph::new();
        let root = lia(&mut graph, "A");
        let mut tip = root;
        for i in 0..66 {
            tip = join(&mut graph, tip, &format!("J{i}"));
        }
        terminal(&mut graph, tip, 1);

        let prototype = build_segment(&graph, root, tip).unwrap();
        assert_eq!(prototype.nodes.len(), 67);
        for (i, (_, mask)) in prototype.nodes.iter().enumerate() {
            assert_eq!(*mask, 1u64 << i.min(63), "node {i}");
        }
        assert_eq!(prototype.all_linked_mask_test, u64::MAX);

        let mut arena = LinkingArena::new();
        assert!(arena.create_segment(&prototype));
        let (distinct, shared) = prototype.nodes.split_at(63);
        for (node, _) in distinct {
            arena.link_node(*node).unwrap();
        }
        assert!(!arena.is_segment_linked(root).unwrap());

        // any node on the top bit links it for all of them
        arena.link_node(shared[3].0).unwrap();
        assert!(arena.is_segment_linked(root).unwrap());
        assert!(shared.iter().all(|(node, _)| arena.is_node_linked(*node).unwrap()));

        // and unlinking any one of them unlinks them all
        arena.unlink_node(shared[1].0).unwrap();
        let memory = arena.segment(root).unwrap();
        assert_eq!(memory.linked_node_mask, u64::MAX >> 1);
        assert_eq!(memory.all_linked_mask_test, u64::MAX);
        assert!(!arena.is_segment_linked(root).unwrap());
        assert!(!arena.is_node_linked(shared[3].0).unwrap());

        // a second unlink of the cleared bit changes nothing
        arena.unlink_node(shared[2].0).unwrap();
        assert_eq!(arena.segment(root).unwrap().linked_node_mask, u64::MAX >> 1);
    }

    #[test]
    fn test_single_segment_masks() {
        let mut graph = NetworkGraph::new();
        let root = lia(&mut graph, "A");
        let j1 = join(&mut graph, root, "B");
        let not = graph
            .add_node(
                NodeKind::Not(BetaNodeSpec::object_type(
                    "C",
                    vec![BetaConstraint::equal(0, "x", "x", ValueType::Integer)],
                )),
                Some(j1),
            )
            .unwrap();
        let j2 = join(&mut graph, not, "D");
        terminal(&mut graph, j2, 1);

        let prototype = build_segment(&graph, root, j2).unwrap();
        assert_eq!(prototype.nodes, vec![(root, 1), (j1, 2), (not, 4), (j2, 8)]);
        // the constrained not node never disables the segment
        assert_eq!(prototype.all_linked_mask_test, 0b1011);
        assert_eq!(prototype.segment_pos_mask_bit, 1);
        assert_eq!(prototype.pos, 0);
    }

    #[test]
    fn test_fan_out_splits_segments() {
        let mut graph = NetworkGraph::new();
        let root = lia(&mut graph, "A");
        let shared = join(&mut graph, root, "B");
        let left = join(&mut graph, shared, "C");
        let right = join(&mut graph, shared, "D");
        let t1 = terminal(&mut graph, left, 1);
        let t2 = terminal(&mut graph, right, 2);

        let builder = SegmentBuilder::new(&graph);
        assert!(builder.is_non_terminal_tip_node(shared).unwrap());
        assert!(builder.is_root_node(left).unwrap());
        assert!(builder.is_tip_node(t1).unwrap());

        let build = builder.create_path_memories(t1).unwrap();
        assert_eq!(build.paths[0].segments, vec![root, left]);
        assert_eq!(build.paths[0].spec, PathMemSpec { all_linked_test_mask: 0b11, segment_count: 2 });
        assert_eq!(build.segments[&left].segment_pos_mask_bit, 2);
        assert_eq!(build.segments[&left].pos, 1);

        // discounting rule 2 merges everything back into one segment
        let discounting = SegmentBuilder::discounting(&graph, t2);
        assert!(!discounting.is_non_terminal_tip_node(shared).unwrap());
        let merged = discounting.create_path_memories(t1).unwrap();
        assert_eq!(merged.paths[0].segments, vec![root]);
        assert_eq!(merged.segments[&root].tip, left);
    }

    #[test]
    fn test_conditional_branch_stops_bit_updates() {
        let mut graph = NetworkGraph::new();
        let root = lia(&mut graph, "A");
        let branch = graph.add_node(NodeKind::ConditionalBranch, Some(root)).unwrap();
        let j = join(&mut graph, branch, "B");
        terminal(&mut graph, j, 1);

        let prototype = build_segment(&graph, root, j).unwrap();
        assert_eq!(prototype.all_linked_mask_test, 1);
        assert_eq!(prototype.node_mask(j), Some(4));
    }

    #[test]
    fn test_subnetwork_bit_depends_on_reactivity() {
        let mut graph = NetworkGraph::new();
        let root = lia(&mut graph, "A");
        let sub = join(&mut graph, root, "B");
        let ria = graph.add_node(NodeKind::RightInputAdapter { start_source: root }, Some(sub)).unwrap();
        let exists = graph
            .add_node(NodeKind::Exists(BetaNodeSpec::new(RightInput::Subnetwork(ria), vec![])), Some(root))
            .unwrap();
        let t = terminal(&mut graph, exists, 1);

        let build = SegmentBuilder::new(&graph).create_path_memories(t).unwrap();
        assert_eq!(build.paths.len(), 2);
        assert_eq!(build.paths[0].end, ria);
        assert_eq!(build.paths[0].subnetwork_parent, Some(exists));
        assert!(build.paths[0].spec.is_reactive());
        assert_eq!(build.segments[&exists].all_linked_mask_test, 1);
        assert_eq!(build.paths[1].segments, vec![root, exists]);
    }

    #[test]
    fn test_building_from_unrelated_nodes_fails() {
        let mut graph = NetworkGraph::new();
        let a = lia(&mut graph, "A");
        let b = lia(&mut graph, "B");
        assert!(build_segment(&graph, a, b).is_err());
    }
}
