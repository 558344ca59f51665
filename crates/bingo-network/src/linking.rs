//! Segment and path memories, and the linking protocol between them
//!
//! Segment memories live in an arena keyed by their root node; path memories are
//! keyed by their end node. A segment lists the paths that depend on it and a path
//! lists its segments, so linking fans out by id without shared pointers.
//!
//! ## Protocol
//!
//! - `link_node` sets a node bit. When the segment becomes fully linked, every
//!   dependent path sets the segment bit. A path is rule-linked once its mask
//!   covers its all-linked test mask.
//! - `unlink_node` clears a node bit. When the segment drops out of the linked
//!   state, every dependent path clears the segment bit.
//! - A sub-network path that links or unlinks does the same to the beta node it
//!   feeds in the parent path.
//!
//! Transitions are returned as [`LinkEvent`]s so the caller decides how to react.

use crate::error::{NetworkError, NetworkResult};
use crate::segment::{PathLayout, SegmentPrototype};
use crate::types::{NodeId, PathId, RuleId, SegmentId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Linking transition reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkEvent {
    SegmentLinked { segment: SegmentId },
    SegmentUnlinked { segment: SegmentId },
    RuleLinked { rule: RuleId, path: PathId },
    RuleUnlinked { rule: RuleId, path: PathId },
}

/// What a path memory stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathKind {
    Rule(RuleId),
    /// Sub-network feeding the right input of `parent`
    Subnetwork { parent: NodeId },
}

/// Runtime state of one segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMemory {
    pub root: NodeId,
    pub tip: NodeId,
    pub linked_node_mask: u64,
    pub dirty_node_mask: u64,
    pub all_linked_mask_test: u64,
    pub segment_pos_mask_bit: u64,
    pub pos: usize,
    /// Dependent paths in attachment order
    pub path_memories: Vec<PathId>,
    pub nodes: Vec<(NodeId, u64)>,
}

impl SegmentMemory {
    pub fn from_prototype(prototype: &SegmentPrototype) -> Self {
        Self {
            root: prototype.root,
            tip: prototype.tip,
            linked_node_mask: 0,
            dirty_node_mask: 0,
            all_linked_mask_test: prototype.all_linked_mask_test,
            segment_pos_mask_bit: prototype.segment_pos_mask_bit,
            pos: prototype.pos,
            path_memories: Vec::new(),
            nodes: prototype.nodes.clone(),
        }
    }

    pub fn is_segment_linked(&self) -> bool {
        self.linked_node_mask & self.all_linked_mask_test == self.all_linked_mask_test
    }

    pub fn is_node_linked(&self, mask: u64) -> bool {
        self.linked_node_mask & mask == mask
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_node_mask != 0
    }
}

/// Runtime state of one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMemory {
    pub end: PathId,
    pub kind: PathKind,
    pub linked_segment_mask: u64,
    pub all_linked_test_mask: u64,
    /// Segment roots from the adapter side
    pub segments: Vec<SegmentId>,
}

impl PathMemory {
    pub fn is_rule_linked(&self) -> bool {
        self.linked_segment_mask & self.all_linked_test_mask == self.all_linked_test_mask
    }
}

/// Arena of segment and path memories
#[derive(Debug, Clone, Default)]
pub struct LinkingArena {
    segments: BTreeMap<SegmentId, SegmentMemory>,
    paths: BTreeMap<PathId, PathMemory>,
    /// Node to owning segment and position bit
    node_index: HashMap<NodeId, (SegmentId, u64)>,
}

impl LinkingArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a segment memory; returns false if one with the same root exists
    pub fn create_segment(&mut self, prototype: &SegmentPrototype) -> bool {
        if self.segments.contains_key(&prototype.root) {
            return false;
        }
        let memory = SegmentMemory::from_prototype(prototype);
        for &(node, mask) in &memory.nodes {
            self.node_index.insert(node, (memory.root, mask));
        }
        self.segments.insert(memory.root, memory);
        true
    }

    /// Drop a segment memory. Fails while paths still depend on it.
    pub fn remove_segment(&mut self, segment: SegmentId) -> NetworkResult<SegmentMemory> {
        let memory = self.segment(segment)?;
        if !memory.path_memories.is_empty() {
            return Err(NetworkError::Structure {
                message: format!("segment {segment} still has dependent paths"),
                node_id: Some(segment),
                details: Some(format!("paths: {:?}", memory.path_memories)),
            });
        }
        let memory = self.segments.remove(&segment).ok_or_else(|| NetworkError::unknown_node(segment))?;
        for (node, _) in &memory.nodes {
            if self.node_index.get(node).is_some_and(|(owner, _)| *owner == segment) {
                self.node_index.remove(node);
            }
        }
        Ok(memory)
    }

    /// Attach a path to existing segments; already linked segments count at once
    pub fn attach_path(&mut self, layout: &PathLayout, kind: PathKind) -> NetworkResult<Vec<LinkEvent>> {
        for segment in &layout.segments {
            self.segment(*segment)?;
        }
        if self.paths.contains_key(&layout.end) {
            return Err(NetworkError::Structure {
                message: format!("path {} is already attached", layout.end),
                node_id: Some(layout.end),
                details: None,
            });
        }

        let mut path = PathMemory {
            end: layout.end,
            kind,
            linked_segment_mask: 0,
            all_linked_test_mask: layout.spec.all_linked_test_mask,
            segments: layout.segments.clone(),
        };
        for segment in &layout.segments {
            if let Some(memory) = self.segments.get_mut(segment) {
                if !memory.path_memories.contains(&layout.end) {
                    memory.path_memories.push(layout.end);
                }
                if memory.is_segment_linked() {
                    path.linked_segment_mask |= memory.segment_pos_mask_bit;
                }
            }
        }
        let linked = path.is_rule_linked();
        self.paths.insert(layout.end, path);

        trace!(path = layout.end, kind = ?kind, linked, "Attached path memory");
        let mut events = Vec::new();
        if linked {
            self.on_path_linked(layout.end, &mut events)?;
        }
        Ok(events)
    }

    /// Detach a path without touching the state of other paths
    pub fn detach_path(&mut self, path: PathId) -> NetworkResult<Vec<LinkEvent>> {
        let memory = self.paths.remove(&path).ok_or_else(|| NetworkError::unknown_node(path))?;
        for segment in &memory.segments {
            if let Some(segment_memory) = self.segments.get_mut(segment) {
                segment_memory.path_memories.retain(|&p| p != path);
            }
        }
        let mut events = Vec::new();
        if memory.is_rule_linked() {
            match memory.kind {
                PathKind::Rule(rule) => events.push(LinkEvent::RuleUnlinked { rule, path }),
                PathKind::Subnetwork { parent } => {
                    if self.node_index.contains_key(&parent) {
                        self.unlink_node_into(parent, true, &mut events)?;
                    }
                }
            }
        }
        trace!(path, "Detached path memory");
        Ok(events)
    }

    /// Segments no path depends on any more
    pub fn orphan_segments(&self) -> Vec<SegmentId> {
        self.segments.values().filter(|s| s.path_memories.is_empty()).map(|s| s.root).collect()
    }

    pub fn link_node(&mut self, node: NodeId) -> NetworkResult<Vec<LinkEvent>> {
        let mut events = Vec::new();
        self.link_node_into(node, true, &mut events)?;
        Ok(events)
    }

    pub fn unlink_node(&mut self, node: NodeId) -> NetworkResult<Vec<LinkEvent>> {
        let mut events = Vec::new();
        self.unlink_node_into(node, true, &mut events)?;
        Ok(events)
    }

    /// Set a node bit without notifying paths; used when restoring state
    pub fn link_node_without_rule_notify(&mut self, node: NodeId) -> NetworkResult<()> {
        let mut events = Vec::new();
        self.link_node_into(node, false, &mut events)
    }

    pub fn unlink_node_without_rule_notify(&mut self, node: NodeId) -> NetworkResult<()> {
        let mut events = Vec::new();
        self.unlink_node_into(node, false, &mut events)
    }

    /// Set `bit` in a segment directly
    pub fn link_segment_bit(&mut self, segment: SegmentId, bit: u64) -> NetworkResult<Vec<LinkEvent>> {
        let mut events = Vec::new();
        self.link_bit(segment, bit, true, &mut events)?;
        Ok(events)
    }

    /// Clear `bit` in a segment directly
    pub fn unlink_segment_bit(&mut self, segment: SegmentId, bit: u64) -> NetworkResult<Vec<LinkEvent>> {
        let mut events = Vec::new();
        self.unlink_bit(segment, bit, true, &mut events)?;
        Ok(events)
    }

    fn link_node_into(&mut self, node: NodeId, notify: bool, events: &mut Vec<LinkEvent>) -> NetworkResult<()> {
        let (segment, bit) = self.node_position(node)?;
        self.link_bit(segment, bit, notify, events)
    }

    fn unlink_node_into(&mut self, node: NodeId, notify: bool, events: &mut Vec<LinkEvent>) -> NetworkResult<()> {
        let (segment, bit) = self.node_position(node)?;
        self.unlink_bit(segment, bit, notify, events)
    }

    fn link_bit(&mut self, segment: SegmentId, bit: u64, notify: bool, events: &mut Vec<LinkEvent>) -> NetworkResult<()> {
        let memory = self.segments.get_mut(&segment).ok_or_else(|| NetworkError::unknown_node(segment))?;
        let was_linked = memory.is_segment_linked();
        memory.linked_node_mask |= bit;
        memory.dirty_node_mask |= bit;
        let now_linked = memory.is_segment_linked();
        trace!(
            segment,
            bit,
            linked_node_mask = memory.linked_node_mask,
            segment_pos = memory.pos,
            notify,
            paths = ?memory.path_memories,
            "LinkNode notify={}",
            notify
        );
        if notify && !was_linked && now_linked {
            events.push(LinkEvent::SegmentLinked { segment });
            self.notify_segment_linked(segment, events)?;
        }
        Ok(())
    }

    fn unlink_bit(&mut self, segment: SegmentId, bit: u64, notify: bool, events: &mut Vec<LinkEvent>) -> NetworkResult<()> {
        let memory = self.segments.get_mut(&segment).ok_or_else(|| NetworkError::unknown_node(segment))?;
        if memory.linked_node_mask & bit == 0 {
            return Ok(());
        }
        let was_linked = memory.is_segment_linked();
        memory.linked_node_mask ^= bit;
        memory.dirty_node_mask |= bit;
        let now_linked = memory.is_segment_linked();
        trace!(
            segment,
            bit,
            linked_node_mask = memory.linked_node_mask,
            segment_pos = memory.pos,
            notify,
            paths = ?memory.path_memories,
            "UnlinkNode notify={}",
            notify
        );
        if notify && was_linked && !now_linked {
            events.push(LinkEvent::SegmentUnlinked { segment });
            self.notify_segment_unlinked(segment, events)?;
        }
        Ok(())
    }

    fn notify_segment_linked(&mut self, segment: SegmentId, events: &mut Vec<LinkEvent>) -> NetworkResult<()> {
        let (paths, bit) = self.dependents(segment)?;
        for path in paths {
            let Some(memory) = self.paths.get_mut(&path) else {
                continue;
            };
            let was_linked = memory.is_rule_linked();
            memory.linked_segment_mask |= bit;
            if !was_linked && memory.is_rule_linked() {
                self.on_path_linked(path, events)?;
            }
        }
        Ok(())
    }

    fn notify_segment_unlinked(&mut self, segment: SegmentId, events: &mut Vec<LinkEvent>) -> NetworkResult<()> {
        let (paths, bit) = self.dependents(segment)?;
        for path in paths {
            let Some(memory) = self.paths.get_mut(&path) else {
                continue;
            };
            let was_linked = memory.is_rule_linked();
            memory.linked_segment_mask &= !bit;
            if was_linked && !memory.is_rule_linked() {
                self.on_path_unlinked(path, events)?;
            }
        }
        Ok(())
    }

    fn dependents(&self, segment: SegmentId) -> NetworkResult<(Vec<PathId>, u64)> {
        let memory = self.segment(segment)?;
        Ok((memory.path_memories.clone(), memory.segment_pos_mask_bit))
    }

    fn on_path_linked(&mut self, path: PathId, events: &mut Vec<LinkEvent>) -> NetworkResult<()> {
        let kind = self.path(path)?.kind;
        match kind {
            PathKind::Rule(rule) => events.push(LinkEvent::RuleLinked { rule, path }),
            PathKind::Subnetwork { parent } => {
                if self.node_index.contains_key(&parent) {
                    self.link_node_into(parent, true, events)?;
                }
            }
        }
        Ok(())
    }

    fn on_path_unlinked(&mut self, path: PathId, events: &mut Vec<LinkEvent>) -> NetworkResult<()> {
        let kind = self.path(path)?.kind;
        match kind {
            PathKind::Rule(rule) => events.push(LinkEvent::RuleUnlinked { rule, path }),
            PathKind::Subnetwork { parent } => {
                if self.node_index.contains_key(&parent) {
                    self.unlink_node_into(parent, true, events)?;
                }
            }
        }
        Ok(())
    }

    /// Mark a node as changed without altering its link state
    pub fn mark_node_dirty(&mut self, node: NodeId) -> NetworkResult<()> {
        let (segment, bit) = self.node_position(node)?;
        if let Some(memory) = self.segments.get_mut(&segment) {
            memory.dirty_node_mask |= bit;
        }
        Ok(())
    }

    pub fn is_path_dirty(&self, path: PathId) -> NetworkResult<bool> {
        let memory = self.path(path)?;
        Ok(memory.segments.iter().any(|s| self.segments.get(s).is_some_and(SegmentMemory::is_dirty)))
    }

    /// Reset every dirty mask after an evaluation pass
    pub fn clean(&mut self) {
        for memory in self.segments.values_mut() {
            memory.dirty_node_mask = 0;
        }
    }

    pub fn node_position(&self, node: NodeId) -> NetworkResult<(SegmentId, u64)> {
        self.node_index.get(&node).copied().ok_or_else(|| NetworkError::unknown_node(node))
    }

    pub fn is_node_linked(&self, node: NodeId) -> NetworkResult<bool> {
        let (segment, bit) = self.node_position(node)?;
        Ok(self.segment(segment)?.is_node_linked(bit))
    }

    pub fn is_segment_linked(&self, segment: SegmentId) -> NetworkResult<bool> {
        Ok(self.segment(segment)?.is_segment_linked())
    }

    pub fn is_path_linked(&self, path: PathId) -> NetworkResult<bool> {
        Ok(self.path(path)?.is_rule_linked())
    }

    pub fn segment(&self, segment: SegmentId) -> NetworkResult<&SegmentMemory> {
        self.segments.get(&segment).ok_or_else(|| NetworkError::unknown_node(segment))
    }

    pub fn path(&self, path: PathId) -> NetworkResult<&PathMemory> {
        self.paths.get(&path).ok_or_else(|| NetworkError::unknown_node(path))
    }

    pub fn has_segment(&self, segment: SegmentId) -> bool {
        self.segments.contains_key(&segment)
    }

    pub fn has_path(&self, path: PathId) -> bool {
        self.paths.contains_key(&path)
    }

    pub fn segments(&self) -> impl Iterator<Item = &SegmentMemory> {
        self.segments.values()
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathMemory> {
        self.paths.values()
    }

    /// Rule paths that are linked and have pending changes
    pub fn dirty_linked_rule_paths(&self) -> Vec<(RuleId, PathId)> {
        self.paths
            .values()
            .filter_map(|p| match p.kind {
                PathKind::Rule(rule) if p.is_rule_linked() => Some((rule, p.end)),
                _ => None,
            })
            .filter(|(_, path)| self.is_path_dirty(*path).unwrap_or(false))
            .collect()
    }
}
