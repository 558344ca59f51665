//! Field index selection for beta nodes
//!
//! Decides, once per node at build time, which constraints back the node's join
//! memory index and in which order they are evaluated. Selection never mutates the
//! caller's constraints: it returns an [`IndexSelection`] permutation which
//! [`IndexSelection::apply`] turns into the reordered constraint list.
//!
//! ## Policies
//!
//! - **Equality priority**: equality constraints anywhere in the node are pulled to
//!   the front, up to the composite key depth. Without one, the first range
//!   indexable constraint is used when the node type allows range indexes.
//! - **Pattern order**: the first indexable constraint in declaration order decides
//!   whether the node gets a hash or a range index.
//!
//! Any indexable unification constraint makes the node non-composite: the key depth
//! clamps to one and a non-unification constraint is moved to the first slot.

use crate::config::{IndexPrecedence, NetworkConfig};
use crate::constraint::{range_index_allowed, BetaConstraint, ConstraintOperator, FieldIndex};
use crate::types::NodeType;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Result of index selection for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSelection {
    /// `order[i]` is the original position of the constraint placed at slot `i`
    pub order: Vec<usize>,
    /// Whether the constraint at slot `i` is part of the index
    pub indexed: Vec<bool>,
    /// Effective composite key depth after unification clamping
    pub key_depth: usize,
}

impl IndexSelection {
    fn identity(len: usize, key_depth: usize) -> Self {
        Self { order: (0..len).collect(), indexed: vec![false; len], key_depth }
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a != b {
            self.order.swap(a, b);
        }
    }

    /// Reorder a slice the same way the constraints were reordered
    pub fn apply<T: Clone>(&self, items: &[T]) -> Vec<T> {
        self.order.iter().filter_map(|&i| items.get(i).cloned()).collect()
    }

    pub fn has_index(&self) -> bool {
        self.indexed.iter().any(|&b| b)
    }

    pub fn indexed_count(&self) -> usize {
        self.indexed.iter().filter(|&&b| b).count()
    }
}

/// Select the indexed constraints of a beta node
pub fn select_indexes(
    constraints: &[BetaConstraint],
    node_type: NodeType,
    config: &NetworkConfig,
) -> IndexSelection {
    let depth = config.composite_key_depth as usize;
    let mut selection = IndexSelection::identity(constraints.len(), depth);
    if depth < 1 {
        return selection;
    }

    if !composite_allowed(constraints, node_type, config, &mut selection) {
        selection.key_depth = 1;
    }

    match config.index_precedence {
        IndexPrecedence::EqualityPriority => {
            select_with_equality_priority(constraints, node_type, config, &mut selection)
        }
        IndexPrecedence::PatternOrder => {
            select_with_pattern_order(constraints, node_type, config, &mut selection)
        }
    }

    trace!(
        node_type = ?node_type,
        order = ?selection.order,
        indexed = ?selection.indexed,
        key_depth = selection.key_depth,
        "Selected join indexes"
    );
    selection
}

/// Returns false when an indexable unification constraint is present
fn composite_allowed(
    constraints: &[BetaConstraint],
    node_type: NodeType,
    config: &NetworkConfig,
    selection: &mut IndexSelection,
) -> bool {
    let mut first_unification = None;
    let mut first_non_unification = None;
    for (i, constraint) in constraints.iter().enumerate() {
        if constraint.is_indexable_for_node(node_type, config) {
            if constraint.unification {
                first_unification.get_or_insert(i);
            } else {
                first_non_unification.get_or_insert(i);
            }
        }
        if first_unification.is_some() && first_non_unification.is_some() {
            break;
        }
    }

    if let Some(pos) = first_non_unification {
        selection.swap(0, pos);
    }
    first_unification.is_none()
}

fn select_with_equality_priority(
    constraints: &[BetaConstraint],
    node_type: NodeType,
    config: &NetworkConfig,
    selection: &mut IndexSelection,
) {
    if sort_equal_indexable(constraints, selection, 0) {
        return;
    }
    if !range_index_allowed(node_type, config) {
        return;
    }
    if let Some(slot) = (0..selection.order.len())
        .find(|&slot| slot_constraint(constraints, selection, slot).is_some_and(|c| c.is_indexable_for_node(node_type, config)))
    {
        sort_range_indexable(selection, slot);
    }
}

fn select_with_pattern_order(
    constraints: &[BetaConstraint],
    node_type: NodeType,
    config: &NetworkConfig,
    selection: &mut IndexSelection,
) {
    for slot in 0..selection.order.len() {
        let Some(constraint) = slot_constraint(constraints, selection, slot) else {
            continue;
        };
        if constraint.is_indexable_for_node(node_type, config) {
            if constraint.is_equal_indexable() {
                sort_equal_indexable(constraints, selection, slot);
            } else {
                sort_range_indexable(selection, slot);
            }
            break;
        }
    }
}

/// Pull equality constraints from `start` onwards to the front, up to the key depth
fn sort_equal_indexable(constraints: &[BetaConstraint], selection: &mut IndexSelection, start: usize) -> bool {
    let mut found = false;
    let mut counter = 0;
    for slot in start..selection.order.len() {
        if slot_constraint(constraints, selection, slot).is_some_and(BetaConstraint::is_equal_indexable) {
            found = true;
            if selection.key_depth > counter {
                selection.swap(slot, counter);
                selection.indexed[counter] = true;
                counter += 1;
            }
        }
    }
    found
}

fn sort_range_indexable(selection: &mut IndexSelection, slot: usize) {
    selection.swap(slot, 0);
    selection.indexed[0] = true;
}

fn slot_constraint<'a>(
    constraints: &'a [BetaConstraint],
    selection: &IndexSelection,
    slot: usize,
) -> Option<&'a BetaConstraint> {
    selection.order.get(slot).and_then(|&i| constraints.get(i))
}

/// Kind of index a join memory is keyed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// No usable constraint; linear scan
    None,
    /// Hash index over one or more equality fields
    Equal,
    /// Ordered index over one comparison field
    Range(ConstraintOperator),
}

impl IndexKind {
    pub fn is_indexed(&self) -> bool {
        !matches!(self, IndexKind::None)
    }
}

/// The index kind and the ordered fields keying it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub kind: IndexKind,
    pub indexes: Vec<FieldIndex>,
}

impl IndexSpec {
    pub fn none() -> Self {
        Self { kind: IndexKind::None, indexes: Vec::new() }
    }

    /// Derive the spec from constraints already reordered by `selection`
    pub fn from_selection(ordered: &[BetaConstraint], selection: &IndexSelection) -> Self {
        let Some(first) = selection.indexed.iter().position(|&b| b) else {
            return Self::none();
        };
        let Some(constraint) = ordered.get(first) else {
            return Self::none();
        };
        let Some(first_index) = constraint.field_index() else {
            return Self::none();
        };

        match constraint.operator {
            ConstraintOperator::Equal => {
                let mut indexes = vec![first_index];
                for (slot, candidate) in ordered.iter().enumerate().skip(first + 1) {
                    if indexes.len() >= selection.key_depth {
                        break;
                    }
                    let eligible = selection.indexed.get(slot).copied().unwrap_or(false)
                        && candidate.operator == ConstraintOperator::Equal
                        && !candidate.unification;
                    if let (true, Some(index)) = (eligible, candidate.field_index()) {
                        indexes.push(index);
                    }
                }
                Self { kind: IndexKind::Equal, indexes }
            }
            op if op.is_comparison() => Self { kind: IndexKind::Range(op), indexes: vec![first_index] },
            _ => Self::none(),
        }
    }
}
