//! Join memories for beta nodes
//!
//! Each beta node owns a [`BetaMemory`]: a left memory of tuples and a right memory
//! of facts. The structure behind each side is chosen once by [`build_join_memory`]
//! and never changes at runtime.
//!
//! ## Structures
//!
//! - [`TupleList`]: insertion ordered, scanned linearly
//! - [`TupleIndexHashTable`]: keyed by one to three equality fields
//! - [`TupleIndexTree`]: ordered by one comparison field, answers range lookups
//!
//! Indexes only narrow the candidate set. Callers re-check every constraint on the
//! candidates they get back.

use crate::config::NetworkConfig;
use crate::constraint::{BetaConstraint, ConstraintOperator, FieldIndex};
use crate::error::NetworkResult;
use crate::index_selector::{select_indexes, IndexKind, IndexSelection, IndexSpec};
use crate::types::{Fact, FactId, NodeType, Tuple};
use bingo_types::{FactValue, canonical_float};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

/// Identity of a memory entry: the ids of the facts it is made of
pub type EntryKey = Vec<FactId>;

/// Something a join memory can store and index
pub trait MemoryEntry: Clone {
    fn entry_key(&self) -> EntryKey;

    /// The value this entry contributes to `index`
    fn index_value<'a>(&'a self, index: &FieldIndex) -> Option<&'a FactValue>;
}

impl MemoryEntry for Tuple {
    fn entry_key(&self) -> EntryKey {
        self.fact_ids()
    }

    fn index_value<'a>(&'a self, index: &FieldIndex) -> Option<&'a FactValue> {
        index.left.extract(self)
    }
}

impl MemoryEntry for Arc<Fact> {
    fn entry_key(&self) -> EntryKey {
        vec![self.id]
    }

    fn index_value<'a>(&'a self, index: &FieldIndex) -> Option<&'a FactValue> {
        index.right.extract(self)
    }
}

/// Unindexed, insertion ordered memory
#[derive(Debug, Clone)]
pub struct TupleList<E> {
    entries: BTreeMap<u64, E>,
    positions: HashMap<EntryKey, u64>,
    next_seq: u64,
}

impl<E: MemoryEntry> TupleList<E> {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new(), positions: HashMap::new(), next_seq: 0 }
    }

    pub fn insert(&mut self, entry: E) {
        let key = entry.entry_key();
        if let Some(seq) = self.positions.remove(&key) {
            self.entries.remove(&seq);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.positions.insert(key, seq);
        self.entries.insert(seq, entry);
    }

    pub fn remove(&mut self, key: &EntryKey) -> Option<E> {
        let seq = self.positions.remove(key)?;
        self.entries.remove(&seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.positions.clear();
    }
}

impl<E: MemoryEntry> Default for TupleList<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash index keyed by the values of an ordered list of equality fields
#[derive(Debug, Clone)]
pub struct TupleIndexHashTable<E> {
    indexes: Vec<FieldIndex>,
    buckets: HashMap<Vec<FactValue>, Vec<E>>,
    /// Entries whose key could not be extracted
    unkeyed: Vec<E>,
    locations: HashMap<EntryKey, Option<Vec<FactValue>>>,
}

impl<E: MemoryEntry> TupleIndexHashTable<E> {
    pub fn new(indexes: Vec<FieldIndex>) -> Self {
        Self { indexes, buckets: HashMap::new(), unkeyed: Vec::new(), locations: HashMap::new() }
    }

    fn key_of(&self, entry: &E) -> Option<Vec<FactValue>> {
        self.indexes.iter().map(|index| entry.index_value(index).cloned()).collect()
    }

    pub fn insert(&mut self, entry: E) {
        let key = entry.entry_key();
        self.remove(&key);
        let hash_key = self.key_of(&entry);
        match &hash_key {
            Some(values) => self.buckets.entry(values.clone()).or_default().push(entry),
            None => self.unkeyed.push(entry),
        }
        self.locations.insert(key, hash_key);
    }

    pub fn remove(&mut self, key: &EntryKey) -> Option<E> {
        let location = self.locations.remove(key)?;
        let bucket = match &location {
            Some(values) => self.buckets.get_mut(values)?,
            None => &mut self.unkeyed,
        };
        let pos = bucket.iter().position(|e| &e.entry_key() == key)?;
        let removed = bucket.remove(pos);
        if let Some(values) = location {
            if self.buckets.get(&values).is_some_and(Vec::is_empty) {
                self.buckets.remove(&values);
            }
        }
        Some(removed)
    }

    /// Entries in the bucket for the probed key, plus the unkeyed entries
    pub fn candidates<F>(&self, probe: F) -> Vec<&E>
    where
        F: Fn(&FieldIndex) -> Option<FactValue>,
    {
        let key: Option<Vec<FactValue>> = self.indexes.iter().map(&probe).collect();
        let bucket = key.and_then(|k| self.buckets.get(&k));
        bucket.into_iter().flatten().chain(self.unkeyed.iter()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.buckets.values().flatten().chain(self.unkeyed.iter())
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn indexes(&self) -> &[FieldIndex] {
        &self.indexes
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.unkeyed.clear();
        self.locations.clear();
    }
}

/// Totally ordered wrapper used as the range tree key
#[derive(Debug, Clone)]
pub struct OrdValue(pub FactValue);

impl OrdValue {
    fn rank(value: &FactValue) -> u8 {
        match value {
            FactValue::Null => 0,
            FactValue::Boolean(_) => 1,
            FactValue::Integer(_) | FactValue::Float(_) => 2,
            FactValue::String(_) => 3,
            FactValue::Date(_) => 4,
            FactValue::Array(_) => 5,
            FactValue::Object(_) => 6,
        }
    }
}

impl Ord for OrdValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.0, &other.0) {
            (FactValue::Integer(a), FactValue::Integer(b)) => a.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => canonical_float(x).total_cmp(&canonical_float(y)),
                _ => Self::rank(a)
                    .cmp(&Self::rank(b))
                    .then_with(|| a.partial_cmp(b).unwrap_or(Ordering::Equal)),
            },
        }
    }
}

impl PartialOrd for OrdValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for OrdValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrdValue {}

/// Ordered index over a single comparison field
#[derive(Debug, Clone)]
pub struct TupleIndexTree<E> {
    index: FieldIndex,
    /// Operator as seen from the stored entries: `entry <op> probe`
    operator: ConstraintOperator,
    left: bool,
    tree: BTreeMap<OrdValue, Vec<E>>,
    unkeyed: Vec<E>,
    locations: HashMap<EntryKey, Option<OrdValue>>,
}

impl<E: MemoryEntry> TupleIndexTree<E> {
    /// `operator` is the constraint operator; left memories store it mirrored
    pub fn new(operator: ConstraintOperator, index: FieldIndex, left: bool) -> Self {
        let operator = if left { operator.mirror() } else { operator };
        Self {
            index,
            operator,
            left,
            tree: BTreeMap::new(),
            unkeyed: Vec::new(),
            locations: HashMap::new(),
        }
    }

    pub fn insert(&mut self, entry: E) {
        let key = entry.entry_key();
        self.remove(&key);
        let value = entry.index_value(&self.index).cloned().map(OrdValue);
        match &value {
            Some(v) => self.tree.entry(v.clone()).or_default().push(entry),
            None => self.unkeyed.push(entry),
        }
        self.locations.insert(key, value);
    }

    pub fn remove(&mut self, key: &EntryKey) -> Option<E> {
        let location = self.locations.remove(key)?;
        let bucket = match &location {
            Some(value) => self.tree.get_mut(value)?,
            None => &mut self.unkeyed,
        };
        let pos = bucket.iter().position(|e| &e.entry_key() == key)?;
        let removed = bucket.remove(pos);
        if let Some(value) = location {
            if self.tree.get(&value).is_some_and(Vec::is_empty) {
                self.tree.remove(&value);
            }
        }
        Some(removed)
    }

    /// Entries whose value satisfies `value <op> probe`, plus the unkeyed entries
    pub fn candidates<F>(&self, probe: F) -> Vec<&E>
    where
        F: Fn(&FieldIndex) -> Option<FactValue>,
    {
        let mut result: Vec<&E> = Vec::new();
        if let Some(probe) = probe(&self.index) {
            let bounds = match self.operator {
                ConstraintOperator::LessThan => (Bound::Unbounded, Bound::Excluded(OrdValue(probe.clone()))),
                ConstraintOperator::LessOrEqual => (Bound::Unbounded, Bound::Included(OrdValue(probe.clone()))),
                ConstraintOperator::GreaterThan => (Bound::Excluded(OrdValue(probe.clone())), Bound::Unbounded),
                ConstraintOperator::GreaterOrEqual => (Bound::Included(OrdValue(probe.clone())), Bound::Unbounded),
                _ => (Bound::Unbounded, Bound::Unbounded),
            };
            for (value, bucket) in self.tree.range(bounds) {
                // Other value types share the tree; keep only comparable keys
                if self.operator.evaluate(&value.0, &probe) {
                    result.extend(bucket.iter());
                }
            }
        }
        result.extend(self.unkeyed.iter());
        result
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.tree.values().flatten().chain(self.unkeyed.iter())
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn operator(&self) -> ConstraintOperator {
        self.operator
    }

    pub fn is_left(&self) -> bool {
        self.left
    }

    pub fn clear(&mut self) {
        self.tree.clear();
        self.unkeyed.clear();
        self.locations.clear();
    }
}

/// One side of a beta node's join memory
#[derive(Debug, Clone)]
pub enum TupleMemory<E> {
    List(TupleList<E>),
    Hash(TupleIndexHashTable<E>),
    Tree(TupleIndexTree<E>),
}

impl<E: MemoryEntry> TupleMemory<E> {
    pub fn insert(&mut self, entry: E) {
        match self {
            TupleMemory::List(m) => m.insert(entry),
            TupleMemory::Hash(m) => m.insert(entry),
            TupleMemory::Tree(m) => m.insert(entry),
        }
    }

    pub fn remove(&mut self, key: &EntryKey) -> Option<E> {
        match self {
            TupleMemory::List(m) => m.remove(key),
            TupleMemory::Hash(m) => m.remove(key),
            TupleMemory::Tree(m) => m.remove(key),
        }
    }

    pub fn candidates<F>(&self, probe: F) -> Vec<&E>
    where
        F: Fn(&FieldIndex) -> Option<FactValue>,
    {
        match self {
            TupleMemory::List(m) => m.iter().collect(),
            TupleMemory::Hash(m) => m.candidates(probe),
            TupleMemory::Tree(m) => m.candidates(probe),
        }
    }

    pub fn entries(&self) -> Vec<&E> {
        match self {
            TupleMemory::List(m) => m.iter().collect(),
            TupleMemory::Hash(m) => m.iter().collect(),
            TupleMemory::Tree(m) => m.iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TupleMemory::List(m) => m.len(),
            TupleMemory::Hash(m) => m.len(),
            TupleMemory::Tree(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        match self {
            TupleMemory::List(m) => m.clear(),
            TupleMemory::Hash(m) => m.clear(),
            TupleMemory::Tree(m) => m.clear(),
        }
    }

    pub fn index_kind(&self) -> IndexKind {
        match self {
            TupleMemory::List(_) => IndexKind::None,
            TupleMemory::Hash(_) => IndexKind::Equal,
            TupleMemory::Tree(m) => IndexKind::Range(m.operator),
        }
    }
}

/// Left and right memories of a beta node
#[derive(Debug, Clone)]
pub struct BetaMemory {
    node_type: NodeType,
    /// Constraints in evaluation order, indexed ones first
    constraints: Vec<BetaConstraint>,
    selection: IndexSelection,
    spec: IndexSpec,
    /// Absent in sequential mode
    left: Option<TupleMemory<Tuple>>,
    right: TupleMemory<Arc<Fact>>,
}

impl BetaMemory {
    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn constraints(&self) -> &[BetaConstraint] {
        &self.constraints
    }

    pub fn selection(&self) -> &IndexSelection {
        &self.selection
    }

    pub fn index_spec(&self) -> &IndexSpec {
        &self.spec
    }

    pub fn has_left_memory(&self) -> bool {
        self.left.is_some()
    }

    pub fn left_index_kind(&self) -> Option<IndexKind> {
        self.left.as_ref().map(TupleMemory::index_kind)
    }

    pub fn right_index_kind(&self) -> IndexKind {
        self.right.index_kind()
    }

    /// Returns false when the node keeps no left memory
    pub fn insert_left(&mut self, tuple: Tuple) -> bool {
        match &mut self.left {
            Some(left) => {
                left.insert(tuple);
                true
            }
            None => false,
        }
    }

    pub fn remove_left(&mut self, fact_ids: &[FactId]) -> Option<Tuple> {
        self.left.as_mut().and_then(|left| left.remove(&fact_ids.to_vec()))
    }

    pub fn clear_left(&mut self) {
        if let Some(left) = &mut self.left {
            left.clear();
        }
    }

    pub fn insert_right(&mut self, fact: Arc<Fact>) {
        self.right.insert(fact);
    }

    pub fn remove_right(&mut self, fact_id: FactId) -> Option<Arc<Fact>> {
        self.right.remove(&vec![fact_id])
    }

    /// Facts that may join with `tuple`
    pub fn right_candidates(&self, tuple: &Tuple) -> Vec<&Arc<Fact>> {
        self.right.candidates(|index| index.left.extract(tuple).cloned())
    }

    /// Tuples that may join with `fact`; empty without a left memory
    pub fn left_candidates(&self, fact: &Fact) -> Vec<&Tuple> {
        match &self.left {
            Some(left) => left.candidates(|index| index.right.extract(fact).cloned()),
            None => Vec::new(),
        }
    }

    /// Whether `fact` joins a stored left tuple; always true without a left memory
    pub fn joins_left(&self, fact: &Fact) -> bool {
        if self.left.is_none() {
            return true;
        }
        self.left_candidates(fact).into_iter().any(|tuple| self.is_allowed(tuple, fact))
    }

    /// Whether every constraint holds between `tuple` and `fact`
    pub fn is_allowed(&self, tuple: &Tuple, fact: &Fact) -> bool {
        self.constraints.iter().all(|c| c.evaluate(tuple, fact))
    }

    /// Facts that really join with `tuple`
    pub fn matching_facts(&self, tuple: &Tuple) -> Vec<&Arc<Fact>> {
        self.right_candidates(tuple)
            .into_iter()
            .filter(|fact| self.is_allowed(tuple, fact))
            .collect()
    }

    pub fn right_facts(&self) -> Vec<&Arc<Fact>> {
        self.right.entries()
    }

    pub fn left_tuples(&self) -> Vec<&Tuple> {
        self.left.as_ref().map(TupleMemory::entries).unwrap_or_default()
    }

    pub fn left_len(&self) -> usize {
        self.left.as_ref().map_or(0, TupleMemory::len)
    }

    pub fn right_len(&self) -> usize {
        self.right.len()
    }

    pub fn right_is_empty(&self) -> bool {
        self.right.is_empty()
    }
}

/// Build the join memory of a beta node from its constraints and the configuration
pub fn build_join_memory(
    node_type: NodeType,
    constraints: &[BetaConstraint],
    config: &NetworkConfig,
) -> NetworkResult<BetaMemory> {
    config.validate()?;

    let selection = select_indexes(constraints, node_type, config);
    let ordered = selection.apply(constraints);
    let spec = if config.composite_key_depth < 1 {
        IndexSpec::none()
    } else {
        IndexSpec::from_selection(&ordered, &selection)
    };

    let left = if config.sequential {
        None
    } else {
        Some(create_side::<Tuple>(config.index_left_beta_memory, &spec, true))
    };
    let right = create_side::<Arc<Fact>>(config.index_right_beta_memory, &spec, false);

    debug!(
        node_type = ?node_type,
        index_kind = ?spec.kind,
        fields = spec.indexes.len(),
        left = ?left.as_ref().map(TupleMemory::index_kind),
        right = ?right.index_kind(),
        "Built join memory"
    );

    Ok(BetaMemory { node_type, constraints: ordered, selection, spec, left, right })
}

fn create_side<E: MemoryEntry>(enabled: bool, spec: &IndexSpec, left: bool) -> TupleMemory<E> {
    if !enabled {
        return TupleMemory::List(TupleList::new());
    }
    match (spec.kind, spec.indexes.first()) {
        (IndexKind::Equal, Some(_)) => TupleMemory::Hash(TupleIndexHashTable::new(spec.indexes.clone())),
        (IndexKind::Range(op), Some(index)) => TupleMemory::Tree(TupleIndexTree::new(op, index.clone(), left)),
        _ => TupleMemory::List(TupleList::new()),
    }
}
