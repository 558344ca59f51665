//! Agenda of pending activations
//!
//! Activations sit in a binary heap ordered by [`DepthConflictResolver`]. Cancelling
//! marks an activation dead; dead entries are skipped when popped.

use crate::conflict_resolution::{Activation, DepthConflictResolver};
use crate::types::{FactId, PathId, RuleId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct QueuedActivation(Activation);

impl Ord for QueuedActivation {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: the activation that fires first must compare greatest
        DepthConflictResolver.compare(&other.0, &self.0)
    }
}

impl PartialOrd for QueuedActivation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedActivation {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedActivation {}

/// Record of a fired activation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleExecution {
    pub rule_id: RuleId,
    pub tuple: Vec<FactId>,
    pub salience: i32,
    pub activation_number: u64,
}

impl From<Activation> for RuleExecution {
    fn from(activation: Activation) -> Self {
        Self {
            rule_id: activation.rule_id,
            tuple: activation.tuple,
            salience: activation.salience,
            activation_number: activation.activation_number,
        }
    }
}

/// Pending activations in firing order
#[derive(Debug, Default)]
pub struct Agenda {
    heap: BinaryHeap<QueuedActivation>,
    /// rule -> tuple -> activation number
    pending: HashMap<RuleId, HashMap<Vec<FactId>, u64>>,
    cancelled: HashSet<u64>,
    next_number: u64,
}

impl Agenda {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a match; a tuple already pending for the rule keeps its activation
    pub fn add(&mut self, rule_id: RuleId, path: PathId, tuple: Vec<FactId>, salience: i32) -> u64 {
        if let Some(number) = self.pending.get(&rule_id).and_then(|p| p.get(&tuple)) {
            return *number;
        }
        self.next_number += 1;
        let activation_number = self.next_number;
        self.pending.entry(rule_id).or_default().insert(tuple.clone(), activation_number);
        trace!(rule_id, activation_number, salience, tuple = ?tuple, "Activation created");
        self.heap.push(QueuedActivation(Activation { rule_id, path, tuple, salience, activation_number }));
        activation_number
    }

    pub fn is_pending(&self, rule_id: RuleId, tuple: &[FactId]) -> bool {
        self.pending.get(&rule_id).is_some_and(|p| p.contains_key(tuple))
    }

    /// Tuples currently pending for a rule
    pub fn pending_tuples(&self, rule_id: RuleId) -> Vec<Vec<FactId>> {
        self.pending.get(&rule_id).map(|p| p.keys().cloned().collect()).unwrap_or_default()
    }

    pub fn cancel_tuple(&mut self, rule_id: RuleId, tuple: &[FactId]) -> bool {
        let Some(number) = self.pending.get_mut(&rule_id).and_then(|p| p.remove(tuple)) else {
            return false;
        };
        self.cancelled.insert(number);
        true
    }

    /// Cancel every pending activation of a rule
    pub fn cancel_rule(&mut self, rule_id: RuleId) -> usize {
        let Some(pending) = self.pending.remove(&rule_id) else {
            return 0;
        };
        let count = pending.len();
        self.cancelled.extend(pending.into_values());
        if count > 0 {
            debug!(rule_id, count, "Cancelled rule activations");
        }
        count
    }

    /// Cancel every pending activation whose tuple contains the fact
    pub fn cancel_fact(&mut self, fact_id: FactId) -> usize {
        let mut count = 0;
        for pending in self.pending.values_mut() {
            pending.retain(|tuple, number| {
                if tuple.contains(&fact_id) {
                    self.cancelled.insert(*number);
                    count += 1;
                    false
                } else {
                    true
                }
            });
        }
        count
    }

    /// Pop the next live activation
    pub fn next(&mut self) -> Option<Activation> {
        while let Some(QueuedActivation(activation)) = self.heap.pop() {
            if self.cancelled.remove(&activation.activation_number) {
                continue;
            }
            if let Some(pending) = self.pending.get_mut(&activation.rule_id) {
                pending.remove(&activation.tuple);
            }
            return Some(activation);
        }
        None
    }

    /// Fire until empty, handing each activation to `fire`
    pub fn fire_all<F>(&mut self, mut fire: F) -> Vec<RuleExecution>
    where
        F: FnMut(&Activation),
    {
        let mut executions = Vec::new();
        while let Some(activation) = self.next() {
            fire(&activation);
            executions.push(RuleExecution::from(activation));
        }
        executions
    }

    /// Live activations in firing order
    pub fn activations(&self) -> Vec<Activation> {
        let mut live: Vec<Activation> = self
            .heap
            .iter()
            .filter(|q| !self.cancelled.contains(&q.0.activation_number))
            .map(|q| q.0.clone())
            .collect();
        DepthConflictResolver.sort(&mut live);
        live
    }

    pub fn len(&self) -> usize {
        self.pending.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.pending.clear();
        self.cancelled.clear();
    }
}
