//! Conflict resolution for rule activations
//!
//! Determines which of several ready activations fires first. The order is total:
//!
//! 1. **Salience**: higher salience fires first
//! 2. **Activation number**: among equal salience, the activation created first
//!    fires first
//!
//! Activation numbers are assigned monotonically by the agenda and never reused, so
//! no two distinct activations compare equal. Nothing else influences the order.
//!
//! ```text
//! salience  5   5   3
//! number   10   7  20    →   fire: #7, #10, #20
//! ```

use crate::types::{FactId, PathId, RuleId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A rule match waiting on the agenda
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Activation {
    pub rule_id: RuleId,
    /// Path memory the match was produced by
    pub path: PathId,
    /// Fact ids of the matched tuple, in join order
    pub tuple: Vec<FactId>,
    pub salience: i32,
    pub activation_number: u64,
}

/// Salience first, then creation order. Stateless and safe to share across threads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DepthConflictResolver;

impl DepthConflictResolver {
    /// `Less` when `a` fires before `b`
    pub fn compare(&self, a: &Activation, b: &Activation) -> Ordering {
        b.salience
            .cmp(&a.salience)
            .then_with(|| a.activation_number.cmp(&b.activation_number))
    }

    /// Sort activations into firing order
    pub fn sort(&self, activations: &mut [Activation]) {
        activations.sort_by(|a, b| self.compare(a, b));
    }
}
