//! Beta constraints and field extractors
//!
//! A beta constraint compares a field of a fact arriving on the right input of a
//! join node with a field of a tuple arriving on its left input. Constraints that
//! expose both extractors can back a hash or range index; the rest are evaluated
//! only after candidates have been fetched.
//!
//! Evaluation reads as `right <op> left`: the fact field is the subject and the
//! tuple field is the operand.

use crate::config::NetworkConfig;
use crate::types::{Fact, NodeType, Tuple};
use bingo_types::{FactValue, ValueType};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Range indexes on not/exists nodes are always on; join nodes follow the configuration
pub(crate) const RANGE_INDEX_FOR_EXISTENTIAL_NODES: bool = true;

/// Comparison operator of a beta constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintOperator {
    Equal,
    NotEqual,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
    /// Operators the network cannot interpret (custom predicates)
    Unknown,
}

impl ConstraintOperator {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            ConstraintOperator::LessThan
                | ConstraintOperator::LessOrEqual
                | ConstraintOperator::GreaterThan
                | ConstraintOperator::GreaterOrEqual
        )
    }

    /// Whether any index structure exists for this operator
    pub fn is_indexable(&self) -> bool {
        *self == ConstraintOperator::Equal || self.is_comparison()
    }

    /// The operator seen from the other operand: `a < b` is `b > a`
    pub fn mirror(&self) -> Self {
        match self {
            ConstraintOperator::LessThan => ConstraintOperator::GreaterThan,
            ConstraintOperator::LessOrEqual => ConstraintOperator::GreaterOrEqual,
            ConstraintOperator::GreaterThan => ConstraintOperator::LessThan,
            ConstraintOperator::GreaterOrEqual => ConstraintOperator::LessOrEqual,
            other => *other,
        }
    }

    /// Evaluate `subject <op> operand`
    pub fn evaluate(&self, subject: &FactValue, operand: &FactValue) -> bool {
        match self {
            ConstraintOperator::Equal => subject == operand,
            ConstraintOperator::NotEqual => subject != operand,
            ConstraintOperator::LessThan => subject.partial_cmp(operand) == Some(Ordering::Less),
            ConstraintOperator::LessOrEqual => matches!(
                subject.partial_cmp(operand),
                Some(Ordering::Less | Ordering::Equal)
            ),
            ConstraintOperator::GreaterThan => {
                subject.partial_cmp(operand) == Some(Ordering::Greater)
            }
            ConstraintOperator::GreaterOrEqual => matches!(
                subject.partial_cmp(operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            ConstraintOperator::Unknown => false,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            ConstraintOperator::Equal => "==",
            ConstraintOperator::NotEqual => "!=",
            ConstraintOperator::LessThan => "<",
            ConstraintOperator::LessOrEqual => "<=",
            ConstraintOperator::GreaterThan => ">",
            ConstraintOperator::GreaterOrEqual => ">=",
            ConstraintOperator::Unknown => "?",
        }
    }
}

impl fmt::Display for ConstraintOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Reads a field from one fact of a left tuple
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleExtractor {
    /// Position of the fact within the tuple
    pub position: usize,
    pub field: String,
    pub value_type: ValueType,
}

impl TupleExtractor {
    pub fn new(position: usize, field: impl Into<String>, value_type: ValueType) -> Self {
        Self { position, field: field.into(), value_type }
    }

    pub fn extract<'a>(&self, tuple: &'a Tuple) -> Option<&'a FactValue> {
        tuple.get(self.position).and_then(|fact| fact.get_field(&self.field))
    }
}

/// Reads a field from the fact arriving on the right input
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldExtractor {
    pub field: String,
    pub value_type: ValueType,
}

impl FieldExtractor {
    pub fn new(field: impl Into<String>, value_type: ValueType) -> Self {
        Self { field: field.into(), value_type }
    }

    pub fn extract<'a>(&self, fact: &'a Fact) -> Option<&'a FactValue> {
        fact.get_field(&self.field)
    }
}

/// One indexable field: how to read the key from either side of a join
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldIndex {
    pub left: TupleExtractor,
    pub right: FieldExtractor,
    pub value_type: ValueType,
}

/// A constraint between the left tuple and the right fact of a beta node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BetaConstraint {
    pub operator: ConstraintOperator,
    pub left: Option<TupleExtractor>,
    pub right: Option<FieldExtractor>,
    /// Unification constraints bind a variable instead of testing it
    pub unification: bool,
}

impl BetaConstraint {
    pub fn new(operator: ConstraintOperator, left: TupleExtractor, right: FieldExtractor) -> Self {
        Self { operator, left: Some(left), right: Some(right), unification: false }
    }

    /// `right.right_field <op> tuple[position].left_field`, both sides typed alike
    pub fn compare(
        operator: ConstraintOperator,
        position: usize,
        left_field: &str,
        right_field: &str,
        value_type: ValueType,
    ) -> Self {
        Self::new(
            operator,
            TupleExtractor::new(position, left_field, value_type),
            FieldExtractor::new(right_field, value_type),
        )
    }

    pub fn equal(position: usize, left_field: &str, right_field: &str, value_type: ValueType) -> Self {
        Self::compare(ConstraintOperator::Equal, position, left_field, right_field, value_type)
    }

    /// A constraint without extractors; it can never back an index
    pub fn opaque(operator: ConstraintOperator) -> Self {
        Self { operator, left: None, right: None, unification: false }
    }

    pub fn with_unification(mut self, unification: bool) -> Self {
        self.unification = unification;
        self
    }

    /// The index description, if both extractors are present
    pub fn field_index(&self) -> Option<FieldIndex> {
        match (&self.left, &self.right) {
            (Some(left), Some(right)) => Some(FieldIndex {
                left: left.clone(),
                right: right.clone(),
                value_type: right.value_type,
            }),
            _ => None,
        }
    }

    pub fn has_extractors(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }

    /// Equality constraint that can key a hash index
    pub fn is_equal_indexable(&self) -> bool {
        self.operator == ConstraintOperator::Equal && self.has_extractors()
    }

    /// Whether this constraint may be indexed on a node of the given type
    pub fn is_indexable_for_node(&self, node_type: NodeType, config: &NetworkConfig) -> bool {
        if !self.has_extractors() {
            return false;
        }
        match self.operator {
            ConstraintOperator::Equal => true,
            op if op.is_comparison() => {
                range_index_allowed(node_type, config) && self.has_range_compatible_operands()
            }
            _ => false,
        }
    }

    /// Number against number, or the same comparable type on both sides
    pub fn has_range_compatible_operands(&self) -> bool {
        match (&self.left, &self.right) {
            (Some(left), Some(right)) => {
                let (l, r) = (left.value_type, right.value_type);
                (l.is_number() && r.is_number()) || (l.is_comparable() && l == r)
            }
            _ => false,
        }
    }

    /// Constraints lacking an extractor are never satisfied by the network itself
    pub fn evaluate(&self, tuple: &Tuple, fact: &Fact) -> bool {
        let (Some(left), Some(right)) = (&self.left, &self.right) else {
            return false;
        };
        match (right.extract(fact), left.extract(tuple)) {
            (Some(subject), Some(operand)) => self.operator.evaluate(subject, operand),
            _ => false,
        }
    }
}

impl fmt::Display for BetaConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.left, &self.right) {
            (Some(left), Some(right)) => write!(
                f,
                "{} {} ${}.{}{}",
                right.field,
                self.operator,
                left.position,
                left.field,
                if self.unification { " (unify)" } else { "" }
            ),
            _ => write!(f, "<opaque {}>", self.operator),
        }
    }
}

/// Whether a node type may carry a range index under this configuration
pub fn range_index_allowed(node_type: NodeType, config: &NetworkConfig) -> bool {
    match node_type {
        NodeType::Not | NodeType::Exists => RANGE_INDEX_FOR_EXISTENTIAL_NODES,
        NodeType::Join => RANGE_INDEX_FOR_EXISTENTIAL_NODES && config.beta_node_range_index_enabled,
        NodeType::Accumulate | NodeType::Other => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tuple_with_age(age: i64) -> Tuple {
        Tuple::from_fact(Arc::new(Fact::new(1, "Person", 0).with_field("age", FactValue::Integer(age))))
    }

    #[test]
    fn test_evaluation_reads_right_against_left() {
        let constraint = BetaConstraint::compare(
            ConstraintOperator::GreaterThan,
            0,
            "age",
            "limit",
            ValueType::Integer,
        );
        let tuple = tuple_with_age(30);
        let above = Fact::new(2, "Limit", 0).with_field("limit", FactValue::Integer(40));
        let below = Fact::new(3, "Limit", 0).with_field("limit", FactValue::Integer(20));

        assert!(constraint.evaluate(&tuple, &above));
        assert!(!constraint.evaluate(&tuple, &below));
    }

    #[test]
    fn test_missing_extractor_is_not_indexable() {
        let config = NetworkConfig::default();
        let constraint = BetaConstraint::opaque(ConstraintOperator::Equal);
        assert!(constraint.field_index().is_none());
        assert!(!constraint.is_indexable_for_node(NodeType::Join, &config));
        assert!(!constraint.evaluate(&tuple_with_age(1), &Fact::new(2, "X", 0)));
    }

    #[test]
    fn test_range_indexing_depends_on_node_type() {
        let config = NetworkConfig::default();
        let lt = BetaConstraint::compare(ConstraintOperator::LessThan, 0, "a", "b", ValueType::Integer);

        assert!(lt.is_indexable_for_node(NodeType::Not, &config));
        assert!(lt.is_indexable_for_node(NodeType::Exists, &config));
        assert!(!lt.is_indexable_for_node(NodeType::Join, &config));
        assert!(!lt.is_indexable_for_node(NodeType::Accumulate, &config));

        let enabled = NetworkConfig::default().with_beta_range_index(true);
        assert!(lt.is_indexable_for_node(NodeType::Join, &enabled));
    }

    #[test]
    fn test_range_operand_compatibility() {
        let mixed_numbers = BetaConstraint::new(
            ConstraintOperator::LessThan,
            TupleExtractor::new(0, "a", ValueType::Integer),
            FieldExtractor::new("b", ValueType::Float),
        );
        assert!(mixed_numbers.has_range_compatible_operands());

        let strings = BetaConstraint::compare(ConstraintOperator::LessThan, 0, "a", "b", ValueType::String);
        assert!(strings.has_range_compatible_operands());

        let mismatched = BetaConstraint::new(
            ConstraintOperator::LessThan,
            TupleExtractor::new(0, "a", ValueType::String),
            FieldExtractor::new("b", ValueType::Integer),
        );
        assert!(!mismatched.has_range_compatible_operands());

        let objects = BetaConstraint::compare(ConstraintOperator::LessThan, 0, "a", "b", ValueType::Object);
        assert!(!objects.has_range_compatible_operands());
    }

    #[test]
    fn test_operator_mirror() {
        assert_eq!(ConstraintOperator::LessThan.mirror(), ConstraintOperator::GreaterThan);
        assert_eq!(ConstraintOperator::GreaterOrEqual.mirror(), ConstraintOperator::LessOrEqual);
        assert_eq!(ConstraintOperator::Equal.mirror(), ConstraintOperator::Equal);
        assert!(ConstraintOperator::LessOrEqual.evaluate(&FactValue::Integer(2), &FactValue::Float(2.0)));
    }
}
