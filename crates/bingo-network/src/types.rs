use crate::error::{NetworkError, NetworkResult};
use bingo_types::FactValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Unique identifier for facts
pub type FactId = u64;
pub type NodeId = u64;
pub type RuleId = u64;
/// Segments are identified by their root node
pub type SegmentId = NodeId;
/// Paths are identified by their end node (rule terminal or right input adapter)
pub type PathId = NodeId;
pub type WindowId = u64;
/// Milliseconds on the session clock
pub type Timestamp = i64;

/// The actual data content of a fact
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FactData {
    pub fields: HashMap<String, FactValue>,
}

/// A typed fact held by the working memory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fact {
    pub id: FactId,
    pub object_type: String,
    /// Event start time; windows measure expiration from here
    pub timestamp: Timestamp,
    pub data: FactData,
}

impl Fact {
    pub fn new(id: FactId, object_type: impl Into<String>, timestamp: Timestamp) -> Self {
        Self { id, object_type: object_type.into(), timestamp, data: FactData::default() }
    }

    /// Build a fact from a JSON object payload, one field per top-level key
    pub fn from_json(
        id: FactId,
        object_type: impl Into<String>,
        timestamp: Timestamp,
        payload: &serde_json::Value,
    ) -> NetworkResult<Self> {
        let serde_json::Value::Object(entries) = payload else {
            return Err(NetworkError::session_fact(id, "from_json", "fact payload must be a JSON object"));
        };
        let mut fact = Self::new(id, object_type, timestamp);
        for (name, value) in entries {
            let value = FactValue::try_from(value)
                .map_err(|err| NetworkError::session_fact(id, "from_json", format!("field '{name}': {err}")))?;
            fact.data.fields.insert(name.clone(), value);
        }
        Ok(fact)
    }

    /// Builder used mainly in tests and demos
    pub fn with_field(mut self, name: impl Into<String>, value: FactValue) -> Self {
        self.data.fields.insert(name.into(), value);
        self
    }

    /// Get a field value from this fact
    pub fn get_field(&self, field: &str) -> Option<&FactValue> {
        self.data.fields.get(field)
    }
}

/// Ordered sequence of previously joined facts flowing down the left input
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    facts: Vec<Arc<Fact>>,
}

impl Tuple {
    pub fn from_fact(fact: Arc<Fact>) -> Self {
        Self { facts: vec![fact] }
    }

    /// New tuple with `fact` appended; the receiver is left untouched
    pub fn extend(&self, fact: Arc<Fact>) -> Self {
        let mut facts = Vec::with_capacity(self.facts.len() + 1);
        facts.extend(self.facts.iter().cloned());
        facts.push(fact);
        Self { facts }
    }

    pub fn get(&self, position: usize) -> Option<&Arc<Fact>> {
        self.facts.get(position)
    }

    pub fn facts(&self) -> &[Arc<Fact>] {
        &self.facts
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// Stable identity of the tuple within a session
    pub fn fact_ids(&self) -> Vec<FactId> {
        self.facts.iter().map(|fact| fact.id).collect()
    }

    pub fn contains(&self, fact_id: FactId) -> bool {
        self.facts.iter().any(|fact| fact.id == fact_id)
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, fact) in self.facts.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}#{}", fact.object_type, fact.id)?;
        }
        write!(f, "]")
    }
}

/// Beta node classification used by index selection and memory construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Join,
    Not,
    Exists,
    Accumulate,
    Other,
}

impl NodeType {
    /// Not and exists nodes always accept a range index
    pub fn is_existential(&self) -> bool {
        matches!(self, NodeType::Not | NodeType::Exists)
    }
}

/// How a fact change entered the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropagationType {
    Insertion,
    Deletion,
    Modification,
    /// Deletion caused by a window evicting the fact
    Expiration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tuple_extension_keeps_order() {
        let a = Arc::new(Fact::new(1, "Order", 0));
        let b = Arc::new(Fact::new(2, "Customer", 0).with_field("id", FactValue::Integer(7)));
        let tuple = Tuple::from_fact(a).extend(b);

        assert_eq!(tuple.fact_ids(), vec![1, 2]);
        assert!(tuple.contains(2));
        assert!(!tuple.contains(3));
        assert_eq!(tuple.get(1).and_then(|f| f.get_field("id")), Some(&FactValue::Integer(7)));
        assert_eq!(tuple.to_string(), "[Order#1, Customer#2]");
    }

    #[test]
    fn test_fact_from_json_payload() {
        let payload = serde_json::json!({"id": 7, "limit": 2.5, "name": "acme"});
        let fact = Fact::from_json(3, "Customer", 10, &payload).expect("valid payload");
        assert_eq!(fact.get_field("id"), Some(&FactValue::Integer(7)));
        assert_eq!(fact.get_field("limit"), Some(&FactValue::Float(2.5)));
        assert_eq!(fact.get_field("name"), Some(&FactValue::String("acme".into())));

        let err = Fact::from_json(4, "Customer", 10, &serde_json::json!([1, 2])).expect_err("arrays are not facts");
        assert!(matches!(err, NetworkError::Session { fact_id: Some(4), .. }));
    }

    #[test]
    fn test_existential_node_types() {
        assert!(NodeType::Not.is_existential());
        assert!(NodeType::Exists.is_existential());
        assert!(!NodeType::Join.is_existential());
        assert!(!NodeType::Accumulate.is_existential());
    }
}
