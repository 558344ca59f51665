//! Read-only evaluation of rule paths
//!
//! A linked, dirty rule path is recomputed from the adapter's facts down to its
//! terminal using the join memories for candidate lookup. Evaluation never mutates
//! memories, so independent partitions can run on worker threads; the left tuples
//! seen by each beta node are returned for the owning thread to store. The session
//! probes those stored tuples to tell which later right-side changes can matter.

use crate::error::{NetworkError, NetworkResult};
use crate::graph::{NetworkGraph, NodeKind};
use crate::join_memory::BetaMemory;
use crate::types::{Fact, FactId, NodeId, PathId, RuleId, Tuple};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::trace;

/// Facts in working memory grouped by object type
pub type FactsByType = HashMap<String, BTreeMap<FactId, Arc<Fact>>>;

/// Outcome of evaluating one rule path
#[derive(Debug, Clone, PartialEq)]
pub struct PathResult {
    pub rule: RuleId,
    pub path: PathId,
    /// Matched tuples as fact ids, sorted
    pub matches: Vec<Vec<FactId>>,
    /// Tuples that entered each beta node
    pub left_inputs: Vec<(NodeId, Vec<Tuple>)>,
}

/// Evaluates paths over a snapshot of the session's memories
pub struct PathEvaluator<'a> {
    graph: &'a NetworkGraph,
    memories: &'a HashMap<NodeId, BetaMemory>,
    facts: &'a FactsByType,
}

impl<'a> PathEvaluator<'a> {
    pub fn new(graph: &'a NetworkGraph, memories: &'a HashMap<NodeId, BetaMemory>, facts: &'a FactsByType) -> Self {
        Self { graph, memories, facts }
    }

    /// All current matches of the rule ending at `terminal`
    pub fn evaluate_rule(&self, rule: RuleId, terminal: PathId) -> NetworkResult<PathResult> {
        let mut chain = self.graph.path_nodes(terminal)?;
        chain.reverse();
        let Some((&adapter, rest)) = chain.split_first() else {
            return Err(NetworkError::structure(format!("terminal {terminal} has no path")));
        };
        let NodeKind::LeftInputAdapter { object_type } = &self.graph.node(adapter)?.kind else {
            return Err(NetworkError::Structure {
                message: "path does not start at an input adapter".to_string(),
                node_id: Some(adapter),
                details: None,
            });
        };

        let input: Vec<Tuple> = self
            .facts
            .get(object_type)
            .map(|facts| facts.values().cloned().map(Tuple::from_fact).collect())
            .unwrap_or_default();

        let mut left_inputs = BTreeMap::new();
        let output = self.evaluate_chain(rest, input, &mut left_inputs)?;
        let matches: BTreeSet<Vec<FactId>> = output.iter().map(Tuple::fact_ids).collect();
        trace!(rule, terminal, matches = matches.len(), "Evaluated rule path");

        Ok(PathResult {
            rule,
            path: terminal,
            matches: matches.into_iter().collect(),
            left_inputs: left_inputs.into_iter().collect(),
        })
    }

    fn evaluate_chain(
        &self,
        chain: &[NodeId],
        mut tuples: Vec<Tuple>,
        left_inputs: &mut BTreeMap<NodeId, Vec<Tuple>>,
    ) -> NetworkResult<Vec<Tuple>> {
        for &id in chain {
            let node = self.graph.node(id)?;
            let Some(spec) = node.kind.beta_spec() else {
                continue;
            };
            // nodes past an empty join still record that nothing reached them
            left_inputs.entry(id).or_default().extend(tuples.iter().cloned());
            if tuples.is_empty() {
                continue;
            }

            tuples = match spec.subnetwork() {
                Some(ria) => self.apply_subnetwork(&node.kind, ria, tuples, left_inputs)?,
                None => {
                    let memory = self.memory(id)?;
                    apply_beta(&node.kind, memory, tuples)
                }
            };
        }
        Ok(tuples)
    }

    fn apply_subnetwork(
        &self,
        kind: &NodeKind,
        ria: NodeId,
        tuples: Vec<Tuple>,
        left_inputs: &mut BTreeMap<NodeId, Vec<Tuple>>,
    ) -> NetworkResult<Vec<Tuple>> {
        let mut chain = self.graph.path_nodes(ria)?;
        chain.reverse();
        let mut output = Vec::new();
        for tuple in tuples {
            let results = self.evaluate_chain(&chain, vec![tuple.clone()], left_inputs)?;
            match kind {
                NodeKind::Exists(_) if !results.is_empty() => output.push(tuple),
                NodeKind::Not(_) if results.is_empty() => output.push(tuple),
                NodeKind::Join(_) => output.extend(results),
                NodeKind::Accumulate(_) => output.push(tuple),
                _ => {}
            }
        }
        Ok(output)
    }

    fn memory(&self, node: NodeId) -> NetworkResult<&'a BetaMemory> {
        self.memories.get(&node).ok_or_else(|| NetworkError::Internal {
            message: format!("no join memory for node {node}"),
            component: Some("evaluation".to_string()),
        })
    }
}

fn apply_beta(kind: &NodeKind, memory: &BetaMemory, tuples: Vec<Tuple>) -> Vec<Tuple> {
    match kind {
        NodeKind::Join(_) => tuples
            .iter()
            .flat_map(|tuple| {
                memory
                    .matching_facts(tuple)
                    .into_iter()
                    .map(|fact| tuple.extend(Arc::clone(fact)))
                    .collect::<Vec<_>>()
            })
            .collect(),
        NodeKind::Exists(_) => tuples.into_iter().filter(|t| !memory.matching_facts(t).is_empty()).collect(),
        NodeKind::Not(_) => tuples.into_iter().filter(|t| memory.matching_facts(t).is_empty()).collect(),
        _ => tuples,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::constraint::BetaConstraint;
    use crate::join_memory::build_join_memory;
    use crate::network::{Condition, Pattern, ReteNetwork, RuleDefinition};
    use bingo_types::{FactValue, ValueType};

    fn fact(id: FactId, object_type: &str, field: &str, value: i64) -> Arc<Fact> {
        Arc::new(Fact::new(id, object_type, 0).with_field(field, FactValue::Integer(value)))
    }

    fn memories(network: &ReteNetwork, facts: &FactsByType) -> HashMap<NodeId, BetaMemory> {
        let mut memories = HashMap::new();
        for node in network.graph().nodes() {
            let (Some(spec), Some(node_type)) = (node.kind.beta_spec(), node.kind.node_type()) else {
                continue;
            };
            let mut memory = build_join_memory(node_type, &spec.constraints, network.config()).unwrap();
            if let crate::graph::RightInput::ObjectType(ot) = &spec.right_input {
                for f in facts.get(ot).into_iter().flat_map(|m| m.values()) {
                    memory.insert_right(Arc::clone(f));
                }
            }
            memories.insert(node.id, memory);
        }
        memories
    }

    fn facts_by_type(facts: Vec<Arc<Fact>>) -> FactsByType {
        let mut grouped = FactsByType::new();
        for f in facts {
            grouped.entry(f.object_type.clone()).or_default().insert(f.id, f);
        }
        grouped
    }

    #[test]
    fn test_join_and_not_filter_tuples() {
        let mut network = ReteNetwork::new(NetworkConfig::default()).unwrap();
        network
            .add_rule(
                RuleDefinition::new(1, "unblocked orders", "Order")
                    .join("Customer", vec![BetaConstraint::equal(0, "customer", "id", ValueType::Integer)])
                    .not("Block", vec![BetaConstraint::equal(1, "id", "customer", ValueType::Integer)]),
            )
            .unwrap();
        let facts = facts_by_type(vec![
            fact(1, "Order", "customer", 10),
            fact(2, "Order", "customer", 20),
            fact(3, "Customer", "id", 10),
            fact(4, "Customer", "id", 20),
            fact(5, "Block", "customer", 20),
        ]);
        let memories = memories(&network, &facts);

        let evaluator = PathEvaluator::new(network.graph(), &memories, &facts);
        let result = evaluator.evaluate_rule(1, network.terminal(1).unwrap()).unwrap();
        assert_eq!(result.matches, vec![vec![1, 3]]);
        assert_eq!(result.left_inputs.len(), 2);
        assert_eq!(result.left_inputs[0].1.len(), 2);
    }

    #[test]
    fn test_exists_over_subnetwork() {
        let mut network = ReteNetwork::new(NetworkConfig::default()).unwrap();
        network
            .add_rule(RuleDefinition::new(1, "shipped", "Order").condition(Condition::ExistsAll(vec![
                Pattern::new("Item", vec![BetaConstraint::equal(0, "id", "order", ValueType::Integer)]),
                Pattern::new("Shipment", vec![BetaConstraint::equal(1, "id", "item", ValueType::Integer)]),
            ])))
            .unwrap();
        let facts = facts_by_type(vec![
            fact(1, "Order", "id", 1),
            fact(2, "Order", "id", 2),
            Arc::new(
                Fact::new(3, "Item", 0)
                    .with_field("order", FactValue::Integer(1))
                    .with_field("id", FactValue::Integer(30)),
            ),
            Arc::new(
                Fact::new(4, "Item", 0)
                    .with_field("order", FactValue::Integer(2))
                    .with_field("id", FactValue::Integer(40)),
            ),
            fact(5, "Shipment", "item", 30),
        ]);
        let memories = memories(&network, &facts);

        let evaluator = PathEvaluator::new(network.graph(), &memories, &facts);
        let result = evaluator.evaluate_rule(1, network.terminal(1).unwrap()).unwrap();
        // the exists node keeps the left tuple without extending it
        assert_eq!(result.matches, vec![vec![1]]);
    }
}
