//! Firing order of the agenda and of a session's rules
//!
//! Salience decides first; among equal salience the activation created first fires
//! first. Nothing else breaks ties.

use bingo_network::{
    Activation, Agenda, DepthConflictResolver, EvaluationSession, Fact, NetworkConfig, PseudoClockScheduler,
    RuleDefinition,
};
use proptest::prelude::*;
use std::cmp::Ordering;

#[test]
fn test_agenda_fires_by_salience_then_creation() {
    let mut agenda = Agenda::new();
    let a = agenda.add(1, 100, vec![1], 5);
    let b = agenda.add(2, 200, vec![2], 5);
    let c = agenda.add(3, 300, vec![3], 3);
    let d = agenda.add(4, 400, vec![4], 7);

    let preview: Vec<u64> = agenda.activations().iter().map(|x| x.activation_number).collect();
    let fired: Vec<u64> = agenda.fire_all(|_| {}).iter().map(|e| e.activation_number).collect();
    assert_eq!(fired, vec![d, a, b, c]);
    assert_eq!(preview, fired);
    assert!(agenda.is_empty());
}

#[test]
fn test_cancelled_activations_never_fire() {
    let mut agenda = Agenda::new();
    agenda.add(1, 100, vec![1, 2], 0);
    agenda.add(1, 100, vec![1, 3], 0);
    agenda.add(2, 200, vec![3], 10);

    assert!(agenda.cancel_tuple(1, &[1, 2]));
    assert!(!agenda.cancel_tuple(1, &[1, 2]));
    assert_eq!(agenda.cancel_fact(3), 2);
    assert!(agenda.fire_all(|_| {}).is_empty());
}

#[test]
fn test_duplicate_match_keeps_its_number() {
    let mut agenda = Agenda::new();
    let first = agenda.add(1, 100, vec![1], 0);
    agenda.add(2, 200, vec![2], 0);
    assert_eq!(agenda.add(1, 100, vec![1], 0), first);
    assert_eq!(agenda.len(), 2);
    assert_eq!(agenda.next().map(|a| a.activation_number), Some(first));
}

#[test]
fn test_session_fires_rules_in_salience_order() {
    let mut session = EvaluationSession::with_timer(NetworkConfig::default(), Box::new(PseudoClockScheduler::new()))
        .expect("Failed to create session");
    for (id, salience) in [(1, 5), (2, 5), (3, 10), (4, -1)] {
        session
            .add_rule(RuleDefinition::new(id, format!("rule {id}"), "Order").with_salience(salience))
            .expect("Failed to add rule");
    }
    session.insert(Fact::new(1, "Order", 0)).expect("insert");
    session.insert(Fact::new(2, "Order", 0)).expect("insert");

    let executions = session.fire_all_rules().expect("fire");
    let order: Vec<(u64, Vec<u64>)> = executions.iter().map(|e| (e.rule_id, e.tuple.clone())).collect();
    assert_eq!(
        order,
        vec![
            (3, vec![1]),
            (3, vec![2]),
            (1, vec![1]),
            (1, vec![2]),
            (2, vec![1]),
            (2, vec![2]),
            (4, vec![1]),
            (4, vec![2]),
        ]
    );
    assert!(executions.windows(2).all(|w| w[0].salience >= w[1].salience));
}

fn activation(salience: i32, number: u64) -> Activation {
    Activation { rule_id: 1, path: 1, tuple: vec![number], salience, activation_number: number }
}

proptest! {
    #[test]
    fn prop_fire_order_is_salience_then_number(saliences in prop::collection::vec(-5i32..5, 1..40)) {
        let mut agenda = Agenda::new();
        for (i, salience) in saliences.iter().enumerate() {
            agenda.add(i as u64, 1, vec![i as u64], *salience);
        }
        let executions = agenda.fire_all(|_| {});
        prop_assert_eq!(executions.len(), saliences.len());

        let resolver = DepthConflictResolver;
        for pair in executions.windows(2) {
            let a = activation(pair[0].salience, pair[0].activation_number);
            let b = activation(pair[1].salience, pair[1].activation_number);
            prop_assert_eq!(resolver.compare(&a, &b), Ordering::Less);
        }
    }
}
