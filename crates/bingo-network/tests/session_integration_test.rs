//! End-to-end session behaviour: rule edits, negation, sub-networks, cross-thread
//! actions and partitioned evaluation.

use bingo_network::{
    Action, BetaConstraint, Condition, ConstraintOperator, EvaluationSession, Fact, FactValue, NetworkConfig,
    NetworkError, Pattern, PseudoClockScheduler, RuleDefinition, RuleExecution, ValueType,
};
use std::thread;
use tracing_subscriber::EnvFilter;

fn session(config: NetworkConfig) -> EvaluationSession {
    // RUST_LOG=bingo_network=trace shows the linking transitions of a failing test
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
    bingo_network::init().expect("Failed to initialize network core");
    EvaluationSession::with_timer(config, Box::new(PseudoClockScheduler::new())).expect("Failed to create session")
}

fn eq(position: usize, left: &str, right: &str) -> Vec<BetaConstraint> {
    vec![BetaConstraint::equal(position, left, right, ValueType::Integer)]
}

fn fact(id: u64, object_type: &str, fields: &[(&str, i64)]) -> Fact {
    fields
        .iter()
        .fold(Fact::new(id, object_type, 0), |f, (name, value)| f.with_field(*name, FactValue::Integer(*value)))
}

fn fired(executions: &[RuleExecution]) -> Vec<(u64, Vec<u64>)> {
    let mut fired: Vec<(u64, Vec<u64>)> = executions.iter().map(|e| (e.rule_id, e.tuple.clone())).collect();
    fired.sort();
    fired
}

fn order_items() -> RuleDefinition {
    RuleDefinition::new(1, "order items", "Order")
        .join("Customer", eq(0, "customer", "id"))
        .join("Item", eq(0, "id", "order"))
}

fn order_payments() -> RuleDefinition {
    RuleDefinition::new(2, "order payments", "Order")
        .join("Customer", eq(0, "customer", "id"))
        .join("Payment", eq(0, "id", "order"))
}

#[test]
fn test_removing_a_shared_rule_keeps_the_other() {
    let mut session = session(NetworkConfig::default());
    session.add_rule(order_items()).expect("Failed to add rule 1");
    session.add_rule(order_payments()).expect("Failed to add rule 2");
    let shared_size = session.network().graph().len();

    session.insert(fact(1, "Order", &[("id", 10), ("customer", 7)])).expect("insert");
    session.insert(fact(2, "Customer", &[("id", 7)])).expect("insert");
    session.insert(fact(3, "Item", &[("order", 10)])).expect("insert");
    session.insert(fact(4, "Payment", &[("order", 10)])).expect("insert");

    let executions = session.fire_all_rules().expect("fire");
    assert_eq!(fired(&executions), vec![(1, vec![1, 2, 3]), (2, vec![1, 2, 4])]);

    session.remove_rule(2).expect("Failed to remove rule");
    assert_eq!(session.network().rule_count(), 1);
    assert_eq!(session.network().graph().len(), shared_size - 2);
    assert!(session.is_rule_linked(1).expect("rule 1"));
    // the surviving rule does not fire again for tuples it already fired
    assert!(session.fire_all_rules().expect("fire").is_empty());

    session.insert(fact(5, "Item", &[("order", 10)])).expect("insert");
    let executions = session.fire_all_rules().expect("fire");
    assert_eq!(fired(&executions), vec![(1, vec![1, 2, 5])]);

    session.add_rule(order_payments()).expect("Failed to re-add rule 2");
    assert_eq!(session.network().graph().len(), shared_size);
    let executions = session.fire_all_rules().expect("fire");
    assert_eq!(fired(&executions), vec![(2, vec![1, 2, 4])]);
}

#[test]
fn test_rule_added_after_facts_sees_them() {
    let mut session = session(NetworkConfig::default());
    session.insert(fact(1, "Order", &[("id", 10), ("customer", 7)])).expect("insert");
    session.insert(fact(2, "Customer", &[("id", 7)])).expect("insert");
    session.insert(fact(3, "Item", &[("order", 10)])).expect("insert");
    session.insert(fact(4, "Item", &[("order", 11)])).expect("insert");

    session.add_rule(order_items()).expect("Failed to add rule");
    assert!(session.is_rule_linked(1).expect("rule 1"));
    let executions = session.fire_all_rules().expect("fire");
    assert_eq!(fired(&executions), vec![(1, vec![1, 2, 3])]);
}

#[test]
fn test_not_node_blocks_and_releases() {
    let mut session = session(NetworkConfig::default());
    session
        .add_rule(RuleDefinition::new(1, "unblocked orders", "Order").not("Block", eq(0, "id", "order")))
        .expect("Failed to add rule");

    session.insert(fact(1, "Order", &[("id", 10)])).expect("insert");
    session.insert(fact(2, "Block", &[("order", 99)])).expect("insert");
    assert_eq!(fired(&session.fire_all_rules().expect("fire")), vec![(1, vec![1])]);

    session.insert(fact(3, "Block", &[("order", 10)])).expect("insert");
    assert!(session.fire_all_rules().expect("fire").is_empty());

    // the match disappeared, so its return is a new activation
    session.retract(3).expect("retract");
    assert_eq!(fired(&session.fire_all_rules().expect("fire")), vec![(1, vec![1])]);
}

#[test]
fn test_exists_over_a_subnetwork() {
    let mut session = session(NetworkConfig::default());
    session
        .add_rule(RuleDefinition::new(1, "shipped orders", "Order").condition(Condition::ExistsAll(vec![
            Pattern::new("Item", eq(0, "id", "order")),
            Pattern::new("Shipment", eq(1, "id", "item")),
        ])))
        .expect("Failed to add rule");

    session.insert(fact(1, "Order", &[("id", 10)])).expect("insert");
    session.insert(fact(2, "Item", &[("id", 30), ("order", 10)])).expect("insert");
    session.insert(fact(3, "Item", &[("id", 31), ("order", 10)])).expect("insert");
    assert!(!session.is_rule_linked(1).expect("rule 1"));
    assert!(session.fire_all_rules().expect("fire").is_empty());

    session.insert(fact(4, "Shipment", &[("item", 30)])).expect("insert");
    assert!(session.is_rule_linked(1).expect("rule 1"));
    assert_eq!(fired(&session.fire_all_rules().expect("fire")), vec![(1, vec![1])]);

    // a second shipment does not add a second activation for the same order
    session.insert(fact(5, "Shipment", &[("item", 31)])).expect("insert");
    assert!(session.fire_all_rules().expect("fire").is_empty());

    session.retract(4).expect("retract");
    session.retract(5).expect("retract");
    assert!(!session.is_rule_linked(1).expect("rule 1"));
    session.insert(fact(6, "Shipment", &[("item", 31)])).expect("insert");
    assert_eq!(fired(&session.fire_all_rules().expect("fire")), vec![(1, vec![1])]);
}

#[test]
fn test_update_moves_a_fact_between_matches() {
    let mut session = session(NetworkConfig::default());
    session.add_rule(order_items()).expect("Failed to add rule");
    session.insert(fact(1, "Order", &[("id", 10), ("customer", 7)])).expect("insert");
    session.insert(fact(2, "Customer", &[("id", 7)])).expect("insert");
    session.insert(fact(3, "Item", &[("order", 11)])).expect("insert");
    assert!(session.fire_all_rules().expect("fire").is_empty());

    session.update(fact(3, "Item", &[("order", 10)])).expect("update");
    assert_eq!(fired(&session.fire_all_rules().expect("fire")), vec![(1, vec![1, 2, 3])]);

    let err = session.update(fact(3, "Payment", &[("order", 10)])).expect_err("type change must fail");
    assert!(matches!(err, NetworkError::Session { .. }));
    assert!(session.update(fact(42, "Item", &[])).is_err());
}

#[test]
fn test_actions_from_other_threads_apply_in_order() {
    let mut session = session(NetworkConfig::default());
    session.add_rule(RuleDefinition::new(1, "every order", "Order")).expect("Failed to add rule");

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let sender = session.action_sender();
            thread::spawn(move || {
                for i in 0..5 {
                    let id = t * 100 + i;
                    sender.enqueue(Action::Insert(fact(id, "Order", &[("id", id as i64)]))).expect("enqueue");
                }
                // retract the last order of this thread after inserting it
                sender.enqueue(Action::Retract(t * 100 + 4)).expect("enqueue");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("sender thread panicked");
    }

    assert_eq!(session.pending_actions(), 24);
    assert_eq!(session.fact_count(), 0);
    let executions = session.fire_all_rules().expect("fire");
    assert_eq!(session.pending_actions(), 0);
    assert_eq!(session.fact_count(), 16);
    assert_eq!(executions.len(), 16);
}

fn partitioned_rules() -> Vec<RuleDefinition> {
    vec![
        order_items(),
        RuleDefinition::new(3, "large invoices", "Invoice").join(
            "Customer",
            vec![BetaConstraint::compare(ConstraintOperator::GreaterThan, 0, "amount", "limit", ValueType::Integer)],
        ),
        RuleDefinition::new(4, "unpaid invoices", "Invoice").not("Payment", eq(0, "id", "invoice")),
        RuleDefinition::new(5, "any customer", "Customer").with_salience(5),
    ]
}

fn run_partitioned(config: NetworkConfig) -> Vec<(u64, Vec<u64>)> {
    let mut session = session(config);
    for rule in partitioned_rules() {
        session.add_rule(rule).expect("Failed to add rule");
    }
    session.insert(fact(1, "Order", &[("id", 10), ("customer", 7)])).expect("insert");
    session.insert(fact(2, "Customer", &[("id", 7), ("limit", 100)])).expect("insert");
    session.insert(fact(3, "Item", &[("order", 10)])).expect("insert");
    session.insert(fact(4, "Invoice", &[("id", 20), ("amount", 50)])).expect("insert");
    session.insert(fact(5, "Invoice", &[("id", 21), ("amount", 500)])).expect("insert");
    session.insert(fact(6, "Payment", &[("invoice", 21)])).expect("insert");
    fired(&session.fire_all_rules().expect("fire"))
}

#[test]
fn test_partitioned_evaluation_matches_sequential() {
    let single = run_partitioned(NetworkConfig::default());
    let multi = run_partitioned(NetworkConfig::default().with_multithread_evaluation(true, 3));

    // limit > amount for invoice 4 only; invoice 5 is paid
    assert_eq!(single, vec![(1, vec![1, 2, 3]), (3, vec![4, 2]), (4, vec![4]), (5, vec![2])]);
    assert_eq!(single, multi);
}

#[test]
fn test_invalid_configuration_is_rejected() {
    let config = NetworkConfig { max_threads: 0, ..NetworkConfig::default() };
    let err = EvaluationSession::with_timer(config, Box::new(PseudoClockScheduler::new()))
        .err()
        .expect("zero threads must fail");
    assert!(matches!(err, NetworkError::Configuration { .. }));
}
