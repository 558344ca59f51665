//! Evaluation session
//!
//! The session owns the working memory, join memories, linking arena, windows and
//! agenda. All of them are mutated only by the thread holding the session; other
//! threads, the timer thread included, talk to it through [`ActionSender`].
//!
//! Fact changes update join memories and node link bits eagerly. Rule paths are
//! evaluated lazily in [`EvaluationSession::fire_all_rules`]: only paths that are
//! rule-linked and dirty are recomputed, and their matches are diffed against the
//! agenda and the set of tuples that already fired.

use crate::action_queue::{Action, ActionQueue, ActionSender};
use crate::agenda::{Agenda, RuleExecution};
use crate::config::NetworkConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::evaluation::{FactsByType, PathEvaluator, PathResult};
use crate::graph::{NodeKind, RightInput};
use crate::join_memory::{BetaMemory, build_join_memory};
use crate::linking::{LinkEvent, LinkingArena, PathKind};
use crate::network::{NetworkChange, ReteNetwork, RuleDefinition};
use crate::timer::{RealtimeTimerService, TimerService};
use crate::types::{Fact, FactId, NodeId, PathId, PropagationType, RuleId, Timestamp, WindowId};
use crate::window::{SlidingLengthWindow, SlidingTimeWindow, WindowBehavior, WindowServices};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

/// A single-writer rule evaluation session
pub struct EvaluationSession {
    id: Uuid,
    network: ReteNetwork,
    facts: BTreeMap<FactId, Arc<Fact>>,
    facts_by_type: FactsByType,
    memories: HashMap<NodeId, BetaMemory>,
    arena: LinkingArena,
    agenda: Agenda,
    /// Tuples that fired and still match, per rule
    fired: HashMap<RuleId, HashSet<Vec<FactId>>>,
    windows: BTreeMap<WindowId, WindowBehavior>,
    window_by_type: HashMap<String, WindowId>,
    next_window_id: WindowId,
    timer: Box<dyn TimerService>,
    queue: ActionQueue,
    sender: ActionSender,
    pool: Option<rayon::ThreadPool>,
}

impl EvaluationSession {
    /// Session on the wall clock
    pub fn new(config: NetworkConfig) -> NetworkResult<Self> {
        Self::with_timer(config, Box::new(RealtimeTimerService::start()?))
    }

    /// Session on a caller supplied clock, typically a pseudo clock in tests
    #[instrument(skip(timer))]
    pub fn with_timer(config: NetworkConfig, timer: Box<dyn TimerService>) -> NetworkResult<Self> {
        let network = ReteNetwork::new(config)?;
        let pool = if network.config().multithread_evaluation {
            let threads = network.config().max_threads.min(num_cpus::get().max(1));
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .thread_name(|i| format!("bingo-eval-{i}"))
                .build()
                .map_err(|e| NetworkError::internal_component("evaluation", format!("failed to build worker pool: {e}")))?;
            Some(pool)
        } else {
            None
        };

        let queue = ActionQueue::new();
        let sender = queue.sender();
        let id = Uuid::new_v4();
        info!(session = %id, multithreaded = pool.is_some(), "Created evaluation session");

        Ok(Self {
            id,
            network,
            facts: BTreeMap::new(),
            facts_by_type: FactsByType::new(),
            memories: HashMap::new(),
            arena: LinkingArena::new(),
            agenda: Agenda::new(),
            fired: HashMap::new(),
            windows: BTreeMap::new(),
            window_by_type: HashMap::new(),
            next_window_id: 1,
            timer,
            queue,
            sender,
            pool,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &NetworkConfig {
        self.network.config()
    }

    /// Handle for enqueueing changes from other threads
    pub fn action_sender(&self) -> ActionSender {
        self.sender.clone()
    }

    pub fn current_time(&self) -> Timestamp {
        self.timer.current_time()
    }

    #[instrument(skip(self, rule), fields(session = %self.id, rule_id = rule.id))]
    pub fn add_rule(&mut self, rule: RuleDefinition) -> NetworkResult<()> {
        let change = self.network.add_rule(rule)?;
        self.apply_change(change)
    }

    #[instrument(skip(self), fields(session = %self.id))]
    pub fn remove_rule(&mut self, rule_id: RuleId) -> NetworkResult<()> {
        let change = self.network.remove_rule(rule_id)?;
        self.agenda.cancel_rule(rule_id);
        self.fired.remove(&rule_id);
        self.apply_change(change)
    }

    /// Replace the memories of every edited path. Link state is derived again from
    /// the join memories; only rules that stop being linked lose their activations.
    fn apply_change(&mut self, change: NetworkChange) -> NetworkResult<()> {
        let linked_before: Vec<(PathId, RuleId)> = change
            .detached_paths
            .iter()
            .filter_map(|path| {
                let memory = self.arena.path(*path).ok()?;
                match memory.kind {
                    PathKind::Rule(rule) if memory.is_rule_linked() => Some((*path, rule)),
                    _ => None,
                }
            })
            .collect();

        for path in &change.detached_paths {
            if self.arena.has_path(*path) {
                self.arena.detach_path(*path)?;
            }
        }
        for segment in self.arena.orphan_segments() {
            self.arena.remove_segment(segment)?;
        }

        for node in &change.removed_nodes {
            self.memories.remove(node);
        }
        for node in &change.added_nodes {
            self.create_memory(*node)?;
        }

        for prototype in change.build.segments.values() {
            if !self.arena.create_segment(prototype) {
                continue;
            }
            for &(node, _) in &prototype.nodes {
                if self.node_should_be_linked(node)? == Some(true) {
                    self.arena.link_node_without_rule_notify(node)?;
                }
                self.arena.mark_node_dirty(node)?;
            }
        }

        let mut events = Vec::new();
        for layout in &change.build.paths {
            let kind = self.network.path_kind(layout)?;
            events.extend(self.arena.attach_path(layout, kind)?);
        }
        for (path, rule) in linked_before {
            if !self.arena.has_path(path) || !self.arena.is_path_linked(path)? {
                events.push(LinkEvent::RuleUnlinked { rule, path });
            }
        }
        debug!(
            rule_id = change.rule,
            paths = change.build.paths.len(),
            segments = self.arena.segments().count(),
            "Applied network change"
        );
        self.handle_events(events);
        Ok(())
    }

    fn create_memory(&mut self, node: NodeId) -> NetworkResult<()> {
        let graph_node = self.network.graph().node(node)?;
        let (Some(spec), Some(node_type)) = (graph_node.kind.beta_spec(), graph_node.kind.node_type()) else {
            return Ok(());
        };
        let mut memory = build_join_memory(node_type, &spec.constraints, self.network.config())?;
        if let RightInput::ObjectType(object_type) = &spec.right_input {
            for fact in self.facts_by_type.get(object_type).into_iter().flat_map(BTreeMap::values) {
                memory.insert_right(Arc::clone(fact));
            }
        }
        self.memories.insert(node, memory);
        Ok(())
    }

    /// Link state implied by the memories; `None` for nodes linked by other means
    fn node_should_be_linked(&self, node: NodeId) -> NetworkResult<Option<bool>> {
        let graph_node = self.network.graph().node(node)?;
        if let NodeKind::LeftInputAdapter { object_type } = &graph_node.kind {
            return Ok(Some(self.facts_by_type.get(object_type).is_some_and(|facts| !facts.is_empty())));
        }
        let Some(spec) = graph_node.kind.beta_spec() else {
            return Ok(None);
        };
        if spec.subnetwork().is_some() {
            return Ok(None);
        }
        let right_empty = self.memories.get(&node).is_none_or(BetaMemory::right_is_empty);
        Ok(Some(match graph_node.kind {
            NodeKind::Not(_) => right_empty,
            _ => !right_empty,
        }))
    }

    /// Re-derive the link bit of `node`; a node whose link state holds is marked
    /// dirty only when `changed` says its output may differ
    fn refresh_node_link(&mut self, node: NodeId, changed: bool) -> NetworkResult<Vec<LinkEvent>> {
        if self.arena.node_position(node).is_err() {
            return Ok(Vec::new());
        }
        let linked = self.arena.is_node_linked(node)?;
        match self.node_should_be_linked(node)? {
            Some(true) if !linked => self.arena.link_node(node),
            Some(false) if linked => self.arena.unlink_node(node),
            _ if changed => {
                self.arena.mark_node_dirty(node)?;
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Whether adding or removing `fact` on the right input of `node` can change
    /// what the node emits. Join, exists and not nodes consult the left tuples
    /// stored by the last evaluation; a fact that joins none of them cannot.
    fn right_change_matters(&self, node: NodeId, fact: &Fact) -> NetworkResult<bool> {
        let kind = &self.network.graph().node(node)?.kind;
        if !matches!(kind, NodeKind::Join(_) | NodeKind::Exists(_) | NodeKind::Not(_)) {
            return Ok(true);
        }
        let matters = self.memories.get(&node).is_none_or(|memory| memory.joins_left(fact));
        if !matters {
            trace!(node, fact_id = fact.id, "Right change joins no left tuple");
        }
        Ok(matters)
    }

    fn handle_events(&mut self, events: Vec<LinkEvent>) {
        for event in events {
            match event {
                LinkEvent::RuleUnlinked { rule, path } => {
                    let cancelled = self.agenda.cancel_rule(rule);
                    self.fired.remove(&rule);
                    debug!(session = %self.id, rule, path, cancelled, "Rule unlinked");
                }
                LinkEvent::RuleLinked { rule, path } => {
                    debug!(session = %self.id, rule, path, "Rule linked");
                }
                LinkEvent::SegmentLinked { segment } | LinkEvent::SegmentUnlinked { segment } => {
                    trace!(segment, event = ?event, "Segment transition");
                }
            }
        }
    }

    /// Declare a sliding time window over every later fact of `object_type`
    pub fn declare_time_window(&mut self, object_type: &str, size: Timestamp) -> NetworkResult<WindowId> {
        if size < 0 {
            return Err(NetworkError::configuration(
                "window.size",
                "a non-negative duration in milliseconds",
                &size.to_string(),
                "window size cannot be negative",
            ));
        }
        let id = self.reserve_window(object_type)?;
        self.windows.insert(id, WindowBehavior::Time(SlidingTimeWindow::new(id, size)));
        info!(session = %self.id, window = id, object_type, size, "Declared time window");
        Ok(id)
    }

    /// Declare a sliding window over the last `size` facts of `object_type`
    pub fn declare_length_window(&mut self, object_type: &str, size: usize) -> NetworkResult<WindowId> {
        let id = self.reserve_window(object_type)?;
        self.windows.insert(id, WindowBehavior::Length(SlidingLengthWindow::new(id, size)));
        info!(session = %self.id, window = id, object_type, size, "Declared length window");
        Ok(id)
    }

    fn reserve_window(&mut self, object_type: &str) -> NetworkResult<WindowId> {
        if let Some(existing) = self.window_by_type.get(object_type) {
            return Err(NetworkError::Window {
                message: format!("object type {object_type} already has a window"),
                window_id: Some(*existing),
            });
        }
        let id = self.next_window_id;
        self.next_window_id += 1;
        self.window_by_type.insert(object_type.to_string(), id);
        Ok(id)
    }

    /// Insert a fact; returns false when its window rejected it as already expired
    pub fn insert(&mut self, fact: Fact) -> NetworkResult<bool> {
        if self.facts.contains_key(&fact.id) {
            return Err(NetworkError::session_fact(fact.id, "insert", "fact is already in working memory"));
        }

        let mut evicted = None;
        if let Some(window_id) = self.window_by_type.get(&fact.object_type) {
            match self.windows.get_mut(window_id) {
                Some(WindowBehavior::Time(window)) => {
                    let mut services = WindowServices { timer: &mut *self.timer, sender: &self.sender };
                    if !window.assert_fact(fact.id, fact.timestamp, &mut services)? {
                        debug!(session = %self.id, fact_id = fact.id, "Fact already expired");
                        return Ok(false);
                    }
                }
                Some(WindowBehavior::Length(window)) => {
                    evicted = window.assert_fact(fact.id);
                    if evicted == Some(fact.id) {
                        return Ok(false);
                    }
                }
                None => {}
            }
        }

        let fact_id = fact.id;
        self.add_to_memories(Arc::new(fact))?;
        if let Some(oldest) = evicted {
            self.retract_internal(oldest, PropagationType::Expiration)?;
        }
        trace!(session = %self.id, fact_id, "Inserted fact");
        Ok(true)
    }

    pub fn retract(&mut self, fact_id: FactId) -> NetworkResult<()> {
        self.retract_internal(fact_id, PropagationType::Deletion)
    }

    /// Replace the field values of a fact; window membership is unchanged
    pub fn update(&mut self, fact: Fact) -> NetworkResult<()> {
        let old = self
            .facts
            .get(&fact.id)
            .cloned()
            .ok_or_else(|| NetworkError::session_fact(fact.id, "update", "fact is not in working memory"))?;
        if old.object_type != fact.object_type {
            return Err(NetworkError::session_fact(fact.id, "update", "object type cannot change"));
        }
        self.remove_from_memories(&old)?;
        self.forget_matches(fact.id);
        self.add_to_memories(Arc::new(fact))?;
        trace!(session = %self.id, fact_id = old.id, propagation = ?PropagationType::Modification, "Updated fact");
        Ok(())
    }

    fn retract_internal(&mut self, fact_id: FactId, propagation: PropagationType) -> NetworkResult<()> {
        let fact = self
            .facts
            .remove(&fact_id)
            .ok_or_else(|| NetworkError::session_fact(fact_id, "retract", "fact is not in working memory"))?;

        if let Some(window_id) = self.window_by_type.get(&fact.object_type) {
            match self.windows.get_mut(window_id) {
                Some(WindowBehavior::Time(window)) => {
                    let mut services = WindowServices { timer: &mut *self.timer, sender: &self.sender };
                    window.retract_fact(fact_id, &mut services)?;
                }
                Some(WindowBehavior::Length(window)) => {
                    window.retract_fact(fact_id);
                }
                None => {}
            }
        }

        self.remove_from_memories(&fact)?;
        self.forget_matches(fact_id);
        trace!(session = %self.id, fact_id, propagation = ?propagation, "Retracted fact");
        Ok(())
    }

    fn forget_matches(&mut self, fact_id: FactId) {
        self.agenda.cancel_fact(fact_id);
        for tuples in self.fired.values_mut() {
            tuples.retain(|tuple| !tuple.contains(&fact_id));
        }
    }

    fn add_to_memories(&mut self, fact: Arc<Fact>) -> NetworkResult<()> {
        self.facts.insert(fact.id, Arc::clone(&fact));
        self.facts_by_type.entry(fact.object_type.clone()).or_default().insert(fact.id, Arc::clone(&fact));

        let nodes = self.network.nodes_for_object_type(&fact.object_type).to_vec();
        let mut events = Vec::new();
        for node in nodes {
            let changed = self.right_change_matters(node, &fact)?;
            if let Some(memory) = self.memories.get_mut(&node) {
                memory.insert_right(Arc::clone(&fact));
            }
            events.extend(self.refresh_node_link(node, changed)?);
        }
        self.handle_events(events);
        Ok(())
    }

    fn remove_from_memories(&mut self, fact: &Fact) -> NetworkResult<()> {
        if let Some(facts) = self.facts_by_type.get_mut(&fact.object_type) {
            facts.remove(&fact.id);
        }
        let nodes = self.network.nodes_for_object_type(&fact.object_type).to_vec();
        let mut events = Vec::new();
        for node in nodes {
            let changed = self.right_change_matters(node, fact)?;
            if let Some(memory) = self.memories.get_mut(&node) {
                memory.remove_right(fact.id);
            }
            events.extend(self.refresh_node_link(node, changed)?);
        }
        self.handle_events(events);
        Ok(())
    }

    /// Apply every queued action in arrival order; returns how many were applied
    #[instrument(skip(self), fields(session = %self.id))]
    pub fn flush(&mut self) -> NetworkResult<usize> {
        let mut applied = 0;
        while let Some(action) = self.queue.try_next() {
            trace!(action = action.name(), "Applying action");
            match action {
                Action::Insert(fact) => {
                    self.insert(fact)?;
                }
                Action::Retract(fact_id) => self.retract(fact_id)?,
                Action::Update(fact) => self.update(fact)?,
                Action::ExpireWindow(window) => {
                    self.expire_window(window)?;
                }
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Expire every due fact of a time window and reschedule it
    pub fn expire_window(&mut self, window_id: WindowId) -> NetworkResult<usize> {
        match self.windows.get(&window_id) {
            Some(WindowBehavior::Time(_)) => {}
            Some(WindowBehavior::Length(_)) => return Ok(0),
            None => return Err(NetworkError::unknown_window(window_id)),
        }

        let now = self.timer.current_time();
        let mut expired = 0;
        loop {
            let next = match self.windows.get_mut(&window_id) {
                Some(WindowBehavior::Time(window)) => window.next_expired(now),
                _ => None,
            };
            let Some(fact_id) = next else {
                break;
            };
            let result = if self.facts.contains_key(&fact_id) {
                self.retract_internal(fact_id, PropagationType::Expiration)
            } else {
                Ok(())
            };
            if let Some(WindowBehavior::Time(window)) = self.windows.get_mut(&window_id) {
                window.finish_expiring();
            }
            result?;
            expired += 1;
        }

        if let Some(WindowBehavior::Time(window)) = self.windows.get_mut(&window_id) {
            let mut services = WindowServices { timer: &mut *self.timer, sender: &self.sender };
            window.update_next_expiration(&mut services)?;
        }
        if expired > 0 {
            debug!(session = %self.id, window = window_id, expired, now, "Expired window facts");
        }
        Ok(expired)
    }

    /// Drain the action queue, evaluate linked dirty rules and fire the agenda
    #[instrument(skip(self), fields(session = %self.id))]
    pub fn fire_all_rules(&mut self) -> NetworkResult<Vec<RuleExecution>> {
        self.flush()?;
        self.evaluate()?;

        let fired = &mut self.fired;
        let executions = self.agenda.fire_all(|activation| {
            fired.entry(activation.rule_id).or_default().insert(activation.tuple.clone());
        });
        info!(fired = executions.len(), "Fired rules");
        Ok(executions)
    }

    fn evaluate(&mut self) -> NetworkResult<()> {
        let candidates: Vec<(RuleId, PathId)> = self
            .network
            .rule_ids()
            .into_iter()
            .filter_map(|rule| {
                let terminal = self.network.terminal(rule)?;
                let linked = self.arena.is_path_linked(terminal).unwrap_or(false);
                let dirty = self
                    .network
                    .rule_paths(rule)
                    .iter()
                    .any(|path| self.arena.is_path_dirty(*path).unwrap_or(false));
                (linked && dirty).then_some((rule, terminal))
            })
            .collect();

        if !candidates.is_empty() {
            debug!(session = %self.id, paths = candidates.len(), "Evaluating rule paths");
            for result in self.evaluate_paths(&candidates)? {
                self.apply_result(result);
            }
        }
        self.arena.clean();
        Ok(())
    }

    fn evaluate_paths(&self, candidates: &[(RuleId, PathId)]) -> NetworkResult<Vec<PathResult>> {
        let evaluator = PathEvaluator::new(self.network.graph(), &self.memories, &self.facts_by_type);
        let Some(pool) = &self.pool else {
            return candidates.iter().map(|(rule, path)| evaluator.evaluate_rule(*rule, *path)).collect();
        };

        let groups: Vec<Vec<(RuleId, PathId)>> = self
            .network
            .partitions()
            .into_iter()
            .map(|partition| candidates.iter().copied().filter(|(rule, _)| partition.contains(rule)).collect::<Vec<_>>())
            .filter(|group| !group.is_empty())
            .collect();
        let results: Vec<NetworkResult<Vec<PathResult>>> = pool.install(|| {
            groups
                .par_iter()
                .map(|group| group.iter().map(|(rule, path)| evaluator.evaluate_rule(*rule, *path)).collect())
                .collect()
        });

        let mut flattened = Vec::with_capacity(candidates.len());
        for group in results {
            flattened.extend(group?);
        }
        Ok(flattened)
    }

    fn apply_result(&mut self, result: PathResult) {
        let rule = result.rule;
        let salience = self.network.rule(rule).map_or(0, |r| r.salience);
        let current: HashSet<&Vec<FactId>> = result.matches.iter().collect();

        for tuple in self.agenda.pending_tuples(rule) {
            if !current.contains(&tuple) {
                self.agenda.cancel_tuple(rule, &tuple);
            }
        }
        let fired = self.fired.entry(rule).or_default();
        fired.retain(|tuple| current.contains(tuple));
        for tuple in &result.matches {
            if !fired.contains(tuple) {
                self.agenda.add(rule, result.path, tuple.clone(), salience);
            }
        }

        for (node, tuples) in result.left_inputs {
            if let Some(memory) = self.memories.get_mut(&node) {
                memory.clear_left();
                for tuple in tuples {
                    memory.insert_left(tuple);
                }
            }
        }
        trace!(rule, matches = result.matches.len(), pending = self.agenda.len(), "Applied rule matches");
    }

    pub fn network(&self) -> &ReteNetwork {
        &self.network
    }

    pub fn arena(&self) -> &LinkingArena {
        &self.arena
    }

    pub fn agenda(&self) -> &Agenda {
        &self.agenda
    }

    pub fn fact(&self, fact_id: FactId) -> Option<&Arc<Fact>> {
        self.facts.get(&fact_id)
    }

    pub fn fact_count(&self) -> usize {
        self.facts.len()
    }

    pub fn beta_memory(&self, node: NodeId) -> Option<&BetaMemory> {
        self.memories.get(&node)
    }

    pub fn window(&self, window_id: WindowId) -> Option<&WindowBehavior> {
        self.windows.get(&window_id)
    }

    pub fn window_for_type(&self, object_type: &str) -> Option<WindowId> {
        self.window_by_type.get(object_type).copied()
    }

    pub fn is_rule_linked(&self, rule_id: RuleId) -> NetworkResult<bool> {
        let terminal = self
            .network
            .terminal(rule_id)
            .ok_or_else(|| NetworkError::structure(format!("rule {rule_id} is not in the network")))?;
        self.arena.is_path_linked(terminal)
    }

    pub fn pending_actions(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for EvaluationSession {
    fn drop(&mut self) {
        if !self.queue.is_empty() {
            warn!(session = %self.id, pending = self.queue.len(), "Dropping session with unapplied actions");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::BetaConstraint;
    use crate::timer::PseudoClockScheduler;
    use bingo_types::{FactValue, ValueType};

    fn session() -> (EvaluationSession, PseudoClockScheduler) {
        let clock = PseudoClockScheduler::new();
        let session = EvaluationSession::with_timer(NetworkConfig::default(), Box::new(clock.clone())).unwrap();
        (session, clock)
    }

    fn order(id: FactId, customer: i64) -> Fact {
        Fact::new(id, "Order", 0).with_field("customer", FactValue::Integer(customer))
    }

    fn customer(id: FactId, key: i64) -> Fact {
        Fact::new(id, "Customer", 0).with_field("id", FactValue::Integer(key))
    }

    fn order_rule() -> RuleDefinition {
        RuleDefinition::new(1, "order with customer", "Order")
            .join("Customer", vec![BetaConstraint::equal(0, "customer", "id", ValueType::Integer)])
    }

    #[test]
    fn test_rule_links_when_both_inputs_have_facts() {
        let (mut session, _clock) = session();
        session.add_rule(order_rule()).unwrap();
        assert!(!session.is_rule_linked(1).unwrap());

        session.insert(order(1, 10)).unwrap();
        assert!(!session.is_rule_linked(1).unwrap());
        session.insert(customer(2, 10)).unwrap();
        assert!(session.is_rule_linked(1).unwrap());

        let fired = session.fire_all_rules().unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].tuple, vec![1, 2]);
        // the same match does not fire twice
        assert!(session.fire_all_rules().unwrap().is_empty());
    }

    #[test]
    fn test_unlinking_cancels_pending_activations() {
        let (mut session, _clock) = session();
        session.add_rule(order_rule()).unwrap();
        session.insert(order(1, 10)).unwrap();
        session.insert(customer(2, 10)).unwrap();
        session.evaluate().unwrap();
        assert_eq!(session.agenda().len(), 1);

        session.retract(2).unwrap();
        assert!(!session.is_rule_linked(1).unwrap());
        assert!(session.agenda().is_empty());
        assert!(session.fire_all_rules().unwrap().is_empty());
    }

    #[test]
    fn test_update_refires_changed_match() {
        let (mut session, _clock) = session();
        session.add_rule(order_rule()).unwrap();
        session.insert(order(1, 10)).unwrap();
        session.insert(customer(2, 10)).unwrap();
        assert_eq!(session.fire_all_rules().unwrap().len(), 1);

        session.update(order(1, 10)).unwrap();
        assert_eq!(session.fire_all_rules().unwrap().len(), 1);
        session.update(order(1, 99)).unwrap();
        assert!(session.fire_all_rules().unwrap().is_empty());
        assert!(session.update(customer(1, 10)).is_err());
    }

    #[test]
    fn test_right_facts_that_join_no_left_tuple_leave_the_rule_clean() {
        let (mut session, _clock) = session();
        session.add_rule(order_rule()).unwrap();
        session.insert(order(1, 10)).unwrap();
        session.insert(customer(2, 10)).unwrap();
        assert_eq!(session.fire_all_rules().unwrap().len(), 1);

        let join = session.network().nodes_for_object_type("Customer")[0];
        let terminal = session.network().terminal(1).unwrap();
        let memory = session.beta_memory(join).unwrap();
        assert_eq!(memory.left_len(), 1);
        assert!(memory.joins_left(&customer(9, 10)));
        assert!(!memory.joins_left(&customer(9, 99)));

        session.insert(customer(3, 99)).unwrap();
        assert!(!session.arena().is_path_dirty(terminal).unwrap());
        session.retract(3).unwrap();
        assert!(!session.arena().is_path_dirty(terminal).unwrap());
        assert!(session.fire_all_rules().unwrap().is_empty());

        session.insert(customer(4, 10)).unwrap();
        assert!(session.arena().is_path_dirty(terminal).unwrap());
        let fired = session.fire_all_rules().unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].tuple, vec![1, 4]);

        // a new left fact is stored by the next evaluation and then joins
        session.insert(order(5, 99)).unwrap();
        assert!(session.fire_all_rules().unwrap().is_empty());
        assert_eq!(session.beta_memory(join).unwrap().left_len(), 2);
        session.insert(customer(6, 99)).unwrap();
        assert!(session.arena().is_path_dirty(terminal).unwrap());
        assert_eq!(session.fire_all_rules().unwrap()[0].tuple, vec![5, 6]);
    }

    #[test]
    fn test_not_node_ignores_blocks_for_other_customers() {
        let (mut session, _clock) = session();
        session
            .add_rule(
                RuleDefinition::new(1, "unblocked order", "Order")
                    .not("Block", vec![BetaConstraint::equal(0, "customer", "customer", ValueType::Integer)]),
            )
            .unwrap();
        session.insert(order(1, 10)).unwrap();
        session.insert(Fact::new(2, "Block", 0).with_field("customer", FactValue::Integer(20))).unwrap();
        assert_eq!(session.fire_all_rules().unwrap().len(), 1);

        let terminal = session.network().terminal(1).unwrap();
        session.insert(Fact::new(3, "Block", 0).with_field("customer", FactValue::Integer(30))).unwrap();
        assert!(!session.arena().is_path_dirty(terminal).unwrap());

        session.insert(Fact::new(4, "Block", 0).with_field("customer", FactValue::Integer(10))).unwrap();
        assert!(session.arena().is_path_dirty(terminal).unwrap());
        assert!(session.fire_all_rules().unwrap().is_empty());
        session.retract(4).unwrap();
        assert_eq!(session.fire_all_rules().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_and_unknown_facts_are_rejected() {
        let (mut session, _clock) = session();
        session.insert(order(1, 10)).unwrap();
        assert_eq!(session.insert(order(1, 10)).unwrap_err().category(), "session");
        assert!(session.retract(5).is_err());
        assert!(session.expire_window(42).is_err());
    }
}
