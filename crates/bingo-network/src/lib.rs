#![allow(missing_docs)]
//! Incremental join network core for the Bingo rules engine.
//!
//! This crate keeps the matching state of a rule session up to date as facts come
//! and go: join memories indexed per beta node, segment and path memories that link
//! rules lazily through bitmasks, an agenda ordered by salience and activation
//! number, and sliding windows whose expiration re-enters the session through a
//! single-writer action queue.

use tracing::{debug, instrument};

/// Single-writer action queue shared with timer threads
pub mod action_queue;
/// Pending activations and firing
pub mod agenda;
/// Network configuration and property loading
pub mod config;
/// Firing order of activations
pub mod conflict_resolution;
/// Beta constraints, extractors and field indexes
pub mod constraint;
/// Error types
pub mod error;
/// Read-only evaluation of rule paths
pub mod evaluation;
/// Node arena of the join network
pub mod graph;
/// Choice of indexed constraints per beta node
pub mod index_selector;
/// Hash, range and list memories of beta nodes
pub mod join_memory;
/// Segment and path memories and the linking protocol
pub mod linking;
/// Rule compilation, node sharing and rule removal
pub mod network;
/// Segment boundaries, prototypes and path specs
pub mod segment;
/// Evaluation session
pub mod session;
/// Timer services
pub mod timer;
/// Facts, tuples and identifiers
pub mod types;
/// Sliding time and length windows
pub mod window;

pub use action_queue::{Action, ActionQueue, ActionSender};
pub use agenda::{Agenda, RuleExecution};
pub use config::{IndexPrecedence, MAX_COMPOSITE_KEY_DEPTH, NetworkConfig};
pub use conflict_resolution::{Activation, DepthConflictResolver};
pub use constraint::{BetaConstraint, ConstraintOperator, FieldExtractor, FieldIndex, TupleExtractor};
pub use error::{ErrorSeverity, NetworkError, NetworkResult};
pub use graph::{BetaNodeSpec, NetworkGraph, NodeKind, RightInput};
pub use index_selector::{IndexKind, IndexSelection, IndexSpec, select_indexes};
pub use join_memory::{BetaMemory, build_join_memory};
pub use linking::{LinkEvent, LinkingArena, PathKind, PathMemory, SegmentMemory};
pub use network::{Condition, NetworkChange, Pattern, ReteNetwork, RuleDefinition};
pub use segment::{PathMemSpec, SegmentBuilder, SegmentPrototype, build_segment, next_node_pos_mask};
pub use session::EvaluationSession;
pub use timer::{JobHandle, PseudoClockScheduler, RealtimeTimerService, TimerJob, TimerService};
pub use types::{Fact, FactData, FactId, NodeId, NodeType, PropagationType, RuleId, Timestamp, Tuple};
pub use window::{SlidingLengthWindow, SlidingTimeWindow, WindowBehavior, WindowServices};

pub use bingo_types::{FactValue, ValueType};

/// Initialize the network core
#[instrument]
pub fn init() -> anyhow::Result<()> {
    debug!("Initializing Bingo network core");
    Ok(())
}
