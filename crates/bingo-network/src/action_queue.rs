//! Single-writer action queue
//!
//! Every change to session state travels through this FIFO queue and is applied by
//! the thread that owns the session. Other threads, timer threads included, only
//! hold an [`ActionSender`].

use crate::error::{NetworkError, NetworkResult};
use crate::types::{Fact, FactId, WindowId};
use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};

/// A pending change to the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    Insert(Fact),
    Retract(FactId),
    Update(Fact),
    /// Expire due facts of a window
    ExpireWindow(WindowId),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Insert(_) => "insert",
            Action::Retract(_) => "retract",
            Action::Update(_) => "update",
            Action::ExpireWindow(_) => "expire_window",
        }
    }
}

/// Cloneable handle for enqueueing actions from any thread
#[derive(Debug, Clone)]
pub struct ActionSender {
    sender: Sender<Action>,
}

impl ActionSender {
    pub fn enqueue(&self, action: Action) -> NetworkResult<()> {
        self.sender
            .send(action)
            .map_err(|e| NetworkError::internal_component("action_queue", format!("session is gone: {e}")))
    }
}

/// FIFO queue drained by the owning session
#[derive(Debug)]
pub struct ActionQueue {
    sender: Sender<Action>,
    receiver: Receiver<Action>,
}

impl ActionQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    pub fn sender(&self) -> ActionSender {
        ActionSender { sender: self.sender.clone() }
    }

    pub fn enqueue(&self, action: Action) -> NetworkResult<()> {
        self.sender().enqueue(action)
    }

    /// Next action in arrival order, without blocking
    pub fn try_next(&self) -> Option<Action> {
        match self.receiver.try_recv() {
            Ok(action) => Some(action),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new()
    }
}
