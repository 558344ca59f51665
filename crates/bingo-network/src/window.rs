//! Sliding window behaviors
//!
//! A time window keeps event facts ordered by expiration time (`start + size`) and
//! holds at most one scheduled timer job, always targeting the earliest expiration.
//! The job only enqueues an expire action; the session then drives expiration
//! through [`SlidingTimeWindow::next_expired`] so that retracting the fact can call
//! back into the window while it is mid-expiration.
//!
//! ```text
//! empty ──insert──▶ populated, scheduled ──expire/retract last──▶ empty
//!                      │  ▲
//!                      └──┘ new head: swap the job
//! ```
//!
//! A length window keeps the most recent `size` events and evicts the oldest one
//! on overflow. It never schedules jobs.

use crate::action_queue::{Action, ActionSender};
use crate::error::NetworkResult;
use crate::timer::{JobHandle, TimerJob, TimerService};
use crate::types::{FactId, Timestamp, WindowId};
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, instrument, trace};

/// Services a window needs to (re)schedule its expiration
pub struct WindowServices<'a> {
    pub timer: &'a mut dyn TimerService,
    pub sender: &'a ActionSender,
}

/// Queue and scheduling state of a time window
#[derive(Debug, Default, Clone)]
pub struct WindowContext {
    queue: BTreeSet<(Timestamp, FactId)>,
    expirations: HashMap<FactId, Timestamp>,
    /// Fact currently being expired; retracting it again is a no-op
    expiring_handle: Option<FactId>,
    job_handle: Option<JobHandle>,
}

impl WindowContext {
    fn add(&mut self, fact_id: FactId, expires_at: Timestamp) {
        self.queue.insert((expires_at, fact_id));
        self.expirations.insert(fact_id, expires_at);
    }

    fn remove(&mut self, fact_id: FactId) -> bool {
        match self.expirations.remove(&fact_id) {
            Some(expires_at) => self.queue.remove(&(expires_at, fact_id)),
            None => false,
        }
    }

    fn peek(&self) -> Option<(Timestamp, FactId)> {
        self.queue.first().copied()
    }

    fn poll(&mut self) -> Option<(Timestamp, FactId)> {
        let head = self.queue.pop_first()?;
        self.expirations.remove(&head.1);
        Some(head)
    }
}

/// Window over the last `size` milliseconds of events
#[derive(Debug, Clone)]
pub struct SlidingTimeWindow {
    id: WindowId,
    size: Timestamp,
    context: WindowContext,
}

impl SlidingTimeWindow {
    pub fn new(id: WindowId, size: Timestamp) -> Self {
        Self { id, size, context: WindowContext::default() }
    }

    pub fn id(&self) -> WindowId {
        self.id
    }

    pub fn size(&self) -> Timestamp {
        self.size
    }

    pub fn expiration_offset(&self) -> Option<Timestamp> {
        Some(self.size)
    }

    /// Expiration time of an event starting at `start`; saturates at the end of time
    pub fn expires_at(&self, start: Timestamp) -> Timestamp {
        start.saturating_add(self.size)
    }

    /// Inclusive boundary: an event is expired at exactly `start + size`
    pub fn is_expired(&self, now: Timestamp, start: Timestamp) -> bool {
        self.expires_at(start) <= now
    }

    /// Add an event; returns false when it is already expired and was not added
    pub fn assert_fact(&mut self, fact_id: FactId, start: Timestamp, services: &mut WindowServices<'_>) -> NetworkResult<bool> {
        let now = services.timer.current_time();
        if self.is_expired(now, start) {
            trace!(window = self.id, fact_id, start, now, "Rejected expired event");
            return Ok(false);
        }

        let expires_at = self.expires_at(start);
        self.context.add(fact_id, expires_at);
        if self.context.peek() == Some((expires_at, fact_id)) {
            if let Err(e) = self.update_next_expiration(services) {
                self.context.remove(fact_id);
                return Err(e);
            }
        }
        Ok(true)
    }

    /// Remove an event that left the working memory by other means
    pub fn retract_fact(&mut self, fact_id: FactId, services: &mut WindowServices<'_>) -> NetworkResult<bool> {
        if self.context.expiring_handle == Some(fact_id) {
            return Ok(false);
        }
        let Some(&expires_at) = self.context.expirations.get(&fact_id) else {
            return Ok(false);
        };

        if self.context.peek() == Some((expires_at, fact_id)) {
            self.context.poll();
            self.update_next_expiration(services)?;
        } else {
            self.context.remove(fact_id);
        }
        Ok(true)
    }

    /// Pop the head if it is expired at `now` and mark it as mid-expiration.
    /// Call [`Self::finish_expiring`] once the fact has been retracted.
    pub fn next_expired(&mut self, now: Timestamp) -> Option<FactId> {
        let (expires_at, fact_id) = self.context.peek()?;
        if expires_at > now {
            return None;
        }
        self.context.expiring_handle = Some(fact_id);
        self.context.poll();
        Some(fact_id)
    }

    pub fn finish_expiring(&mut self) {
        self.context.expiring_handle = None;
    }

    /// Expire every due event, handing each to `retract`, then reschedule
    #[instrument(skip(self, services, retract), fields(window = self.id))]
    pub fn expire_facts<F>(&mut self, services: &mut WindowServices<'_>, mut retract: F) -> NetworkResult<Vec<FactId>>
    where
        F: FnMut(FactId) -> NetworkResult<()>,
    {
        let now = services.timer.current_time();
        let mut expired = Vec::new();
        while let Some(fact_id) = self.next_expired(now) {
            let result = retract(fact_id);
            self.finish_expiring();
            result?;
            expired.push(fact_id);
        }
        self.update_next_expiration(services)?;
        if !expired.is_empty() {
            debug!(window = self.id, count = expired.len(), "Expired window events");
        }
        Ok(expired)
    }

    /// Point the timer at the current head. A head already in the past is expired
    /// through an immediate action instead of a job; an empty window keeps no job.
    pub fn update_next_expiration(&mut self, services: &mut WindowServices<'_>) -> NetworkResult<()> {
        let Some((next, _)) = self.context.peek() else {
            self.cancel_job(services);
            return Ok(());
        };
        if next < services.timer.current_time() {
            services.sender.enqueue(Action::ExpireWindow(self.id))?;
            self.cancel_job(services);
            return Ok(());
        }

        // the replacement is placed first so a failure leaves the old job intact
        let handle = services.timer.schedule_job(TimerJob::new(self.id, services.sender.clone()), next)?;
        if let Some(old) = self.context.job_handle.replace(handle) {
            services.timer.remove_job(old);
        }
        trace!(window = self.id, fires_at = next, handle = handle.0, "Scheduled window expiration");
        Ok(())
    }

    fn cancel_job(&mut self, services: &mut WindowServices<'_>) {
        if let Some(handle) = self.context.job_handle.take() {
            // a job that already fired is gone from the timer
            services.timer.remove_job(handle);
        }
    }

    pub fn job_handle(&self) -> Option<JobHandle> {
        self.context.job_handle
    }

    pub fn expiring_handle(&self) -> Option<FactId> {
        self.context.expiring_handle
    }

    pub fn next_expiration(&self) -> Option<Timestamp> {
        self.context.peek().map(|(at, _)| at)
    }

    pub fn contains(&self, fact_id: FactId) -> bool {
        self.context.expirations.contains_key(&fact_id)
    }

    pub fn len(&self) -> usize {
        self.context.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.context.queue.is_empty()
    }

    /// Events in expiration order
    pub fn facts(&self) -> Vec<FactId> {
        self.context.queue.iter().map(|(_, id)| *id).collect()
    }
}

/// Window over the last `size` events
#[derive(Debug, Clone)]
pub struct SlidingLengthWindow {
    id: WindowId,
    size: usize,
    buffer: VecDeque<FactId>,
}

impl SlidingLengthWindow {
    pub fn new(id: WindowId, size: usize) -> Self {
        Self { id, size, buffer: VecDeque::with_capacity(size) }
    }

    pub fn id(&self) -> WindowId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Length windows do not expire by time
    pub fn expiration_offset(&self) -> Option<Timestamp> {
        None
    }

    /// Add an event; returns the event pushed out by it, which may be the event itself
    /// for a zero-length window
    pub fn assert_fact(&mut self, fact_id: FactId) -> Option<FactId> {
        if self.size == 0 {
            return Some(fact_id);
        }
        self.buffer.push_back(fact_id);
        if self.buffer.len() > self.size {
            let evicted = self.buffer.pop_front();
            trace!(window = self.id, evicted = ?evicted, "Length window overflow");
            return evicted;
        }
        None
    }

    pub fn retract_fact(&mut self, fact_id: FactId) -> bool {
        match self.buffer.iter().position(|&id| id == fact_id) {
            Some(pos) => self.buffer.remove(pos).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, fact_id: FactId) -> bool {
        self.buffer.contains(&fact_id)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Events oldest first
    pub fn facts(&self) -> Vec<FactId> {
        self.buffer.iter().copied().collect()
    }
}

/// A window declared on an object type
#[derive(Debug, Clone)]
pub enum WindowBehavior {
    Time(SlidingTimeWindow),
    Length(SlidingLengthWindow),
}

impl WindowBehavior {
    pub fn id(&self) -> WindowId {
        match self {
            WindowBehavior::Time(w) => w.id(),
            WindowBehavior::Length(w) => w.id(),
        }
    }

    pub fn expiration_offset(&self) -> Option<Timestamp> {
        match self {
            WindowBehavior::Time(w) => w.expiration_offset(),
            WindowBehavior::Length(w) => w.expiration_offset(),
        }
    }

    pub fn contains(&self, fact_id: FactId) -> bool {
        match self {
            WindowBehavior::Time(w) => w.contains(fact_id),
            WindowBehavior::Length(w) => w.contains(fact_id),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            WindowBehavior::Time(w) => w.len(),
            WindowBehavior::Length(w) => w.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
