//! Timer services
//!
//! Windows schedule their next expiration through a [`TimerService`]. A fired job
//! never touches session state: it only enqueues an [`Action::ExpireWindow`] on the
//! session's action queue, which the owning thread drains in arrival order.
//!
//! - [`PseudoClockScheduler`]: manually advanced clock, fires due jobs in timestamp
//!   order on the calling thread. Clones share the same clock.
//! - [`RealtimeTimerService`]: wall clock with a scheduler thread fed through a
//!   command channel.

use crate::action_queue::{Action, ActionSender};
use crate::error::{NetworkError, NetworkResult};
use crate::types::{Timestamp, WindowId};
use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Handle of a scheduled job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle(pub u64);

/// Job that asks the session to expire a window
#[derive(Debug, Clone)]
pub struct TimerJob {
    window: WindowId,
    sender: ActionSender,
}

impl TimerJob {
    pub fn new(window: WindowId, sender: ActionSender) -> Self {
        Self { window, sender }
    }

    pub fn window(&self) -> WindowId {
        self.window
    }

    /// Enqueue the expire action; runs on whichever thread fires the job
    pub fn execute(&self) -> NetworkResult<()> {
        trace!(window = self.window, "Timer job fired");
        self.sender.enqueue(Action::ExpireWindow(self.window))
    }
}

/// Clock and job scheduling used by windows
pub trait TimerService: Send {
    fn current_time(&self) -> Timestamp;

    fn schedule_job(&mut self, job: TimerJob, fires_at: Timestamp) -> NetworkResult<JobHandle>;

    /// Returns whether the job was still pending
    fn remove_job(&mut self, handle: JobHandle) -> bool;

    fn pending_jobs(&self) -> usize;
}

#[derive(Debug, Default)]
struct PseudoClockState {
    now: Timestamp,
    next_handle: u64,
    jobs: BTreeMap<(Timestamp, JobHandle), TimerJob>,
    fire_times: HashMap<JobHandle, Timestamp>,
}

/// Deterministic clock for tests and simulations
#[derive(Debug, Clone, Default)]
pub struct PseudoClockScheduler {
    state: Arc<Mutex<PseudoClockState>>,
}

impl PseudoClockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(now: Timestamp) -> Self {
        let scheduler = Self::default();
        scheduler.lock().now = now;
        scheduler
    }

    fn lock(&self) -> MutexGuard<'_, PseudoClockState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Move the clock forward and fire due jobs in timestamp order
    pub fn advance_time(&self, delta: Timestamp) -> NetworkResult<usize> {
        let target = self.lock().now.saturating_add(delta);
        self.set_time(target)
    }

    /// Move the clock to `now` and fire due jobs; returns how many fired
    pub fn set_time(&self, now: Timestamp) -> NetworkResult<usize> {
        let mut fired = 0;
        loop {
            let due = {
                let mut state = self.lock();
                let next = state.jobs.keys().next().copied();
                match next {
                    Some((fires_at, handle)) if fires_at <= now => {
                        state.now = state.now.max(fires_at);
                        state.fire_times.remove(&handle);
                        state.jobs.remove(&(fires_at, handle))
                    }
                    _ => {
                        state.now = now;
                        None
                    }
                }
            };
            match due {
                Some(job) => {
                    job.execute()?;
                    fired += 1;
                }
                None => break,
            }
        }
        Ok(fired)
    }

    /// Fire times of pending jobs, earliest first
    pub fn scheduled_times(&self) -> Vec<Timestamp> {
        self.lock().jobs.keys().map(|(at, _)| *at).collect()
    }
}

impl TimerService for PseudoClockScheduler {
    fn current_time(&self) -> Timestamp {
        self.lock().now
    }

    fn schedule_job(&mut self, job: TimerJob, fires_at: Timestamp) -> NetworkResult<JobHandle> {
        let mut state = self.lock();
        state.next_handle += 1;
        let handle = JobHandle(state.next_handle);
        state.jobs.insert((fires_at, handle), job);
        state.fire_times.insert(handle, fires_at);
        trace!(handle = handle.0, fires_at, "Scheduled pseudo clock job");
        Ok(handle)
    }

    fn remove_job(&mut self, handle: JobHandle) -> bool {
        let mut state = self.lock();
        match state.fire_times.remove(&handle) {
            Some(fires_at) => state.jobs.remove(&(fires_at, handle)).is_some(),
            None => false,
        }
    }

    fn pending_jobs(&self) -> usize {
        self.lock().jobs.len()
    }
}

enum TimerCommand {
    Schedule { handle: JobHandle, fires_at: Timestamp, job: TimerJob },
    Remove(JobHandle),
    Shutdown,
}

/// Wall clock service backed by a scheduler thread
pub struct RealtimeTimerService {
    commands: Option<Sender<TimerCommand>>,
    worker: Option<JoinHandle<()>>,
    next_handle: AtomicU64,
    pending: Arc<Mutex<HashMap<JobHandle, Timestamp>>>,
}

/// Longest sleep of the scheduler thread between checks
const IDLE_WAIT: Duration = Duration::from_secs(3600);

impl RealtimeTimerService {
    pub fn start() -> NetworkResult<Self> {
        let (sender, receiver) = unbounded::<TimerCommand>();
        let pending: Arc<Mutex<HashMap<JobHandle, Timestamp>>> = Arc::new(Mutex::new(HashMap::new()));
        let worker_pending = Arc::clone(&pending);

        let worker = std::thread::Builder::new()
            .name("bingo-timer".to_string())
            .spawn(move || {
                let mut jobs: BTreeMap<(Timestamp, JobHandle), TimerJob> = BTreeMap::new();
                loop {
                    let now = wall_clock_millis();
                    loop {
                        let Some((fires_at, handle)) = jobs.keys().next().copied() else {
                            break;
                        };
                        if fires_at > now {
                            break;
                        }
                        if let Some(job) = jobs.remove(&(fires_at, handle)) {
                            lock_pending(&worker_pending).remove(&handle);
                            if let Err(e) = job.execute() {
                                warn!(error = %e, window = job.window(), "Dropping timer job for closed session");
                            }
                        }
                    }
                    let wait = jobs
                        .keys()
                        .next()
                        .map(|(fires_at, _)| Duration::from_millis(fires_at.saturating_sub(now).max(0) as u64))
                        .map_or(IDLE_WAIT, |wait| wait.min(IDLE_WAIT));
                    match receiver.recv_timeout(wait) {
                        Ok(TimerCommand::Schedule { handle, fires_at, job }) => {
                            jobs.insert((fires_at, handle), job);
                        }
                        Ok(TimerCommand::Remove(handle)) => {
                            jobs.retain(|(_, h), _| *h != handle);
                        }
                        Ok(TimerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                }
                debug!("Timer thread stopped");
            })
            .map_err(|e| NetworkError::scheduling(format!("failed to start timer thread: {e}")))?;

        Ok(Self { commands: Some(sender), worker: Some(worker), next_handle: AtomicU64::new(1), pending })
    }

    /// Stop the scheduler thread; later scheduling fails
    pub fn shutdown(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(TimerCommand::Shutdown);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Timer thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.commands.is_some()
    }
}

fn wall_clock_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

fn lock_pending(pending: &Mutex<HashMap<JobHandle, Timestamp>>) -> MutexGuard<'_, HashMap<JobHandle, Timestamp>> {
    pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl TimerService for RealtimeTimerService {
    fn current_time(&self) -> Timestamp {
        wall_clock_millis()
    }

    fn schedule_job(&mut self, job: TimerJob, fires_at: Timestamp) -> NetworkResult<JobHandle> {
        let handle = JobHandle(self.next_handle.fetch_add(1, AtomicOrdering::Relaxed));
        let Some(commands) = &self.commands else {
            return Err(NetworkError::scheduling_job(
                handle.0,
                fires_at.max(0) as u64,
                "timer service has been shut down",
            ));
        };
        lock_pending(&self.pending).insert(handle, fires_at);
        if commands.send(TimerCommand::Schedule { handle, fires_at, job }).is_err() {
            lock_pending(&self.pending).remove(&handle);
            return Err(NetworkError::scheduling_job(handle.0, fires_at.max(0) as u64, "timer thread is gone"));
        }
        Ok(handle)
    }

    fn remove_job(&mut self, handle: JobHandle) -> bool {
        let was_pending = lock_pending(&self.pending).remove(&handle).is_some();
        if let Some(commands) = &self.commands {
            let _ = commands.send(TimerCommand::Remove(handle));
        }
        was_pending
    }

    fn pending_jobs(&self) -> usize {
        lock_pending(&self.pending).len()
    }
}

impl Drop for RealtimeTimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_queue::ActionQueue;

    #[test]
    fn test_pseudo_clock_fires_due_jobs_in_order() {
        let queue = ActionQueue::new();
        let mut clock = PseudoClockScheduler::new();
        clock.schedule_job(TimerJob::new(2, queue.sender()), 200).unwrap();
        clock.schedule_job(TimerJob::new(1, queue.sender()), 100).unwrap();
        let removed = clock.schedule_job(TimerJob::new(3, queue.sender()), 150).unwrap();
        assert!(clock.remove_job(removed));
        assert!(!clock.remove_job(removed));

        assert_eq!(clock.advance_time(99).unwrap(), 0);
        assert!(queue.is_empty());
        assert_eq!(clock.advance_time(150).unwrap(), 2);
        assert_eq!(clock.current_time(), 249);
        assert_eq!(queue.try_next(), Some(Action::ExpireWindow(1)));
        assert_eq!(queue.try_next(), Some(Action::ExpireWindow(2)));
    }

    #[test]
    fn test_clones_share_the_clock() {
        let clock = PseudoClockScheduler::starting_at(1_000);
        let other = clock.clone();
        clock.advance_time(5).unwrap();
        assert_eq!(other.current_time(), 1_005);
    }

    #[test]
    fn test_realtime_service_fires_and_shuts_down() {
        let queue = ActionQueue::new();
        let mut service = RealtimeTimerService::start().unwrap();
        let now = service.current_time();
        service.schedule_job(TimerJob::new(9, queue.sender()), now + 10).unwrap();

        let mut fired = None;
        for _ in 0..200 {
            fired = queue.try_next();
            if fired.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fired, Some(Action::ExpireWindow(9)));

        service.shutdown();
        assert!(!service.is_running());
        let err = service.schedule_job(TimerJob::new(9, queue.sender()), now).unwrap_err();
        assert_eq!(err.category(), "scheduling");
    }
}
