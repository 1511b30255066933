use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use pushbuild_core::models::{RunLog, TimeStamp};
use tokio::task::JoinHandle;

/// A job body started by the [`Scheduler`].
#[async_trait]
pub trait Job: Send + Sync + 'static {
    async fn run(&self, log: &RunLog, timestamp: TimeStamp) -> Result<()>;
}

/// Resolves once the run started by a trigger, and every rerun coalesced into
/// it, has finished. A failing run resolves it with that failure and halts the
/// scheduler.
pub type RunHandle = JoinHandle<Result<()>>;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
struct SchedulerState {
    running: bool,
    /// Only ever set while `running` is.
    rerun_requested: bool,
    /// Set once a run fails or panics. Never cleared; the process is on its
    /// way out.
    halted: bool,
}

impl SchedulerState {
    const HALTED: Self = Self { running: false, rerun_requested: false, halted: true };
}

/// Single-flight wrapper around a [`Job`].
///
/// At most one run of the job executes at any time. Triggers arriving while a
/// run is in flight collapse into a single rerun, started with the log and
/// timestamp of the in-flight run as soon as it finishes. The rerun repeats for
/// as long as new triggers keep arriving during each run.
///
/// After a failed run the scheduler starts nothing further, so no job can
/// overlap the escalation of that failure.
#[derive(Clone)]
pub struct Scheduler {
    job: Arc<dyn Job>,
    state: Arc<Mutex<SchedulerState>>,
}

impl Scheduler {
    pub fn new(job: Arc<dyn Job>) -> Self {
        Self { job, state: Arc::new(Mutex::new(SchedulerState::default())) }
    }

    /// Start a run, or request a rerun if one is already in flight.
    ///
    /// Never waits. Returns `None` when the trigger was coalesced into the
    /// in-flight run or the scheduler is halted; the caller's log records that
    /// nothing new was started. Must be called from within a Tokio runtime.
    pub fn trigger(&self, log: &RunLog, timestamp: TimeStamp) -> Option<RunHandle> {
        let mut state = lock(&self.state);
        if state.halted {
            log.info(format!("A previous run failed, not starting a run for event {timestamp}"));
            return None;
        }
        if state.running {
            state.rerun_requested = true;
            log.info(format!("Job already running, event {timestamp} queued as a rerun"));
            return None;
        }
        state.running = true;
        drop(state);
        Some(tokio::spawn(run_loop(self.job.clone(), self.state.clone(), log.clone(), timestamp)))
    }

    #[cfg(test)]
    fn state(&self) -> SchedulerState { *lock(&self.state) }
}

fn lock(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Halts the scheduler if a run fails or panics.
struct HaltOnDrop<'a> {
    state: &'a Mutex<SchedulerState>,
    armed: bool,
}

impl Drop for HaltOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            *lock(self.state) = SchedulerState::HALTED;
        }
    }
}

async fn run_loop(
    job: Arc<dyn Job>,
    state: Arc<Mutex<SchedulerState>>,
    log: RunLog,
    timestamp: TimeStamp,
) -> Result<()> {
    let mut guard = HaltOnDrop { state: &state, armed: true };
    let mut run = 1;
    loop {
        tracing::info!("Starting job run {} for event {}", run, timestamp);
        job.run(&log, timestamp).await?;
        // Checking the flag and going idle must happen in one critical section,
        // otherwise a trigger landing in between would be lost.
        let rerun = {
            let mut current = lock(&state);
            if current.rerun_requested {
                current.rerun_requested = false;
                true
            } else {
                current.running = false;
                false
            }
        };
        if !rerun {
            guard.armed = false;
            tracing::info!("Job for event {} finished after {} run(s)", timestamp, run);
            return Ok(());
        }
        run += 1;
        log.info("Pushes arrived during the run, running again");
    }
}
