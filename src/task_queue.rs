//! Worker-thread task queue shared by every processing node.
//!
//! Tasks are single-shot closures appended to a FIFO. Workers are spawned
//! lazily, one per submission that finds no idle worker, up to
//! `max_workers`. Each worker waits on a condition variable with a bounded
//! timeout so a stop request is always observed.
//!
//! # Failure isolation
//!
//! A panicking task is caught at the worker boundary, logged and counted.
//! The worker thread survives and picks up the next task.
//!
//! # Backpressure
//!
//! `submit` never blocks. When `max_pending` is set, submissions beyond that
//! many queued tasks are rejected with [`TaskQueueError::Full`].

use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// An owned, single-shot unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Default worker cap
pub const DEFAULT_MAX_WORKERS: usize = 2;

/// Default bounded wait between stop-flag checks
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(50);

/// Default bound on queued (not yet running) tasks
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Errors returned by [`TaskQueue::submit`].
#[derive(Error, Debug)]
pub enum TaskQueueError {
    #[error("Task queue '{0}' is shutting down")]
    ShuttingDown(String),

    #[error("Task queue full ({capacity} tasks pending)")]
    Full { capacity: usize },

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Sizing and timing of a [`TaskQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskQueueConfig {
    /// Upper bound on live worker threads (at least 1).
    pub max_workers: usize,
    /// How long an idle worker sleeps before re-checking the stop flag.
    pub idle_wait: Duration,
    /// Reject submissions once this many tasks are queued. `None` = unbounded.
    pub max_pending: Option<usize>,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            idle_wait: DEFAULT_IDLE_WAIT,
            max_pending: Some(DEFAULT_MAX_PENDING),
        }
    }
}

/// Counters describing queue activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskQueueStats {
    pub submitted: u64,
    pub completed: u64,
    pub panicked: u64,
    pub rejected: u64,
    pub live_workers: usize,
    pub pending: usize,
}

struct QueueState {
    tasks: VecDeque<Task>,
    live_workers: usize,
    idle_workers: usize,
    running_tasks: usize,
    stopping: bool,
    handles: Vec<JoinHandle<()>>,
    next_worker: usize,
}

struct Shared {
    name: String,
    config: TaskQueueConfig,
    state: Mutex<QueueState>,
    work_ready: Condvar,
    idle: Condvar,
    submitted: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
    rejected: AtomicU64,
}

impl Shared {
    // Tasks never run under this lock, so a poisoned guard still holds
    // consistent queue state.
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_task(&self, task: Task) {
        match catch_unwind(AssertUnwindSafe(task)) {
            Ok(()) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                self.panicked.fetch_add(1, Ordering::Relaxed);
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic payload>".to_string());
                tracing::error!("Task queue '{}': task panicked: {}", self.name, message);
            }
        }
    }
}

/// Bounded pool of worker threads consuming a FIFO of tasks.
pub struct TaskQueue {
    shared: Arc<Shared>,
}

impl TaskQueue {
    /// Create a queue. No thread is spawned until the first submission.
    pub fn new(name: impl Into<String>, mut config: TaskQueueConfig) -> Self {
        let name = name.into();
        if config.max_workers == 0 {
            tracing::warn!("Task queue '{}': max_workers = 0, using 1", name);
            config.max_workers = 1;
        }
        Self {
            shared: Arc::new(Shared {
                name,
                config,
                state: Mutex::new(QueueState {
                    tasks: VecDeque::new(),
                    live_workers: 0,
                    idle_workers: 0,
                    running_tasks: 0,
                    stopping: false,
                    handles: Vec::new(),
                    next_worker: 0,
                }),
                work_ready: Condvar::new(),
                idle: Condvar::new(),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                panicked: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.shared.config
    }

    /// Queue a task. Never blocks the caller.
    pub fn submit<F>(&self, task: F) -> Result<(), TaskQueueError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock_state();

        if state.stopping {
            self.shared.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(TaskQueueError::ShuttingDown(self.shared.name.clone()));
        }

        if let Some(capacity) = self.shared.config.max_pending {
            if state.tasks.len() >= capacity {
                self.shared.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Task queue '{}' rejected task: {} pending",
                    self.shared.name,
                    capacity
                );
                return Err(TaskQueueError::Full { capacity });
            }
        }

        state.tasks.push_back(Box::new(task));
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);

        let waiting = state.tasks.len();
        if waiting > state.idle_workers && state.live_workers < self.shared.config.max_workers {
            if let Err(e) = self.spawn_worker(&mut state) {
                if state.live_workers == 0 {
                    // Nobody would ever run it.
                    state.tasks.pop_back();
                    self.shared.submitted.fetch_sub(1, Ordering::Relaxed);
                    return Err(TaskQueueError::Spawn(e));
                }
                tracing::warn!(
                    "Task queue '{}' could not grow past {} workers: {}",
                    self.shared.name,
                    state.live_workers,
                    e
                );
            }
        }

        drop(state);
        self.shared.work_ready.notify_one();
        Ok(())
    }

    fn spawn_worker(&self, state: &mut QueueState) -> std::io::Result<()> {
        let index = state.next_worker;
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("{}-worker-{}", self.shared.name, index))
            .spawn(move || worker_loop(shared))?;
        state.next_worker += 1;
        state.live_workers += 1;
        state.handles.push(handle);
        tracing::debug!(
            "Task queue '{}' spawned worker {} ({} live)",
            self.shared.name,
            index,
            state.live_workers
        );
        Ok(())
    }

    /// Block until nothing is queued or running, or until `timeout` passes.
    /// Returns `true` if the queue went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock_state();
        while !(state.tasks.is_empty() && state.running_tasks == 0) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .shared
                .idle
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        true
    }

    /// Stop accepting tasks, let workers finish what is queued, and join them.
    pub fn shutdown(&self) {
        let handles = {
            let mut state = self.shared.lock_state();
            if !state.stopping {
                tracing::info!(
                    "Task queue '{}' shutting down ({} pending, {} workers)",
                    self.shared.name,
                    state.tasks.len(),
                    state.live_workers
                );
            }
            state.stopping = true;
            std::mem::take(&mut state.handles)
        };
        self.shared.work_ready.notify_all();

        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                tracing::warn!(
                    "Task queue '{}' shut down from its own worker; not joining it",
                    self.shared.name
                );
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("Task queue '{}': worker exited abnormally", self.shared.name);
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.lock_state().stopping
    }

    pub fn stats(&self) -> TaskQueueStats {
        let state = self.shared.lock_state();
        TaskQueueStats {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
            rejected: self.shared.rejected.load(Ordering::Relaxed),
            live_workers: state.live_workers,
            pending: state.tasks.len(),
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    tracing::trace!("Task queue '{}' worker started", shared.name);
    let idle_wait = shared.config.idle_wait;
    let mut state = shared.lock_state();

    loop {
        if let Some(task) = state.tasks.pop_front() {
            state.running_tasks += 1;
            drop(state);

            shared.run_task(task);

            state = shared.lock_state();
            state.running_tasks -= 1;
            if state.tasks.is_empty() && state.running_tasks == 0 {
                shared.idle.notify_all();
            }
            continue;
        }

        if state.stopping {
            break;
        }

        state.idle_workers += 1;
        let (guard, _) = shared
            .work_ready
            .wait_timeout(state, idle_wait)
            .unwrap_or_else(PoisonError::into_inner);
        state = guard;
        state.idle_workers -= 1;
    }

    state.live_workers -= 1;
    drop(state);
    tracing::trace!("Task queue '{}' worker exiting", shared.name);
}
