use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::ThreadPoolConfig;

/// Work handed to the pool. `rejected` runs instead of `run` when no
/// thread could take the task.
pub trait PooledTask: Send + 'static {
    fn run(self: Box<Self>);

    fn rejected(self: Box<Self>, _reason: &PoolError) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    pub min_threads: usize,
    pub max_threads: usize,
    pub keep_alive: Duration,
}

impl From<&ThreadPoolConfig> for PoolSettings {
    fn from(config: &ThreadPoolConfig) -> Self {
        Self {
            min_threads: config.min_threads,
            max_threads: config.max_threads.max(1),
            keep_alive: config.keep_alive(),
        }
    }
}

#[derive(Debug)]
pub enum PoolError {
    Saturated { max_threads: usize },
    ShutDown,
    Spawn(io::Error),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Saturated { max_threads } => {
                write!(f, "all {max_threads} worker threads are busy")
            }
            Self::ShutDown => write!(f, "worker thread pool is shut down"),
            Self::Spawn(source) => write!(f, "failed to spawn worker thread: {source}"),
        }
    }
}

impl std::error::Error for PoolError {}

struct PoolState {
    live: usize,
    idle: usize,
    handoff: Option<Box<dyn PooledTask>>,
    shutdown: bool,
}

struct PoolShared {
    settings: PoolSettings,
    thread_prefix: String,
    spawned: AtomicUsize,
    state: Mutex<PoolState>,
    task_ready: Condvar,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Thread pool with direct handoff: a task goes to an idle thread or to a
/// new one, never into a queue. Threads above `min_threads` exit after
/// `keep_alive` without work; core threads never expire.
///
/// Threads are reused across tasks, so they are named `{prefix}-{n}` once
/// and tasks identify themselves in their own log lines.
pub struct WorkerThreadPool {
    shared: Arc<PoolShared>,
}

impl WorkerThreadPool {
    pub fn new(settings: PoolSettings, thread_prefix: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                settings,
                thread_prefix: thread_prefix.into(),
                spawned: AtomicUsize::new(0),
                state: Mutex::new(PoolState {
                    live: 0,
                    idle: 0,
                    handoff: None,
                    shutdown: false,
                }),
                task_ready: Condvar::new(),
            }),
        }
    }

    /// Live threads, busy or idle.
    pub fn live_threads(&self) -> usize {
        self.shared.lock().live
    }

    pub fn idle_threads(&self) -> usize {
        self.shared.lock().idle
    }

    /// Starts `task` on a pooled thread. On failure the task's `rejected`
    /// hook has already run.
    pub fn submit(&self, task: Box<dyn PooledTask>) -> Result<(), PoolError> {
        let mut state = self.shared.lock();

        if state.shutdown {
            drop(state);
            return Err(reject(task, PoolError::ShutDown));
        }

        if state.idle > 0 && state.handoff.is_none() {
            state.idle -= 1;
            state.handoff = Some(task);
            self.shared.task_ready.notify_one();
            return Ok(());
        }

        if state.live >= self.shared.settings.max_threads {
            let max_threads = self.shared.settings.max_threads;
            drop(state);
            return Err(reject(task, PoolError::Saturated { max_threads }));
        }

        state.live += 1;
        drop(state);

        // Shared slot so the task survives a failed spawn.
        let first_task = Arc::new(Mutex::new(Some(task)));
        let thread_task = Arc::clone(&first_task);
        let shared = Arc::clone(&self.shared);
        let thread_name = format!(
            "{}-{}",
            self.shared.thread_prefix,
            self.shared.spawned.fetch_add(1, Ordering::Relaxed) + 1
        );
        let spawned = thread::Builder::new().name(thread_name).spawn(move || {
            let task = thread_task
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(task) = task {
                worker_loop(shared, task);
            }
        });

        match spawned {
            Ok(_) => Ok(()),
            Err(source) => {
                self.shared.lock().live -= 1;
                let task = first_task
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                let error = PoolError::Spawn(source);
                if let Some(task) = task {
                    task.rejected(&error);
                }
                Err(error)
            }
        }
    }

    /// Rejects further submissions and lets idle threads exit. Running
    /// tasks are not interrupted.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        state.shutdown = true;
        self.shared.task_ready.notify_all();
    }
}

impl Drop for WorkerThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reject(task: Box<dyn PooledTask>, error: PoolError) -> PoolError {
    task.rejected(&error);
    error
}

fn worker_loop(shared: Arc<PoolShared>, first: Box<dyn PooledTask>) {
    let mut next = Some(first);

    while let Some(task) = next.take() {
        // Tasks contain their own panics; this keeps the accounting intact
        // if one slips through.
        let _ = panic::catch_unwind(AssertUnwindSafe(|| task.run()));
        next = wait_for_handoff(&shared);
    }
}

fn wait_for_handoff(shared: &PoolShared) -> Option<Box<dyn PooledTask>> {
    let mut state = shared.lock();
    state.idle += 1;
    let idle_since = Instant::now();

    loop {
        if let Some(task) = state.handoff.take() {
            return Some(task);
        }
        if state.shutdown {
            state.idle -= 1;
            state.live -= 1;
            return None;
        }

        if state.live <= shared.settings.min_threads {
            state = shared
                .task_ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            continue;
        }

        let remaining = shared.settings.keep_alive.saturating_sub(idle_since.elapsed());
        if remaining.is_zero() {
            state.idle -= 1;
            state.live -= 1;
            return None;
        }
        state = shared
            .task_ready
            .wait_timeout(state, remaining)
            .map(|(guard, _)| guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner().0);
    }
}
