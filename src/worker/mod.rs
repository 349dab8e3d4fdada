pub mod factory;
pub mod job;
pub mod pool;
pub mod queue;
pub mod router;

#[cfg(test)]
mod tests;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::bolt::{ConnectionFatality, ResponseMessage, ResponseWriter, Session, SessionSignals, Status};
use crate::config::WorkerConfig;
use crate::logging::{LogChannels, LogLevel};

pub use factory::{
    FactoryError, MemorySessionConnector, SessionConnector, ThreadNaming, WorkerFactory,
};
pub use job::Job;
pub use pool::PoolSettings;

use queue::{JobQueue, Poll, QueueError};
use router::MessageRouter;

const LOG_CONTEXT: &str = "bolt::worker";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerSettings {
    pub queue_capacity: usize,
    /// How long the worker waits for a job before running the idle check.
    pub idle_poll: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            idle_poll: config.idle_poll(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum WorkerError {
    QueueClosed { session: String },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueClosed { session } => {
                write!(f, "worker for session '{session}' no longer accepts jobs")
            }
        }
    }
}

impl std::error::Error for WorkerError {}

/// Why a worker loop ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    Halted,
    Fatal(ConnectionFatality),
}

/// Producer-side handle to a running worker. Cheap to clone.
#[derive(Clone)]
pub struct WorkerHandle {
    key: Arc<str>,
    queue: Arc<JobQueue<Job>>,
    keep_running: Arc<AtomicBool>,
    signals: Arc<dyn SessionSignals>,
}

impl WorkerHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Blocks while the worker's queue is full.
    pub fn enqueue(&self, job: impl Into<Job>) -> Result<(), WorkerError> {
        self.queue
            .enqueue(job.into())
            .map_err(|QueueError::Closed| WorkerError::QueueClosed {
                session: self.key.to_string(),
            })
    }

    /// Makes the session ignore queued requests up to the next `RESET`.
    pub fn interrupt(&self) {
        self.signals.interrupt();
    }

    /// Stops the worker after its current job. The session is closed by the
    /// worker thread itself.
    pub fn halt(&self) {
        self.signals.terminate();
        self.keep_running.store(false, Ordering::SeqCst);
        self.queue.close();
    }

    pub fn is_running(&self) -> bool {
        self.keep_running.load(Ordering::SeqCst)
    }

    pub fn queued_jobs(&self) -> usize {
        self.queue.pending()
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("key", &self.key)
            .field("running", &self.is_running())
            .field("queued_jobs", &self.queued_jobs())
            .finish()
    }
}

/// Executes one connection's jobs, one at a time, against its session.
pub struct SessionWorker<S: Session> {
    name: String,
    session: S,
    queue: Arc<JobQueue<Job>>,
    router: MessageRouter,
    writer: Arc<dyn ResponseWriter>,
    keep_running: Arc<AtomicBool>,
    idle_poll: Duration,
    logs: LogChannels,
}

impl<S: Session> SessionWorker<S> {
    pub fn new(
        name: impl Into<String>,
        session: S,
        writer: Arc<dyn ResponseWriter>,
        settings: &WorkerSettings,
        logs: LogChannels,
    ) -> (Self, WorkerHandle) {
        let queue = Arc::new(JobQueue::new(settings.queue_capacity));
        let keep_running = Arc::new(AtomicBool::new(true));
        let handle = WorkerHandle {
            key: Arc::from(session.key()),
            queue: Arc::clone(&queue),
            keep_running: Arc::clone(&keep_running),
            signals: session.signals(),
        };
        let name: String = name.into();
        let worker = Self {
            router: MessageRouter::new(&name, Arc::clone(&writer), Arc::clone(&logs.internal)),
            name,
            session,
            queue,
            writer,
            keep_running,
            idle_poll: settings.idle_poll,
            logs,
        };
        (worker, handle)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs until halted or a fatality occurs, then closes the session.
    pub fn run(mut self) -> WorkerExit {
        self.logs.internal.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "session worker started",
            Some(json!({ "worker": self.name, "session": self.session.key() })),
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process_jobs()));
        let exit = match outcome {
            Ok(Ok(())) => WorkerExit::Halted,
            Ok(Err(fatality)) => WorkerExit::Fatal(fatality),
            Err(payload) => WorkerExit::Fatal(ConnectionFatality::crashed(panic_message(&*payload))),
        };

        self.keep_running.store(false, Ordering::SeqCst);
        self.queue.close();
        self.report_exit(&exit);
        self.close_session();
        exit
    }

    /// Refuses the connection without running any job: the client gets a
    /// single `FAILURE` and the session is closed.
    pub fn reject(mut self, status: Status, message: &str) {
        self.keep_running.store(false, Ordering::SeqCst);
        self.queue.close();
        if let Err(error) = self.writer.write(&ResponseMessage::failure(status, message)) {
            self.logs.internal.warn(
                Some(LOG_CONTEXT),
                &format!("failed to notify rejected connection '{}': {error}", self.name),
            );
        }
        self.close_session();
    }

    fn process_jobs(&mut self) -> Result<(), ConnectionFatality> {
        let mut batch = Vec::with_capacity(self.queue.capacity());

        while self.keep_running.load(Ordering::SeqCst) {
            match self.queue.poll(self.idle_poll) {
                Poll::Item(job) => {
                    self.execute(job)?;
                    self.queue.drain_into(&mut batch);
                    for job in batch.drain(..) {
                        if !self.keep_running.load(Ordering::SeqCst) {
                            break;
                        }
                        self.execute(job)?;
                    }
                }
                Poll::TimedOut => self.session.validate_transaction()?,
                Poll::Closed => break,
            }
        }

        Ok(())
    }

    fn execute(&mut self, job: Job) -> Result<(), ConnectionFatality> {
        if self.logs.internal.should_log(LogLevel::Verbose) {
            self.logs.internal.log(
                LogLevel::Verbose,
                Some(LOG_CONTEXT),
                &format!("dispatching {}", job.kind()),
                Some(json!({
                    "worker": self.name,
                    "queued_for_ms": job.enqueued_at().elapsed().as_millis() as u64,
                })),
            );
        }
        self.router.dispatch(&mut self.session, job)
    }

    fn report_exit(&self, exit: &WorkerExit) {
        let reason = match exit {
            WorkerExit::Halted => "halted",
            WorkerExit::Fatal(fatality) => fatality.kind(),
        };
        let payload = Some(json!({
            "worker": self.name,
            "session": self.session.key(),
            "reason": reason,
        }));
        match exit {
            WorkerExit::Halted => {
                self.logs
                    .internal
                    .log(LogLevel::Debug, Some(LOG_CONTEXT), "session worker halted", payload);
            }
            WorkerExit::Fatal(ConnectionFatality::AuthFatal { message }) => {
                self.logs.security.log(
                    LogLevel::Warn,
                    Some(LOG_CONTEXT),
                    &format!("authentication failed, closing connection: {message}"),
                    payload,
                );
            }
            WorkerExit::Fatal(ConnectionFatality::ProtocolBreach { message }) => {
                self.logs.internal.log(
                    LogLevel::Error,
                    Some(LOG_CONTEXT),
                    &format!("protocol breach, closing connection: {message}"),
                    payload,
                );
            }
            WorkerExit::Fatal(ConnectionFatality::Interrupted { reason }) => {
                self.logs.internal.log(
                    LogLevel::Info,
                    Some(LOG_CONTEXT),
                    &format!("session worker interrupted: {reason}"),
                    payload,
                );
            }
            WorkerExit::Fatal(ConnectionFatality::Crashed { message }) => {
                self.logs.user.log(
                    LogLevel::Error,
                    Some(LOG_CONTEXT),
                    &format!("worker for session '{}' crashed: {message}", self.session.key()),
                    payload,
                );
            }
        }
    }

    fn close_session(&mut self) {
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| self.session.close())) {
            Ok(Ok(())) => return,
            Ok(Err(fatality)) => fatality.to_string(),
            Err(payload) => panic_message(&*payload),
        };
        self.logs.internal.warn(
            Some(LOG_CONTEXT),
            &format!("failed to close session for worker '{}': {failure}", self.name),
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_owned()
    }
}
