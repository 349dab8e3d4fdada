use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;

use crate::bolt::memory::{InMemoryRunner, StaticAuthenticator};
use crate::bolt::runner::Authenticator;
use crate::bolt::state_machine::{BoltStateMachine, SessionSettings};
use crate::bolt::{ConnectionDescriptor, ResponseWriter, Session, Status};
use crate::config::AppConfig;
use crate::logging::{LogChannels, LogLevel, Logger};

use super::pool::{PoolError, PoolSettings, PooledTask, WorkerThreadPool};
use super::{SessionWorker, WorkerHandle, WorkerSettings};

const LOG_CONTEXT: &str = "bolt::worker_factory";

const NO_THREADS_MESSAGE: &str = "There are no available threads to serve this request at the moment. \
You can retry at a later time or consider increasing max thread pool size for bolt connector(s).";

/// Opens the session a new connection will talk to.
pub trait SessionConnector: Send + Sync + 'static {
    type Session: Session + 'static;

    fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Self::Session, ConnectorError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorError {
    pub message: String,
}

impl ConnectorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to open session: {}", self.message)
    }
}

impl std::error::Error for ConnectorError {}

/// Names pool threads and the workers running on them. Pool threads are
/// shared between connections and get `{prefix}-{n}`; a worker's name embeds
/// its connection descriptor and travels with every line it logs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadNaming {
    prefix: String,
}

impl ThreadNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn thread_prefix(&self) -> &str {
        &self.prefix
    }

    pub fn worker_name(&self, descriptor: &ConnectionDescriptor) -> String {
        format!("{}[{}]", self.prefix, descriptor)
    }
}

impl Default for ThreadNaming {
    fn default() -> Self {
        Self::new("bolt-worker")
    }
}

#[derive(Debug)]
pub enum FactoryError {
    Connect(ConnectorError),
    NoThreadsAvailable { max_threads: usize },
    ShutDown,
    Spawn(io::Error),
}

impl fmt::Display for FactoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(source) => write!(f, "{source}"),
            Self::NoThreadsAvailable { max_threads } => {
                write!(f, "no worker threads available (max {max_threads})")
            }
            Self::ShutDown => write!(f, "worker factory is shut down"),
            Self::Spawn(source) => write!(f, "failed to start worker thread: {source}"),
        }
    }
}

impl std::error::Error for FactoryError {}

impl From<PoolError> for FactoryError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::Saturated { max_threads } => Self::NoThreadsAvailable { max_threads },
            PoolError::ShutDown => Self::ShutDown,
            PoolError::Spawn(source) => Self::Spawn(source),
        }
    }
}

type WorkerRegistry = Arc<Mutex<HashMap<u64, WorkerHandle>>>;

fn lock_registry(registry: &WorkerRegistry) -> MutexGuard<'_, HashMap<u64, WorkerHandle>> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Creates one worker per accepted connection and runs it on the shared
/// thread pool.
pub struct WorkerFactory<C: SessionConnector> {
    connector: C,
    settings: WorkerSettings,
    naming: ThreadNaming,
    pool: WorkerThreadPool,
    registry: WorkerRegistry,
    logs: LogChannels,
}

impl<C: SessionConnector> WorkerFactory<C> {
    pub fn new(
        connector: C,
        settings: WorkerSettings,
        pool_settings: PoolSettings,
        naming: ThreadNaming,
        logs: LogChannels,
    ) -> Self {
        Self {
            connector,
            settings,
            pool: WorkerThreadPool::new(pool_settings, naming.thread_prefix()),
            naming,
            registry: Arc::new(Mutex::new(HashMap::new())),
            logs,
        }
    }

    /// Starts a worker for `descriptor`. `on_close` runs exactly once, after
    /// the worker has closed its session, also when the worker could not be
    /// started.
    pub fn new_worker(
        &self,
        descriptor: ConnectionDescriptor,
        writer: Arc<dyn ResponseWriter>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Result<WorkerHandle, FactoryError> {
        let session = match self.connector.connect(&descriptor) {
            Ok(session) => session,
            Err(error) => {
                self.logs.internal.warn(
                    Some(LOG_CONTEXT),
                    &format!("failed to open session for {descriptor}: {error}"),
                );
                on_close();
                return Err(FactoryError::Connect(error));
            }
        };

        let worker_name = self.naming.worker_name(&descriptor);
        let (worker, handle) = SessionWorker::new(
            worker_name.clone(),
            session,
            writer,
            &self.settings,
            self.logs.clone(),
        );

        lock_registry(&self.registry).insert(descriptor.connection_id, handle.clone());

        let task = WorkerTask {
            worker,
            connection_id: descriptor.connection_id,
            registry: Arc::clone(&self.registry),
            logger: Arc::clone(&self.logs.internal),
            on_close: Box::new(on_close),
        };
        self.pool.submit(Box::new(task))?;

        self.logs.internal.log(
            LogLevel::Debug,
            Some(LOG_CONTEXT),
            "worker scheduled",
            Some(json!({
                "worker": worker_name,
                "session": handle.key(),
                "live_threads": self.pool.live_threads(),
                "idle_threads": self.pool.idle_threads(),
            })),
        );
        Ok(handle)
    }

    pub fn live_workers(&self) -> usize {
        lock_registry(&self.registry).len()
    }

    /// Stops accepting workers and halts every live one. Workers finish
    /// their current job at most.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        let handles: Vec<WorkerHandle> = lock_registry(&self.registry).values().cloned().collect();
        self.logs.internal.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "halting session workers",
            Some(json!({ "workers": handles.len() })),
        );
        for handle in handles {
            handle.halt();
        }
    }
}

struct WorkerTask<S: Session> {
    worker: SessionWorker<S>,
    connection_id: u64,
    registry: WorkerRegistry,
    logger: Arc<Logger>,
    on_close: Box<dyn FnOnce() + Send>,
}

impl<S: Session + 'static> PooledTask for WorkerTask<S> {
    fn run(self: Box<Self>) {
        let Self {
            worker,
            connection_id,
            registry,
            on_close,
            ..
        } = *self;
        worker.run();
        lock_registry(&registry).remove(&connection_id);
        on_close();
    }

    fn rejected(self: Box<Self>, reason: &PoolError) {
        let Self {
            worker,
            connection_id,
            registry,
            logger,
            on_close,
        } = *self;
        lock_registry(&registry).remove(&connection_id);
        logger.warn(
            Some(LOG_CONTEXT),
            &format!("rejecting connection for worker '{}': {reason}", worker.name()),
        );
        worker.reject(Status::NoThreadsAvailable, NO_THREADS_MESSAGE);
        on_close();
    }
}

/// Opens [`BoltStateMachine`] sessions over the in-memory statement runner.
pub struct MemorySessionConnector {
    authenticator: Arc<dyn Authenticator>,
    settings: SessionSettings,
    logger: Arc<Logger>,
}

impl MemorySessionConnector {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        settings: SessionSettings,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            authenticator,
            settings,
            logger,
        }
    }

    pub fn from_config(config: &AppConfig, logs: &LogChannels) -> Self {
        Self::new(
            Arc::new(StaticAuthenticator::from_config(&config.auth)),
            SessionSettings {
                transaction_timeout: config.session.transaction_timeout(),
            },
            Arc::clone(&logs.internal),
        )
    }
}

impl SessionConnector for MemorySessionConnector {
    type Session = BoltStateMachine<InMemoryRunner>;

    fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Self::Session, ConnectorError> {
        Ok(BoltStateMachine::new(
            descriptor.clone(),
            InMemoryRunner::new(),
            Arc::clone(&self.authenticator),
            self.settings,
            Arc::clone(&self.logger),
        ))
    }
}
