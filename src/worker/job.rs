use std::fmt;
use std::time::Instant;

use crate::bolt::{CompletionHook, RequestKind, RequestMessage};

/// One decoded request waiting for the worker.
pub struct Job {
    pub(crate) request: RequestMessage,
    pub(crate) on_completed: Option<CompletionHook>,
    enqueued_at: Instant,
}

impl Job {
    pub fn new(request: RequestMessage) -> Self {
        Self {
            request,
            on_completed: None,
            enqueued_at: Instant::now(),
        }
    }

    /// Runs `hook` on the worker thread once the response has been written.
    pub fn with_completion(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_completed = Some(Box::new(hook));
        self
    }

    pub fn kind(&self) -> RequestKind {
        self.request.kind()
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("request", &self.request)
            .field("on_completed", &self.on_completed.is_some())
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

impl From<RequestMessage> for Job {
    fn from(request: RequestMessage) -> Self {
        Self::new(request)
    }
}
