use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::error::BoltError;
use super::handler::RecordStream;
use super::messages::ValueMap;

/// Cancellation flag for the statement currently executing. Set from other
/// threads by interrupt/terminate, cleared by the session on reset.
#[derive(Clone, Debug, Default)]
pub struct TerminationToken {
    marked: Arc<AtomicBool>,
}

impl TerminationToken {
    pub fn mark(&self) {
        self.marked.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.marked.store(false, Ordering::SeqCst);
    }

    pub fn is_marked(&self) -> bool {
        self.marked.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatementMetadata {
    pub field_names: Vec<String>,
}

pub type ResultConsumer<'a> = dyn FnMut(&mut dyn RecordStream) -> Result<(), BoltError> + 'a;

/// Executes statements for one session and keeps its transaction and
/// pending result.
pub trait StatementRunner: Send {
    /// Runs `statement`, leaving its result pending.
    fn run(
        &mut self,
        statement: &str,
        parameters: &ValueMap,
        termination: &TerminationToken,
    ) -> Result<StatementMetadata, BoltError>;

    /// Hands the pending result to `consumer` and drops it afterwards.
    fn consume_result(&mut self, consumer: &mut ResultConsumer<'_>) -> Result<(), BoltError>;

    fn has_transaction(&self) -> bool;

    /// Rolls back any open transaction and drops the pending result.
    fn reset(&mut self) -> Result<(), BoltError>;

    fn close(&mut self) -> Result<(), BoltError>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthenticationResult {
    pub principal: Option<String>,
    pub credentials_expired: bool,
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, auth_token: &ValueMap) -> Result<AuthenticationResult, BoltError>;
}
