use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use super::error::ConnectionFatality;
use super::handler::ResponseHandler;
use super::messages::ValueMap;

/// Identity of one accepted client connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionDescriptor {
    pub connection_id: u64,
    pub connector: String,
    pub client_address: SocketAddr,
    pub server_address: SocketAddr,
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}[{} -> {}]",
            self.connector, self.connection_id, self.client_address, self.server_address
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Connected,
    Idle,
    InTransaction,
    Streaming,
    Failed,
    Interrupted,
    Closed,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Connected => "CONNECTED",
            Self::Idle => "READY",
            Self::InTransaction => "IN_TRANSACTION",
            Self::Streaming => "STREAMING",
            Self::Failed => "FAILED",
            Self::Interrupted => "INTERRUPTED",
            Self::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The parts of a session that may be poked from any thread.
pub trait SessionSignals: Send + Sync {
    /// Makes the next request observe an interrupted session.
    fn interrupt(&self);

    /// Marks the session as terminated; the next operation fails fatally.
    fn terminate(&self);
}

/// A per-connection request processor. Not thread-safe: only the owning
/// worker thread calls these, one at a time. Every request operation reports
/// its outcome through `handler` and calls `handler.on_finish()` once before
/// returning, fatal or not.
pub trait Session: Send {
    fn key(&self) -> &str;

    fn signals(&self) -> Arc<dyn SessionSignals>;

    fn init(
        &mut self,
        client_name: &str,
        auth_token: &ValueMap,
        handler: &mut dyn ResponseHandler,
    ) -> Result<(), ConnectionFatality>;

    fn run(
        &mut self,
        statement: &str,
        parameters: &ValueMap,
        handler: &mut dyn ResponseHandler,
    ) -> Result<(), ConnectionFatality>;

    fn pull_all(&mut self, handler: &mut dyn ResponseHandler) -> Result<(), ConnectionFatality>;

    fn discard_all(&mut self, handler: &mut dyn ResponseHandler) -> Result<(), ConnectionFatality>;

    fn reset(&mut self, handler: &mut dyn ResponseHandler) -> Result<(), ConnectionFatality>;

    fn ack_failure(&mut self, handler: &mut dyn ResponseHandler) -> Result<(), ConnectionFatality>;

    /// Idle health check, called when no job arrived within the poll period.
    fn validate_transaction(&mut self) -> Result<(), ConnectionFatality>;

    /// Releases resources. Safe to call more than once.
    fn close(&mut self) -> Result<(), ConnectionFatality>;
}
