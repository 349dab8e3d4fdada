use std::fmt;

use uuid::Uuid;

use super::status::Status;

/// A classified failure raised while handling a request.
#[derive(Clone, Debug)]
pub struct BoltError {
    status: Status,
    message: String,
    reference: Uuid,
    fatal: bool,
}

impl BoltError {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            reference: Uuid::new_v4(),
            fatal: false,
        }
    }

    pub fn fatal(status: Status, message: impl Into<String>) -> Self {
        Self {
            fatal: true,
            ..Self::new(status, message)
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn reference(&self) -> Uuid {
        self.reference
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn is_publishable(&self) -> bool {
        self.status.is_publishable()
    }

    /// The message a client is allowed to see.
    pub fn client_message(&self) -> String {
        if self.is_publishable() {
            self.message.clone()
        } else {
            format!(
                "An unexpected failure occurred, see details in the database logs, reference number {}.",
                self.reference
            )
        }
    }
}

impl fmt::Display for BoltError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status.wire_code(), self.message)
    }
}

impl std::error::Error for BoltError {}

/// Why a connection must be torn down. Every variant ends the worker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionFatality {
    AuthFatal { message: String },
    ProtocolBreach { message: String },
    Interrupted { reason: String },
    Crashed { message: String },
}

impl ConnectionFatality {
    pub fn auth(message: impl Into<String>) -> Self {
        Self::AuthFatal {
            message: message.into(),
        }
    }

    pub fn breach(message: impl Into<String>) -> Self {
        Self::ProtocolBreach {
            message: message.into(),
        }
    }

    pub fn interrupted(reason: impl Into<String>) -> Self {
        Self::Interrupted {
            reason: reason.into(),
        }
    }

    pub fn crashed(message: impl Into<String>) -> Self {
        Self::Crashed {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthFatal { .. } => "auth_fatal",
            Self::ProtocolBreach { .. } => "protocol_breach",
            Self::Interrupted { .. } => "interrupted",
            Self::Crashed { .. } => "crashed",
        }
    }
}

impl fmt::Display for ConnectionFatality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthFatal { message } => write!(f, "authentication failure: {message}"),
            Self::ProtocolBreach { message } => write!(f, "protocol breach: {message}"),
            Self::Interrupted { reason } => write!(f, "interrupted: {reason}"),
            Self::Crashed { message } => write!(f, "crashed: {message}"),
        }
    }
}

impl std::error::Error for ConnectionFatality {}
