use std::fmt;

use serde_json::{Map, Value};

use super::status::Status;

pub type ValueMap = Map<String, Value>;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum RequestKind {
    Init,
    Run,
    PullAll,
    DiscardAll,
    Reset,
    AckFailure,
}

impl RequestKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Run => "RUN",
            Self::PullAll => "PULL_ALL",
            Self::DiscardAll => "DISCARD_ALL",
            Self::Reset => "RESET",
            Self::AckFailure => "ACK_FAILURE",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded client request.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestMessage {
    Init {
        client_name: String,
        auth_token: ValueMap,
    },
    Run {
        statement: String,
        parameters: ValueMap,
    },
    PullAll,
    DiscardAll,
    Reset,
    AckFailure,
}

impl RequestMessage {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Init { .. } => RequestKind::Init,
            Self::Run { .. } => RequestKind::Run,
            Self::PullAll => RequestKind::PullAll,
            Self::DiscardAll => RequestKind::DiscardAll,
            Self::Reset => RequestKind::Reset,
            Self::AckFailure => RequestKind::AckFailure,
        }
    }

    #[cfg(test)]
    pub fn run(statement: impl Into<String>) -> Self {
        Self::Run {
            statement: statement.into(),
            parameters: ValueMap::new(),
        }
    }

    #[cfg(test)]
    pub fn init(client_name: impl Into<String>, auth_token: ValueMap) -> Self {
        Self::Init {
            client_name: client_name.into(),
            auth_token,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResponseMessage {
    Success(ValueMap),
    Record(Vec<Value>),
    Ignored,
    Failure { status: Status, message: String },
}

impl ResponseMessage {
    pub fn failure(status: Status, message: impl Into<String>) -> Self {
        Self::Failure {
            status,
            message: message.into(),
        }
    }

}
