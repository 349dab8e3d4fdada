use std::fmt;

/// Broad class of a status; decides whether its message may reach a client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Classification {
    ClientError,
    TransientError,
    DatabaseError,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientError => "ClientError",
            Self::TransientError => "TransientError",
            Self::DatabaseError => "DatabaseError",
        }
    }

    pub fn is_publishable(self) -> bool {
        !matches!(self, Self::DatabaseError)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    RequestInvalid,
    NoThreadsAvailable,
    InvalidSyntax,
    ParameterMissing,
    ProcedureNotFound,
    TransactionNotFound,
    TransactionTimedOut,
    TransactionTerminated,
    Unauthorized,
    AuthorizationExpired,
    UnknownError,
}

impl Status {
    /// Short `Category.Title` form, e.g. `Statement.InvalidSyntax`.
    pub fn code(self) -> &'static str {
        match self {
            Self::RequestInvalid => "Request.Invalid",
            Self::NoThreadsAvailable => "Request.NoThreadsAvailable",
            Self::InvalidSyntax => "Statement.InvalidSyntax",
            Self::ParameterMissing => "Statement.ParameterMissing",
            Self::ProcedureNotFound => "Procedure.ProcedureNotFound",
            Self::TransactionNotFound => "Transaction.TransactionNotFound",
            Self::TransactionTimedOut => "Transaction.TransactionTimedOut",
            Self::TransactionTerminated => "Transaction.Terminated",
            Self::Unauthorized => "Security.Unauthorized",
            Self::AuthorizationExpired => "Security.AuthorizationExpired",
            Self::UnknownError => "General.UnknownError",
        }
    }

    pub fn classification(self) -> Classification {
        match self {
            Self::NoThreadsAvailable => Classification::TransientError,
            Self::UnknownError => Classification::DatabaseError,
            _ => Classification::ClientError,
        }
    }

    pub fn is_publishable(self) -> bool {
        self.classification().is_publishable()
    }

    /// Fully qualified wire code, e.g. `Neo.ClientError.Request.Invalid`.
    pub fn wire_code(self) -> String {
        format!("Neo.{}.{}", self.classification().as_str(), self.code())
    }

    #[cfg(test)]
    pub fn from_wire_code(code: &str) -> Option<Self> {
        const ALL: [Status; 11] = [
            Status::RequestInvalid,
            Status::NoThreadsAvailable,
            Status::InvalidSyntax,
            Status::ParameterMissing,
            Status::ProcedureNotFound,
            Status::TransactionNotFound,
            Status::TransactionTimedOut,
            Status::TransactionTerminated,
            Status::Unauthorized,
            Status::AuthorizationExpired,
            Status::UnknownError,
        ];
        ALL.into_iter().find(|status| status.wire_code() == code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
