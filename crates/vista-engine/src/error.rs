//! Error types for the view engine access layer

use std::fmt;

use serde::{Deserialize, Serialize};
use vista_depgraph::GraphError;
use vista_leases::LeaseError;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, Error>;

/// Main error type for the engine access layer
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    context: String,
}

impl Error {
    /// Create a new error
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
        }
    }

    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Get the error context
    pub fn context(&self) -> &str {
        &self.context
    }

    /// A requested process/client/cycle/reference does not exist
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, what)
    }

    /// The operation is invalid for the current lifecycle state
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, msg)
    }

    /// The call boundary failed; fatal to the session, never retried
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, msg)
    }

    /// An internal invariant failed
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }

    /// Check for a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::NotFound)
    }

    /// Check for an invalid-state error
    pub fn is_invalid_state(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidState)
    }

    /// Check for a transport error
    pub fn is_transport(&self) -> bool {
        matches!(self.kind, ErrorKind::Transport)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

/// Error kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The addressed entity does not exist (or was already released)
    NotFound,
    /// The operation is invalid for the current lifecycle state
    InvalidState,
    /// The call boundary failed
    Transport,
    /// Internal invariant failure
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotFound => "not found",
            Self::InvalidState => "invalid state",
            Self::Transport => "transport failure",
            Self::Internal => "internal error",
        };
        f.write_str(name)
    }
}

impl From<LeaseError> for Error {
    fn from(err: LeaseError) -> Self {
        match &err {
            LeaseError::UnknownResource(_) | LeaseError::NotFound(_) => {
                Self::not_found(err.to_string())
            }
            LeaseError::AlreadyReleased(_) => Self::invalid_state(err.to_string()),
            LeaseError::Transport(_) => Self::transport(err.to_string()),
        }
    }
}

impl From<GraphError> for Error {
    fn from(err: GraphError) -> Self {
        match &err {
            GraphError::UnknownConfig(_) => Self::not_found(err.to_string()),
            GraphError::Transport(_) => Self::transport(err.to_string()),
        }
    }
}

impl From<Error> for GraphError {
    fn from(err: Error) -> Self {
        GraphError::Transport(err.to_string())
    }
}
