//! Error types for Braid

use crate::types::{GlobalId, XaState, Xid};
use thiserror::Error;

/// Result type alias using Braid's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Braid
#[derive(Error, Debug)]
pub enum Error {
    // Transaction protocol errors
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    // Participant errors
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    // Remote branch errors
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    // Not found
    #[error("{0} not found: {1}")]
    NotFound(String, String),

    // Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("No transaction bound to the current thread")]
    NoTransaction,

    #[error("Transaction {xid} is in state {state}")]
    InvalidState { xid: Xid, state: XaState },

    #[error("Another transaction is bound to this thread: {0}")]
    AlreadyBound(Xid),

    #[error("Transaction rolled back: {0}")]
    RolledBack(Xid),

    #[error("Heuristic mixed outcome: {0}")]
    HeuristicMixed(Xid),

    #[error("Heuristic hazard, outcome unknown: {0}")]
    HeuristicHazard(Xid),

    #[error("Transaction not found: {0}")]
    NotFound(GlobalId),
}

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Resource {resource} failed: {reason}")]
    Failed { resource: String, reason: String },

    #[error("Resource {resource} rolled back: {reason}")]
    RolledBack { resource: String, reason: String },

    #[error("Protocol violation: {0}")]
    Protocol(String),
}

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Remote branch {0} voted no")]
    Refused(String),

    #[error("Remote branch {0} reported an error")]
    Failed(String),

    #[error("Remote branch {0} did not answer in time")]
    Timeout(String),

    #[error("Malformed transaction context: {0}")]
    MalformedContext(String),
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound(kind.into(), name.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn resource_failed(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Resource(ResourceError::Failed {
            resource: resource.into(),
            reason: reason.into(),
        })
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Resource(ResourceError::Protocol(msg.into()))
    }

    /// True when the error reports that the work was rolled back rather than
    /// left in doubt.
    pub fn is_rollback(&self) -> bool {
        matches!(
            self,
            Error::Transaction(TransactionError::RolledBack(_))
                | Error::Resource(ResourceError::RolledBack { .. })
                | Error::Remote(RemoteError::Refused(_))
        )
    }

    /// Return the X/Open XA return code for this error.
    ///
    /// Rollback codes are in the `XA_RB*` range (100..=107), heuristic
    /// outcomes are positive and resource-manager errors are negative
    /// (`XAER_*`).
    pub fn xa_code(&self) -> i32 {
        match self {
            Error::Transaction(te) => match te {
                TransactionError::NoTransaction => -6,        // XAER_PROTO
                TransactionError::InvalidState { .. } => -6,  // XAER_PROTO
                TransactionError::AlreadyBound(_) => -9,      // XAER_OUTSIDE
                TransactionError::RolledBack(_) => 100,       // XA_RBROLLBACK
                TransactionError::HeuristicMixed(_) => 5,     // XA_HEURMIX
                TransactionError::HeuristicHazard(_) => 8,    // XA_HEURHAZ
                TransactionError::NotFound(_) => -4,          // XAER_NOTA
            },
            Error::Resource(re) => match re {
                ResourceError::Failed { .. } => -3,           // XAER_RMERR
                ResourceError::RolledBack { .. } => 100,      // XA_RBROLLBACK
                ResourceError::Protocol(_) => -6,             // XAER_PROTO
            },
            Error::Remote(re) => match re {
                RemoteError::Refused(_) => 100,               // XA_RBROLLBACK
                RemoteError::Failed(_) => 101,                // XA_RBCOMMFAIL
                RemoteError::Timeout(_) => 106,               // XA_RBTIMEOUT
                RemoteError::MalformedContext(_) => -5,       // XAER_INVAL
            },
            Error::Io(_) => -7,                               // XAER_RMFAIL
            Error::Config(_) => -5,                           // XAER_INVAL
            Error::Internal(_) => -3,                         // XAER_RMERR
            Error::NotFound(_, _) => -4,                      // XAER_NOTA
            Error::InvalidArgument(_) => -5,                  // XAER_INVAL
            Error::Timeout(_) => 106,                         // XA_RBTIMEOUT
        }
    }
}
