//! # Domain Errors
//!
//! Error types for the transaction coordination layer.
//!
//! Three families:
//! - [`CoordinatorError`]: the only error callers of the coordinator ever see.
//! - [`XaError`]: participant protocol misuse (start/end/prepare/...).
//! - [`BackendError`]: outcomes reported by the pluggable transaction manager.
//!   These are classified into a [`CoordinatorError`] at the coordinator boundary.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::value_objects::Xid;

/// Shared, cloneable error source carried by coordinator errors.
pub type ErrorSource = Arc<dyn StdError + Send + Sync + 'static>;

/// Classification of coordinator failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Backend selector missing, unknown or failed to instantiate.
    Configuration,
    /// Begin attempted in an unsupported nesting context.
    Nesting,
    /// Generic backend system failure.
    System,
    /// Commit attempted while rollback-only was set; carries the recorded cause.
    RollbackOnly,
    /// Commit failed and the transaction rolled back with no recorded cause.
    Rollback,
    /// Backend reported an illegal state during commit.
    IllegalState,
    /// Heuristic decision: partly committed, partly rolled back.
    HeuristicMixed,
    /// Heuristic decision: everything rolled back.
    HeuristicRollback,
    /// Participant protocol misuse.
    ProtocolViolation,
    /// Participant started twice with the same id.
    DuplicateId,
    /// Participant asked about an id it does not hold.
    NoSuchTransaction,
    /// A unit of work run inside a transaction failed.
    WorkFailed,
}

impl ErrorKind {
    /// Stable name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "Configuration",
            Self::Nesting => "Nesting",
            Self::System => "System",
            Self::RollbackOnly => "RollbackOnly",
            Self::Rollback => "Rollback",
            Self::IllegalState => "IllegalState",
            Self::HeuristicMixed => "HeuristicMixed",
            Self::HeuristicRollback => "HeuristicRollback",
            Self::ProtocolViolation => "ProtocolViolation",
            Self::DuplicateId => "DuplicateId",
            Self::NoSuchTransaction => "NoSuchTransaction",
            Self::WorkFailed => "WorkFailed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error surfaced by every coordinator operation.
#[derive(Debug, Clone, Error)]
#[error("{kind} error: {message}")]
pub struct CoordinatorError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<ErrorSource>,
}

impl CoordinatorError {
    /// Create an error without a source.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach a source error.
    pub fn caused_by(mut self, source: ErrorSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Attach an optional source error.
    pub fn maybe_caused_by(mut self, source: Option<ErrorSource>) -> Self {
        self.source = source;
        self
    }

    /// Configuration failure (backend resolution).
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// System failure wrapping a backend error.
    pub fn system(message: impl Into<String>, source: BackendError) -> Self {
        Self::new(ErrorKind::System, message).caused_by(Arc::new(source))
    }

    /// Error classification.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human-readable message (without the kind prefix).
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The wrapped source, if any.
    pub fn source_error(&self) -> Option<&ErrorSource> {
        self.source.as_ref()
    }

    /// Check the classification.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Deepest error in the source chain, or `self` when there is none.
    pub fn root_cause(&self) -> &(dyn StdError + 'static) {
        let mut current: &(dyn StdError + 'static) = self;
        while let Some(next) = current.source() {
            current = next;
        }
        current
    }
}

impl From<XaError> for CoordinatorError {
    fn from(err: XaError) -> Self {
        let kind = match &err {
            XaError::DuplicateId(_) => ErrorKind::DuplicateId,
            XaError::NoSuchTransaction(_) => ErrorKind::NoSuchTransaction,
            XaError::ProtocolViolation(_) | XaError::InvalidXid(_) => {
                ErrorKind::ProtocolViolation
            }
            XaError::ResourceManager(_) => ErrorKind::System,
        };
        Self::new(kind, err.to_string()).caused_by(Arc::new(err))
    }
}

/// Participant protocol errors (the XA error codes this layer can raise).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XaError {
    /// Operation not legal in the participant's current state (XAER_PROTO).
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// `start` called twice for the same id (XAER_DUPID).
    #[error("Duplicate transaction id: {0}")]
    DuplicateId(Xid),

    /// Id does not match the one the participant holds (XAER_NOTA).
    #[error("No such transaction: {0}")]
    NoSuchTransaction(Xid),

    /// Malformed transaction id.
    #[error("Invalid xid: {0}")]
    InvalidXid(String),

    /// Resource manager failure (XAER_RMERR).
    #[error("Resource manager error: {0}")]
    ResourceManager(String),
}

/// Outcomes reported by the transaction-manager backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Requested operation is not supported (e.g. nested begin).
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Generic system failure.
    #[error("System error: {0}")]
    System(String),

    /// Commit turned into a rollback.
    #[error("Transaction rolled back: {message}")]
    Rollback {
        /// Description of what happened.
        message: String,
        /// Underlying cause, when the backend knows one.
        #[source]
        cause: Option<ErrorSource>,
    },

    /// Operation not legal in the current state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Heuristic mixed outcome.
    #[error("Heuristic mixed outcome: {0}")]
    HeuristicMixed(String),

    /// Heuristic rollback.
    #[error("Heuristic rollback: {0}")]
    HeuristicRollback(String),

    /// Handle does not name a transaction the backend can resume.
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    /// An enlisted resource failed.
    #[error("Resource failure: {0}")]
    Resource(#[from] XaError),
}

impl BackendError {
    /// Root cause as reported by the backend: the attached cause for a
    /// rollback, the error itself otherwise.
    pub fn into_root_cause(self) -> ErrorSource {
        match self {
            BackendError::Rollback {
                cause: Some(cause), ..
            } => cause,
            other => Arc::new(other),
        }
    }
}
