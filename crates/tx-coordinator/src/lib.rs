//! # TX Coordinator
//!
//! Transaction coordination layer in front of a pluggable two-phase-commit
//! transaction manager.
//!
//! **Architecture:** Hexagonal (DDD + Ports/Adapters)
//!
//! ## Purpose
//!
//! - Thread-confined, nestable "current transaction" with explicit
//!   suspend/resume stacks
//! - Diagnostics: where a transaction was begun, suspended, and why it was
//!   marked rollback-only
//! - Resource participant protocol (start/end/prepare/commit/rollback/
//!   forget/recover) with a debug participant tracking live transactions and
//!   a timeout monitor firing when a transaction outlives its budget
//! - Uniform failure classification across backend errors
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tx_coordinator::{CoordinatorConfig, TransactionCoordinator};
//!
//! let coordinator = Arc::new(TransactionCoordinator::new(CoordinatorConfig::from_env())?);
//! let mut session = coordinator.session()?;
//!
//! let total = session.run_in_transaction(
//!     |_tx| Ok(40 + 2),
//!     "could not compute total",
//!     0,
//!     true,
//! )?;
//! assert_eq!(total, 42);
//! # Ok::<(), tx_coordinator::CoordinatorError>(())
//! ```
//!
//! ## Module Structure
//!
//! ```text
//! tx-coordinator/
//! ├── domain/          # Status, Xid, handles, errors, per-thread context
//! ├── ports/           # XaResource/Synchronization in, backend traits out
//! ├── participant/     # Participant runtime, timeout watch, debug + timeout participants
//! ├── adapters/        # In-memory transaction manager backend
//! ├── locator          # Backend registry and once-only resolution
//! ├── coordinator/     # Shared coordinator and per-thread sessions
//! ├── config           # Environment configuration
//! └── logging          # tracing-subscriber setup
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod locator;
pub mod logging;
pub mod participant;
pub mod ports;

// Re-exports
pub use adapters::{InMemoryTransactionFactory, InMemoryTransactionManager, IN_MEMORY_BACKEND};
pub use config::{CoordinatorConfig, DEFAULT_BACKEND};
pub use coordinator::{
    SuspendedTransactionInfo, ThreadBeginStack, TransactionCoordinator, TransactionSession,
    WorkError,
};
pub use domain::{
    BackendError, CaptureSnapshot, CoordinatorError, DiagnosticCapture, ErrorKind, ErrorSource,
    ParticipantState, RollbackCause, Status, TransactionHandle, XaError, XaVote, Xid,
};
pub use locator::{BackendConstructor, BackendLocator, BackendRegistry};
pub use logging::init_tracing;
pub use participant::{
    log_running_transactions, running_transactions, DebugParticipant, Participant,
    ParticipantRuntime, TimeoutCallback, TimeoutMonitor,
};
pub use ports::{
    Connection, Synchronization, TransactionFactory, TransactionManager, UserTransaction,
    XaResource,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    #[test]
    fn test_version() {
        assert!(!super::VERSION.is_empty());
    }
}
