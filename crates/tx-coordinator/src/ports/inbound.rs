//! # Inbound Ports
//!
//! Callbacks the transaction-manager backend drives: resource participants
//! (two-phase protocol) and completion synchronizations.

use crate::domain::{Status, XaError, XaVote, Xid};

/// Resource participant protocol (XA `XAResource`).
///
/// Methods take `&self`: a participant is shared between the backend, which
/// drives the protocol, and whatever registry or monitor observes it.
pub trait XaResource: Send + Sync {
    /// Associate the participant with branch `xid`.
    fn start(&self, xid: &Xid, flags: i32) -> Result<(), XaError>;

    /// End the association with branch `xid`.
    fn end(&self, xid: &Xid, flags: i32) -> Result<(), XaError>;

    /// Phase one vote.
    fn prepare(&self, xid: &Xid) -> Result<XaVote, XaError>;

    /// Phase two commit (or single-phase commit when `one_phase`).
    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError>;

    /// Roll the branch back.
    fn rollback(&self, xid: &Xid) -> Result<(), XaError>;

    /// Forget a heuristically completed branch.
    fn forget(&self, xid: &Xid) -> Result<(), XaError>;

    /// Branches in prepared state, for recovery.
    fn recover(&self, flags: i32) -> Result<Vec<Xid>, XaError>;

    /// Whether `other` is the same resource manager.
    fn is_same_rm(&self, other: &dyn XaResource) -> bool;

    /// Configured timeout in seconds (0 = none).
    fn transaction_timeout(&self) -> u32;

    /// Configure the timeout in seconds; 0 clears it.
    fn set_transaction_timeout(&self, seconds: u32) -> Result<bool, XaError>;
}

/// Completion callback registered on a transaction.
pub trait Synchronization: Send + Sync {
    /// Called before the two-phase commit starts.
    fn before_completion(&self) {}

    /// Called once the transaction has completed with `status`.
    fn after_completion(&self, status: Status);
}
