//! # Outbound Ports
//!
//! Capabilities the coordinator requires from the external transaction
//! manager. A backend plugs in by implementing [`TransactionFactory`] and
//! registering a constructor with the [`BackendRegistry`](crate::BackendRegistry).
//!
//! All thread-bound calls (`begin`, `status`, `suspend`, ...) operate on the
//! transaction associated with the *calling* thread.

use std::sync::Arc;

use crate::domain::{BackendError, Status, TransactionHandle};
use crate::ports::inbound::{Synchronization, XaResource};

/// Demarcation API (JTA `UserTransaction` equivalent).
pub trait UserTransaction: Send + Sync {
    /// Begin a transaction on the calling thread.
    fn begin(&self) -> Result<(), BackendError>;

    /// Commit the calling thread's transaction.
    fn commit(&self) -> Result<(), BackendError>;

    /// Roll back the calling thread's transaction.
    fn rollback(&self) -> Result<(), BackendError>;

    /// Mark the calling thread's transaction rollback-only.
    fn set_rollback_only(&self) -> Result<(), BackendError>;

    /// Status of the calling thread's transaction.
    fn status(&self) -> Result<Status, BackendError>;

    /// Timeout for transactions begun afterwards on this thread; 0 restores the default.
    fn set_transaction_timeout(&self, seconds: u32) -> Result<(), BackendError>;
}

/// Management API (JTA `TransactionManager` equivalent).
pub trait TransactionManager: Send + Sync {
    /// Status of the calling thread's transaction.
    fn status(&self) -> Result<Status, BackendError>;

    /// Detach the calling thread's transaction. `None` when there was none.
    fn suspend(&self) -> Result<Option<TransactionHandle>, BackendError>;

    /// Re-attach a suspended transaction to the calling thread.
    fn resume(&self, handle: &TransactionHandle) -> Result<(), BackendError>;

    /// Handle of the calling thread's transaction.
    fn transaction(&self) -> Result<Option<TransactionHandle>, BackendError>;

    /// Status of an arbitrary transaction; callable from any thread.
    fn transaction_status(&self, handle: &TransactionHandle) -> Result<Status, BackendError>;

    /// Enlist a participant in `handle`'s transaction.
    fn enlist_resource(
        &self,
        handle: &TransactionHandle,
        resource: Arc<dyn XaResource>,
    ) -> Result<bool, BackendError>;

    /// Register a completion callback on `handle`'s transaction.
    fn register_synchronization(
        &self,
        handle: &TransactionHandle,
        sync: Arc<dyn Synchronization>,
    ) -> Result<(), BackendError>;
}

/// Connection handed out by the backend for a named datasource.
pub trait Connection: Send {
    /// Datasource this connection belongs to.
    fn datasource(&self) -> &str;

    /// Transaction the connection was enlisted in at acquisition, if any.
    fn transaction(&self) -> Option<TransactionHandle>;
}

/// Pluggable backend.
pub trait TransactionFactory: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Management API.
    fn manager(&self) -> Arc<dyn TransactionManager>;

    /// Demarcation API.
    fn user_transaction(&self) -> Arc<dyn UserTransaction>;

    /// Acquire a connection for `datasource`.
    fn connection(&self, datasource: &str) -> Result<Box<dyn Connection>, BackendError>;

    /// Release backend resources.
    fn shutdown(&self);
}
