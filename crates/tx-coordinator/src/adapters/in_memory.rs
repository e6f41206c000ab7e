//! In-Memory Transaction Manager Adapter
//!
//! Implements the outbound backend ports without any external transaction
//! manager. Transactions are associated with the thread that began or resumed
//! them. Enlisted participants are driven through end/prepare/commit (or
//! end/rollback), using the one-phase optimization for a single participant.
//!
//! Intended for tests and single-process deployments with no real XA manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::domain::{
    BackendError, Status, TransactionHandle, XaError, Xid, XA_TMFAIL, XA_TMNOFLAGS, XA_TMSUCCESS,
};
use crate::ports::{
    Connection, Synchronization, TransactionFactory, TransactionManager, UserTransaction,
    XaResource,
};

/// Backend name reported by [`InMemoryTransactionFactory`].
pub const IN_MEMORY_BACKEND: &str = "in-memory";

struct InMemoryTransaction {
    status: Status,
    timeout: Option<Duration>,
    began_at: Instant,
    resources: Vec<(Xid, Arc<dyn XaResource>)>,
    synchronizations: Vec<Arc<dyn Synchronization>>,
    next_branch: u32,
}

impl InMemoryTransaction {
    fn timed_out(&self) -> bool {
        self.timeout
            .map(|t| self.began_at.elapsed() > t)
            .unwrap_or(false)
    }
}

type Participants = Vec<(Xid, Arc<dyn XaResource>)>;
type Synchronizations = Vec<Arc<dyn Synchronization>>;

/// Thread-associating transaction manager kept entirely in memory.
pub struct InMemoryTransactionManager {
    transactions: DashMap<TransactionHandle, Arc<Mutex<InMemoryTransaction>>>,
    associations: DashMap<ThreadId, TransactionHandle>,
    /// Timeout for the next begin on a thread.
    pending_timeouts: DashMap<ThreadId, u32>,
    default_timeout_secs: u32,
    /// Failure injected into the next commit (tests, fault drills).
    injected_commit_failure: Mutex<Option<BackendError>>,
}

impl InMemoryTransactionManager {
    /// Manager with no default timeout.
    pub fn new() -> Self {
        Self::with_default_timeout(0)
    }

    /// Manager applying `secs` to every transaction begun without an explicit timeout.
    pub fn with_default_timeout(secs: u32) -> Self {
        Self {
            transactions: DashMap::new(),
            associations: DashMap::new(),
            pending_timeouts: DashMap::new(),
            default_timeout_secs: secs,
            injected_commit_failure: Mutex::new(None),
        }
    }

    /// Make the next commit fail with `err` (after rolling the transaction back).
    pub fn inject_commit_failure(&self, err: BackendError) {
        *self.injected_commit_failure.lock() = Some(err);
    }

    /// Number of transactions that have begun and not yet completed.
    pub fn live_transactions(&self) -> usize {
        self.transactions.len()
    }

    fn current(&self) -> Option<TransactionHandle> {
        self.associations
            .get(&thread::current().id())
            .map(|entry| *entry.value())
    }

    fn lookup(
        &self,
        handle: &TransactionHandle,
    ) -> Result<Arc<Mutex<InMemoryTransaction>>, BackendError> {
        self.transactions
            .get(handle)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BackendError::InvalidTransaction(handle.to_string()))
    }

    fn require_current(
        &self,
    ) -> Result<(TransactionHandle, Arc<Mutex<InMemoryTransaction>>), BackendError> {
        let handle = self
            .current()
            .ok_or_else(|| BackendError::IllegalState("no transaction on this thread".into()))?;
        let tx = self.lookup(&handle)?;
        Ok((handle, tx))
    }

    /// Detach `handle` from the calling thread and forget it.
    fn finish(&self, handle: &TransactionHandle) {
        self.associations.remove(&thread::current().id());
        self.transactions.remove(handle);
    }

    fn roll_back_participants(participants: &Participants) {
        for (xid, resource) in participants {
            if let Err(e) = resource.end(xid, XA_TMFAIL) {
                debug!(xid = %xid, error = %e, "end(TMFAIL) rejected during rollback");
            }
            if let Err(e) = resource.rollback(xid) {
                warn!(xid = %xid, error = %e, "Participant rollback failed");
            }
        }
    }

    fn notify(synchronizations: &Synchronizations, status: Status) {
        for sync in synchronizations {
            sync.after_completion(status);
        }
    }

    /// Roll back the calling thread's transaction and detach it.
    fn complete_rollback(
        &self,
        handle: &TransactionHandle,
        tx: &Mutex<InMemoryTransaction>,
    ) {
        let (participants, synchronizations) = {
            let mut guard = tx.lock();
            guard.status = Status::RollingBack;
            (
                std::mem::take(&mut guard.resources),
                std::mem::take(&mut guard.synchronizations),
            )
        };

        Self::roll_back_participants(&participants);
        tx.lock().status = Status::RolledBack;
        self.finish(handle);
        Self::notify(&synchronizations, Status::RolledBack);
        debug!(transaction = %handle, "Transaction rolled back");
    }

    fn run_two_phase(participants: &Participants) -> Result<(), BackendError> {
        for (xid, resource) in participants {
            if let Err(e) = resource.end(xid, XA_TMSUCCESS) {
                debug!(xid = %xid, error = %e, "end(TMSUCCESS) rejected");
            }
        }

        if participants.len() == 1 {
            let (xid, resource) = &participants[0];
            return resource
                .commit(xid, true)
                .map_err(|e| BackendError::Rollback {
                    message: format!("one-phase commit of {} failed", xid),
                    cause: Some(Arc::new(e)),
                });
        }

        for (xid, resource) in participants {
            if let Err(e) = resource.prepare(xid) {
                Self::roll_back_participants(participants);
                return Err(BackendError::Rollback {
                    message: format!("participant {} voted no", xid),
                    cause: Some(Arc::new(e)),
                });
            }
        }

        let failures: Vec<XaError> = participants
            .iter()
            .filter_map(|(xid, resource)| resource.commit(xid, false).err())
            .collect();

        match failures.len() {
            0 => Ok(()),
            n if n == participants.len() => Err(BackendError::HeuristicRollback(format!(
                "all {} participants failed to commit: {}",
                n, failures[0]
            ))),
            n => Err(BackendError::HeuristicMixed(format!(
                "{} of {} participants failed to commit: {}",
                n,
                participants.len(),
                failures[0]
            ))),
        }
    }
}

impl Default for InMemoryTransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl UserTransaction for InMemoryTransactionManager {
    fn begin(&self) -> Result<(), BackendError> {
        let thread_id = thread::current().id();
        if self.associations.contains_key(&thread_id) {
            return Err(BackendError::NotSupported(
                "nested transactions are not supported".into(),
            ));
        }

        let secs = self
            .pending_timeouts
            .get(&thread_id)
            .map(|entry| *entry.value())
            .unwrap_or(self.default_timeout_secs);

        let handle = TransactionHandle::new();
        let tx = InMemoryTransaction {
            status: Status::Active,
            timeout: (secs > 0).then(|| Duration::from_secs(u64::from(secs))),
            began_at: Instant::now(),
            resources: Vec::new(),
            synchronizations: Vec::new(),
            next_branch: 0,
        };
        self.transactions.insert(handle, Arc::new(Mutex::new(tx)));
        self.associations.insert(thread_id, handle);
        debug!(transaction = %handle, timeout_secs = secs, "Transaction begun");
        Ok(())
    }

    fn commit(&self) -> Result<(), BackendError> {
        let (handle, tx) = self.require_current()?;

        let (status, timed_out) = {
            let guard = tx.lock();
            (guard.status, guard.timed_out())
        };

        match status {
            Status::Active => {}
            Status::MarkedRollback => {
                self.complete_rollback(&handle, &tx);
                return Err(BackendError::Rollback {
                    message: "transaction was marked rollback-only".into(),
                    cause: None,
                });
            }
            other => {
                return Err(BackendError::IllegalState(format!(
                    "cannot commit a transaction in state {}",
                    other
                )))
            }
        }

        if timed_out {
            self.complete_rollback(&handle, &tx);
            return Err(BackendError::Rollback {
                message: "transaction timed out".into(),
                cause: None,
            });
        }

        if let Some(err) = self.injected_commit_failure.lock().take() {
            self.complete_rollback(&handle, &tx);
            return Err(err);
        }

        let synchronizations = tx.lock().synchronizations.clone();
        for sync in &synchronizations {
            sync.before_completion();
        }

        // A synchronization may have marked the transaction rollback-only.
        if tx.lock().status == Status::MarkedRollback {
            self.complete_rollback(&handle, &tx);
            return Err(BackendError::Rollback {
                message: "marked rollback-only during before-completion".into(),
                cause: None,
            });
        }

        let participants = {
            let mut guard = tx.lock();
            guard.status = Status::Preparing;
            guard.synchronizations.clear();
            std::mem::take(&mut guard.resources)
        };

        let outcome = Self::run_two_phase(&participants);
        let final_status = match &outcome {
            Ok(()) => Status::Committed,
            Err(BackendError::HeuristicMixed(_)) => Status::Unknown,
            Err(_) => Status::RolledBack,
        };

        tx.lock().status = final_status;
        self.finish(&handle);
        Self::notify(&synchronizations, final_status);
        debug!(transaction = %handle, status = ?final_status, "Transaction completed");
        outcome
    }

    fn rollback(&self) -> Result<(), BackendError> {
        let (handle, tx) = self.require_current()?;
        self.complete_rollback(&handle, &tx);
        Ok(())
    }

    fn set_rollback_only(&self) -> Result<(), BackendError> {
        let (_, tx) = self.require_current()?;
        tx.lock().status = Status::MarkedRollback;
        Ok(())
    }

    fn status(&self) -> Result<Status, BackendError> {
        match self.current() {
            Some(handle) => Ok(self.lookup(&handle)?.lock().status),
            None => Ok(Status::NoTransaction),
        }
    }

    fn set_transaction_timeout(&self, seconds: u32) -> Result<(), BackendError> {
        let thread_id = thread::current().id();
        if seconds == 0 {
            self.pending_timeouts.remove(&thread_id);
        } else {
            self.pending_timeouts.insert(thread_id, seconds);
        }
        Ok(())
    }
}

impl TransactionManager for InMemoryTransactionManager {
    fn status(&self) -> Result<Status, BackendError> {
        UserTransaction::status(self)
    }

    fn suspend(&self) -> Result<Option<TransactionHandle>, BackendError> {
        Ok(self
            .associations
            .remove(&thread::current().id())
            .map(|(_, handle)| handle))
    }

    fn resume(&self, handle: &TransactionHandle) -> Result<(), BackendError> {
        let thread_id = thread::current().id();
        if let Some(current) = self.associations.get(&thread_id) {
            return Err(BackendError::IllegalState(format!(
                "thread already associated with {}",
                current.value()
            )));
        }
        if !self.transactions.contains_key(handle) {
            return Err(BackendError::InvalidTransaction(handle.to_string()));
        }
        self.associations.insert(thread_id, *handle);
        Ok(())
    }

    fn transaction(&self) -> Result<Option<TransactionHandle>, BackendError> {
        Ok(self.current())
    }

    fn transaction_status(&self, handle: &TransactionHandle) -> Result<Status, BackendError> {
        Ok(self.lookup(handle)?.lock().status)
    }

    fn enlist_resource(
        &self,
        handle: &TransactionHandle,
        resource: Arc<dyn XaResource>,
    ) -> Result<bool, BackendError> {
        let tx = self.lookup(handle)?;
        let mut guard = tx.lock();
        match guard.status {
            Status::Active => {}
            Status::MarkedRollback => {
                return Err(BackendError::Rollback {
                    message: "cannot enlist in a rollback-only transaction".into(),
                    cause: None,
                })
            }
            other => {
                return Err(BackendError::IllegalState(format!(
                    "cannot enlist in a transaction in state {}",
                    other
                )))
            }
        }

        if guard
            .resources
            .iter()
            .any(|(_, existing)| existing.is_same_rm(resource.as_ref()))
        {
            return Ok(false);
        }

        guard.next_branch += 1;
        let xid = Xid::for_branch(handle, guard.next_branch);
        resource.start(&xid, XA_TMNOFLAGS)?;
        guard.resources.push((xid, resource));
        Ok(true)
    }

    fn register_synchronization(
        &self,
        handle: &TransactionHandle,
        sync: Arc<dyn Synchronization>,
    ) -> Result<(), BackendError> {
        let tx = self.lookup(handle)?;
        let mut guard = tx.lock();
        if guard.status != Status::Active {
            return Err(BackendError::IllegalState(format!(
                "cannot register a synchronization in state {}",
                guard.status
            )));
        }
        guard.synchronizations.push(sync);
        Ok(())
    }
}

/// Connection bound to the transaction current at acquisition.
#[derive(Debug)]
pub struct InMemoryConnection {
    datasource: String,
    transaction: Option<TransactionHandle>,
}

impl Connection for InMemoryConnection {
    fn datasource(&self) -> &str {
        &self.datasource
    }

    fn transaction(&self) -> Option<TransactionHandle> {
        self.transaction
    }
}

/// Factory exposing an [`InMemoryTransactionManager`] as a backend.
pub struct InMemoryTransactionFactory {
    manager: Arc<InMemoryTransactionManager>,
    opened: Mutex<HashMap<String, usize>>,
}

impl InMemoryTransactionFactory {
    /// Factory over a fresh manager.
    pub fn new() -> Self {
        Self::with_manager(Arc::new(InMemoryTransactionManager::new()))
    }

    /// Factory over an existing manager.
    pub fn with_manager(manager: Arc<InMemoryTransactionManager>) -> Self {
        Self {
            manager,
            opened: Mutex::new(HashMap::new()),
        }
    }

    /// Registry constructor.
    pub fn create() -> Result<Arc<dyn TransactionFactory>, BackendError> {
        Ok(Arc::new(Self::new()))
    }

    /// The concrete manager (for fault injection in tests).
    pub fn in_memory_manager(&self) -> &Arc<InMemoryTransactionManager> {
        &self.manager
    }

    /// Connections handed out so far for `datasource`.
    pub fn connections_opened(&self, datasource: &str) -> usize {
        self.opened.lock().get(datasource).copied().unwrap_or(0)
    }
}

impl Default for InMemoryTransactionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionFactory for InMemoryTransactionFactory {
    fn name(&self) -> &str {
        IN_MEMORY_BACKEND
    }

    fn manager(&self) -> Arc<dyn TransactionManager> {
        self.manager.clone()
    }

    fn user_transaction(&self) -> Arc<dyn UserTransaction> {
        self.manager.clone()
    }

    fn connection(&self, datasource: &str) -> Result<Box<dyn Connection>, BackendError> {
        if datasource.is_empty() {
            return Err(BackendError::System("datasource name is empty".into()));
        }
        *self.opened.lock().entry(datasource.to_string()).or_insert(0) += 1;
        Ok(Box::new(InMemoryConnection {
            datasource: datasource.to_string(),
            transaction: self.manager.current(),
        }))
    }

    fn shutdown(&self) {
        let live = self.manager.live_transactions();
        if live > 0 {
            warn!(live, "Shutting down in-memory backend with live transactions");
        }
        self.manager.associations.clear();
        self.manager.transactions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::{DebugParticipant, Participant};

    #[test]
    fn test_begin_commit_cycle() {
        let tm = InMemoryTransactionManager::new();
        assert_eq!(UserTransaction::status(&tm).unwrap(), Status::NoTransaction);

        tm.begin().unwrap();
        assert_eq!(UserTransaction::status(&tm).unwrap(), Status::Active);
        tm.commit().unwrap();
        assert_eq!(UserTransaction::status(&tm).unwrap(), Status::NoTransaction);
        assert_eq!(tm.live_transactions(), 0);
    }

    #[test]
    fn test_nested_begin_not_supported() {
        let tm = InMemoryTransactionManager::new();
        tm.begin().unwrap();
        assert!(matches!(tm.begin(), Err(BackendError::NotSupported(_))));
    }

    #[test]
    fn test_commit_of_rollback_only_rolls_back() {
        let tm = InMemoryTransactionManager::new();
        tm.begin().unwrap();
        tm.set_rollback_only().unwrap();
        assert!(matches!(tm.commit(), Err(BackendError::Rollback { .. })));
        assert_eq!(UserTransaction::status(&tm).unwrap(), Status::NoTransaction);
    }

    #[test]
    fn test_suspend_and_resume() {
        let tm = InMemoryTransactionManager::new();
        tm.begin().unwrap();
        let handle = tm.suspend().unwrap().unwrap();
        assert_eq!(UserTransaction::status(&tm).unwrap(), Status::NoTransaction);
        assert_eq!(tm.transaction_status(&handle).unwrap(), Status::Active);

        tm.resume(&handle).unwrap();
        assert_eq!(tm.transaction().unwrap(), Some(handle));
        assert!(matches!(
            tm.resume(&handle),
            Err(BackendError::IllegalState(_))
        ));
    }

    #[test]
    fn test_resume_unknown_handle_is_invalid() {
        let tm = InMemoryTransactionManager::new();
        assert!(matches!(
            tm.resume(&TransactionHandle::new()),
            Err(BackendError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_transactions_are_thread_associated() {
        let tm = Arc::new(InMemoryTransactionManager::new());
        tm.begin().unwrap();

        let other = Arc::clone(&tm);
        let status = thread::spawn(move || UserTransaction::status(other.as_ref()).unwrap())
            .join()
            .unwrap();
        assert_eq!(status, Status::NoTransaction);
        tm.rollback().unwrap();
    }

    #[test]
    fn test_enlisted_participant_driven_to_completion() {
        let tm = InMemoryTransactionManager::new();
        tm.begin().unwrap();
        let handle = tm.transaction().unwrap().unwrap();

        let participant = DebugParticipant::new("test");
        assert!(tm.enlist_resource(&handle, participant.clone()).unwrap());
        // Same resource manager is not enlisted twice.
        assert!(!tm.enlist_resource(&handle, participant.clone()).unwrap());

        tm.commit().unwrap();
        assert_eq!(
            participant.runtime().state(),
            crate::domain::ParticipantState::Completed
        );
    }

    #[test]
    fn test_expired_timeout_rolls_back_on_commit() {
        let tm = InMemoryTransactionManager::new();
        tm.set_transaction_timeout(1).unwrap();
        tm.begin().unwrap();
        tm.set_transaction_timeout(0).unwrap();
        {
            let handle = tm.transaction().unwrap().unwrap();
            let tx = tm.lookup(&handle).unwrap();
            tx.lock().began_at = Instant::now() - Duration::from_secs(5);
        }
        assert!(matches!(tm.commit(), Err(BackendError::Rollback { .. })));
    }

    #[test]
    fn test_injected_failure_is_returned_once() {
        let tm = InMemoryTransactionManager::new();
        tm.inject_commit_failure(BackendError::HeuristicMixed("disk".into()));
        tm.begin().unwrap();
        assert!(matches!(tm.commit(), Err(BackendError::HeuristicMixed(_))));

        tm.begin().unwrap();
        assert!(tm.commit().is_ok());
    }

    #[test]
    fn test_factory_connections() {
        let factory = InMemoryTransactionFactory::new();
        assert_eq!(factory.name(), IN_MEMORY_BACKEND);
        let conn = factory.connection("main").unwrap();
        assert_eq!(conn.datasource(), "main");
        assert!(conn.transaction().is_none());
        assert_eq!(factory.connections_opened("main"), 1);
        assert!(factory.connection("").is_err());
    }
}
