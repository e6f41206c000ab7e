//! # Timeout Monitor
//!
//! Participant that warns (and runs a corrective callback) when the
//! transaction it is enlisted in is still active after its budget.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use tracing::{error, warn};

use super::runtime::{Participant, ParticipantRuntime};
use super::timeout_watch::TimeoutTarget;
use crate::domain::{Status, TransactionHandle, XaError, Xid};
use crate::ports::TransactionManager;

/// Corrective action run when the deadline passes.
pub type TimeoutCallback = Box<dyn Fn(&Xid) + Send + Sync>;

/// Participant watching one transaction's time budget.
pub struct TimeoutMonitor {
    runtime: ParticipantRuntime,
    manager: Arc<dyn TransactionManager>,
    transaction: TransactionHandle,
    run_on_timeout: TimeoutCallback,
    fired: AtomicUsize,
}

impl TimeoutMonitor {
    /// Monitor `transaction` with a budget of `timeout_secs` and no callback.
    pub fn new(
        manager: Arc<dyn TransactionManager>,
        transaction: TransactionHandle,
        timeout_secs: u32,
    ) -> Arc<Self> {
        Self::with_callback(manager, transaction, timeout_secs, Box::new(|_| {}))
    }

    /// Monitor `transaction`, running `run_on_timeout` when the budget is exceeded.
    pub fn with_callback(
        manager: Arc<dyn TransactionManager>,
        transaction: TransactionHandle,
        timeout_secs: u32,
        run_on_timeout: TimeoutCallback,
    ) -> Arc<Self> {
        let monitor = Arc::new_cyclic(|weak: &Weak<Self>| {
            let target: Weak<dyn TimeoutTarget> = weak.clone();
            Self {
                runtime: ParticipantRuntime::new(target),
                manager,
                transaction,
                run_on_timeout,
                fired: AtomicUsize::new(0),
            }
        });
        // Always succeeds.
        let _ = monitor.runtime.set_transaction_timeout(timeout_secs);
        monitor
    }

    /// Transaction being watched.
    pub fn transaction(&self) -> TransactionHandle {
        self.transaction
    }

    /// How many times the timeout fired (0 or 1).
    pub fn timeouts_fired(&self) -> usize {
        self.fired.load(Ordering::Acquire)
    }
}

impl Participant for TimeoutMonitor {
    fn runtime(&self) -> &ParticipantRuntime {
        &self.runtime
    }

    fn commit_branch(&self, xid: &Xid, _one_phase: bool) -> Result<(), XaError> {
        self.runtime.complete(xid)
    }

    fn rollback_branch(&self, xid: &Xid) -> Result<(), XaError> {
        self.runtime.complete(xid)
    }

    fn on_timeout(&self, xid: &Xid) {
        self.fired.fetch_add(1, Ordering::AcqRel);

        let status = match self.manager.transaction_status(&self.transaction) {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, transaction = %self.transaction, "Could not read status of timed out transaction");
                Status::Unknown
            }
        };

        warn!(
            timeout = self.runtime.transaction_timeout(),
            status = status.describe(),
            xid = %xid,
            transaction = %self.transaction,
            "Transaction timeout"
        );

        if panic::catch_unwind(AssertUnwindSafe(|| (self.run_on_timeout)(xid))).is_err() {
            error!(xid = %xid, "Timeout callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryTransactionManager;
    use crate::domain::{ParticipantState, XA_TMNOFLAGS, XA_TMSUCCESS};
    use crate::ports::XaResource;
    use std::thread;
    use std::time::Duration;

    fn manager() -> Arc<InMemoryTransactionManager> {
        Arc::new(InMemoryTransactionManager::new())
    }

    #[test]
    fn test_fires_callback_once_after_deadline() {
        let manager = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_callback = Arc::clone(&calls);
        let monitor = TimeoutMonitor::with_callback(
            manager,
            TransactionHandle::new(),
            1,
            Box::new(move |_| {
                calls_in_callback.fetch_add(1, Ordering::SeqCst);
            }),
        );
        monitor.runtime().set_timeout_unit(Duration::from_millis(20));

        let xid = Xid::generate();
        monitor.start(&xid, XA_TMNOFLAGS).unwrap();
        thread::sleep(Duration::from_millis(250));

        assert_eq!(monitor.timeouts_fired(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.runtime().state(), ParticipantState::Active);
        assert_eq!(monitor.recover(0).unwrap(), vec![xid]);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let monitor = TimeoutMonitor::with_callback(
            manager(),
            TransactionHandle::new(),
            1,
            Box::new(|_| panic!("corrective action failed")),
        );
        monitor.runtime().set_timeout_unit(Duration::from_millis(10));
        monitor.start(&Xid::generate(), XA_TMNOFLAGS).unwrap();
        thread::sleep(Duration::from_millis(200));

        assert_eq!(monitor.timeouts_fired(), 1);
    }

    #[test]
    fn test_completed_before_deadline_never_fires() {
        let monitor = TimeoutMonitor::new(manager(), TransactionHandle::new(), 1);
        monitor.runtime().set_timeout_unit(Duration::from_millis(60));

        let xid = Xid::generate();
        monitor.start(&xid, XA_TMNOFLAGS).unwrap();
        monitor.end(&xid, XA_TMSUCCESS).unwrap();
        monitor.commit(&xid, true).unwrap();
        thread::sleep(Duration::from_millis(200));

        assert_eq!(monitor.timeouts_fired(), 0);
        assert_eq!(monitor.runtime().state(), ParticipantState::Completed);
    }

    #[test]
    fn test_commit_with_foreign_id_fails() {
        let monitor = TimeoutMonitor::new(manager(), TransactionHandle::new(), 0);
        monitor.start(&Xid::generate(), XA_TMNOFLAGS).unwrap();
        assert!(matches!(
            monitor.commit(&Xid::generate(), true),
            Err(XaError::NoSuchTransaction(_))
        ));
    }
}
