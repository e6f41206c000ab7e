//! Thread-confined transaction session.
//!
//! A [`TransactionSession`] owns the calling thread's
//! [`ThreadTransactionContext`] and carries every per-thread coordinator
//! operation. Sessions are `!Send`: the backend associates transactions
//! with threads, so the bookkeeping must never move to another one.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::TransactionCoordinator;
use crate::domain::{
    BackendError, CaptureSnapshot, CoordinatorError, DiagnosticCapture, ErrorKind, ErrorSource,
    RollbackCause, SavedMarkers, Status, SuspendedFrame, ThreadTransactionContext,
    TransactionHandle,
};
use crate::participant::{DebugParticipant, TimeoutCallback, TimeoutMonitor};
use crate::ports::{Synchronization, TransactionManager, UserTransaction, XaResource};

struct Backend {
    user_transaction: Arc<dyn UserTransaction>,
    manager: Arc<dyn TransactionManager>,
}

/// Clears the session's stamps when the transaction completes.
struct StampClearSync {
    stale: Arc<AtomicBool>,
}

impl Synchronization for StampClearSync {
    fn after_completion(&self, _status: Status) {
        self.stale.store(true, Ordering::Release);
    }
}

/// A suspended transaction as listed for operators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendedTransactionInfo {
    /// Backend handle.
    pub handle: TransactionHandle,
    /// Where it was suspended.
    pub suspended_at: CaptureSnapshot,
    /// Its start stamp, if one was taken.
    pub start_stamp: Option<DateTime<Utc>>,
}

/// Map a backend failure onto the coordinator taxonomy.
fn classify(err: BackendError, message: &str) -> CoordinatorError {
    let kind = match &err {
        BackendError::Rollback { .. } => ErrorKind::Rollback,
        BackendError::IllegalState(_) => ErrorKind::IllegalState,
        BackendError::HeuristicMixed(_) => ErrorKind::HeuristicMixed,
        BackendError::HeuristicRollback(_) => ErrorKind::HeuristicRollback,
        BackendError::NotSupported(_)
        | BackendError::System(_)
        | BackendError::InvalidTransaction(_)
        | BackendError::Resource(_) => ErrorKind::System,
    };
    let message = format!("{}: {}", message, err);
    CoordinatorError::new(kind, message).caused_by(err.into_root_cause())
}

/// Per-thread handle on the coordinator.
pub struct TransactionSession {
    coordinator: Arc<TransactionCoordinator>,
    context: ThreadTransactionContext,
    stamps_stale: Arc<AtomicBool>,
    thread_id: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl TransactionSession {
    pub(super) fn new(coordinator: Arc<TransactionCoordinator>, thread_id: ThreadId) -> Self {
        Self {
            coordinator,
            context: ThreadTransactionContext::new(),
            stamps_stale: Arc::new(AtomicBool::new(false)),
            thread_id,
            _not_send: PhantomData,
        }
    }

    /// Coordinator this session belongs to.
    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    /// Backend as currently resolved by the locator.
    ///
    /// Resolved on every call so a backend shut down and replaced through the
    /// locator is picked up by sessions that are already open.
    fn backend(&self) -> Result<Option<Backend>, CoordinatorError> {
        let Some(locator) = self.coordinator.locator() else {
            return Ok(None);
        };
        let factory = locator.resolve()?;
        Ok(Some(Backend {
            user_transaction: factory.user_transaction(),
            manager: factory.manager(),
        }))
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    /// Status of this thread's transaction; `NoTransaction` without a backend.
    pub fn status(&mut self) -> Result<Status, CoordinatorError> {
        let Some(backend) = self.backend()? else {
            return Ok(Status::NoTransaction);
        };
        backend
            .user_transaction
            .status()
            .map_err(|e| CoordinatorError::system("System error, could not get status", e))
    }

    /// Human-readable [`status`](Self::status).
    pub fn status_string(&mut self) -> Result<String, CoordinatorError> {
        Ok(self.status()?.describe().to_string())
    }

    /// Whether any transaction is associated with this thread.
    pub fn is_transaction_in_place(&mut self) -> Result<bool, CoordinatorError> {
        Ok(self.status()? != Status::NoTransaction)
    }

    /// Backend handle of this thread's transaction.
    pub fn current_transaction(&mut self) -> Result<Option<TransactionHandle>, CoordinatorError> {
        let Some(backend) = self.backend()? else {
            return Ok(None);
        };
        backend
            .manager
            .transaction()
            .map_err(|e| CoordinatorError::system("System error, could not get transaction", e))
    }

    /// Where the active transaction was begun, if this coordinator began it.
    pub fn begin_marker(&self) -> Option<&DiagnosticCapture> {
        self.context.begin_marker()
    }

    /// Why the active transaction was marked rollback-only, if recorded.
    pub fn rollback_cause(&self) -> Option<&RollbackCause> {
        self.context.rollback_cause()
    }

    // -------------------------------------------------------------------------
    // Begin / commit / rollback
    // -------------------------------------------------------------------------

    /// Begin a transaction unless one is already in place.
    ///
    /// Returns true only when this call began a transaction; pass that value
    /// to [`commit_if_began`](Self::commit_if_began) and
    /// [`rollback_if_began`](Self::rollback_if_began). A `timeout_secs` of 0
    /// uses the configured default.
    #[track_caller]
    pub fn begin(&mut self, timeout_secs: u32) -> Result<bool, CoordinatorError> {
        let Some(backend) = self.backend()? else {
            debug!("No transaction backend, not beginning a transaction");
            return Ok(false);
        };

        match self.status()? {
            Status::Active => {
                debug!("Active transaction in place, so no transaction begun");
                return Ok(false);
            }
            Status::MarkedRollback => {
                if let Some(cause) = self.context.rollback_cause().filter(|c| !c.is_empty()) {
                    return Err(CoordinatorError::new(
                        ErrorKind::RollbackOnly,
                        format!(
                            "The current transaction is marked for rollback, not beginning a new transaction; rollback-only was caused by: {}",
                            cause.message()
                        ),
                    )
                    .maybe_caused_by(cause.source().cloned()));
                }
                debug!("Transaction marked for rollback without a recorded cause, not beginning");
                return Ok(false);
            }
            _ => {}
        }

        let timeout = if timeout_secs > 0 {
            timeout_secs
        } else {
            self.coordinator.config().default_timeout_secs
        };

        if timeout > 0 {
            backend
                .user_transaction
                .set_transaction_timeout(timeout)
                .map_err(|e| {
                    CoordinatorError::system("System error, could not set transaction timeout", e)
                })?;
        }
        let began = backend.user_transaction.begin();
        if timeout > 0 {
            if let Err(e) = backend.user_transaction.set_transaction_timeout(0) {
                warn!(error = %e, "Could not reset transaction timeout to default");
            }
        }
        began.map_err(|e| match e {
            BackendError::NotSupported(_) => CoordinatorError::new(
                ErrorKind::Nesting,
                format!("Nested transaction not supported: {}", e),
            )
            .caused_by(Arc::new(e)),
            other => CoordinatorError::system("System error, could not begin transaction", other),
        })?;

        self.clear_stamps();
        if let Some(previous) = self.context.set_begin_marker(DiagnosticCapture::here("begin")) {
            warn!(previous = %previous, "Begin marker already set; replacing it");
        }
        self.publish_begin_stack();
        self.transaction_start_stamp()?;

        if self.coordinator.config().debug_resources {
            let participant = DebugParticipant::new("begin");
            match self.enlist_resource(participant.clone()) {
                Ok(true) => {
                    participant.register();
                }
                Ok(false) => debug!("Debug participant not enlisted"),
                Err(e) => error!(error = %e, "Could not enlist debug participant"),
            }
        }

        debug!(timeout_secs = timeout, "Transaction begun");
        Ok(true)
    }

    /// Commit only if `began` (the value returned by [`begin`](Self::begin)).
    pub fn commit_if_began(&mut self, began: bool) -> Result<(), CoordinatorError> {
        if began {
            self.commit()
        } else {
            Ok(())
        }
    }

    /// Commit this thread's transaction.
    ///
    /// No-op when there is no transaction or it is already completing.
    pub fn commit(&mut self) -> Result<(), CoordinatorError> {
        let Some(backend) = self.backend()? else {
            return Ok(());
        };

        let status = self.status()?;
        if status.is_completing_or_done() {
            debug!(status = %status, "Not committing, transaction already completing or absent");
            return Ok(());
        }

        match backend.user_transaction.commit() {
            Ok(()) => {
                self.clear_completed();
                debug!("Transaction committed");
                Ok(())
            }
            Err(e @ BackendError::Rollback { .. }) => {
                let cause = self.context.rollback_cause().cloned();
                self.clear_completed();
                match cause {
                    Some(cause) => Err(CoordinatorError::new(
                        ErrorKind::RollbackOnly,
                        format!(
                            "The current transaction is marked for rollback, not committing; rollback-only was caused by: {}",
                            cause.message()
                        ),
                    )
                    .maybe_caused_by(cause.source().cloned())),
                    None => Err(classify(
                        e,
                        "Roll back error (no rollback-only cause recorded), could not commit transaction, was rolled back instead",
                    )),
                }
            }
            Err(e) => {
                let err = classify(e, "Could not commit transaction");
                // Heuristic outcomes end the transaction; an illegal state may not.
                if matches!(self.status(), Ok(Status::NoTransaction)) {
                    self.clear_completed();
                }
                Err(err)
            }
        }
    }

    /// Roll back if `began`; otherwise mark the transaction rollback-only
    /// with the given cause.
    #[track_caller]
    pub fn rollback_if_began(
        &mut self,
        began: bool,
        cause_message: &str,
        cause: Option<ErrorSource>,
    ) -> Result<(), CoordinatorError> {
        if began {
            self.rollback()
        } else {
            self.set_rollback_only(cause_message, cause)
        }
    }

    /// Roll back this thread's transaction. No-op when there is none.
    pub fn rollback(&mut self) -> Result<(), CoordinatorError> {
        let Some(backend) = self.backend()? else {
            return Ok(());
        };

        if self.status()? == Status::NoTransaction {
            info!("No transaction in place, not rolling back");
            return Ok(());
        }

        self.clear_completed();
        backend.user_transaction.rollback().map_err(|e| {
            classify(e, "Could not roll back transaction")
        })?;
        debug!("Transaction rolled back");
        Ok(())
    }

    /// Mark this thread's transaction rollback-only and record why.
    ///
    /// A cause recorded earlier for the same transaction is replaced (with a
    /// warning).
    #[track_caller]
    pub fn set_rollback_only(
        &mut self,
        cause_message: &str,
        cause: Option<ErrorSource>,
    ) -> Result<(), CoordinatorError> {
        let Some(backend) = self.backend()? else {
            return Ok(());
        };

        match self.status()? {
            Status::NoTransaction => {
                info!(cause = cause_message, "No transaction in place, not setting rollback-only");
                Ok(())
            }
            Status::MarkedRollback => {
                info!(cause = cause_message, "Transaction rollback-only already set, not setting again");
                Ok(())
            }
            _ => {
                let new_cause = RollbackCause::new(cause_message, cause);
                if let Some(previous) = self.context.set_rollback_cause(new_cause) {
                    warn!(
                        previous = %previous,
                        previous_at = %previous.captured(),
                        current = cause_message,
                        "Rollback-only cause already set; the new cause replaces it"
                    );
                }
                backend.user_transaction.set_rollback_only().map_err(|e| {
                    CoordinatorError::system("System error, could not set rollback-only", e)
                })?;
                debug!(cause = cause_message, "Transaction marked rollback-only");
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Suspend / resume
    // -------------------------------------------------------------------------

    /// Detach this thread's transaction. `None` when there was nothing to suspend.
    #[track_caller]
    pub fn suspend(&mut self) -> Result<Option<TransactionHandle>, CoordinatorError> {
        let Some(backend) = self.backend()? else {
            return Ok(None);
        };

        if self.status()? == Status::NoTransaction {
            warn!("No transaction in place, so not suspending");
            return Ok(None);
        }

        let handle = match backend.manager.suspend() {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                warn!("Backend had no transaction to suspend");
                return Ok(None);
            }
            Err(e) => {
                return Err(CoordinatorError::system(
                    "System error, could not suspend transaction",
                    e,
                ));
            }
        };

        let markers = self.context.take_active_markers();
        self.context.push_frame(SuspendedFrame {
            handle,
            suspended_at: DiagnosticCapture::here("suspend"),
            start_stamp: self.context.start_stamp(),
            markers,
        });
        self.context.set_start_stamp(None);
        self.publish_begin_stack();
        debug!(transaction = %handle, depth = self.context.suspended_count(), "Transaction suspended");
        Ok(Some(handle))
    }

    /// Re-attach a transaction detached by [`suspend`](Self::suspend).
    ///
    /// `None` is a no-op, so the result of `suspend` can be passed straight in.
    /// When the backend refuses, the session is left exactly as it was: the
    /// frame stays suspended and the active transaction keeps its markers.
    pub fn resume(&mut self, handle: Option<TransactionHandle>) -> Result<(), CoordinatorError> {
        let Some(handle) = handle else {
            return Ok(());
        };
        let Some(backend) = self.backend()? else {
            return Ok(());
        };

        if !self.context.frames().any(|f| f.handle == handle) {
            warn!(transaction = %handle, "Resuming a transaction this session did not suspend");
        }

        if let Err(e) = backend.manager.resume(&handle) {
            let message = match &e {
                BackendError::InvalidTransaction(_) => {
                    "System error, could not resume invalid transaction"
                }
                _ => "System error, could not resume transaction",
            };
            return Err(CoordinatorError::system(message, e));
        }

        if let Some(frame) = self.context.remove_frame(&handle) {
            self.context.restore_active_markers(frame.markers);
            self.context.set_start_stamp(frame.start_stamp);
        }
        self.stamps_stale.store(false, Ordering::Release);
        self.publish_begin_stack();
        debug!(transaction = %handle, depth = self.context.suspended_count(), "Transaction resumed");
        Ok(())
    }

    /// Resume the most recently suspended transaction, whatever its handle.
    pub fn pop_and_resume(&mut self) -> Result<Option<TransactionHandle>, CoordinatorError> {
        let Some(handle) = self.context.frames().next().map(|f| f.handle) else {
            return Ok(None);
        };
        self.resume(Some(handle))?;
        Ok(Some(handle))
    }

    /// Resume and roll back every suspended transaction of this thread.
    ///
    /// Emergency cleanup. A transaction active on the thread is set aside for
    /// the duration and re-attached afterwards with its begin marker, rollback
    /// cause and start stamp intact. Frames the backend refuses to resume stay
    /// suspended so they can still be listed and retried. Returns how many
    /// suspended transactions were actually rolled back.
    pub fn clean_suspended_transactions(&mut self) -> usize {
        if self.context.suspended_count() == 0 {
            return 0;
        }
        let backend = match self.backend() {
            Ok(Some(backend)) => backend,
            Ok(None) => return 0,
            Err(e) => {
                error!(error = %e, "No backend while cleaning suspended transactions");
                return 0;
            }
        };

        let active = match backend.manager.suspend() {
            Ok(active) => active,
            Err(e) => {
                error!(error = %e, "Could not set the active transaction aside, not cleaning suspended transactions");
                return 0;
            }
        };
        let active_markers = self.context.take_active_markers();
        let active_stamp = self.context.start_stamp();

        let mut drained = 0;
        let mut kept = Vec::new();
        for frame in self.context.take_frames() {
            if let Err(e) = backend.manager.resume(&frame.handle) {
                error!(transaction = %frame.handle, error = %e, "Could not resume suspended transaction for rollback");
                kept.push(frame);
                continue;
            }
            match backend.user_transaction.rollback() {
                Ok(()) => drained += 1,
                Err(e) => {
                    error!(transaction = %frame.handle, error = %e, "Could not roll back suspended transaction")
                }
            }
        }
        for frame in kept.into_iter().rev() {
            self.context.push_frame(frame);
        }

        self.restore_after_drain(&backend, active, active_markers, active_stamp);
        self.publish_begin_stack();
        if drained > 0 {
            warn!(drained, left = self.context.suspended_count(), "Rolled back suspended transactions");
        }
        drained
    }

    fn restore_after_drain(
        &mut self,
        backend: &Backend,
        active: Option<TransactionHandle>,
        markers: SavedMarkers,
        start_stamp: Option<DateTime<Utc>>,
    ) {
        // Completion callbacks of the drained transactions flag the stamps stale.
        self.stamps_stale.store(false, Ordering::Release);
        let Some(handle) = active else {
            self.context.clear_stamps();
            return;
        };
        if let Err(e) = backend.manager.resume(&handle) {
            error!(transaction = %handle, error = %e, "Could not re-attach the active transaction after cleaning");
        }
        self.context.restore_active_markers(markers);
        self.context.set_start_stamp(start_stamp);
    }

    /// This thread's suspended transactions, newest first; also logged.
    pub fn list_suspended_transactions(&self) -> Vec<SuspendedTransactionInfo> {
        let list: Vec<SuspendedTransactionInfo> = self
            .context
            .frames()
            .map(|frame| SuspendedTransactionInfo {
                handle: frame.handle,
                suspended_at: frame.suspended_at.snapshot(),
                start_stamp: frame.start_stamp,
            })
            .collect();
        for (depth, info) in list.iter().enumerate() {
            info!(depth, transaction = %info.handle, suspended_at = %info.suspended_at.location, "Suspended transaction");
        }
        list
    }

    /// Number of suspended transactions held by this session.
    pub fn suspended_count(&self) -> usize {
        self.context.suspended_count()
    }

    // -------------------------------------------------------------------------
    // Enlistment
    // -------------------------------------------------------------------------

    /// Enlist `resource` in the active transaction.
    ///
    /// Returns false (and does nothing) unless a transaction is Active.
    pub fn enlist_resource(
        &mut self,
        resource: Arc<dyn XaResource>,
    ) -> Result<bool, CoordinatorError> {
        let Some((backend, handle)) = self.active_transaction()? else {
            return Ok(false);
        };
        backend
            .manager
            .enlist_resource(&handle, resource)
            .map_err(|e| classify(e, "Could not enlist resource in transaction"))
    }

    /// Register `sync` on the active transaction.
    ///
    /// Returns false (and does nothing) unless a transaction is Active.
    pub fn register_synchronization(
        &mut self,
        sync: Arc<dyn Synchronization>,
    ) -> Result<bool, CoordinatorError> {
        let Some((backend, handle)) = self.active_transaction()? else {
            return Ok(false);
        };
        backend
            .manager
            .register_synchronization(&handle, sync)
            .map_err(|e| classify(e, "Could not register synchronization in transaction"))?;
        Ok(true)
    }

    /// Enlist a [`TimeoutMonitor`] on the active transaction.
    ///
    /// `None` when there is no active transaction to watch.
    pub fn enlist_timeout_monitor(
        &mut self,
        timeout_secs: u32,
        run_on_timeout: Option<TimeoutCallback>,
    ) -> Result<Option<Arc<TimeoutMonitor>>, CoordinatorError> {
        let Some((backend, handle)) = self.active_transaction()? else {
            return Ok(None);
        };
        let monitor = match run_on_timeout {
            Some(callback) => {
                TimeoutMonitor::with_callback(backend.manager, handle, timeout_secs, callback)
            }
            None => TimeoutMonitor::new(backend.manager, handle, timeout_secs),
        };
        if self.enlist_resource(monitor.clone())? {
            Ok(Some(monitor))
        } else {
            Ok(None)
        }
    }

    fn active_transaction(
        &mut self,
    ) -> Result<Option<(Backend, TransactionHandle)>, CoordinatorError> {
        let Some(backend) = self.backend()? else {
            return Ok(None);
        };
        if self.status()? != Status::Active {
            debug!("No active transaction, not enlisting");
            return Ok(None);
        }
        match self.current_transaction()? {
            Some(handle) => Ok(Some((backend, handle))),
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Stamps
    // -------------------------------------------------------------------------

    /// Start stamp of the active transaction, taken on first access.
    ///
    /// The first access also registers a synchronization that clears the
    /// stamps when the transaction completes.
    pub fn transaction_start_stamp(&mut self) -> Result<DateTime<Utc>, CoordinatorError> {
        self.refresh_stamps();
        if let Some(stamp) = self.context.start_stamp() {
            return Ok(stamp);
        }

        let stamp = Utc::now().trunc_subsecs(3);
        self.context.set_start_stamp(Some(stamp));
        let sync = Arc::new(StampClearSync {
            stale: Arc::clone(&self.stamps_stale),
        });
        if let Err(e) = self.register_synchronization(sync) {
            error!(error = %e, "Could not register stamp clearing synchronization");
        }
        Ok(stamp)
    }

    /// A stamp strictly greater than every stamp this call returned before
    /// in the current transaction context.
    pub fn unique_now_stamp(&mut self) -> DateTime<Utc> {
        self.refresh_stamps();
        self.context.next_unique_stamp(Utc::now())
    }

    fn refresh_stamps(&mut self) {
        if self.stamps_stale.swap(false, Ordering::AcqRel) {
            self.context.clear_stamps();
        }
    }

    fn clear_stamps(&mut self) {
        self.context.clear_stamps();
        self.stamps_stale.store(false, Ordering::Release);
    }

    // -------------------------------------------------------------------------
    // Bookkeeping
    // -------------------------------------------------------------------------

    /// Forget everything about the transaction that just completed.
    fn clear_completed(&mut self) {
        if self.context.take_begin_marker().is_none() {
            warn!("Clearing begin marker, but none was set");
        }
        self.context.take_rollback_cause();
        self.clear_stamps();
        self.publish_begin_stack();
    }

    fn publish_begin_stack(&self) {
        let (current, saved) = self.context.begin_marker_snapshots();
        self.coordinator
            .publish_begin_stack(self.thread_id, current, saved);
    }
}

impl Drop for TransactionSession {
    fn drop(&mut self) {
        let suspended = self.context.suspended_count();
        if suspended > 0 {
            warn!(suspended, "Session closed with suspended transactions");
        }
        self.coordinator.release_session(self.thread_id);
    }
}
