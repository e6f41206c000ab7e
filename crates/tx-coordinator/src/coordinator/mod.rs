//! # Transaction Coordinator
//!
//! The shared coordinator owns the backend handle and configuration and
//! hands out one [`TransactionSession`] per worker thread. Every per-thread
//! operation (begin, commit, suspend, ...) lives on the session; the
//! coordinator itself keeps only read-mostly cross-thread diagnostics.
//!
//! ```text
//!   Arc<TransactionCoordinator> ── session() ──► TransactionSession (!Send)
//!          │                                          │
//!          ├── BackendLocator ◄──────────── resolve ──┘
//!          └── begin stacks (ThreadId → ThreadBeginStack)
//! ```

mod session;
mod unit_of_work;

pub use session::{SuspendedTransactionInfo, TransactionSession};
pub use unit_of_work::WorkError;

use std::sync::Arc;
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::CoordinatorConfig;
use crate::domain::{CaptureSnapshot, CoordinatorError, ErrorKind};
use crate::locator::{BackendLocator, BackendRegistry};
use crate::ports::TransactionFactory;

lazy_static! {
    static ref GLOBAL_COORDINATOR: Arc<TransactionCoordinator> = Arc::new(
        TransactionCoordinator::with_locator(CoordinatorConfig::from_env(), BackendLocator::global())
    );
}

/// Begin markers of one thread, for cross-thread dumps.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadBeginStack {
    /// Thread name and id.
    pub thread: String,
    /// Marker of the transaction currently active on the thread.
    pub current: Option<CaptureSnapshot>,
    /// Markers of suspended transactions, newest first.
    pub saved: Vec<CaptureSnapshot>,
}

/// Process-level coordinator shared by all worker threads.
pub struct TransactionCoordinator {
    config: CoordinatorConfig,
    locator: Option<Arc<BackendLocator>>,
    begin_stacks: DashMap<ThreadId, ThreadBeginStack>,
}

impl TransactionCoordinator {
    /// Coordinator resolving the backend named in `config` from the default registry.
    pub fn new(config: CoordinatorConfig) -> Result<Self, CoordinatorError> {
        Self::with_registry(config, BackendRegistry::default())
    }

    /// Coordinator resolving the backend named in `config` from `registry`.
    pub fn with_registry(
        config: CoordinatorConfig,
        registry: BackendRegistry,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;
        let locator = Arc::new(BackendLocator::new(&config, registry));
        Ok(Self::with_locator(config, locator))
    }

    /// Coordinator sharing an existing locator.
    pub fn with_locator(config: CoordinatorConfig, locator: Arc<BackendLocator>) -> Self {
        Self {
            config,
            locator: Some(locator),
            begin_stacks: DashMap::new(),
        }
    }

    /// Coordinator over an already constructed backend.
    pub fn with_factory(config: CoordinatorConfig, factory: Arc<dyn TransactionFactory>) -> Self {
        Self::with_locator(config, Arc::new(BackendLocator::with_factory(factory)))
    }

    /// Coordinator with no backend: every operation is a no-op and status
    /// is always `NoTransaction`.
    pub fn without_backend(config: CoordinatorConfig) -> Self {
        Self {
            config,
            locator: None,
            begin_stacks: DashMap::new(),
        }
    }

    /// Process-wide coordinator configured from the environment.
    pub fn global() -> Arc<TransactionCoordinator> {
        Arc::clone(&GLOBAL_COORDINATOR)
    }

    /// Active configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Backend locator, when a backend is configured.
    pub fn locator(&self) -> Option<&Arc<BackendLocator>> {
        self.locator.as_ref()
    }

    /// Open a session for the calling thread.
    ///
    /// Fails with `IllegalState` when this thread already has an open session
    /// on this coordinator.
    pub fn session(self: &Arc<Self>) -> Result<TransactionSession, CoordinatorError> {
        let current = thread::current();
        let thread_id = current.id();
        let entry = ThreadBeginStack {
            thread: format!("{} ({:?})", current.name().unwrap_or("<unnamed>"), thread_id),
            ..Default::default()
        };

        match self.begin_stacks.entry(thread_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CoordinatorError::new(
                ErrorKind::IllegalState,
                "a transaction session is already open on this thread",
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(TransactionSession::new(Arc::clone(self), thread_id))
            }
        }
    }

    /// Number of threads with an open session.
    pub fn open_sessions(&self) -> usize {
        self.begin_stacks.len()
    }

    /// Snapshot of every thread's current and saved begin markers; also logged.
    pub fn dump_all_threads_begin_stacks(&self) -> Vec<ThreadBeginStack> {
        let stacks: Vec<ThreadBeginStack> = self
            .begin_stacks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for stack in &stacks {
            info!(
                thread = %stack.thread,
                current = ?stack.current.as_ref().map(|c| c.location.as_str()),
                suspended = stack.saved.len(),
                "Thread begin stack"
            );
            for (depth, saved) in stack.saved.iter().enumerate() {
                info!(thread = %stack.thread, depth, begun_at = %saved.location, "Suspended transaction begun");
            }
        }
        stacks
    }

    pub(crate) fn publish_begin_stack(
        &self,
        thread_id: ThreadId,
        current: Option<CaptureSnapshot>,
        saved: Vec<CaptureSnapshot>,
    ) {
        if let Some(mut entry) = self.begin_stacks.get_mut(&thread_id) {
            entry.current = current;
            entry.saved = saved;
        }
    }

    pub(crate) fn release_session(&self, thread_id: ThreadId) {
        self.begin_stacks.remove(&thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryTransactionFactory;

    fn coordinator() -> Arc<TransactionCoordinator> {
        Arc::new(TransactionCoordinator::with_factory(
            CoordinatorConfig::default(),
            Arc::new(InMemoryTransactionFactory::new()),
        ))
    }

    #[test]
    fn test_one_session_per_thread() {
        let coordinator = coordinator();
        let session = coordinator.session().unwrap();
        let err = coordinator.session().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::IllegalState);

        drop(session);
        assert_eq!(coordinator.open_sessions(), 0);
        assert!(coordinator.session().is_ok());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = CoordinatorConfig::default().with_backend("");
        let err = TransactionCoordinator::new(config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_dump_reports_each_thread() {
        let coordinator = coordinator();
        let mut session = coordinator.session().unwrap();
        session.begin(0).unwrap();

        let worker = Arc::clone(&coordinator);
        std::thread::spawn(move || {
            let mut session = worker.session().unwrap();
            session.begin(0).unwrap();
            let stacks = worker.dump_all_threads_begin_stacks();
            assert_eq!(stacks.len(), 2);
            assert!(stacks.iter().all(|s| s.current.is_some()));
            session.commit().unwrap();
        })
        .join()
        .unwrap();

        let stacks = coordinator.dump_all_threads_begin_stacks();
        assert_eq!(stacks.len(), 1);
        assert!(stacks[0].current.as_ref().unwrap().location.contains("mod.rs"));
        session.rollback().unwrap();
    }
}
