//! Units of work run inside (or outside) a transaction.
//!
//! Each helper guarantees its cleanup (commit, rollback or resume) on every
//! exit path, including a panic in the work itself, which is re-raised after
//! cleanup.

use std::any::Any;
use std::error::Error as StdError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use super::session::TransactionSession;
use crate::domain::{BackendError, CoordinatorError, ErrorKind, ErrorSource};

/// Error type returned by units of work.
pub type WorkError = Box<dyn StdError + Send + Sync + 'static>;

/// Strip coordinator and backend wrappers down to the innermost owned cause.
///
/// Only those two wrapper types are unwrapped. A foreign error is returned as
/// is even when its own `source()` chain goes deeper, because a cause reached
/// through `&dyn Error` cannot be owned.
fn root_cause(err: WorkError) -> ErrorSource {
    let mut current: ErrorSource = Arc::from(err);
    loop {
        let next = if let Some(wrapped) = current.downcast_ref::<CoordinatorError>() {
            wrapped.source_error().cloned()
        } else if let Some(BackendError::Rollback { cause, .. }) =
            current.downcast_ref::<BackendError>()
        {
            cause.clone()
        } else {
            None
        };
        match next {
            Some(inner) => current = inner,
            None => return current,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unit of work panicked".to_string()
    }
}

fn work_failed(error_message: &str, root: ErrorSource) -> CoordinatorError {
    CoordinatorError::new(ErrorKind::WorkFailed, format!("{}: {}", error_message, root))
        .caused_by(root)
}

impl TransactionSession {
    /// Run `work` in a transaction, beginning one if none is in place.
    ///
    /// On success the transaction is committed if this call began it. On
    /// failure it is rolled back if this call began it, otherwise marked
    /// rollback-only with `error_message`; the work's root cause is returned
    /// wrapped in a `WorkFailed` error. A cleanup failure after a work
    /// failure is logged, never returned in its place.
    #[track_caller]
    pub fn run_in_transaction<T, F>(
        &mut self,
        work: F,
        error_message: &str,
        timeout_secs: u32,
        print_error: bool,
    ) -> Result<T, CoordinatorError>
    where
        F: FnOnce(&mut TransactionSession) -> Result<T, WorkError>,
    {
        let began = self.begin(timeout_secs)?;

        match panic::catch_unwind(AssertUnwindSafe(|| work(self))) {
            Ok(Ok(value)) => {
                self.commit_if_began(began)?;
                Ok(value)
            }
            Ok(Err(err)) => {
                let root = root_cause(err);
                if print_error {
                    error!(error = %root, "{}", error_message);
                }
                if let Err(cleanup) =
                    self.rollback_if_began(began, error_message, Some(Arc::clone(&root)))
                {
                    error!(error = %cleanup, "Cleanup after failed unit of work also failed");
                }
                Err(work_failed(error_message, root))
            }
            Err(payload) => {
                let message = format!("{}: {}", error_message, panic_message(payload.as_ref()));
                error!(panic = %message, "Unit of work panicked");
                if let Err(cleanup) = self.rollback_if_began(began, &message, None) {
                    error!(error = %cleanup, "Cleanup after panicked unit of work also failed");
                }
                panic::resume_unwind(payload)
            }
        }
    }

    /// Run `work` with this thread's transaction suspended, resuming it on
    /// every exit path.
    #[track_caller]
    pub fn run_outside_transaction<T, F>(&mut self, work: F) -> Result<T, CoordinatorError>
    where
        F: FnOnce(&mut TransactionSession) -> Result<T, WorkError>,
    {
        let suspended = self.suspend()?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(self)));
        let resumed = self.resume(suspended);

        match outcome {
            Ok(Ok(value)) => {
                resumed?;
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(e) = resumed {
                    error!(error = %e, "Could not resume transaction after failed work");
                }
                Err(work_failed("Error running outside transaction", root_cause(err)))
            }
            Err(payload) => {
                if let Err(e) = resumed {
                    error!(error = %e, "Could not resume transaction after panicked work");
                }
                panic::resume_unwind(payload)
            }
        }
    }

    /// Run `work` in a fresh transaction, suspending (and afterwards
    /// resuming) any transaction already in place.
    #[track_caller]
    pub fn run_in_new_transaction<T, F>(
        &mut self,
        work: F,
        error_message: &str,
        timeout_secs: u32,
        print_error: bool,
    ) -> Result<T, CoordinatorError>
    where
        F: FnOnce(&mut TransactionSession) -> Result<T, WorkError>,
    {
        let suspended = self.suspend()?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_in_transaction(work, error_message, timeout_secs, print_error)
        }));
        let resumed = self.resume(suspended);

        match outcome {
            Ok(Ok(value)) => {
                resumed?;
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(e) = resumed {
                    error!(error = %e, "Could not resume outer transaction");
                }
                Err(err)
            }
            Err(payload) => {
                if let Err(e) = resumed {
                    error!(error = %e, "Could not resume outer transaction after panic");
                }
                panic::resume_unwind(payload)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryTransactionFactory;
    use crate::config::CoordinatorConfig;
    use crate::coordinator::TransactionCoordinator;
    use crate::domain::{Status, XaError};

    fn coordinator() -> Arc<TransactionCoordinator> {
        Arc::new(TransactionCoordinator::with_factory(
            CoordinatorConfig::default(),
            Arc::new(InMemoryTransactionFactory::new()),
        ))
    }

    #[test]
    fn test_root_cause_unwraps_coordinator_layers() {
        let original: ErrorSource = Arc::new(XaError::ResourceManager("disk".into()));
        let inner = CoordinatorError::new(ErrorKind::System, "inner").caused_by(Arc::clone(&original));
        let outer = CoordinatorError::new(ErrorKind::WorkFailed, "outer").caused_by(Arc::new(inner));

        let root = root_cause(Box::new(outer));
        assert!(Arc::ptr_eq(&root, &original));
    }

    #[test]
    fn test_root_cause_keeps_foreign_error() {
        let err: WorkError = "plain failure".into();
        assert_eq!(root_cause(err).to_string(), "plain failure");
    }

    #[test]
    fn test_root_cause_stops_at_foreign_wrapper() {
        let wrapped = std::io::Error::other(XaError::ResourceManager("disk".into()));
        let outer = CoordinatorError::new(ErrorKind::System, "outer").caused_by(Arc::new(wrapped));

        let root = root_cause(Box::new(outer));
        assert!(root.downcast_ref::<std::io::Error>().is_some());
        assert!(root.source().is_some());
    }

    #[test]
    fn test_inner_failure_marks_outer_rollback_only() {
        let coordinator = coordinator();
        let mut session = coordinator.session().unwrap();
        assert!(session.begin(0).unwrap());

        let result: Result<(), _> = session.run_in_transaction(
            |_| Err("constraint violated".into()),
            "inner step failed",
            0,
            false,
        );
        assert_eq!(result.unwrap_err().kind(), ErrorKind::WorkFailed);
        assert_eq!(session.status().unwrap(), Status::MarkedRollback);
        assert_eq!(session.rollback_cause().unwrap().message(), "inner step failed");
        session.rollback().unwrap();
    }

    #[test]
    fn test_panicking_work_rolls_back_and_propagates() {
        let coordinator = coordinator();
        let mut session = coordinator.session().unwrap();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let _: Result<(), _> =
                session.run_in_transaction(|_| panic!("boom"), "panicking work", 0, false);
        }));
        assert!(outcome.is_err());
        assert_eq!(session.status().unwrap(), Status::NoTransaction);
    }

    #[test]
    fn test_run_outside_resumes_after_failure() {
        let coordinator = coordinator();
        let mut session = coordinator.session().unwrap();
        session.begin(0).unwrap();
        let outer = session.current_transaction().unwrap();

        let result: Result<(), _> = session.run_outside_transaction(|inner| {
            assert_eq!(inner.status().unwrap(), Status::NoTransaction);
            Err("outside work failed".into())
        });
        assert!(result.is_err());
        assert_eq!(session.current_transaction().unwrap(), outer);
        assert_eq!(session.suspended_count(), 0);
        session.commit().unwrap();
    }

    #[test]
    fn test_run_in_new_transaction_commits_independently() {
        let coordinator = coordinator();
        let mut session = coordinator.session().unwrap();
        session.begin(0).unwrap();
        let outer = session.current_transaction().unwrap();

        let inner = session
            .run_in_new_transaction(
                |s| Ok(s.current_transaction()?),
                "independent work failed",
                0,
                false,
            )
            .unwrap();
        assert_ne!(inner, outer);
        assert_eq!(session.current_transaction().unwrap(), outer);
        assert_eq!(session.status().unwrap(), Status::Active);
        session.commit().unwrap();
    }
}
