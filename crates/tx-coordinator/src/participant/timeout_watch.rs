//! Deferred, cancellable timeout check for one participant enlistment.
//!
//! The watch owns no protocol state. It sleeps on a condvar until either the
//! deadline passes or it is cancelled, then reads the participant's liveness
//! flag and, if the participant is still active, calls the timeout target once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use crate::domain::Xid;

/// Receiver of a fired timeout.
pub trait TimeoutTarget: Send + Sync {
    /// The branch `xid` was still active when its deadline passed.
    fn timed_out(&self, xid: &Xid);
}

#[derive(Default)]
struct CancelToken {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

impl CancelToken {
    fn cancel(&self) {
        let mut cancelled = self.cancelled.lock();
        *cancelled = true;
        self.signal.notify_all();
    }

    /// Block until the deadline or cancellation. True when the deadline won.
    fn wait_for_deadline(&self, deadline: Instant) -> bool {
        let mut cancelled = self.cancelled.lock();
        while !*cancelled {
            if self.signal.wait_until(&mut cancelled, deadline).timed_out() {
                return !*cancelled;
            }
        }
        false
    }
}

/// Handle on an armed timeout check. Dropping it cancels the check.
pub struct TimeoutWatch {
    token: Arc<CancelToken>,
}

impl TimeoutWatch {
    /// Spawn the deferred check.
    ///
    /// `active` is read without any ordering assumption beyond eventual
    /// visibility; firing after the participant left Active is a no-op.
    pub fn arm(
        after: Duration,
        active: Arc<AtomicBool>,
        target: Weak<dyn TimeoutTarget>,
        xid: Xid,
    ) -> Self {
        let token = Arc::new(CancelToken::default());
        let thread_token = Arc::clone(&token);
        let deadline = Instant::now() + after;

        let spawned = thread::Builder::new()
            .name("tx-timeout-watch".to_string())
            .spawn(move || {
                if !thread_token.wait_for_deadline(deadline) {
                    trace!(xid = %xid, "Timeout watch cancelled");
                    return;
                }
                if !active.load(Ordering::Acquire) {
                    return;
                }
                if let Some(target) = target.upgrade() {
                    target.timed_out(&xid);
                }
            });

        if let Err(e) = spawned {
            warn!(error = %e, "Could not spawn timeout watch; timeout will not be monitored");
        }

        Self { token }
    }

    /// Cancel the check. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the check was cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.token.cancelled.lock()
    }
}

impl Drop for TimeoutWatch {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        fired: AtomicUsize,
    }

    impl TimeoutTarget for Counter {
        fn timed_out(&self, _xid: &Xid) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn arm(counter: &Arc<Counter>, active: bool, after_ms: u64) -> TimeoutWatch {
        let weak: Weak<Counter> = Arc::downgrade(counter);
        let target: Weak<dyn TimeoutTarget> = weak;
        TimeoutWatch::arm(
            Duration::from_millis(after_ms),
            Arc::new(AtomicBool::new(active)),
            target,
            Xid::generate(),
        )
    }

    #[test]
    fn test_fires_once_when_active() {
        let counter = Arc::new(Counter::default());
        let _watch = arm(&counter, true, 10);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(counter.fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_inactive_participant_does_not_fire() {
        let counter = Arc::new(Counter::default());
        let _watch = arm(&counter, false, 10);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_before_deadline() {
        let counter = Arc::new(Counter::default());
        let watch = arm(&counter, true, 100);
        watch.cancel();
        assert!(watch.is_cancelled());
        thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_cancels() {
        let counter = Arc::new(Counter::default());
        drop(arm(&counter, true, 100));
        thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.fired.load(Ordering::SeqCst), 0);
    }
}
