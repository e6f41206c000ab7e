//! # Participant Runtime
//!
//! Generic resource-participant state machine. Concrete participants embed a
//! [`ParticipantRuntime`], implement [`Participant`] for the two
//! kind-specific operations (commit and rollback) and get the full
//! [`XaResource`] protocol through the blanket impl below.
//!
//! ```text
//! NotEnlisted ──start──→ Active ──end──→ Ended ──prepare──→ Prepared
//!                           │              │                   │
//!                           └──────────────┴──commit/rollback──┴──→ Completed
//!
//! (any) ──forget──→ Forgotten
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::timeout_watch::{TimeoutTarget, TimeoutWatch};
use crate::domain::{ParticipantState, XaError, XaVote, Xid};
use crate::ports::XaResource;

/// Length of one timeout unit unless overridden.
pub const DEFAULT_TIMEOUT_UNIT: Duration = Duration::from_secs(1);

/// Kind-specific part of a participant.
pub trait Participant: Send + Sync + 'static {
    /// The embedded protocol state machine.
    fn runtime(&self) -> &ParticipantRuntime;

    /// Commit the branch.
    fn commit_branch(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError>;

    /// Roll the branch back.
    fn rollback_branch(&self, xid: &Xid) -> Result<(), XaError>;

    /// Called at most once when the branch is still active at its deadline.
    fn on_timeout(&self, _xid: &Xid) {}
}

impl<P: Participant> TimeoutTarget for P {
    fn timed_out(&self, xid: &Xid) {
        self.on_timeout(xid);
    }
}

struct RuntimeState {
    state: ParticipantState,
    xid: Option<Xid>,
    timeout_secs: Option<u32>,
    timeout_unit: Duration,
    watch: Option<TimeoutWatch>,
}

impl RuntimeState {
    fn check_held(&self, xid: &Xid) -> Result<(), XaError> {
        match &self.xid {
            Some(held) if held == xid => Ok(()),
            _ => Err(XaError::NoSuchTransaction(xid.clone())),
        }
    }

    fn disarm(&mut self) {
        if let Some(watch) = self.watch.take() {
            watch.cancel();
        }
    }
}

/// Protocol state machine shared by every participant kind.
pub struct ParticipantRuntime {
    inner: Mutex<RuntimeState>,
    active: Arc<AtomicBool>,
    target: Weak<dyn TimeoutTarget>,
}

impl ParticipantRuntime {
    /// Create a runtime whose timeouts are delivered to `target`.
    ///
    /// Concrete participants build themselves with `Arc::new_cyclic` and pass
    /// their own weak reference here.
    pub fn new(target: Weak<dyn TimeoutTarget>) -> Self {
        Self {
            inner: Mutex::new(RuntimeState {
                state: ParticipantState::NotEnlisted,
                xid: None,
                timeout_secs: None,
                timeout_unit: DEFAULT_TIMEOUT_UNIT,
                watch: None,
            }),
            active: Arc::new(AtomicBool::new(false)),
            target,
        }
    }

    /// Shorten (or lengthen) the wall-clock length of one timeout unit.
    pub fn set_timeout_unit(&self, unit: Duration) {
        self.inner.lock().timeout_unit = unit;
    }

    /// Current protocol state.
    pub fn state(&self) -> ParticipantState {
        self.inner.lock().state
    }

    /// Branch currently held.
    pub fn xid(&self) -> Option<Xid> {
        self.inner.lock().xid.clone()
    }

    /// Liveness flag as seen by the timeout watch.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Associate with branch `xid`; arms the timeout watch when configured.
    pub fn start(&self, xid: &Xid, flags: i32) -> Result<(), XaError> {
        let mut inner = self.inner.lock();

        if self.active.load(Ordering::Acquire) {
            return match &inner.xid {
                Some(held) if held == xid => Err(XaError::DuplicateId(xid.clone())),
                Some(held) => Err(XaError::ProtocolViolation(format!(
                    "start({}) while active on {}",
                    xid, held
                ))),
                None => Err(XaError::ProtocolViolation(format!(
                    "start({}) while active without a branch",
                    xid
                ))),
            };
        }

        if let Some(held) = &inner.xid {
            if held != xid {
                return Err(XaError::ProtocolViolation(format!(
                    "start({}) while still holding {}",
                    xid, held
                )));
            }
        }

        inner.xid = Some(xid.clone());
        inner.state = ParticipantState::Active;
        self.active.store(true, Ordering::Release);

        inner.disarm();
        if let Some(secs) = inner.timeout_secs {
            let after = inner.timeout_unit * secs;
            inner.watch = Some(TimeoutWatch::arm(
                after,
                Arc::clone(&self.active),
                self.target.clone(),
                xid.clone(),
            ));
        }

        debug!(xid = %xid, flags, timeout = ?inner.timeout_secs, "Participant started");
        Ok(())
    }

    /// End the association with branch `xid`.
    pub fn end(&self, xid: &Xid, flags: i32) -> Result<(), XaError> {
        let mut inner = self.inner.lock();
        if !self.active.load(Ordering::Acquire) {
            return Err(XaError::ProtocolViolation(format!(
                "end({}) on a participant that is not active",
                xid
            )));
        }
        inner.check_held(xid)?;

        self.active.store(false, Ordering::Release);
        inner.state = ParticipantState::Ended;
        inner.disarm();
        debug!(xid = %xid, flags, "Participant ended");
        Ok(())
    }

    /// Phase one. Always votes OK.
    pub fn prepare(&self, xid: &Xid) -> Result<XaVote, XaError> {
        let mut inner = self.inner.lock();
        inner.check_held(xid)?;
        inner.state = ParticipantState::Prepared;
        Ok(XaVote::Ok)
    }

    /// Forget branch `xid`.
    pub fn forget(&self, xid: &Xid) -> Result<(), XaError> {
        let mut inner = self.inner.lock();
        inner.check_held(xid)?;

        if self.active.swap(false, Ordering::AcqRel) {
            warn!(xid = %xid, "forget() called without end()");
        }
        inner.xid = None;
        inner.state = ParticipantState::Forgotten;
        inner.disarm();
        Ok(())
    }

    /// Held branch as a single-element list, or empty.
    pub fn recover(&self, _flags: i32) -> Result<Vec<Xid>, XaError> {
        Ok(self.inner.lock().xid.iter().cloned().collect())
    }

    /// Configured timeout in seconds (0 = none).
    pub fn transaction_timeout(&self) -> u32 {
        self.inner.lock().timeout_secs.unwrap_or(0)
    }

    /// Configure the timeout in seconds; 0 clears it.
    pub fn set_transaction_timeout(&self, seconds: u32) -> Result<bool, XaError> {
        self.inner.lock().timeout_secs = (seconds != 0).then_some(seconds);
        Ok(true)
    }

    /// Finish branch `xid` (commit or rollback). Fails when `xid` is not held.
    pub fn complete(&self, xid: &Xid) -> Result<(), XaError> {
        let mut inner = self.inner.lock();
        inner.check_held(xid)?;
        self.finish(&mut inner);
        Ok(())
    }

    /// Finish branch `xid` if it is the held one. Returns whether it was.
    pub fn complete_if_held(&self, xid: &Xid) -> bool {
        let mut inner = self.inner.lock();
        if inner.check_held(xid).is_err() {
            return false;
        }
        self.finish(&mut inner);
        true
    }

    fn finish(&self, inner: &mut RuntimeState) {
        self.active.store(false, Ordering::Release);
        inner.state = ParticipantState::Completed;
        inner.disarm();
    }
}

impl<P: Participant> XaResource for P {
    fn start(&self, xid: &Xid, flags: i32) -> Result<(), XaError> {
        self.runtime().start(xid, flags)
    }

    fn end(&self, xid: &Xid, flags: i32) -> Result<(), XaError> {
        self.runtime().end(xid, flags)
    }

    fn prepare(&self, xid: &Xid) -> Result<XaVote, XaError> {
        self.runtime().prepare(xid)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError> {
        self.commit_branch(xid, one_phase)
    }

    fn rollback(&self, xid: &Xid) -> Result<(), XaError> {
        self.rollback_branch(xid)
    }

    fn forget(&self, xid: &Xid) -> Result<(), XaError> {
        self.runtime().forget(xid)
    }

    fn recover(&self, flags: i32) -> Result<Vec<Xid>, XaError> {
        self.runtime().recover(flags)
    }

    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        std::ptr::addr_eq(self as *const P, other as *const dyn XaResource)
    }

    fn transaction_timeout(&self) -> u32 {
        self.runtime().transaction_timeout()
    }

    fn set_transaction_timeout(&self, seconds: u32) -> Result<bool, XaError> {
        self.runtime().set_transaction_timeout(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::XA_TMNOFLAGS;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct Recording {
        runtime: ParticipantRuntime,
        timeouts: AtomicUsize,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new_cyclic(|weak: &Weak<Self>| {
                let target: Weak<dyn TimeoutTarget> = weak.clone();
                Self {
                    runtime: ParticipantRuntime::new(target),
                    timeouts: AtomicUsize::new(0),
                }
            })
        }
    }

    impl Participant for Recording {
        fn runtime(&self) -> &ParticipantRuntime {
            &self.runtime
        }

        fn commit_branch(&self, xid: &Xid, _one_phase: bool) -> Result<(), XaError> {
            self.runtime.complete(xid)
        }

        fn rollback_branch(&self, xid: &Xid) -> Result<(), XaError> {
            self.runtime.complete(xid)
        }

        fn on_timeout(&self, _xid: &Xid) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn xid(n: u8) -> Xid {
        Xid::new(0, &[n; 8], &[1]).unwrap()
    }

    #[test]
    fn test_full_two_phase_cycle() {
        let p = Recording::new();
        assert_eq!(p.runtime.state(), ParticipantState::NotEnlisted);

        p.start(&xid(1), XA_TMNOFLAGS).unwrap();
        assert_eq!(p.runtime.state(), ParticipantState::Active);
        p.end(&xid(1), XA_TMNOFLAGS).unwrap();
        assert_eq!(p.runtime.state(), ParticipantState::Ended);
        assert_eq!(p.prepare(&xid(1)).unwrap(), XaVote::Ok);
        assert_eq!(p.runtime.state(), ParticipantState::Prepared);
        p.commit(&xid(1), false).unwrap();
        assert_eq!(p.runtime.state(), ParticipantState::Completed);
    }

    #[test]
    fn test_start_twice_same_id_is_duplicate() {
        let p = Recording::new();
        p.start(&xid(1), XA_TMNOFLAGS).unwrap();
        assert!(matches!(
            p.start(&xid(1), XA_TMNOFLAGS),
            Err(XaError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_start_other_id_while_active_is_protocol_violation() {
        let p = Recording::new();
        p.start(&xid(1), XA_TMNOFLAGS).unwrap();
        assert!(matches!(
            p.start(&xid(2), XA_TMNOFLAGS),
            Err(XaError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_start_other_id_while_holding_inactive_is_protocol_violation() {
        let p = Recording::new();
        p.start(&xid(1), XA_TMNOFLAGS).unwrap();
        p.end(&xid(1), XA_TMNOFLAGS).unwrap();
        assert!(matches!(
            p.start(&xid(2), XA_TMNOFLAGS),
            Err(XaError::ProtocolViolation(_))
        ));
        // Rejoining the held branch is fine.
        p.start(&xid(1), XA_TMNOFLAGS).unwrap();
    }

    #[test]
    fn test_commit_unknown_id_is_no_such_transaction() {
        let p = Recording::new();
        p.start(&xid(1), XA_TMNOFLAGS).unwrap();
        assert!(matches!(
            p.commit(&xid(3), true),
            Err(XaError::NoSuchTransaction(_))
        ));
        assert_eq!(p.runtime.state(), ParticipantState::Active);
    }

    #[test]
    fn test_operations_without_held_id_fail() {
        let p = Recording::new();
        assert!(matches!(
            p.prepare(&xid(1)),
            Err(XaError::NoSuchTransaction(_))
        ));
        assert!(matches!(
            p.forget(&xid(1)),
            Err(XaError::NoSuchTransaction(_))
        ));
        assert!(matches!(
            p.end(&xid(1), XA_TMNOFLAGS),
            Err(XaError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_end_with_wrong_id() {
        let p = Recording::new();
        p.start(&xid(1), XA_TMNOFLAGS).unwrap();
        assert!(matches!(
            p.end(&xid(2), XA_TMNOFLAGS),
            Err(XaError::NoSuchTransaction(_))
        ));
        assert!(p.runtime.is_active());
    }

    #[test]
    fn test_forget_clears_id_even_when_active() {
        let p = Recording::new();
        p.start(&xid(1), XA_TMNOFLAGS).unwrap();
        p.forget(&xid(1)).unwrap();
        assert_eq!(p.runtime.state(), ParticipantState::Forgotten);
        assert!(p.runtime.xid().is_none());
        assert!(p.recover(0).unwrap().is_empty());
    }

    #[test]
    fn test_recover_returns_held_id() {
        let p = Recording::new();
        assert!(p.recover(0).unwrap().is_empty());
        p.start(&xid(4), XA_TMNOFLAGS).unwrap();
        assert_eq!(p.recover(0).unwrap(), vec![xid(4)]);
    }

    #[test]
    fn test_is_same_rm_is_identity() {
        let a = Recording::new();
        let b = Recording::new();
        assert!(a.is_same_rm(a.as_ref()));
        assert!(!a.is_same_rm(b.as_ref()));
    }

    #[test]
    fn test_timeout_round_trip() {
        let p = Recording::new();
        assert_eq!(p.transaction_timeout(), 0);
        assert!(p.set_transaction_timeout(30).unwrap());
        assert_eq!(p.transaction_timeout(), 30);
        p.set_transaction_timeout(0).unwrap();
        assert_eq!(p.transaction_timeout(), 0);
    }

    #[test]
    fn test_timeout_fires_once_while_active() {
        let p = Recording::new();
        p.runtime.set_timeout_unit(Duration::from_millis(20));
        p.set_transaction_timeout(1).unwrap();
        p.start(&xid(5), XA_TMNOFLAGS).unwrap();

        thread::sleep(Duration::from_millis(250));

        assert_eq!(p.timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(p.runtime.state(), ParticipantState::Active);
        assert_eq!(p.runtime.xid(), Some(xid(5)));
    }

    #[test]
    fn test_timeout_does_not_fire_after_end() {
        let p = Recording::new();
        p.runtime.set_timeout_unit(Duration::from_millis(50));
        p.set_transaction_timeout(1).unwrap();
        p.start(&xid(6), XA_TMNOFLAGS).unwrap();
        p.end(&xid(6), XA_TMNOFLAGS).unwrap();

        thread::sleep(Duration::from_millis(200));
        assert_eq!(p.timeouts.load(Ordering::SeqCst), 0);
    }
}
