//! # Debug Participant
//!
//! Participant enlisted by every coordinator-begun transaction (unless
//! disabled in config). It keeps a process-wide registry of live branches so
//! that stuck transactions, and the code that began them, can be found from
//! any thread.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use lazy_static::lazy_static;
use tracing::{debug, info, trace};

use super::runtime::{Participant, ParticipantRuntime};
use super::timeout_watch::TimeoutTarget;
use crate::domain::{DiagnosticCapture, XaError, Xid};

lazy_static! {
    /// Live debug participants keyed by branch id.
    static ref DEBUG_REGISTRY: DashMap<Xid, Arc<DebugParticipant>> = DashMap::new();
}

/// Participant that records where its transaction was created.
pub struct DebugParticipant {
    runtime: ParticipantRuntime,
    created: DiagnosticCapture,
    registered: AtomicBool,
}

impl DebugParticipant {
    /// Create a participant, capturing the caller as the creation site.
    #[track_caller]
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        let created = DiagnosticCapture::here(label);
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let target: Weak<dyn TimeoutTarget> = weak.clone();
            Self {
                runtime: ParticipantRuntime::new(target),
                created,
                registered: AtomicBool::new(false),
            }
        })
    }

    /// Where the participant (and so its transaction) was created.
    pub fn created(&self) -> &DiagnosticCapture {
        &self.created
    }

    /// Add this participant to the registry under its current branch id.
    ///
    /// Only the first call after enlistment registers; returns whether this
    /// call did. A participant that was never started has no id and is not
    /// registered.
    pub fn register(self: &Arc<Self>) -> bool {
        let Some(xid) = self.runtime.xid() else {
            return false;
        };
        if self.registered.swap(true, Ordering::AcqRel) {
            return false;
        }
        DEBUG_REGISTRY.insert(xid, Arc::clone(self));
        true
    }

    /// Creation site and current branch id, for logs.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        match self.runtime.xid() {
            Some(xid) => {
                let _ = write!(out, "Xid: {}", xid);
            }
            None => out.push_str("Xid: <none>"),
        }
        let _ = write!(
            out,
            "; state: {:?}; created: {}",
            self.runtime.state(),
            self.created
        );
        out
    }

    /// Log [`describe`](Self::describe) at info level.
    pub fn log(&self) {
        info!(participant = %self.describe(), "Debug participant");
    }

    fn deregister(&self, xid: &Xid) {
        if DEBUG_REGISTRY.remove(xid).is_some() {
            trace!(xid = %xid, "Debug participant removed from registry");
        }
    }
}

impl Participant for DebugParticipant {
    fn runtime(&self) -> &ParticipantRuntime {
        &self.runtime
    }

    fn commit_branch(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError> {
        self.deregister(xid);
        if !self.runtime.complete_if_held(xid) {
            debug!(xid = %xid, "Debug participant committed for a branch it does not hold");
        }
        trace!(xid = %xid, one_phase, "Debug participant committed");
        Ok(())
    }

    fn rollback_branch(&self, xid: &Xid) -> Result<(), XaError> {
        self.deregister(xid);
        if !self.runtime.complete_if_held(xid) {
            debug!(xid = %xid, "Debug participant rolled back for a branch it does not hold");
        }
        trace!(xid = %xid, "Debug participant rolled back");
        Ok(())
    }
}

/// Whether a debug participant is registered for `xid`.
pub fn is_registered(xid: &Xid) -> bool {
    DEBUG_REGISTRY.contains_key(xid)
}

/// Snapshot of every registered debug participant.
pub fn running_transactions() -> Vec<Arc<DebugParticipant>> {
    DEBUG_REGISTRY
        .iter()
        .map(|entry| Arc::clone(entry.value()))
        .collect()
}

/// Log every registered debug participant. Returns how many were logged.
pub fn log_running_transactions() -> usize {
    let running = running_transactions();
    info!(count = running.len(), "Running transactions");
    for participant in &running {
        participant.log();
    }
    running.len()
}
