//! # Thread Transaction Context
//!
//! Per-thread bookkeeping the coordinator keeps next to the backend's own
//! thread association: begin marker, rollback cause, stamps and the stack of
//! suspended transactions. Pure state; no backend calls happen here.

use chrono::{DateTime, Duration, SubsecRound, Utc};

use super::diagnostics::{CaptureSnapshot, DiagnosticCapture, RollbackCause};
use super::value_objects::TransactionHandle;

/// A transaction detached from the thread by `suspend`.
#[derive(Clone, Debug)]
pub struct SuspendedFrame {
    /// Backend handle of the suspended transaction.
    pub handle: TransactionHandle,
    /// Where the suspend happened.
    pub suspended_at: DiagnosticCapture,
    /// Start stamp of the suspended transaction, restored on resume.
    pub start_stamp: Option<DateTime<Utc>>,
    /// Begin marker and rollback cause, restored on resume.
    pub markers: SavedMarkers,
}

/// Begin marker and rollback cause set aside while a transaction is suspended.
#[derive(Clone, Debug, Default)]
pub struct SavedMarkers {
    /// Begin marker of the suspended transaction.
    pub begin_marker: Option<DiagnosticCapture>,
    /// Rollback cause of the suspended transaction.
    pub rollback_cause: Option<RollbackCause>,
}

/// Thread-confined transaction bookkeeping.
#[derive(Debug, Default)]
pub struct ThreadTransactionContext {
    begin_marker: Option<DiagnosticCapture>,
    rollback_cause: Option<RollbackCause>,
    start_stamp: Option<DateTime<Utc>>,
    last_unique_stamp: Option<DateTime<Utc>>,
    suspended: Vec<SuspendedFrame>,
}

impl ThreadTransactionContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Begin marker
    // -------------------------------------------------------------------------

    /// Install a begin marker, returning the one it replaced.
    pub fn set_begin_marker(&mut self, marker: DiagnosticCapture) -> Option<DiagnosticCapture> {
        self.begin_marker.replace(marker)
    }

    /// Remove and return the begin marker.
    pub fn take_begin_marker(&mut self) -> Option<DiagnosticCapture> {
        self.begin_marker.take()
    }

    /// Current begin marker.
    pub fn begin_marker(&self) -> Option<&DiagnosticCapture> {
        self.begin_marker.as_ref()
    }

    // -------------------------------------------------------------------------
    // Rollback cause
    // -------------------------------------------------------------------------

    /// Record a rollback cause, returning the one it replaced (last write wins).
    pub fn set_rollback_cause(&mut self, cause: RollbackCause) -> Option<RollbackCause> {
        self.rollback_cause.replace(cause)
    }

    /// Remove and return the rollback cause.
    pub fn take_rollback_cause(&mut self) -> Option<RollbackCause> {
        self.rollback_cause.take()
    }

    /// Current rollback cause.
    pub fn rollback_cause(&self) -> Option<&RollbackCause> {
        self.rollback_cause.as_ref()
    }

    // -------------------------------------------------------------------------
    // Stamps
    // -------------------------------------------------------------------------

    /// Start stamp of the active transaction, if initialized.
    pub fn start_stamp(&self) -> Option<DateTime<Utc>> {
        self.start_stamp
    }

    /// Set (or clear) the start stamp.
    pub fn set_start_stamp(&mut self, stamp: Option<DateTime<Utc>>) {
        self.start_stamp = stamp;
    }

    /// Drop the start stamp and the unique-stamp counter.
    pub fn clear_stamps(&mut self) {
        self.start_stamp = None;
        self.last_unique_stamp = None;
    }

    /// Next unique stamp given the current clock reading.
    ///
    /// Stamps have millisecond resolution. A reading that is not strictly
    /// after the last issued stamp is bumped to `last + 1ms`.
    pub fn next_unique_stamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut stamp = now.trunc_subsecs(3);
        if let Some(last) = self.last_unique_stamp {
            if stamp <= last {
                stamp = last + Duration::milliseconds(1);
            }
        }
        self.last_unique_stamp = Some(stamp);
        stamp
    }

    // -------------------------------------------------------------------------
    // Active markers
    // -------------------------------------------------------------------------

    /// Move the active begin marker and rollback cause out, leaving the slots empty.
    pub fn take_active_markers(&mut self) -> SavedMarkers {
        SavedMarkers {
            begin_marker: self.begin_marker.take(),
            rollback_cause: self.rollback_cause.take(),
        }
    }

    /// Install `markers` as the active begin marker and rollback cause.
    pub fn restore_active_markers(&mut self, markers: SavedMarkers) {
        self.begin_marker = markers.begin_marker;
        self.rollback_cause = markers.rollback_cause;
    }

    // -------------------------------------------------------------------------
    // Suspended frames
    // -------------------------------------------------------------------------

    /// Push a suspended frame.
    pub fn push_frame(&mut self, frame: SuspendedFrame) {
        self.suspended.push(frame);
    }

    /// Pop the newest suspended frame.
    pub fn pop_frame(&mut self) -> Option<SuspendedFrame> {
        self.suspended.pop()
    }

    /// Remove every suspended frame, newest first.
    pub fn take_frames(&mut self) -> Vec<SuspendedFrame> {
        let mut frames = std::mem::take(&mut self.suspended);
        frames.reverse();
        frames
    }

    /// Remove the most recently suspended frame for `handle`.
    pub fn remove_frame(&mut self, handle: &TransactionHandle) -> Option<SuspendedFrame> {
        let index = self.suspended.iter().rposition(|f| &f.handle == handle)?;
        Some(self.suspended.remove(index))
    }

    /// Suspended frames, newest first.
    pub fn frames(&self) -> impl Iterator<Item = &SuspendedFrame> {
        self.suspended.iter().rev()
    }

    /// Number of suspended frames.
    pub fn suspended_count(&self) -> usize {
        self.suspended.len()
    }

    /// Snapshot of the begin markers: current first, then suspended (newest first).
    pub fn begin_marker_snapshots(&self) -> (Option<CaptureSnapshot>, Vec<CaptureSnapshot>) {
        let current = self.begin_marker.as_ref().map(DiagnosticCapture::snapshot);
        let saved = self
            .frames()
            .filter_map(|f| f.markers.begin_marker.as_ref().map(DiagnosticCapture::snapshot))
            .collect();
        (current, saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn frame() -> SuspendedFrame {
        SuspendedFrame {
            handle: TransactionHandle::new(),
            suspended_at: DiagnosticCapture::here("suspend"),
            start_stamp: None,
            markers: SavedMarkers::default(),
        }
    }

    #[test]
    fn test_unique_stamp_bumps_repeated_reading() {
        let mut ctx = ThreadTransactionContext::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let first = ctx.next_unique_stamp(now);
        let second = ctx.next_unique_stamp(now);
        let third = ctx.next_unique_stamp(now);

        assert_eq!(first, now);
        assert_eq!(second, now + Duration::milliseconds(1));
        assert_eq!(third, now + Duration::milliseconds(2));
    }

    #[test]
    fn test_unique_stamp_handles_clock_going_backwards() {
        let mut ctx = ThreadTransactionContext::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 5).unwrap();
        let earlier = now - Duration::seconds(1);

        let first = ctx.next_unique_stamp(now);
        let second = ctx.next_unique_stamp(earlier);
        assert!(second > first);
    }

    #[test]
    fn test_clear_stamps_resets_counter() {
        let mut ctx = ThreadTransactionContext::new();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ctx.next_unique_stamp(now);
        ctx.set_start_stamp(Some(now));
        ctx.clear_stamps();

        assert!(ctx.start_stamp().is_none());
        assert_eq!(ctx.next_unique_stamp(now), now);
    }

    #[test]
    fn test_active_markers_move_together() {
        let mut ctx = ThreadTransactionContext::new();
        ctx.set_begin_marker(DiagnosticCapture::here("begin A"));
        ctx.set_rollback_cause(RollbackCause::new("cause A", None));

        let saved = ctx.take_active_markers();
        assert!(ctx.begin_marker().is_none());
        assert!(ctx.rollback_cause().is_none());

        ctx.set_begin_marker(DiagnosticCapture::here("begin B"));
        ctx.restore_active_markers(saved);
        assert_eq!(ctx.begin_marker().unwrap().label(), "begin A");
        assert_eq!(ctx.rollback_cause().unwrap().message(), "cause A");
    }

    #[test]
    fn test_take_frames_is_newest_first() {
        let mut ctx = ThreadTransactionContext::new();
        let a = frame();
        let b = frame();
        let (handle_a, handle_b) = (a.handle, b.handle);
        ctx.push_frame(a);
        ctx.push_frame(b);

        let taken: Vec<_> = ctx.take_frames().into_iter().map(|f| f.handle).collect();
        assert_eq!(taken, vec![handle_b, handle_a]);
        assert_eq!(ctx.suspended_count(), 0);
    }

    #[test]
    fn test_remove_frame_takes_newest_match() {
        let mut ctx = ThreadTransactionContext::new();
        let a = frame();
        let b = frame();
        let handle_a = a.handle;
        ctx.push_frame(a);
        ctx.push_frame(b.clone());

        let removed = ctx.remove_frame(&handle_a).unwrap();
        assert_eq!(removed.handle, handle_a);
        assert_eq!(ctx.suspended_count(), 1);
        assert_eq!(ctx.frames().next().unwrap().handle, b.handle);
        assert!(ctx.remove_frame(&handle_a).is_none());
    }

    #[test]
    fn test_begin_marker_snapshots() {
        let mut ctx = ThreadTransactionContext::new();
        ctx.set_begin_marker(DiagnosticCapture::here("outer"));
        let mut outer = frame();
        outer.markers = ctx.take_active_markers();
        ctx.push_frame(outer);
        ctx.set_begin_marker(DiagnosticCapture::here("inner"));

        let (current, saved) = ctx.begin_marker_snapshots();
        assert_eq!(current.unwrap().label, "inner");
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].label, "outer");
    }
}
