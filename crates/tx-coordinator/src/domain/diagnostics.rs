//! # Diagnostic Captures
//!
//! Explicit value objects recording *where* and *when* something happened
//! (a begin, a suspend, a rollback-only mark). Constructed deliberately at the
//! few points the coordinator needs them.

use std::fmt;
use std::panic::Location;
use std::thread::{self, ThreadId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ErrorSource;

/// Timestamped call-site record.
#[derive(Clone, Debug)]
pub struct DiagnosticCapture {
    label: String,
    captured_at: DateTime<Utc>,
    location: &'static Location<'static>,
    thread_id: ThreadId,
    thread_name: String,
}

impl DiagnosticCapture {
    /// Capture the caller's location.
    ///
    /// Public coordinator operations are `#[track_caller]`, so the recorded
    /// location is the application code that called them.
    #[track_caller]
    pub fn here(label: impl Into<String>) -> Self {
        let current = thread::current();
        Self {
            label: label.into(),
            captured_at: Utc::now(),
            location: Location::caller(),
            thread_id: current.id(),
            thread_name: current.name().unwrap_or("<unnamed>").to_string(),
        }
    }

    /// What was captured ("begin", "suspend", ...).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// When it was captured.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Source location of the call site.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Thread the capture was taken on.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Name of that thread.
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Serializable view for dumps.
    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            label: self.label.clone(),
            captured_at: self.captured_at,
            location: self.location.to_string(),
            thread: format!("{} ({:?})", self.thread_name, self.thread_id),
        }
    }
}

impl fmt::Display for DiagnosticCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {} on thread '{}' ({})",
            self.label,
            self.location,
            self.thread_name,
            self.captured_at.to_rfc3339()
        )
    }
}

/// Owned, serializable form of a [`DiagnosticCapture`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSnapshot {
    /// Capture label.
    pub label: String,
    /// Capture time.
    pub captured_at: DateTime<Utc>,
    /// `file:line:column` of the call site.
    pub location: String,
    /// Thread name and id.
    pub thread: String,
}

/// Why a transaction was marked rollback-only.
#[derive(Clone, Debug)]
pub struct RollbackCause {
    message: String,
    source: Option<ErrorSource>,
    captured: DiagnosticCapture,
}

impl RollbackCause {
    /// Record a cause at the caller's location.
    #[track_caller]
    pub fn new(message: impl Into<String>, source: Option<ErrorSource>) -> Self {
        Self {
            message: message.into(),
            source,
            captured: DiagnosticCapture::here("set rollback-only"),
        }
    }

    /// Cause message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Cause error, if one was supplied.
    pub fn source(&self) -> Option<&ErrorSource> {
        self.source.as_ref()
    }

    /// Where rollback-only was set.
    pub fn captured(&self) -> &DiagnosticCapture {
        &self.captured
    }

    /// Neither a message nor a source was recorded.
    pub fn is_empty(&self) -> bool {
        self.message.is_empty() && self.source.is_none()
    }
}

impl fmt::Display for RollbackCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(source) = &self.source {
            write!(f, " ({})", source)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::XaError;
    use std::sync::Arc;

    #[test]
    fn test_capture_records_caller_location() {
        let capture = DiagnosticCapture::here("begin");
        assert_eq!(capture.label(), "begin");
        assert!(capture.location().file().ends_with("diagnostics.rs"));
        assert_eq!(capture.thread_id(), thread::current().id());
    }

    #[test]
    fn test_capture_snapshot_serializes() {
        let snapshot = DiagnosticCapture::here("suspend").snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("suspend"));
        assert!(json.contains("diagnostics.rs"));
    }

    #[test]
    fn test_rollback_cause_emptiness() {
        assert!(RollbackCause::new("", None).is_empty());
        assert!(!RollbackCause::new("disk full", None).is_empty());

        let source: ErrorSource = Arc::new(XaError::ResourceManager("io".into()));
        let cause = RollbackCause::new("", Some(source));
        assert!(!cause.is_empty());
        assert!(cause.to_string().contains("io"));
    }
}
