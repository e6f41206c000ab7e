//! # Domain Value Objects
//!
//! Immutable value types shared by the coordinator, the participants and the
//! backend ports.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::XaError;

// =============================================================================
// XA flags (X/Open XA)
// =============================================================================

/// No flags set.
pub const XA_TMNOFLAGS: i32 = 0x0000_0000;
/// Dissociate caller from branch, work succeeded.
pub const XA_TMSUCCESS: i32 = 0x0400_0000;
/// Dissociate caller from branch, work failed.
pub const XA_TMFAIL: i32 = 0x2000_0000;

/// Transaction status as reported by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Status {
    /// No transaction associated with the thread.
    #[default]
    NoTransaction,
    /// Transaction in progress.
    Active,
    /// Transaction may only be rolled back.
    MarkedRollback,
    /// Phase one in progress.
    Preparing,
    /// Phase one complete.
    Prepared,
    /// Phase two commit in progress.
    Committing,
    /// Committed.
    Committed,
    /// Rollback in progress.
    RollingBack,
    /// Rolled back.
    RolledBack,
    /// Status cannot be determined.
    Unknown,
}

impl Status {
    /// Human-readable description used in log lines.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::NoTransaction => "No Transaction",
            Self::Active => "Transaction Active",
            Self::MarkedRollback => "Transaction Marked Rollback",
            Self::Preparing => "Transaction Preparing",
            Self::Prepared => "Transaction Prepared",
            Self::Committing => "Transaction Committing",
            Self::Committed => "Transaction Committed",
            Self::RollingBack => "Transaction Rolling Back",
            Self::RolledBack => "Transaction Rolled Back",
            Self::Unknown => "Transaction Status Unknown",
        }
    }

    /// Completion is already under way or done; commit has nothing to do.
    pub fn is_completing_or_done(&self) -> bool {
        matches!(
            self,
            Self::NoTransaction
                | Self::Committing
                | Self::Committed
                | Self::RollingBack
                | Self::RolledBack
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Opaque reference to a backend transaction instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionHandle(Uuid);

impl TransactionHandle {
    /// Allocate a fresh handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying identifier.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransactionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// XA transaction identifier. Compared structurally, never interpreted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    format_id: i32,
    global_transaction_id: Vec<u8>,
    branch_qualifier: Vec<u8>,
}

impl Xid {
    /// Maximum length for the global transaction id.
    pub const MAXGTRIDSIZE: usize = 64;
    /// Maximum length for the branch qualifier.
    pub const MAXBQUALSIZE: usize = 64;

    /// Build an Xid, rejecting oversized parts.
    pub fn new(
        format_id: i32,
        global_transaction_id: &[u8],
        branch_qualifier: &[u8],
    ) -> Result<Self, XaError> {
        if global_transaction_id.len() > Self::MAXGTRIDSIZE {
            return Err(XaError::InvalidXid(format!(
                "global transaction id is {} bytes, max {}",
                global_transaction_id.len(),
                Self::MAXGTRIDSIZE
            )));
        }
        if branch_qualifier.len() > Self::MAXBQUALSIZE {
            return Err(XaError::InvalidXid(format!(
                "branch qualifier is {} bytes, max {}",
                branch_qualifier.len(),
                Self::MAXBQUALSIZE
            )));
        }
        Ok(Self {
            format_id,
            global_transaction_id: global_transaction_id.to_vec(),
            branch_qualifier: branch_qualifier.to_vec(),
        })
    }

    /// Xid naming branch `branch` of the transaction behind `handle`.
    pub fn for_branch(handle: &TransactionHandle, branch: u32) -> Self {
        Self {
            format_id: 0,
            global_transaction_id: handle.as_uuid().as_bytes().to_vec(),
            branch_qualifier: branch.to_be_bytes().to_vec(),
        }
    }

    /// Random Xid.
    pub fn generate() -> Self {
        Self {
            format_id: 0,
            global_transaction_id: Uuid::new_v4().as_bytes().to_vec(),
            branch_qualifier: vec![0u8; 4],
        }
    }

    /// Format identifier.
    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    /// Global transaction identifier.
    pub fn global_transaction_id(&self) -> &[u8] {
        &self.global_transaction_id
    }

    /// Branch qualifier.
    pub fn branch_qualifier(&self) -> &[u8] {
        &self.branch_qualifier
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format_id)?;
        for b in &self.global_transaction_id {
            write!(f, "{:02x}", b)?;
        }
        f.write_str(":")?;
        for b in &self.branch_qualifier {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Vote returned from `prepare`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum XaVote {
    /// Ready to commit (XA_OK).
    Ok,
}

/// Participant state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ParticipantState {
    /// Created, never started.
    #[default]
    NotEnlisted,
    /// Associated with a transaction branch.
    Active,
    /// Association ended, awaiting prepare/commit.
    Ended,
    /// Voted in phase one.
    Prepared,
    /// Committed or rolled back.
    Completed,
    /// Branch forgotten.
    Forgotten,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_completing_set() {
        assert!(Status::NoTransaction.is_completing_or_done());
        assert!(Status::Committing.is_completing_or_done());
        assert!(Status::RolledBack.is_completing_or_done());
        assert!(!Status::Active.is_completing_or_done());
        assert!(!Status::MarkedRollback.is_completing_or_done());
        assert!(!Status::Prepared.is_completing_or_done());
    }

    #[test]
    fn test_status_describe() {
        assert_eq!(Status::Active.to_string(), "Transaction Active");
        assert_eq!(Status::default(), Status::NoTransaction);
    }

    #[test]
    fn test_xid_structural_equality() {
        let a = Xid::new(7, b"global", b"branch").unwrap();
        let b = Xid::new(7, b"global", b"branch").unwrap();
        let c = Xid::new(7, b"global", b"other").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_xid_rejects_oversized_parts() {
        let long = [0u8; Xid::MAXGTRIDSIZE + 1];
        assert!(matches!(
            Xid::new(0, &long, b"b"),
            Err(XaError::InvalidXid(_))
        ));
        assert!(Xid::new(0, b"g", &long).is_err());
    }

    #[test]
    fn test_xid_display_is_hex() {
        let xid = Xid::new(1, &[0xab], &[0x01, 0x02]).unwrap();
        assert_eq!(xid.to_string(), "1:ab:0102");
    }

    #[test]
    fn test_branch_xids_share_global_id() {
        let handle = TransactionHandle::new();
        let a = Xid::for_branch(&handle, 1);
        let b = Xid::for_branch(&handle, 2);
        assert_eq!(a.global_transaction_id(), b.global_transaction_id());
        assert_ne!(a, b);
    }

    #[test]
    fn test_handles_are_unique() {
        assert_ne!(TransactionHandle::new(), TransactionHandle::new());
    }
}
