//! Core types for optimistic parallel execution.

use std::fmt;

/// Transaction index in the block (0-based).
pub type TxnIndex = usize;

/// Incarnation number (how many times a transaction has been re-executed).
pub type Incarnation = usize;

/// Store key.
pub type Key = Vec<u8>;

/// Store value.
pub type Value = Vec<u8>;

/// Version identifier for a transaction execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub txn_idx: TxnIndex,
    pub incarnation: Incarnation,
}

impl Version {
    pub fn new(txn_idx: TxnIndex, incarnation: Incarnation) -> Self {
        Self { txn_idx, incarnation }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.txn_idx, self.incarnation)
    }
}

/// Why a speculative execution had to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AbortReason {
    /// A read resolved to an estimate marker.
    #[error("read an estimate marker")]
    ReadEstimate,
}

/// Conflict signal raised when a transaction observes an estimate marker.
///
/// `dependent_txn_idx` is the lower transaction that owns the marker. The
/// scheduler only uses it to decide when to retry; the retried incarnation is
/// validated like any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transaction aborted: {reason} written by transaction {dependent_txn_idx}")]
pub struct Abort {
    pub dependent_txn_idx: TxnIndex,
    pub reason: AbortReason,
}

impl Abort {
    /// Abort caused by reading the estimate marker of `dependent_txn_idx`.
    pub fn estimate(dependent_txn_idx: TxnIndex) -> Self {
        Self {
            dependent_txn_idx,
            reason: AbortReason::ReadEstimate,
        }
    }
}

/// Where a recorded read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOrigin {
    /// Written by a lower transaction at this version.
    Version(Version),
    /// No lower transaction wrote the key; served by the base store.
    Storage,
}

/// A range scan observed during execution, kept for validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRead {
    pub start: Key,
    pub end: Option<Key>,
    /// Keys visible from lower transactions and the base store, ascending.
    pub keys: Vec<Key>,
}

/// Status of a transaction in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Ready to run the given incarnation.
    Pending(Incarnation),
    /// A worker is running this incarnation.
    Executing(Incarnation),
    /// Finished execution, waiting for validation.
    Executed(Incarnation),
    /// Read-set validated against the current multi-version state.
    Validated(Incarnation),
    /// Being reset: either parked on a dependency or failed validation.
    Aborting(Incarnation),
}

impl ExecutionStatus {
    pub fn incarnation(&self) -> Incarnation {
        match *self {
            ExecutionStatus::Pending(inc)
            | ExecutionStatus::Executing(inc)
            | ExecutionStatus::Executed(inc)
            | ExecutionStatus::Validated(inc)
            | ExecutionStatus::Aborting(inc) => inc,
        }
    }

    /// Executed or validated: the recorded writes are real values.
    pub fn is_executed(&self) -> bool {
        matches!(self, ExecutionStatus::Executed(_) | ExecutionStatus::Validated(_))
    }
}
