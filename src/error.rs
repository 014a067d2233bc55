//! Error types.
//!
//! Transaction-level failures are data: they end up as a non-zero code in
//! the transaction's result. Only [`BlockError`] fails a whole block.

use occ_executor::{Abort, ExecutorError};
use thiserror::Error;

/// Codespace of every result code produced by this node.
pub const CODESPACE: &str = "sdk";

/// ABCI-style result codes.
pub mod codes {
    pub const OK: u32 = 0;
    pub const TX_DECODE: u32 = 2;
    pub const INVALID_SEQUENCE: u32 = 3;
    pub const UNAUTHORIZED: u32 = 4;
    pub const INSUFFICIENT_FUNDS: u32 = 5;
    pub const UNKNOWN_REQUEST: u32 = 6;
    pub const OUT_OF_GAS: u32 = 11;
    pub const INSUFFICIENT_FEE: u32 = 13;
    pub const INVALID_REQUEST: u32 = 18;
    pub const INVALID_CHAIN_ID: u32 = 28;
    pub const EVM_REVERTED: u32 = 45;
}

/// Coarse classification callers match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Conflict with a concurrent transaction; retried by the scheduler.
    OccAbort,
    OutOfGas,
    Application,
}

/// Error raised while running a single transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    #[error(transparent)]
    Abort(#[from] Abort),

    #[error("out of gas in location: {descriptor}; gasWanted: {limit}, gasUsed: {used}")]
    OutOfGas {
        descriptor: &'static str,
        limit: u64,
        used: u64,
    },

    #[error("{log}")]
    Application { code: u32, log: String },
}

impl TxError {
    pub fn app(code: u32, log: impl Into<String>) -> Self {
        TxError::Application {
            code,
            log: log.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TxError::Abort(_) => ErrorKind::OccAbort,
            TxError::OutOfGas { .. } => ErrorKind::OutOfGas,
            TxError::Application { .. } => ErrorKind::Application,
        }
    }

    /// Result code reported for this error. Aborts never reach a result.
    pub fn code(&self) -> u32 {
        match self {
            TxError::Abort(_) => codes::OK,
            TxError::OutOfGas { .. } => codes::OUT_OF_GAS,
            TxError::Application { code, .. } => *code,
        }
    }
}

/// Failure of a block hook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    #[error("{hook}: {reason}")]
    Failed { hook: &'static str, reason: String },

    #[error("invariant broken: {0}")]
    InvariantBroken(String),
}

/// Fatal block-processing error. The canonical state is left untouched.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("hook failed: {0}")]
    Hook(#[from] HookError),

    #[error("block {got} does not follow {last}")]
    HeightMismatch { last: u64, got: u64 },

    #[error("invariant violation: {0}")]
    Invariant(String),
}
