//! Transaction execution strategies.
//!
//! This module provides the [`Executor`] trait and its two implementations:
//! the strictly sequential reference path and the optimistic parallel one.
//! Both must leave the store and the result list in exactly the same state
//! for the same batch.

mod occ;
mod sequential;

pub use occ::OccExecutor;
pub use sequential::{SequentialExecutor, SequentialView};

use crate::error::BlockError;
use crate::processor::{BlockTx, ExecTxResult, TxProcessor};
use occ_executor::{ExecutionStats, KvStoreMut};

/// Results of one executed batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// One result per input transaction, in input order.
    pub results: Vec<ExecTxResult>,
    pub stats: ExecutionStats,
}

/// Strategy for running a batch of block transactions.
///
/// The batch executes on top of `store`; when `execute` returns `Ok`, every
/// write of the batch has been merged into `store` in block order.
///
/// # Implementing a New Executor
///
/// ```ignore
/// use occ_node::executor::{BatchOutcome, Executor};
///
/// struct Replay;
///
/// impl Executor for Replay {
///     fn execute(
///         &self,
///         store: &mut dyn KvStoreMut,
///         processor: &TxProcessor<'_>,
///         txs: &[BlockTx],
///     ) -> Result<BatchOutcome, BlockError> {
///         // Run `processor` for each transaction and merge the writes.
///         todo!()
///     }
///
///     fn name(&self) -> &'static str {
///         "replay"
///     }
/// }
/// ```
pub trait Executor: Send + Sync {
    fn execute(
        &self,
        store: &mut dyn KvStoreMut,
        processor: &TxProcessor<'_>,
        txs: &[BlockTx],
    ) -> Result<BatchOutcome, BlockError>;

    /// Returns a human-readable name for this executor.
    fn name(&self) -> &'static str {
        "unknown"
    }
}
