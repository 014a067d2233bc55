//! Sequential transaction executor.
//!
//! The baseline executor runs transactions one at a time in block order
//! without a multi-version store. Each transaction writes into a private
//! overlay that is committed before the next one starts, which makes this
//! path the reference the parallel executor is checked against.

use std::time::Instant;

use super::{BatchOutcome, Executor};
use crate::error::BlockError;
use crate::processor::{BlockTx, TxProcessor};
use occ_executor::{
    apply_write_set, merge_writes, Abort, Checkpoint, ExecutionStats, Key, KvStore, KvStoreMut,
    TxnState, Value, WriteSet,
};

/// Write-buffering view over a committed store.
///
/// Reads fall through to the store; they never abort.
pub struct SequentialView<'a, S: KvStore + ?Sized> {
    base: &'a S,
    writes: WriteSet,
}

impl<'a, S: KvStore + ?Sized> SequentialView<'a, S> {
    pub fn new(base: &'a S) -> Self {
        Self {
            base,
            writes: WriteSet::new(),
        }
    }

    /// Buffered writes, ready to be applied to the base store.
    pub fn into_writes(self) -> WriteSet {
        self.writes
    }
}

impl<S: KvStore + ?Sized> TxnState for SequentialView<'_, S> {
    fn get(&mut self, key: &[u8]) -> Result<Option<Value>, Abort> {
        match self.writes.get(key) {
            Some(value) => Ok(value.clone()),
            None => Ok(self.base.get(key)),
        }
    }

    fn set(&mut self, key: &[u8], value: Value) {
        self.writes.insert(key.to_vec(), Some(value));
    }

    fn delete(&mut self, key: &[u8]) {
        self.writes.insert(key.to_vec(), None);
    }

    fn iterate(&mut self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<(Key, Value)>, Abort> {
        Ok(merge_writes(
            self.base.iterator(start, end),
            &self.writes,
            start,
            end,
        ))
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(self.writes.clone())
    }

    fn revert_to(&mut self, checkpoint: Checkpoint) {
        self.writes = checkpoint.into_writes();
    }
}

/// Sequential executor that processes transactions one at a time.
#[derive(Debug, Clone, Default)]
pub struct SequentialExecutor;

impl SequentialExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for SequentialExecutor {
    fn execute(
        &self,
        store: &mut dyn KvStoreMut,
        processor: &TxProcessor<'_>,
        txs: &[BlockTx],
    ) -> Result<BatchOutcome, BlockError> {
        let start = Instant::now();
        let mut results = Vec::with_capacity(txs.len());

        for tx in txs {
            let mut view = SequentialView::new(&*store);
            // A committed store has no estimate markers to trip over.
            let result = processor.process(&mut view, tx).map_err(|abort| {
                BlockError::Invariant(format!(
                    "transaction {} aborted without concurrency: {abort}",
                    tx.index
                ))
            })?;
            let writes = view.into_writes();
            apply_write_set(store, &writes);
            results.push(result);
        }

        Ok(BatchOutcome {
            results,
            stats: ExecutionStats {
                executions: txs.len(),
                duration: start.elapsed(),
                ..ExecutionStats::default()
            },
        })
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}
