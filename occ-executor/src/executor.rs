//! Parallel block executor.
//!
//! [`ParallelExecutor::execute_block`] runs every transaction of a block
//! speculatively on a pool of scoped worker threads. Each incarnation goes
//! through a [`VersionedView`]; its read and write sets are recorded in the
//! [`MVHashMap`] and validated by the [`Scheduler`]'s validation tasks.
//!
//! If a transaction is re-executed more than `max_incarnation` times the
//! workers stop and the remaining work is finished sequentially in block
//! order on the same multi-version state. Either way the outputs and write
//! sets are those of a serial run.

use crate::kv::{apply_write_set, KvStore, KvStoreMut, WriteSet};
use crate::mvhashmap::MVHashMap;
use crate::scheduler::{Scheduler, Task};
use crate::types::{Abort, ExecutionStatus, Incarnation, Key, TxnIndex, Version};
use crate::view::{TxnState, VersionedView};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Application logic run for each transaction.
///
/// `execute` must be deterministic given the values it reads, and must stop
/// and return the [`Abort`] as soon as `state` yields one.
pub trait TxHandler: Sync {
    type Tx: Sync;
    type Output: Send;

    fn execute(
        &self,
        txn_idx: TxnIndex,
        tx: &Self::Tx,
        state: &mut dyn TxnState,
    ) -> Result<Self::Output, Abort>;

    /// Keys the transaction is expected to write, if known up front.
    fn estimated_writes(&self, _tx: &Self::Tx) -> Option<Vec<Key>> {
        None
    }
}

/// Errors from parallel block execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("worker thread panicked")]
    WorkerPanicked,
    #[error("transaction {txn_idx}: {reason}")]
    InvariantViolation { txn_idx: TxnIndex, reason: String },
}

/// Configuration for parallel execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads.
    pub num_threads: usize,
    /// Incarnation past which execution falls back to sequential.
    pub max_incarnation: Incarnation,
    /// Mark declared write keys as estimates before execution starts.
    pub prefill_estimates: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_threads: std::thread::available_parallelism().map_or(4, |n| n.get()),
            max_incarnation: 10,
            prefill_estimates: false,
        }
    }
}

/// Counters collected while executing a block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionStats {
    /// Handler invocations, re-executions included.
    pub executions: usize,
    pub validations: usize,
    /// Executions stopped by an estimate read.
    pub estimate_aborts: usize,
    /// Incarnations invalidated by validation.
    pub validation_aborts: usize,
    pub highest_incarnation: Incarnation,
    /// The incarnation limit was hit and the block was finished sequentially.
    pub sequential_fallback: bool,
    pub duration: Duration,
}

/// Result of parallel block execution.
#[derive(Debug)]
pub struct BlockExecutionResult<O> {
    /// Handler output per transaction, in block order.
    pub outputs: Vec<O>,
    /// Final write set per transaction, in block order.
    pub write_sets: Vec<WriteSet>,
    pub stats: ExecutionStats,
}

impl<O> BlockExecutionResult<O> {
    /// Merges all write sets into `store` in block order.
    pub fn apply_to<S: KvStoreMut + ?Sized>(&self, store: &mut S) {
        for write_set in &self.write_sets {
            apply_write_set(store, write_set);
        }
    }
}

/// Parallel OCC executor.
pub struct ParallelExecutor {
    config: ExecutorConfig,
}

impl ParallelExecutor {
    /// Creates a new parallel executor.
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Executes `txs` against `base`, which is left untouched.
    pub fn execute_block<S, H>(
        &self,
        base: &S,
        handler: &H,
        txs: &[H::Tx],
    ) -> Result<BlockExecutionResult<H::Output>, ExecutorError>
    where
        S: KvStore + ?Sized,
        H: TxHandler,
    {
        let start = Instant::now();
        if txs.is_empty() {
            return Ok(BlockExecutionResult {
                outputs: Vec::new(),
                write_sets: Vec::new(),
                stats: ExecutionStats::default(),
            });
        }

        let run = BlockRun::new(base, handler, txs, self.config.max_incarnation);
        if self.config.prefill_estimates {
            run.prefill();
        }

        let num_threads = self.config.num_threads.clamp(1, txs.len());
        debug!(num_txns = txs.len(), num_threads, "executing block");

        let joined = crossbeam::scope(|s| {
            for worker_id in 0..num_threads {
                let run = &run;
                s.spawn(move |_| run.worker_loop(worker_id));
            }
        });
        if joined.is_err() || run.panicked.load(Ordering::Acquire) {
            return Err(ExecutorError::WorkerPanicked);
        }

        let fell_back = run.scheduler.halted();
        if fell_back {
            warn!(
                num_txns = txs.len(),
                highest_incarnation = run.scheduler.highest_incarnation(),
                "falling back to sequential execution"
            );
            run.finish_sequentially()?;
        } else {
            run.check_final_state()?;
        }

        let mut stats = run.counters.snapshot();
        stats.highest_incarnation = run.scheduler.highest_incarnation();
        stats.sequential_fallback = fell_back;
        stats.duration = start.elapsed();

        let write_sets = (0..txs.len()).map(|idx| run.mv.write_set(idx)).collect();
        let outputs = run
            .outputs
            .into_iter()
            .enumerate()
            .map(|(txn_idx, slot)| {
                slot.into_inner().ok_or_else(|| ExecutorError::InvariantViolation {
                    txn_idx,
                    reason: "no output recorded".to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(?stats, "block executed");
        Ok(BlockExecutionResult {
            outputs,
            write_sets,
            stats,
        })
    }
}

#[derive(Default)]
struct Counters {
    executions: AtomicUsize,
    validations: AtomicUsize,
    estimate_aborts: AtomicUsize,
    validation_aborts: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> ExecutionStats {
        ExecutionStats {
            executions: self.executions.load(Ordering::Relaxed),
            validations: self.validations.load(Ordering::Relaxed),
            estimate_aborts: self.estimate_aborts.load(Ordering::Relaxed),
            validation_aborts: self.validation_aborts.load(Ordering::Relaxed),
            ..ExecutionStats::default()
        }
    }
}

/// Flags the run as failed if a worker unwinds, so the others stop waiting
/// for a task that will never finish.
struct PanicGuard<'a>(&'a AtomicBool);

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.store(true, Ordering::Release);
        }
    }
}

/// Shared state of one block execution.
struct BlockRun<'a, S: ?Sized, H: TxHandler> {
    base: &'a S,
    handler: &'a H,
    txs: &'a [H::Tx],
    mv: MVHashMap,
    scheduler: Scheduler,
    outputs: Vec<Mutex<Option<H::Output>>>,
    counters: Counters,
    panicked: AtomicBool,
}

impl<'a, S, H> BlockRun<'a, S, H>
where
    S: KvStore + ?Sized,
    H: TxHandler,
{
    fn new(base: &'a S, handler: &'a H, txs: &'a [H::Tx], max_incarnation: Incarnation) -> Self {
        Self {
            base,
            handler,
            txs,
            mv: MVHashMap::new(txs.len()),
            scheduler: Scheduler::new(txs.len(), max_incarnation),
            outputs: txs.iter().map(|_| Mutex::new(None)).collect(),
            counters: Counters::default(),
            panicked: AtomicBool::new(false),
        }
    }

    fn prefill(&self) {
        for (txn_idx, tx) in self.txs.iter().enumerate() {
            if let Some(keys) = self.handler.estimated_writes(tx) {
                self.mv.prefill_estimates(txn_idx, &keys);
            }
        }
    }

    fn worker_loop(&self, worker_id: usize) {
        let _guard = PanicGuard(&self.panicked);
        let backoff = Backoff::new();
        let mut task = None;

        while !self.scheduler.done() && !self.panicked.load(Ordering::Acquire) {
            task = match task {
                Some(Task::Execute(version)) => self.try_execute(version),
                Some(Task::Validate(version)) => self.needs_reexecution(version),
                None => {
                    let next = self.scheduler.next_task();
                    if next.is_none() {
                        backoff.snooze();
                    } else {
                        backoff.reset();
                    }
                    next
                }
            };
        }
        trace!(worker_id, "worker finished");
    }

    /// Runs one incarnation and records it, or parks it on a dependency.
    fn try_execute(&self, version: Version) -> Option<Task> {
        let Version {
            txn_idx,
            incarnation,
        } = version;

        loop {
            self.counters.executions.fetch_add(1, Ordering::Relaxed);
            let mut view = VersionedView::new(version, &self.mv, self.base);
            let result = self.handler.execute(txn_idx, &self.txs[txn_idx], &mut view);

            let output = match (view.abort(), result) {
                (None, Ok(output)) => output,
                (Some(abort), _) | (None, Err(abort)) => {
                    self.counters.estimate_aborts.fetch_add(1, Ordering::Relaxed);
                    trace!(%version, blocking = abort.dependent_txn_idx, "read estimate");
                    if self.scheduler.add_dependency(txn_idx, abort.dependent_txn_idx) {
                        return None;
                    }
                    // The blocking transaction finished in the meantime.
                    continue;
                }
            };

            let (reads, ranges, writes) = view.into_sets();
            *self.outputs[txn_idx].lock() = Some(output);
            let wrote_new_location = self.mv.record(version, reads, ranges, writes);
            return self
                .scheduler
                .finish_execution(txn_idx, incarnation, wrote_new_location);
        }
    }

    /// Validates an incarnation and aborts it if its reads went stale.
    fn needs_reexecution(&self, version: Version) -> Option<Task> {
        let Version {
            txn_idx,
            incarnation,
        } = version;
        self.counters.validations.fetch_add(1, Ordering::Relaxed);

        let valid = self.mv.validate_read_set(txn_idx, self.base);
        let aborted = !valid && self.scheduler.try_validation_abort(txn_idx, incarnation);
        if aborted {
            self.counters.validation_aborts.fetch_add(1, Ordering::Relaxed);
            trace!(%version, "validation failed");
            self.mv.convert_writes_to_estimates(txn_idx);
        }
        self.scheduler.finish_validation(txn_idx, incarnation, aborted)
    }

    /// Completes a halted run in block order on the quiescent state.
    ///
    /// A transaction whose last incarnation still validates against its
    /// predecessors is kept; any other is re-executed here. Every lower
    /// transaction is final by then, so no estimate can be read.
    fn finish_sequentially(&self) -> Result<(), ExecutorError> {
        for txn_idx in 0..self.txs.len() {
            let status = self.scheduler.status(txn_idx);
            if status.is_executed()
                && self.outputs[txn_idx].lock().is_some()
                && self.mv.validate_read_set(txn_idx, self.base)
            {
                self.scheduler
                    .set_status(txn_idx, ExecutionStatus::Validated(status.incarnation()));
                continue;
            }

            let version = Version::new(txn_idx, status.incarnation() + 1);
            self.counters.executions.fetch_add(1, Ordering::Relaxed);
            let mut view = VersionedView::new(version, &self.mv, self.base);
            let result = self.handler.execute(txn_idx, &self.txs[txn_idx], &mut view);
            let output = match (view.abort(), result) {
                (None, Ok(output)) => output,
                (Some(abort), _) | (None, Err(abort)) => {
                    return Err(ExecutorError::InvariantViolation {
                        txn_idx,
                        reason: format!("aborted during sequential execution: {abort}"),
                    });
                }
            };

            let (reads, ranges, writes) = view.into_sets();
            *self.outputs[txn_idx].lock() = Some(output);
            self.mv.record(version, reads, ranges, writes);
            self.scheduler
                .set_status(txn_idx, ExecutionStatus::Validated(version.incarnation));
        }
        Ok(())
    }

    /// Every transaction must have a recorded incarnation whose reads are
    /// still those of a serial run.
    fn check_final_state(&self) -> Result<(), ExecutorError> {
        for txn_idx in 0..self.txs.len() {
            let status = self.scheduler.status(txn_idx);
            if !status.is_executed() {
                return Err(ExecutorError::InvariantViolation {
                    txn_idx,
                    reason: format!("finished in status {status:?}"),
                });
            }
            if !self.mv.validate_read_set(txn_idx, self.base) {
                return Err(ExecutorError::InvariantViolation {
                    txn_idx,
                    reason: "stale read-set after completion".to_string(),
                });
            }
        }
        Ok(())
    }
}
