//! Scheduler for coordinating parallel execution and validation.
//!
//! Workers share two cursors: `execution_idx` (next transaction to run) and
//! `validation_idx` (next transaction whose read-set must be checked). Both
//! only move down when work has to be redone, so workers always pick the
//! lowest-index task available. A transaction that reads an estimate parks on
//! the writer and is resumed once the writer finishes executing. When a
//! validation fails, the transaction is re-incarnated and every transaction
//! above it is re-validated.

use crate::types::{ExecutionStatus, Incarnation, TxnIndex, Version};
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Task for a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Execute a transaction at a specific incarnation.
    Execute(Version),
    /// Validate the read-set of a specific incarnation.
    Validate(Version),
}

/// Scheduler state for coordinating parallel execution.
pub struct Scheduler {
    /// Number of transactions in the block.
    num_txns: usize,

    /// Next transaction index to try to execute.
    execution_idx: CachePadded<AtomicUsize>,

    /// Next transaction index to try to validate.
    validation_idx: CachePadded<AtomicUsize>,

    /// Bumped whenever a cursor moves down; guards the done check.
    decrease_cnt: CachePadded<AtomicUsize>,

    /// Tasks handed out and not yet finished.
    num_active_tasks: CachePadded<AtomicUsize>,

    /// Whether execution is done.
    done_marker: CachePadded<AtomicBool>,

    /// Set when an incarnation exceeds `max_incarnation`.
    halted: AtomicBool,

    /// Incarnation above which the parallel run gives up.
    max_incarnation: Incarnation,

    /// Highest incarnation handed out so far.
    highest_incarnation: AtomicUsize,

    /// Execution status for each transaction.
    statuses: Vec<CachePadded<Mutex<ExecutionStatus>>>,

    /// Transactions parked on each index.
    dependencies: Vec<CachePadded<Mutex<Vec<TxnIndex>>>>,
}

impl Scheduler {
    /// Creates a new scheduler for a block of transactions.
    pub fn new(num_txns: usize, max_incarnation: Incarnation) -> Self {
        Self {
            num_txns,
            execution_idx: CachePadded::new(AtomicUsize::new(0)),
            validation_idx: CachePadded::new(AtomicUsize::new(0)),
            decrease_cnt: CachePadded::new(AtomicUsize::new(0)),
            num_active_tasks: CachePadded::new(AtomicUsize::new(0)),
            done_marker: CachePadded::new(AtomicBool::new(false)),
            halted: AtomicBool::new(false),
            max_incarnation,
            highest_incarnation: AtomicUsize::new(0),
            statuses: (0..num_txns)
                .map(|_| CachePadded::new(Mutex::new(ExecutionStatus::Pending(0))))
                .collect(),
            dependencies: (0..num_txns)
                .map(|_| CachePadded::new(Mutex::new(Vec::new())))
                .collect(),
        }
    }

    pub fn num_txns(&self) -> usize {
        self.num_txns
    }

    /// True once every transaction is validated, or the run was halted.
    pub fn done(&self) -> bool {
        self.done_marker.load(Ordering::Acquire) || self.halted()
    }

    /// True if the incarnation limit was hit.
    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Gets the next task for a worker thread, or `None` if nothing is ready.
    pub fn next_task(&self) -> Option<Task> {
        if self.validation_idx.load(Ordering::Acquire) < self.execution_idx.load(Ordering::Acquire) {
            self.next_version_to_validate().map(Task::Validate)
        } else {
            self.next_version_to_execute().map(Task::Execute)
        }
    }

    fn next_version_to_execute(&self) -> Option<Version> {
        if self.execution_idx.load(Ordering::Acquire) >= self.num_txns {
            self.check_done();
            return None;
        }
        self.num_active_tasks.fetch_add(1, Ordering::AcqRel);
        let idx = self.execution_idx.fetch_add(1, Ordering::AcqRel);
        self.try_incarnate(idx)
    }

    fn next_version_to_validate(&self) -> Option<Version> {
        if self.validation_idx.load(Ordering::Acquire) >= self.num_txns {
            self.check_done();
            return None;
        }
        self.num_active_tasks.fetch_add(1, Ordering::AcqRel);
        let idx = self.validation_idx.fetch_add(1, Ordering::AcqRel);
        if idx < self.num_txns {
            let status = *self.statuses[idx].lock();
            if status.is_executed() {
                return Some(Version::new(idx, status.incarnation()));
            }
        }
        self.num_active_tasks.fetch_sub(1, Ordering::AcqRel);
        None
    }

    /// Claims `txn_idx` for execution if it is pending.
    fn try_incarnate(&self, txn_idx: TxnIndex) -> Option<Version> {
        if txn_idx < self.num_txns {
            let mut status = self.statuses[txn_idx].lock();
            if let ExecutionStatus::Pending(incarnation) = *status {
                *status = ExecutionStatus::Executing(incarnation);
                return Some(Version::new(txn_idx, incarnation));
            }
        }
        self.num_active_tasks.fetch_sub(1, Ordering::AcqRel);
        None
    }

    fn check_done(&self) {
        let observed = self.decrease_cnt.load(Ordering::Acquire);
        let execution_idx = self.execution_idx.load(Ordering::Acquire);
        let validation_idx = self.validation_idx.load(Ordering::Acquire);
        if execution_idx.min(validation_idx) >= self.num_txns
            && self.num_active_tasks.load(Ordering::Acquire) == 0
            && observed == self.decrease_cnt.load(Ordering::Acquire)
        {
            self.done_marker.store(true, Ordering::Release);
        }
    }

    fn decrease_execution_idx(&self, target: TxnIndex) {
        self.execution_idx.fetch_min(target, Ordering::AcqRel);
        self.decrease_cnt.fetch_add(1, Ordering::AcqRel);
    }

    fn decrease_validation_idx(&self, target: TxnIndex) {
        self.validation_idx.fetch_min(target, Ordering::AcqRel);
        self.decrease_cnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Parks `txn_idx` until `blocking_txn_idx` finishes executing.
    ///
    /// Returns false if the dependency was already resolved, in which case the
    /// caller should simply re-run the same incarnation.
    pub fn add_dependency(&self, txn_idx: TxnIndex, blocking_txn_idx: TxnIndex) -> bool {
        {
            let mut dependents = self.dependencies[blocking_txn_idx].lock();
            if self.statuses[blocking_txn_idx].lock().is_executed() {
                return false;
            }

            let mut status = self.statuses[txn_idx].lock();
            debug_assert!(matches!(*status, ExecutionStatus::Executing(_)));
            *status = ExecutionStatus::Aborting(status.incarnation());
            dependents.push(txn_idx);
        }
        self.num_active_tasks.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Moves an aborting transaction to its next incarnation.
    fn set_ready_status(&self, txn_idx: TxnIndex) {
        let next = {
            let mut status = self.statuses[txn_idx].lock();
            debug_assert!(matches!(*status, ExecutionStatus::Aborting(_)));
            let next = status.incarnation() + 1;
            *status = ExecutionStatus::Pending(next);
            next
        };

        self.highest_incarnation.fetch_max(next, Ordering::AcqRel);
        if next > self.max_incarnation && !self.halted.swap(true, Ordering::AcqRel) {
            warn!(
                txn_idx,
                incarnation = next,
                limit = self.max_incarnation,
                "incarnation limit reached, halting parallel execution"
            );
        }
    }

    fn resume_dependencies(&self, dependents: Vec<TxnIndex>) {
        let Some(&min_dependent) = dependents.iter().min() else {
            return;
        };
        for &dependent in &dependents {
            self.set_ready_status(dependent);
        }
        self.decrease_execution_idx(min_dependent);
    }

    /// Marks an incarnation as executed and resumes transactions parked on it.
    ///
    /// Returns a validation task for the same incarnation when the validation
    /// cursor already passed it.
    pub fn finish_execution(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        wrote_new_location: bool,
    ) -> Option<Task> {
        {
            let mut status = self.statuses[txn_idx].lock();
            debug_assert_eq!(*status, ExecutionStatus::Executing(incarnation));
            *status = ExecutionStatus::Executed(incarnation);
        }

        let dependents = std::mem::take(&mut *self.dependencies[txn_idx].lock());
        self.resume_dependencies(dependents);

        if self.validation_idx.load(Ordering::Acquire) > txn_idx {
            if wrote_new_location {
                // Everything above may have read through the new location.
                self.decrease_validation_idx(txn_idx);
            } else {
                return Some(Task::Validate(Version::new(txn_idx, incarnation)));
            }
        }
        self.num_active_tasks.fetch_sub(1, Ordering::AcqRel);
        None
    }

    /// Claims the right to abort an incarnation that failed validation.
    ///
    /// Only the first failing validation of an incarnation wins.
    pub fn try_validation_abort(&self, txn_idx: TxnIndex, incarnation: Incarnation) -> bool {
        let mut status = self.statuses[txn_idx].lock();
        match *status {
            ExecutionStatus::Executed(inc) | ExecutionStatus::Validated(inc) if inc == incarnation => {
                *status = ExecutionStatus::Aborting(incarnation);
                true
            }
            _ => false,
        }
    }

    /// Completes a validation task.
    ///
    /// On abort, schedules the next incarnation (returning it directly when
    /// the execution cursor is already past it) and forces re-validation of
    /// every higher transaction.
    pub fn finish_validation(
        &self,
        txn_idx: TxnIndex,
        incarnation: Incarnation,
        aborted: bool,
    ) -> Option<Task> {
        if aborted {
            self.set_ready_status(txn_idx);
            self.decrease_validation_idx(txn_idx + 1);
            if self.execution_idx.load(Ordering::Acquire) > txn_idx {
                // The active task slot carries over to the re-execution;
                // try_incarnate releases it on failure.
                return self.try_incarnate(txn_idx).map(Task::Execute);
            }
        } else {
            let mut status = self.statuses[txn_idx].lock();
            if *status == ExecutionStatus::Executed(incarnation) {
                *status = ExecutionStatus::Validated(incarnation);
            }
        }
        self.num_active_tasks.fetch_sub(1, Ordering::AcqRel);
        None
    }

    /// Gets the current status of a transaction.
    pub fn status(&self, txn_idx: TxnIndex) -> ExecutionStatus {
        *self.statuses[txn_idx].lock()
    }

    /// Overrides a status. Only used by the sequential fallback once all
    /// workers have stopped.
    pub(crate) fn set_status(&self, txn_idx: TxnIndex, status: ExecutionStatus) {
        *self.statuses[txn_idx].lock() = status;
    }

    /// Highest incarnation any transaction reached.
    pub fn highest_incarnation(&self) -> Incarnation {
        self.highest_incarnation.load(Ordering::Acquire)
    }

    /// Gets statistics about execution progress.
    pub fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats::default();
        for status in &self.statuses {
            match *status.lock() {
                ExecutionStatus::Pending(_) => stats.pending += 1,
                ExecutionStatus::Executing(_) => stats.executing += 1,
                ExecutionStatus::Executed(_) => stats.executed += 1,
                ExecutionStatus::Validated(_) => stats.validated += 1,
                ExecutionStatus::Aborting(_) => stats.aborting += 1,
            }
        }
        debug!(?stats, "scheduler progress");
        stats
    }
}

/// Statistics about scheduler state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub pending: usize,
    pub executing: usize,
    pub executed: usize,
    pub validated: usize,
    pub aborting: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Polls until a task is handed out; a look at a not-yet-executed
    /// validation index returns `None` while moving the cursor.
    fn next(scheduler: &Scheduler) -> Task {
        for _ in 0..16 {
            if let Some(task) = scheduler.next_task() {
                return task;
            }
        }
        panic!("no task available");
    }

    #[test]
    fn test_scheduler_basic() {
        let scheduler = Scheduler::new(3, 10);

        // Lowest indices come first.
        assert_eq!(next(&scheduler), Task::Execute(Version::new(0, 0)));
        assert_eq!(next(&scheduler), Task::Execute(Version::new(1, 0)));
        assert_eq!(scheduler.status(1), ExecutionStatus::Executing(0));
    }

    #[test]
    fn test_execute_then_validate_until_done() {
        let scheduler = Scheduler::new(2, 10);

        assert_eq!(next(&scheduler), Task::Execute(Version::new(0, 0)));
        assert_eq!(scheduler.finish_execution(0, 0, true), None);

        // Validation cursor trails the execution cursor now.
        assert_eq!(next(&scheduler), Task::Validate(Version::new(0, 0)));
        assert_eq!(scheduler.finish_validation(0, 0, false), None);
        assert_eq!(scheduler.status(0), ExecutionStatus::Validated(0));

        assert_eq!(next(&scheduler), Task::Execute(Version::new(1, 0)));
        assert_eq!(scheduler.finish_execution(1, 0, true), None);
        assert_eq!(next(&scheduler), Task::Validate(Version::new(1, 0)));
        assert_eq!(scheduler.finish_validation(1, 0, false), None);

        assert!(!scheduler.done());
        assert_eq!(scheduler.next_task(), None);
        assert!(scheduler.done());
        assert_eq!(scheduler.stats().validated, 2);
    }

    #[test]
    fn test_abort_and_reexecute() {
        let scheduler = Scheduler::new(2, 10);

        assert_eq!(next(&scheduler), Task::Execute(Version::new(0, 0)));
        assert_eq!(next(&scheduler), Task::Execute(Version::new(1, 0)));
        scheduler.finish_execution(0, 0, true);
        scheduler.finish_execution(1, 0, true);

        // Transaction 1 fails validation; only one validator wins the abort.
        assert!(scheduler.try_validation_abort(1, 0));
        assert!(!scheduler.try_validation_abort(1, 0));

        // The same worker gets the re-execution directly.
        assert_eq!(
            scheduler.finish_validation(1, 0, true),
            Some(Task::Execute(Version::new(1, 1)))
        );
        assert_eq!(scheduler.status(1), ExecutionStatus::Executing(1));
        assert_eq!(scheduler.highest_incarnation(), 1);
    }

    #[test]
    fn test_dependency_resumes_after_blocking_executes() {
        let scheduler = Scheduler::new(2, 10);
        assert_eq!(next(&scheduler), Task::Execute(Version::new(0, 0)));
        assert_eq!(next(&scheduler), Task::Execute(Version::new(1, 0)));

        // 1 read an estimate written by 0, which is still executing.
        assert!(scheduler.add_dependency(1, 0));
        assert_eq!(scheduler.status(1), ExecutionStatus::Aborting(0));

        scheduler.finish_execution(0, 0, true);
        assert_eq!(scheduler.status(1), ExecutionStatus::Pending(1));

        // Validation of 0 is preferred, then 1 runs its next incarnation.
        assert_eq!(next(&scheduler), Task::Validate(Version::new(0, 0)));
        scheduler.finish_validation(0, 0, false);
        assert_eq!(next(&scheduler), Task::Execute(Version::new(1, 1)));

        // A dependency on an executed transaction is already resolved.
        assert!(!scheduler.add_dependency(1, 0));
    }

    #[test]
    fn test_incarnation_limit_halts() {
        let scheduler = Scheduler::new(1, 1);
        let mut task = Some(next(&scheduler));
        for expected in 0..2 {
            let Some(Task::Execute(v)) = task else {
                panic!("Expected Execute task");
            };
            assert_eq!(v.incarnation, expected);
            scheduler.finish_execution(0, v.incarnation, true);
            assert!(scheduler.try_validation_abort(0, v.incarnation));
            task = scheduler.finish_validation(0, v.incarnation, true);
        }
        assert!(scheduler.halted());
        assert!(scheduler.done());
    }
}
