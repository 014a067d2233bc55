//! Optimistic parallel executor for blocks of transactions.
//!
//! Transactions are executed speculatively on several threads against a
//! multi-version view of the state, and every incarnation is validated
//! before it counts. The committed result is always that of running the
//! block serially in index order.
//!
//! # Core Components
//!
//! - **MVHashMap**: multi-version store of the writes of every transaction
//! - **VersionedView**: per-incarnation state access that records reads
//! - **Scheduler**: hands out execution and validation tasks, tracks
//!   dependencies between transactions
//! - **ParallelExecutor**: runs the worker pool and produces per-transaction
//!   outputs and write sets
//!
//! # Algorithm Overview
//!
//! 1. Workers pick the lowest pending task, execution or validation
//! 2. A read that hits an estimate marker aborts the incarnation, which waits
//!    for the writer to finish
//! 3. Validation replays the read-set; a stale read turns the writes into
//!    estimates and schedules a new incarnation
//! 4. Write sets are merged into the canonical store in block order
//!
//! # Example
//!
//! ```rust,ignore
//! use occ_executor::{ExecutorConfig, MemStore, ParallelExecutor};
//!
//! let executor = ParallelExecutor::new(ExecutorConfig::default());
//! let result = executor.execute_block(&store, &handler, &txs)?;
//! result.apply_to(&mut store);
//! ```

pub mod executor;
pub mod kv;
pub mod mvhashmap;
pub mod scheduler;
pub mod types;
pub mod view;

pub use executor::{
    BlockExecutionResult, ExecutionStats, ExecutorConfig, ExecutorError, ParallelExecutor, TxHandler,
};
pub use kv::{
    apply_write_set, merge_writes, KvIter, KvStore, KvStoreMut, MemStore, OverlayStore, WriteSet,
};
pub use mvhashmap::{MVHashMap, ReadResult};
pub use scheduler::{Scheduler, SchedulerStats, Task};
pub use types::{Abort, AbortReason, ExecutionStatus, Incarnation, Key, TxnIndex, Value, Version};
pub use view::{Checkpoint, TxnState, VersionedView};
