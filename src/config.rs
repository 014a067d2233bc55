//! Node configuration.

use alloy_primitives::U256;
use occ_executor::ExecutorConfig;

/// Configuration threaded through the block pipeline constructor.
///
/// Read once at startup; nothing here is consulted through globals.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Worker threads for parallel execution.
    pub workers: usize,
    /// Use the OCC executor. Ignored when `workers <= 1`.
    pub occ_enabled: bool,
    /// Incarnation past which a block falls back to sequential execution.
    pub max_incarnation: usize,
    /// Recover and check the signer of every transaction.
    pub verify_signatures: bool,
    /// Run oracle vote transactions in a batch before the others.
    pub prioritize_oracle_votes: bool,
    /// Mark the keys each transaction is known to write as estimates before
    /// execution starts.
    pub prefill_estimates: bool,
    pub chain_id: u64,
    /// Minimum fee per unit of gas limit.
    pub min_gas_price: U256,
    /// Epoch length in blocks.
    pub blocks_per_epoch: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(4, |n| n.get()),
            occ_enabled: true,
            max_incarnation: 10,
            verify_signatures: true,
            prioritize_oracle_votes: false,
            prefill_estimates: false,
            chain_id: 1,
            min_gas_price: U256::ZERO,
            blocks_per_epoch: 100,
        }
    }
}

impl NodeConfig {
    /// Whether blocks run through the parallel executor.
    pub fn use_occ(&self) -> bool {
        self.occ_enabled && self.workers > 1
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            num_threads: self.workers,
            max_incarnation: self.max_incarnation,
            prefill_estimates: self.prefill_estimates,
        }
    }
}
