//! Block pipeline: begin-block hooks, transaction batches, end-block hooks.

use std::collections::BTreeSet;
use std::time::Instant;

use alloy_primitives::{Address, B256, U256};
use occ_executor::{apply_write_set, ExecutionStats, KvStoreMut, MemStore, OverlayStore};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::ante::{AnteHandler, DefaultAnteHandler};
use crate::config::NodeConfig;
use crate::context::{BlockMeta, Event};
use crate::error::BlockError;
use crate::executor::{BatchOutcome, Executor, OccExecutor, SequentialExecutor};
use crate::gas::GasConfig;
use crate::hooks::{BlockHooks, BlockSummary, HookContext, ValidatorUpdate};
use crate::processor::{BlockTx, ExecTxResult, TxProcessor};
use crate::router::MsgRouter;
use crate::state::{
    decode_u256, power_key, StoreExt, StoreMutExt, DEFERRED_FEE_PREFIX, FEE_COLLECTOR, SUPPLY_KEY,
};
use crate::tx::{decode_tx, Tx};

/// Initial balances and validator stakes.
#[derive(Debug, Clone, Default)]
pub struct Genesis {
    pub accounts: Vec<(Address, U256)>,
    /// Validators and their bonded tokens.
    pub validators: Vec<(Address, U256)>,
}

/// Everything consensus gets back for one block.
#[derive(Debug, Clone)]
pub struct BlockOutcome {
    pub height: u64,
    /// Events emitted by block hooks.
    pub events: Vec<Event>,
    /// One result per transaction, in block order.
    pub tx_results: Vec<ExecTxResult>,
    pub validator_updates: Vec<ValidatorUpdate>,
    pub app_hash: B256,
    pub stats: ExecutionStats,
}

/// Processes blocks against the canonical store.
pub struct BlockPipeline {
    config: NodeConfig,
    store: MemStore,
    hooks: BlockHooks,
    ante: Box<dyn AnteHandler>,
    router: MsgRouter,
    gas_config: GasConfig,
    executor: Box<dyn Executor>,
    memstores: BTreeSet<&'static str>,
    last_height: Option<u64>,
}

impl BlockPipeline {
    pub fn new(config: NodeConfig) -> Self {
        let executor: Box<dyn Executor> = if config.use_occ() {
            Box::new(OccExecutor::new(config.executor_config()))
        } else {
            Box::new(SequentialExecutor::new())
        };
        let ante = DefaultAnteHandler {
            chain_id: config.chain_id,
            verify_signatures: config.verify_signatures,
            min_gas_price: config.min_gas_price,
        };

        Self {
            config,
            store: MemStore::new(),
            hooks: BlockHooks::standard(),
            ante: Box::new(ante),
            router: MsgRouter::new(),
            gas_config: GasConfig::default(),
            executor,
            memstores: BTreeSet::new(),
            last_height: None,
        }
    }

    /// Replaces the hook lists.
    pub fn with_hooks(mut self, hooks: BlockHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_ante_handler(mut self, ante: Box<dyn AnteHandler>) -> Self {
        self.ante = ante;
        self
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &MemStore {
        &self.store
    }

    pub fn executor_name(&self) -> &'static str {
        self.executor.name()
    }

    pub fn last_height(&self) -> Option<u64> {
        self.last_height
    }

    /// Seeds balances, validator stakes and the total supply.
    pub fn init_genesis(&mut self, genesis: &Genesis) -> B256 {
        let mut supply = self.store.u256(SUPPLY_KEY);
        for (address, balance) in &genesis.accounts {
            self.store.credit(*address, *balance);
            supply = supply.saturating_add(*balance);
        }
        for (validator, stake) in &genesis.validators {
            let key = power_key(*validator);
            let power = self.store.u256(&key).saturating_add(*stake);
            self.store.set_u256(&key, power);
            supply = supply.saturating_add(*stake);
        }
        self.store.set_u256(SUPPLY_KEY, supply);
        self.store.root_hash()
    }

    /// Runs a block end to end.
    ///
    /// The block executes on an overlay of the canonical store. Its writes
    /// reach the canonical store only once every phase has succeeded.
    pub fn process_block(
        &mut self,
        txs: &[Vec<u8>],
        meta: BlockMeta,
    ) -> Result<BlockOutcome, BlockError> {
        if let Some(last) = self.last_height {
            if meta.height != last + 1 {
                return Err(BlockError::HeightMismatch {
                    last,
                    got: meta.height,
                });
            }
        }

        let start = Instant::now();
        let mut working = OverlayStore::new(&self.store);
        let mut memstores = self.memstores.clone();
        let mut events = Vec::new();

        self.hooks.run_begin(&mut HookContext {
            store: &mut working,
            meta: &meta,
            config: &self.config,
            memstores: &mut memstores,
            events: &mut events,
        })?;

        let decoded: Vec<BlockTx> = txs
            .par_iter()
            .enumerate()
            .map(|(index, bytes)| BlockTx {
                index,
                decoded: decode_tx(bytes),
            })
            .collect();

        let (prioritized, other): (Vec<_>, Vec<_>) = if self.config.prioritize_oracle_votes {
            decoded
                .into_iter()
                .partition(|tx| tx.tx().is_some_and(Tx::is_oracle_vote))
        } else {
            (Vec::new(), decoded)
        };

        let processor = TxProcessor {
            ante: self.ante.as_ref(),
            router: &self.router,
            gas_config: &self.gas_config,
            meta: &meta,
        };

        let mut results: Vec<Option<ExecTxResult>> = vec![None; txs.len()];
        let mut stats = ExecutionStats::default();

        let first = self.run_batch(&mut working, &processor, &prioritized)?;
        collect_batch(&mut results, &mut stats, &prioritized, first);

        self.hooks.run_mid(&mut HookContext {
            store: &mut working,
            meta: &meta,
            config: &self.config,
            memstores: &mut memstores,
            events: &mut events,
        })?;

        let second = self.run_batch(&mut working, &processor, &other)?;
        collect_batch(&mut results, &mut stats, &other, second);

        let tx_results = results
            .into_iter()
            .enumerate()
            .map(|(index, result)| {
                result.ok_or_else(|| BlockError::Invariant(format!("transaction {index} has no result")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let summary = BlockSummary {
            evm_gas_used: tx_results
                .iter()
                .filter(|result| result.evm_tx_info.is_some())
                .map(|result| result.gas_used)
                .sum(),
        };
        let validator_updates = self.hooks.run_end(
            &mut HookContext {
                store: &mut working,
                meta: &meta,
                config: &self.config,
                memstores: &mut memstores,
                events: &mut events,
            },
            &summary,
        )?;

        let writes = working.into_writes();
        apply_write_set(&mut self.store, &writes);
        let app_hash = self.store.root_hash();
        self.memstores = memstores;
        self.last_height = Some(meta.height);
        stats.duration = start.elapsed();

        if stats.sequential_fallback {
            warn!(height = meta.height, "block finished on the sequential fallback");
        }
        info!(
            height = meta.height,
            txs = tx_results.len(),
            latency_ms = stats.duration.as_secs_f64() * 1000.0,
            executor = self.executor.name(),
            workers = self.config.workers,
            executions = stats.executions,
            aborts = stats.estimate_aborts + stats.validation_aborts,
            max_incarnation = stats.highest_incarnation,
            fallback = stats.sequential_fallback,
            writes = writes.len(),
            "processed block"
        );

        Ok(BlockOutcome {
            height: meta.height,
            events,
            tx_results,
            validator_updates,
            app_hash,
            stats,
        })
    }

    /// Executes one batch, then moves its deferred fees to the fee collector.
    fn run_batch(
        &self,
        store: &mut dyn KvStoreMut,
        processor: &TxProcessor<'_>,
        txs: &[BlockTx],
    ) -> Result<BatchOutcome, BlockError> {
        if txs.is_empty() {
            return Ok(BatchOutcome::default());
        }
        let outcome = self.executor.execute(store, processor, txs)?;
        if outcome.results.len() != txs.len() {
            return Err(BlockError::Invariant(format!(
                "{} results for {} transactions",
                outcome.results.len(),
                txs.len()
            )));
        }
        flush_deferred_fees(store)?;
        Ok(outcome)
    }
}

fn collect_batch(
    results: &mut [Option<ExecTxResult>],
    stats: &mut ExecutionStats,
    txs: &[BlockTx],
    outcome: BatchOutcome,
) {
    for (tx, result) in txs.iter().zip(outcome.results) {
        results[tx.index] = Some(result);
    }
    let batch = outcome.stats;
    stats.executions += batch.executions;
    stats.validations += batch.validations;
    stats.estimate_aborts += batch.estimate_aborts;
    stats.validation_aborts += batch.validation_aborts;
    stats.highest_incarnation = stats.highest_incarnation.max(batch.highest_incarnation);
    stats.sequential_fallback |= batch.sequential_fallback;
}

/// Sums every deferred fee into the fee collector account.
pub fn flush_deferred_fees<S: KvStoreMut + ?Sized>(store: &mut S) -> Result<U256, BlockError> {
    let mut total = U256::ZERO;
    for (key, value) in store.prefix_entries(DEFERRED_FEE_PREFIX) {
        let fee = decode_u256(&value)
            .ok_or_else(|| BlockError::Invariant("malformed deferred fee".to_string()))?;
        total = total.saturating_add(fee);
        store.delete(&key);
    }
    if !total.is_zero() {
        store.credit(FEE_COLLECTOR, total);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::hooks::{CapabilityHook, DistributionHook};
    use crate::state::{deferred_fee_key, dirty_key, PRICE_KEY};
    use crate::tx::{Msg, MsgDelegate, MsgEvmCall, MsgOracleVote, MsgSend, TxBody};
    use crate::{Account, Workload, WorkloadConfig};
    use alloy_primitives::Bytes;
    use occ_executor::KvStore;
    use std::sync::Arc;

    const BALANCE: u64 = 1_000_000;

    fn config(workers: usize) -> NodeConfig {
        NodeConfig {
            workers,
            ..NodeConfig::default()
        }
    }

    fn meta(height: u64) -> BlockMeta {
        BlockMeta {
            height,
            time: 1_700_000_000 + height,
            proposer: Address::repeat_byte(0xee),
            hash: B256::repeat_byte(height as u8),
        }
    }

    fn pipeline(workers: usize, accounts: &[Account], validators: &[Account]) -> BlockPipeline {
        pipeline_with(config(workers), accounts, validators)
    }

    fn pipeline_with(
        config: NodeConfig,
        accounts: &[Account],
        validators: &[Account],
    ) -> BlockPipeline {
        let mut pipeline = BlockPipeline::new(config);
        pipeline.init_genesis(&Genesis {
            accounts: accounts
                .iter()
                .chain(validators)
                .map(|account| (account.address, U256::from(BALANCE)))
                .collect(),
            validators: validators
                .iter()
                .map(|validator| (validator.address, U256::from(100)))
                .collect(),
        });
        pipeline
    }

    fn sign(account: &Account, nonce: u64, fee: u64, msgs: &[Msg]) -> Vec<u8> {
        TxBody::new(1, account.address, nonce, U256::from(fee), 200_000, msgs)
            .sign(&account.signing_key)
            .unwrap()
            .encoded()
    }

    fn send(from: &Account, nonce: u64, to: Address, amount: u64) -> Vec<u8> {
        sign(
            from,
            nonce,
            5,
            &[Msg::Send(MsgSend {
                from: from.address,
                to,
                amount: U256::from(amount),
            })],
        )
    }

    fn accounts(range: std::ops::Range<u64>) -> Vec<Account> {
        range.map(Account::from_seed).collect()
    }

    #[test]
    fn test_disjoint_transactions_match_sequential() {
        let users = accounts(0..4);
        let txs = vec![
            send(&users[0], 0, users[1].address, 10),
            send(&users[2], 0, users[3].address, 20),
        ];

        let mut sequential = pipeline(1, &users, &[]);
        let mut occ = pipeline(4, &users, &[]);
        assert_eq!(sequential.executor_name(), "sequential");
        assert_eq!(occ.executor_name(), "occ");

        let expected = sequential.process_block(&txs, meta(1)).unwrap();
        let outcome = occ.process_block(&txs, meta(1)).unwrap();

        assert!(outcome.tx_results.iter().all(ExecTxResult::is_ok));
        assert_eq!(outcome.tx_results, expected.tx_results);
        assert_eq!(outcome.app_hash, expected.app_hash);
        assert_eq!(outcome.stats.validation_aborts, 0);
    }

    #[test]
    fn test_contended_recipient_matches_sequential() {
        let users = accounts(0..10);
        let hot = Address::repeat_byte(0xaa);
        let txs: Vec<_> = users
            .iter()
            .enumerate()
            .map(|(i, user)| send(user, 0, hot, i as u64 + 1))
            .collect();

        let mut sequential = pipeline(1, &users, &[]);
        let mut occ = pipeline(8, &users, &[]);
        let expected = sequential.process_block(&txs, meta(1)).unwrap();
        let outcome = occ.process_block(&txs, meta(1)).unwrap();

        assert_eq!(occ.store().balance(hot), U256::from(55));
        assert_eq!(outcome.tx_results, expected.tx_results);
        assert_eq!(outcome.app_hash, expected.app_hash);
    }

    #[test]
    fn test_mixed_block_is_deterministic() {
        let workload = Workload::generate(WorkloadConfig {
            num_accounts: 12,
            num_transactions: 20,
            conflict_factor: 0.5,
            seed: 7,
            ..WorkloadConfig::default()
        })
        .unwrap();

        let runs: Vec<_> = (0..3)
            .map(|_| {
                let mut occ = BlockPipeline::new(config(4));
                occ.init_genesis(&workload.genesis());
                occ.process_block(&workload.transactions, meta(1)).unwrap()
            })
            .collect();

        for run in &runs[1..] {
            assert_eq!(run.tx_results, runs[0].tx_results);
            assert_eq!(run.app_hash, runs[0].app_hash);
        }
    }

    #[test]
    fn test_rejected_fee_does_not_disturb_siblings() {
        let users = accounts(0..4);
        let strict = NodeConfig {
            min_gas_price: U256::from(1),
            ..config(4)
        };
        let mut occ = pipeline_with(strict, &users, &[]);

        let paying = |from: &Account, to: Address| {
            sign(
                from,
                0,
                200_000,
                &[Msg::Send(MsgSend {
                    from: from.address,
                    to,
                    amount: U256::from(1),
                })],
            )
        };
        let txs = vec![
            paying(&users[0], users[1].address),
            // Fee of 5 against a required 200000.
            send(&users[2], 0, users[3].address, 1),
            paying(&users[3], users[0].address),
        ];
        let outcome = occ.process_block(&txs, meta(1)).unwrap();

        assert!(outcome.tx_results[0].is_ok());
        assert_eq!(outcome.tx_results[1].code, codes::INSUFFICIENT_FEE);
        assert!(outcome.tx_results[2].is_ok());
        assert_eq!(occ.store().account(users[2].address).unwrap().nonce, 0);
        assert_eq!(occ.store().balance(FEE_COLLECTOR), U256::from(400_000));
    }

    #[test]
    fn test_worker_count_never_changes_root() {
        let workload = Workload::generate(WorkloadConfig {
            num_accounts: 30,
            num_transactions: 120,
            conflict_factor: 0.8,
            num_validators: 4,
            invalid_ratio: 0.1,
            seed: 99,
            ..WorkloadConfig::default()
        })
        .unwrap();

        let mut roots = Vec::new();
        let mut results = Vec::new();
        for workers in [1, 2, 3, 4, 8] {
            let mut pipeline = BlockPipeline::new(config(workers));
            pipeline.init_genesis(&workload.genesis());
            let outcome = pipeline
                .process_block(&workload.transactions, meta(1))
                .unwrap();
            roots.push(outcome.app_hash);
            results.push(outcome.tx_results);
        }

        assert!(roots.windows(2).all(|pair| pair[0] == pair[1]));
        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[test]
    fn test_fees_are_flushed_then_distributed() {
        let users = accounts(0..2);
        let validators = accounts(100..102);
        let mut occ = pipeline(4, &users, &validators);

        let txs = vec![send(&users[0], 0, users[1].address, 1)];
        occ.process_block(&txs, meta(1)).unwrap();
        assert_eq!(occ.store().balance(FEE_COLLECTOR), U256::from(5));
        assert!(!occ.store().has(&deferred_fee_key(0)));

        occ.process_block(&[], meta(2)).unwrap();
        assert_eq!(occ.store().balance(FEE_COLLECTOR), U256::ZERO);
        // Equal power: 2 each, the remainder goes to the proposer.
        assert_eq!(
            occ.store().balance(validators[0].address),
            U256::from(BALANCE + 2)
        );
        assert_eq!(occ.store().balance(meta(2).proposer), U256::from(1));
    }

    #[test]
    fn test_prioritized_votes_are_tallied_mid_block() {
        let users = accounts(0..2);
        let validators = accounts(100..103);
        let prioritized = NodeConfig {
            prioritize_oracle_votes: true,
            ..config(4)
        };
        let mut occ = pipeline_with(prioritized, &users, &validators);

        let mut txs = vec![send(&users[0], 0, users[1].address, 1)];
        for (validator, price) in validators.iter().zip([10u64, 30, 20]) {
            txs.push(sign(
                validator,
                0,
                0,
                &[Msg::OracleVote(MsgOracleVote {
                    price: U256::from(price),
                })],
            ));
        }
        let outcome = occ.process_block(&txs, meta(1)).unwrap();

        assert!(outcome.tx_results.iter().all(ExecTxResult::is_ok));
        assert_eq!(occ.store().u256(PRICE_KEY), U256::from(20));
        assert!(outcome.events.iter().any(|event| event.kind == "price_update"));
    }

    #[test]
    fn test_delegation_produces_validator_update() {
        let users = accounts(0..1);
        let validators = accounts(100..101);
        let mut occ = pipeline(2, &users, &validators);

        let txs = vec![sign(
            &users[0],
            0,
            0,
            &[Msg::Delegate(MsgDelegate {
                validator: validators[0].address,
                amount: U256::from(50),
            })],
        )];
        let outcome = occ.process_block(&txs, meta(1)).unwrap();

        assert_eq!(
            outcome.validator_updates,
            vec![ValidatorUpdate {
                validator: validators[0].address,
                power: 150,
            }]
        );
        assert!(!occ.store().has(&dirty_key(validators[0].address)));
    }

    #[test]
    fn test_evm_gas_is_recorded() {
        let users = accounts(0..1);
        let mut occ = pipeline(2, &users, &[]);
        let txs = vec![sign(
            &users[0],
            0,
            0,
            &[Msg::EvmCall(MsgEvmCall {
                to: Address::repeat_byte(0xcc),
                value: U256::ZERO,
                data: Bytes::new(),
            })],
        )];
        let outcome = occ.process_block(&txs, meta(1)).unwrap();

        let gas = outcome.tx_results[0].gas_used;
        assert!(gas >= 21_000);
        assert!(outcome.tx_results[0].evm_tx_info.is_some());
        assert_eq!(
            occ.store().u64(&crate::state::evm_block_gas_key(1)),
            gas
        );
    }

    #[test]
    fn test_undecodable_transaction_gets_a_result() {
        let users = accounts(0..2);
        let mut occ = pipeline(4, &users, &[]);
        let txs = vec![
            vec![0xc0],
            send(&users[0], 0, users[1].address, 1),
        ];
        let outcome = occ.process_block(&txs, meta(1)).unwrap();
        assert_eq!(outcome.tx_results[0].code, codes::TX_DECODE);
        assert!(outcome.tx_results[1].is_ok());
    }

    #[test]
    fn test_height_must_advance_by_one() {
        let mut occ = pipeline(2, &[], &[]);
        occ.process_block(&[], meta(1)).unwrap();
        let err = occ.process_block(&[], meta(3)).unwrap_err();
        assert!(matches!(err, BlockError::HeightMismatch { last: 1, got: 3 }));
        assert_eq!(occ.last_height(), Some(1));
    }

    #[test]
    fn test_failed_hook_leaves_state_untouched() {
        let users = accounts(0..2);
        let misordered = BlockHooks {
            begin: vec![Arc::new(DistributionHook), Arc::new(CapabilityHook)],
            ..BlockHooks::default()
        };
        let mut occ = pipeline(2, &users, &[]).with_hooks(misordered);
        let before = occ.store().root_hash();

        let txs = vec![send(&users[0], 0, users[1].address, 1)];
        let err = occ.process_block(&txs, meta(1)).unwrap_err();

        assert!(matches!(err, BlockError::Hook(_)));
        assert_eq!(occ.store().root_hash(), before);
        assert_eq!(occ.last_height(), None);
    }

    struct RejectEnd;

    impl crate::hooks::BlockHook for RejectEnd {
        fn name(&self) -> &'static str {
            "reject"
        }

        fn end_block(
            &self,
            _ctx: &mut HookContext<'_>,
            _summary: &BlockSummary,
        ) -> Result<Vec<ValidatorUpdate>, crate::error::HookError> {
            Err(crate::error::HookError::Failed {
                hook: self.name(),
                reason: "rejected".to_string(),
            })
        }
    }

    #[test]
    fn test_late_hook_failure_discards_executed_writes() {
        let users = accounts(0..2);
        let mut hooks = BlockHooks::standard();
        hooks.end = vec![Arc::new(RejectEnd)];
        let mut occ = pipeline(2, &users, &[]).with_hooks(hooks);
        let before = occ.store().root_hash();

        let txs = vec![
            send(&users[0], 0, users[1].address, 100),
            send(&users[1], 0, users[0].address, 7),
        ];
        let err = occ.process_block(&txs, meta(1)).unwrap_err();

        assert!(matches!(err, BlockError::Hook(_)));
        assert_eq!(occ.store().root_hash(), before);
        assert_eq!(occ.store().balance(users[0].address), U256::from(BALANCE));
        assert_eq!(occ.store().account(users[1].address).unwrap().nonce, 0);
    }

    #[test]
    fn test_flush_sums_every_deferred_fee() {
        let mut store = MemStore::new();
        store.set_u256(&deferred_fee_key(0), U256::from(3));
        store.set_u256(&deferred_fee_key(9), U256::from(4));

        assert_eq!(flush_deferred_fees(&mut store).unwrap(), U256::from(7));
        assert_eq!(store.balance(FEE_COLLECTOR), U256::from(7));
        assert!(store.prefix_entries(DEFERRED_FEE_PREFIX).is_empty());

        store.set(&deferred_fee_key(1), vec![1, 2, 3]);
        assert!(flush_deferred_fees(&mut store).is_err());
    }
}
