//! Optimistic parallel executor.

use super::{BatchOutcome, Executor};
use crate::error::BlockError;
use crate::processor::{BlockTx, ExecTxResult, TxProcessor};
use crate::state::{account_key, deferred_fee_key};
use crate::tx::Msg;
use occ_executor::{
    Abort, ExecutorConfig, Key, KvStoreMut, ParallelExecutor, TxHandler, TxnIndex, TxnState,
};
use tracing::debug;

/// Runs batches through the OCC scheduler.
pub struct OccExecutor {
    inner: ParallelExecutor,
}

impl OccExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            inner: ParallelExecutor::new(config),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        self.inner.config()
    }
}

/// Adapts the transaction processor to the engine's handler interface.
struct BlockTxHandler<'a, 'p> {
    processor: &'a TxProcessor<'p>,
}

impl TxHandler for BlockTxHandler<'_, '_> {
    type Tx = BlockTx;
    type Output = ExecTxResult;

    fn execute(
        &self,
        _txn_idx: TxnIndex,
        tx: &BlockTx,
        state: &mut dyn TxnState,
    ) -> Result<ExecTxResult, Abort> {
        self.processor.process(state, tx)
    }

    /// Sender account, deferred fee slot and send recipients.
    fn estimated_writes(&self, tx: &BlockTx) -> Option<Vec<Key>> {
        let decoded = tx.tx()?;
        let mut keys = vec![account_key(decoded.sender), deferred_fee_key(tx.index)];
        for msg in &decoded.msgs {
            if let Msg::Send(send) = msg {
                keys.push(account_key(send.to));
            }
        }
        Some(keys)
    }
}

impl Executor for OccExecutor {
    fn execute(
        &self,
        store: &mut dyn KvStoreMut,
        processor: &TxProcessor<'_>,
        txs: &[BlockTx],
    ) -> Result<BatchOutcome, BlockError> {
        let handler = BlockTxHandler { processor };
        let result = self.inner.execute_block(&*store, &handler, txs)?;
        result.apply_to(store);

        debug!(
            txs = txs.len(),
            executions = result.stats.executions,
            validations = result.stats.validations,
            "occ batch committed"
        );
        Ok(BatchOutcome {
            results: result.outputs,
            stats: result.stats,
        })
    }

    fn name(&self) -> &'static str {
        "occ"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ante::DefaultAnteHandler;
    use crate::context::BlockMeta;
    use crate::executor::SequentialExecutor;
    use crate::gas::GasConfig;
    use crate::router::MsgRouter;
    use crate::state::{new_account, StoreMutExt};
    use crate::tx::{decode_tx, MsgSend, TxBody};
    use crate::Account;
    use alloy_primitives::{Address, B256, U256};
    use occ_executor::MemStore;

    struct Fixture {
        ante: DefaultAnteHandler,
        router: MsgRouter,
        gas_config: GasConfig,
        meta: BlockMeta,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                ante: DefaultAnteHandler {
                    chain_id: 1,
                    verify_signatures: true,
                    min_gas_price: U256::ZERO,
                },
                router: MsgRouter::new(),
                gas_config: GasConfig::default(),
                meta: BlockMeta {
                    height: 1,
                    time: 0,
                    proposer: Address::ZERO,
                    hash: B256::ZERO,
                },
            }
        }

        fn processor(&self) -> TxProcessor<'_> {
            TxProcessor {
                ante: &self.ante,
                router: &self.router,
                gas_config: &self.gas_config,
                meta: &self.meta,
            }
        }
    }

    /// Every account sends to the same hot recipient.
    fn hot_batch(accounts: &[Account], hot: Address) -> Vec<BlockTx> {
        accounts
            .iter()
            .enumerate()
            .map(|(index, account)| {
                let body = TxBody::new(
                    1,
                    account.address,
                    0,
                    U256::from(1),
                    200_000,
                    &[Msg::Send(MsgSend {
                        from: account.address,
                        to: hot,
                        amount: U256::from(10),
                    })],
                );
                let bytes = body.sign(&account.signing_key).unwrap().encoded();
                BlockTx {
                    index,
                    decoded: decode_tx(&bytes),
                }
            })
            .collect()
    }

    #[test]
    fn test_matches_sequential_on_contended_batch() {
        let accounts: Vec<_> = (0..10).map(Account::from_seed).collect();
        let hot = Address::repeat_byte(0xaa);
        let mut genesis = MemStore::new();
        for account in &accounts {
            genesis.set_account(account.address, &new_account(U256::from(1000)));
        }
        let txs = hot_batch(&accounts, hot);
        let fixture = Fixture::new();

        let mut sequential_store = genesis.clone();
        let sequential = SequentialExecutor::new()
            .execute(&mut sequential_store, &fixture.processor(), &txs)
            .unwrap();

        let mut occ_store = genesis.clone();
        let occ = OccExecutor::new(ExecutorConfig {
            num_threads: 4,
            ..ExecutorConfig::default()
        })
        .execute(&mut occ_store, &fixture.processor(), &txs)
        .unwrap();

        assert_eq!(occ.results, sequential.results);
        assert_eq!(occ_store.root_hash(), sequential_store.root_hash());
        assert!(occ.stats.executions >= txs.len());
    }

    #[test]
    fn test_estimated_writes() {
        let fixture = Fixture::new();
        let processor = fixture.processor();
        let handler = BlockTxHandler {
            processor: &processor,
        };

        let account = Account::from_seed(5);
        let hot = Address::repeat_byte(0xaa);
        let txs = hot_batch(std::slice::from_ref(&account), hot);
        let keys = handler.estimated_writes(&txs[0]).unwrap();
        assert_eq!(
            keys,
            vec![account_key(account.address), deferred_fee_key(0), account_key(hot)]
        );

        let undecodable = BlockTx {
            index: 1,
            decoded: decode_tx(&[0x01]),
        };
        assert!(handler.estimated_writes(&undecodable).is_none());
    }
}
