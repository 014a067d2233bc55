//! Message dispatch.

use crate::context::{Event, TxContext};
use crate::error::{codes, TxError};
use crate::gas::evm_intrinsic_gas;
use crate::state::{dirty_key, evm_storage_key, power_key, vote_key};
use crate::tx::{Msg, MsgDelegate, MsgEvmCall, MsgOracleVote, MsgSend, Tx};
use alloy_primitives::{keccak256, Address, B256, U256};

/// First byte of call data that makes a call revert.
pub const REVERT_SELECTOR: u8 = 0xfd;

/// Gas charged per storage slot written by an EVM-style call.
const SSTORE_GAS: u64 = 20_000;

/// Receipt data of an EVM-style transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmTxInfo {
    pub sender: Address,
    pub nonce: u64,
    pub tx_hash: B256,
    /// Empty unless the call reverted.
    pub vm_error: String,
}

/// Routes each message of a transaction to its handler.
#[derive(Debug, Clone, Default)]
pub struct MsgRouter;

impl MsgRouter {
    pub fn new() -> Self {
        Self
    }

    /// Runs every message in order. The caller owns the checkpoint that
    /// discards all message writes when one fails.
    pub fn deliver(&self, ctx: &mut TxContext<'_>, tx: &Tx) -> Result<(), TxError> {
        for msg in &tx.msgs {
            match msg {
                Msg::Send(msg) => self.send(ctx, tx.sender, msg)?,
                Msg::Delegate(msg) => self.delegate(ctx, tx.sender, msg)?,
                Msg::OracleVote(msg) => self.oracle_vote(ctx, tx.sender, msg)?,
                Msg::EvmCall(msg) => self.evm_call(ctx, tx.sender, msg)?,
            }
        }
        Ok(())
    }

    fn send(&self, ctx: &mut TxContext<'_>, signer: Address, msg: &MsgSend) -> Result<(), TxError> {
        if msg.from != signer {
            return Err(TxError::app(
                codes::UNAUTHORIZED,
                format!("{} is not the signer {signer}", msg.from),
            ));
        }
        ctx.transfer(msg.from, msg.to, msg.amount)
    }

    fn delegate(
        &self,
        ctx: &mut TxContext<'_>,
        signer: Address,
        msg: &MsgDelegate,
    ) -> Result<(), TxError> {
        if msg.amount.is_zero() {
            return Err(TxError::app(codes::INVALID_REQUEST, "delegation amount is zero"));
        }
        let key = power_key(msg.validator);
        if !ctx.has(&key)? {
            return Err(TxError::app(
                codes::INVALID_REQUEST,
                format!("validator {} does not exist", msg.validator),
            ));
        }

        let mut delegator = ctx.account(signer)?;
        if delegator.balance < msg.amount {
            return Err(TxError::app(
                codes::INSUFFICIENT_FUNDS,
                format!("{} is smaller than {}: insufficient funds", delegator.balance, msg.amount),
            ));
        }
        delegator.balance -= msg.amount;
        ctx.set_account(signer, &delegator)?;

        let power = ctx.u256(&key)?;
        ctx.set_u256(&key, power.saturating_add(msg.amount))?;
        ctx.set(&dirty_key(msg.validator), vec![1])?;

        ctx.emit(
            Event::new("delegate")
                .attr("delegator", signer)
                .attr("validator", msg.validator)
                .attr("amount", msg.amount),
        );
        Ok(())
    }

    fn oracle_vote(
        &self,
        ctx: &mut TxContext<'_>,
        signer: Address,
        msg: &MsgOracleVote,
    ) -> Result<(), TxError> {
        if !ctx.has(&power_key(signer))? {
            return Err(TxError::app(
                codes::UNAUTHORIZED,
                format!("{signer} is not a validator"),
            ));
        }
        ctx.set_u256(&vote_key(signer), msg.price)?;
        ctx.emit(
            Event::new("aggregate_vote")
                .attr("voter", signer)
                .attr("price", msg.price),
        );
        Ok(())
    }

    /// Value transfer, then one storage write per 64-byte `(slot, value)`
    /// chunk of call data. Call data starting with [`REVERT_SELECTOR`]
    /// reverts.
    fn evm_call(
        &self,
        ctx: &mut TxContext<'_>,
        signer: Address,
        msg: &MsgEvmCall,
    ) -> Result<(), TxError> {
        ctx.consume_gas(evm_intrinsic_gas(&msg.data), "evm intrinsic")?;
        if msg.data.first() == Some(&REVERT_SELECTOR) {
            return Err(TxError::app(codes::EVM_REVERTED, "execution reverted"));
        }

        ctx.transfer(signer, msg.to, msg.value)?;
        for chunk in msg.data.chunks_exact(64) {
            ctx.consume_gas(SSTORE_GAS, "evm sstore")?;
            let slot = B256::from_slice(&chunk[..32]);
            let value = U256::from_be_slice(&chunk[32..]);
            let key = evm_storage_key(msg.to, slot);
            if value.is_zero() {
                ctx.delete(&key)?;
            } else {
                ctx.set_u256(&key, value)?;
            }
        }

        ctx.emit(
            Event::new("evm_call")
                .attr("from", signer)
                .attr("to", msg.to)
                .attr("input_hash", keccak256(&msg.data)),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BlockMeta;
    use crate::executor::SequentialView;
    use crate::gas::GasConfig;
    use crate::state::{StoreExt, StoreMutExt};
    use crate::tx::{decode_tx, TxBody};
    use crate::Account;
    use alloy_primitives::Bytes;
    use occ_executor::{apply_write_set, KvStore, MemStore};

    fn deliver(store: &mut MemStore, account: &Account, msgs: &[Msg]) -> Result<(), TxError> {
        let body = TxBody::new(1, account.address, 0, U256::ZERO, 1_000_000, msgs);
        let tx = decode_tx(&body.sign(&account.signing_key).unwrap().encoded()).unwrap();

        let gas_config = GasConfig::default();
        let meta = BlockMeta {
            height: 1,
            time: 0,
            proposer: Address::ZERO,
            hash: B256::ZERO,
        };
        let mut view = SequentialView::new(&*store);
        let mut ctx = TxContext::new(&mut view, tx.gas_limit, &gas_config, &meta, 0);
        let result = MsgRouter::new().deliver(&mut ctx, &tx);
        drop(ctx);
        let writes = view.into_writes();
        if result.is_ok() {
            apply_write_set(store, &writes);
        }
        result
    }

    #[test]
    fn test_send_requires_signer() {
        let alice = Account::from_seed(1);
        let bob = Account::from_seed(2);
        let mut store = MemStore::new();
        store.credit(alice.address, U256::from(100));

        let msg = Msg::Send(MsgSend {
            from: bob.address,
            to: alice.address,
            amount: U256::from(1),
        });
        let err = deliver(&mut store, &alice, &[msg]).unwrap_err();
        assert_eq!(err.code(), codes::UNAUTHORIZED);
    }

    #[test]
    fn test_delegate_bonds_and_marks_dirty() {
        let delegator = Account::from_seed(1);
        let validator = Account::from_seed(2).address;
        let mut store = MemStore::new();
        store.credit(delegator.address, U256::from(100));
        store.set_u256(&power_key(validator), U256::from(10));

        let msg = Msg::Delegate(MsgDelegate {
            validator,
            amount: U256::from(40),
        });
        deliver(&mut store, &delegator, &[msg]).unwrap();

        assert_eq!(store.balance(delegator.address), U256::from(60));
        assert_eq!(store.u256(&power_key(validator)), U256::from(50));
        assert!(store.has(&dirty_key(validator)));

        let unknown = Msg::Delegate(MsgDelegate {
            validator: Address::repeat_byte(9),
            amount: U256::from(1),
        });
        let err = deliver(&mut store, &delegator, &[unknown]).unwrap_err();
        assert_eq!(err.code(), codes::INVALID_REQUEST);
    }

    #[test]
    fn test_oracle_vote_only_from_validators() {
        let validator = Account::from_seed(1);
        let outsider = Account::from_seed(2);
        let mut store = MemStore::new();
        store.set_u256(&power_key(validator.address), U256::from(10));

        let vote = Msg::OracleVote(MsgOracleVote {
            price: U256::from(42),
        });
        deliver(&mut store, &validator, &[vote.clone()]).unwrap();
        assert_eq!(store.u256(&vote_key(validator.address)), U256::from(42));

        let err = deliver(&mut store, &outsider, &[vote]).unwrap_err();
        assert_eq!(err.code(), codes::UNAUTHORIZED);
    }

    #[test]
    fn test_evm_call_writes_storage_or_reverts() {
        let caller = Account::from_seed(1);
        let contract = Address::repeat_byte(0xcc);
        let mut store = MemStore::new();
        store.credit(caller.address, U256::from(100));

        let mut data = vec![0u8; 64];
        data[31] = 1;
        data[63] = 7;
        let call = Msg::EvmCall(MsgEvmCall {
            to: contract,
            value: U256::from(5),
            data: Bytes::from(data),
        });
        deliver(&mut store, &caller, &[call]).unwrap();

        let slot = B256::with_last_byte(1);
        assert_eq!(store.u256(&evm_storage_key(contract, slot)), U256::from(7));
        assert_eq!(store.balance(contract), U256::from(5));

        let revert = Msg::EvmCall(MsgEvmCall {
            to: contract,
            value: U256::from(5),
            data: Bytes::from(vec![REVERT_SELECTOR]),
        });
        let err = deliver(&mut store, &caller, &[revert]).unwrap_err();
        assert_eq!(err.code(), codes::EVM_REVERTED);
        assert_eq!(store.balance(contract), U256::from(5));
    }
}
