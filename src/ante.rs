//! Ante handler: checks and charges run before any message.

use crate::context::{Event, TxContext};
use crate::error::{codes, TxError};
use crate::state::deferred_fee_key;
use crate::tx::Tx;
use alloy_primitives::U256;

/// Validation and fee charging ahead of message execution.
///
/// A failing ante handler rejects the transaction: none of its writes are
/// kept.
pub trait AnteHandler: Send + Sync {
    fn run(&self, ctx: &mut TxContext<'_>, tx: &Tx) -> Result<(), TxError>;
}

/// Default ante chain: size gas, chain id, signature, minimum fee, nonce,
/// fee deduction.
#[derive(Debug, Clone)]
pub struct DefaultAnteHandler {
    pub chain_id: u64,
    pub verify_signatures: bool,
    pub min_gas_price: U256,
}

impl AnteHandler for DefaultAnteHandler {
    fn run(&self, ctx: &mut TxContext<'_>, tx: &Tx) -> Result<(), TxError> {
        let size = u64::try_from(tx.size).unwrap_or(u64::MAX);
        let size_cost = ctx.gas_config().tx_size_cost_per_byte.saturating_mul(size);
        ctx.consume_gas(size_cost, "txSize")?;

        if tx.chain_id != self.chain_id {
            return Err(TxError::app(
                codes::INVALID_CHAIN_ID,
                format!("invalid chain-id; expected {}, got {}", self.chain_id, tx.chain_id),
            ));
        }

        if self.verify_signatures {
            let cost = ctx.gas_config().sig_verify_cost;
            ctx.consume_gas(cost, "ante verify: secp256k1")?;
            if !tx.verify() {
                return Err(TxError::app(
                    codes::UNAUTHORIZED,
                    "signature verification failed",
                ));
            }
        }

        let required = self.min_gas_price.saturating_mul(U256::from(tx.gas_limit));
        if tx.fee < required {
            return Err(TxError::app(
                codes::INSUFFICIENT_FEE,
                format!("insufficient fees; got: {} required: {required}", tx.fee),
            ));
        }

        let mut account = ctx.account(tx.sender)?;
        if account.nonce != tx.nonce {
            return Err(TxError::app(
                codes::INVALID_SEQUENCE,
                format!(
                    "account sequence mismatch, expected {}, got {}",
                    account.nonce, tx.nonce
                ),
            ));
        }
        if account.balance < tx.fee {
            return Err(TxError::app(
                codes::INSUFFICIENT_FUNDS,
                format!("{} is smaller than {}: insufficient funds", account.balance, tx.fee),
            ));
        }

        account.nonce += 1;
        account.balance -= tx.fee;
        ctx.set_account(tx.sender, &account)?;

        // Parked under a per-transaction key and flushed to the fee
        // collector after the batch, so fees do not serialize the block.
        if !tx.fee.is_zero() {
            let key = deferred_fee_key(ctx.tx_index());
            ctx.set_u256(&key, tx.fee)?;
            ctx.emit(
                Event::new("tx")
                    .attr("fee", tx.fee)
                    .attr("fee_payer", tx.sender),
            );
        }
        Ok(())
    }
}
