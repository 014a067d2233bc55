//! Per-transaction execution context.

use crate::error::{codes, TxError};
use crate::gas::{GasConfig, GasMeter};
use crate::state::{
    account_key, decode_account, decode_u256, encode_account, encode_u256, new_account,
};
use alloy_primitives::{Address, B256, U256};
use occ_executor::{Checkpoint, Key, TxnState, Value};
use revm::state::AccountInfo;

/// Block metadata handed over by consensus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    pub height: u64,
    /// Unix seconds.
    pub time: u64,
    pub proposer: Address,
    pub hash: B256,
}

/// Typed event emitted by a transaction or a hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: String,
    pub attributes: Vec<(String, String)>,
}

impl Event {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: Vec::new(),
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.push((key.into(), value.to_string()));
        self
    }
}

/// Rollback point covering state writes and events.
pub struct ContextCheckpoint {
    state: Checkpoint,
    events: usize,
}

/// Everything a transaction can touch while it runs.
///
/// All reads and writes are charged to the gas meter and go through the
/// [`TxnState`], which is either a multi-version view or a sequential
/// overlay.
pub struct TxContext<'a> {
    state: &'a mut dyn TxnState,
    gas: GasMeter,
    gas_config: &'a GasConfig,
    events: Vec<Event>,
    meta: &'a BlockMeta,
    tx_index: usize,
}

impl<'a> TxContext<'a> {
    pub fn new(
        state: &'a mut dyn TxnState,
        gas_limit: u64,
        gas_config: &'a GasConfig,
        meta: &'a BlockMeta,
        tx_index: usize,
    ) -> Self {
        Self {
            state,
            gas: GasMeter::new(gas_limit),
            gas_config,
            events: Vec::new(),
            meta,
            tx_index,
        }
    }

    pub fn meta(&self) -> &BlockMeta {
        self.meta
    }

    /// Position of the transaction in the whole block.
    pub fn tx_index(&self) -> usize {
        self.tx_index
    }

    pub fn gas(&self) -> &GasMeter {
        &self.gas
    }

    pub fn gas_config(&self) -> &GasConfig {
        self.gas_config
    }

    pub fn consume_gas(&mut self, amount: u64, descriptor: &'static str) -> Result<(), TxError> {
        self.gas.consume(amount, descriptor)
    }

    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    pub fn checkpoint(&self) -> ContextCheckpoint {
        ContextCheckpoint {
            state: self.state.checkpoint(),
            events: self.events.len(),
        }
    }

    pub fn revert_to(&mut self, checkpoint: ContextCheckpoint) {
        self.state.revert_to(checkpoint.state);
        self.events.truncate(checkpoint.events);
    }

    // ------------------------------------------------------------------------
    // Raw access
    // ------------------------------------------------------------------------

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Value>, TxError> {
        self.gas.consume(self.gas_config.read_cost_flat, "ReadFlat")?;
        let value = self.state.get(key)?;
        let len = value.as_ref().map_or(0, Vec::len) as u64;
        self.gas
            .consume(self.gas_config.read_cost_per_byte * len, "ReadPerByte")?;
        Ok(value)
    }

    pub fn has(&mut self, key: &[u8]) -> Result<bool, TxError> {
        self.gas.consume(self.gas_config.has_cost, "Has")?;
        Ok(self.state.has(key)?)
    }

    pub fn set(&mut self, key: &[u8], value: Value) -> Result<(), TxError> {
        self.gas.consume(self.gas_config.write_cost_flat, "WriteFlat")?;
        let len = (key.len() + value.len()) as u64;
        self.gas
            .consume(self.gas_config.write_cost_per_byte * len, "WritePerByte")?;
        self.state.set(key, value);
        Ok(())
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<(), TxError> {
        self.gas.consume(self.gas_config.delete_cost, "Delete")?;
        self.state.delete(key);
        Ok(())
    }

    pub fn iterate(
        &mut self,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Result<Vec<(Key, Value)>, TxError> {
        let entries = self.state.iterate(start, end)?;
        self.gas.consume(
            self.gas_config.iter_next_cost_flat * entries.len() as u64,
            "IterNextFlat",
        )?;
        Ok(entries)
    }

    // ------------------------------------------------------------------------
    // Typed access
    // ------------------------------------------------------------------------

    /// Loads an account; missing accounts are empty.
    pub fn account(&mut self, address: Address) -> Result<AccountInfo, TxError> {
        match self.get(&account_key(address))? {
            Some(bytes) => decode_account(&bytes).ok_or_else(|| {
                TxError::app(codes::INVALID_REQUEST, format!("corrupt account {address}"))
            }),
            None => Ok(new_account(U256::ZERO)),
        }
    }

    pub fn set_account(&mut self, address: Address, info: &AccountInfo) -> Result<(), TxError> {
        self.set(&account_key(address), encode_account(info))
    }

    pub fn u256(&mut self, key: &[u8]) -> Result<U256, TxError> {
        match self.get(key)? {
            Some(bytes) => decode_u256(&bytes)
                .ok_or_else(|| TxError::app(codes::INVALID_REQUEST, "corrupt amount")),
            None => Ok(U256::ZERO),
        }
    }

    pub fn set_u256(&mut self, key: &[u8], value: U256) -> Result<(), TxError> {
        self.set(key, encode_u256(value))
    }

    /// Moves `amount` between two accounts.
    pub fn transfer(&mut self, from: Address, to: Address, amount: U256) -> Result<(), TxError> {
        let mut sender = self.account(from)?;
        if sender.balance < amount {
            return Err(TxError::app(
                codes::INSUFFICIENT_FUNDS,
                format!("{} is smaller than {amount}: insufficient funds", sender.balance),
            ));
        }
        if from == to {
            return Ok(());
        }
        sender.balance -= amount;
        self.set_account(from, &sender)?;

        let mut recipient = self.account(to)?;
        recipient.balance = recipient.balance.saturating_add(amount);
        self.set_account(to, &recipient)?;

        self.emit(
            Event::new("transfer")
                .attr("sender", from)
                .attr("recipient", to)
                .attr("amount", amount),
        );
        Ok(())
    }
}
