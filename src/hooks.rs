//! Block hooks run against canonical state around transaction execution.
//!
//! Each phase has its own ordered list, built once by [`BlockHooks::standard`]
//! or by the caller. Order matters: a hook may rely on state written by an
//! earlier hook of the same phase.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::NodeConfig;
use crate::context::{BlockMeta, Event};
use crate::error::HookError;
use crate::state::{
    address_suffix, decode_account, decode_u256, evm_block_gas_key,
    evm_block_hash_key, power_key, StoreExt, StoreMutExt, ACCOUNT_PREFIX, DEFERRED_FEE_PREFIX,
    DIRTY_PREFIX, EPOCH_KEY, FEE_COLLECTOR, POWER_PREFIX, PRICE_KEY, SUPPLY_KEY, VOTE_PREFIX,
};
use alloy_primitives::{Address, U256};
use occ_executor::{KvStore, KvStoreMut};
use tracing::debug;

/// In-memory store name set up by the capability hook.
pub const CAPABILITY_MEMSTORE: &str = "capability";

/// Change of a validator's voting power, reported to consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorUpdate {
    pub validator: Address,
    pub power: u64,
}

/// Block-level figures handed to end-block hooks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockSummary {
    /// Gas used by every EVM-style transaction of the block.
    pub evm_gas_used: u64,
}

/// What a hook can reach.
pub struct HookContext<'a> {
    pub store: &'a mut dyn KvStoreMut,
    pub meta: &'a BlockMeta,
    pub config: &'a NodeConfig,
    /// Names of the in-memory stores initialised so far. Not part of the
    /// committed state.
    pub memstores: &'a mut BTreeSet<&'static str>,
    pub events: &'a mut Vec<Event>,
}

/// A module's begin, mid and end block logic.
pub trait BlockHook: Send + Sync {
    fn name(&self) -> &'static str;

    fn begin_block(&self, _ctx: &mut HookContext<'_>) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs between the prioritised batch and the remaining transactions.
    fn mid_block(&self, _ctx: &mut HookContext<'_>) -> Result<(), HookError> {
        Ok(())
    }

    fn end_block(
        &self,
        _ctx: &mut HookContext<'_>,
        _summary: &BlockSummary,
    ) -> Result<Vec<ValidatorUpdate>, HookError> {
        Ok(Vec::new())
    }
}

/// Ordered hook lists, one per phase.
#[derive(Clone, Default)]
pub struct BlockHooks {
    pub begin: Vec<Arc<dyn BlockHook>>,
    pub mid: Vec<Arc<dyn BlockHook>>,
    pub end: Vec<Arc<dyn BlockHook>>,
}

impl BlockHooks {
    pub fn standard() -> Self {
        let evm: Arc<dyn BlockHook> = Arc::new(EvmHook);
        Self {
            begin: vec![
                Arc::new(EpochHook),
                Arc::new(CapabilityHook),
                Arc::new(DistributionHook),
                evm.clone(),
            ],
            mid: vec![Arc::new(OracleHook)],
            end: vec![Arc::new(CrisisHook), Arc::new(StakingHook), evm],
        }
    }

    pub fn run_begin(&self, ctx: &mut HookContext<'_>) -> Result<(), HookError> {
        for hook in &self.begin {
            debug!(hook = hook.name(), height = ctx.meta.height, "begin block");
            hook.begin_block(ctx)?;
        }
        Ok(())
    }

    pub fn run_mid(&self, ctx: &mut HookContext<'_>) -> Result<(), HookError> {
        for hook in &self.mid {
            debug!(hook = hook.name(), height = ctx.meta.height, "mid block");
            hook.mid_block(ctx)?;
        }
        Ok(())
    }

    /// Runs every end-block hook and concatenates their validator updates.
    pub fn run_end(
        &self,
        ctx: &mut HookContext<'_>,
        summary: &BlockSummary,
    ) -> Result<Vec<ValidatorUpdate>, HookError> {
        let mut updates = Vec::new();
        for hook in &self.end {
            debug!(hook = hook.name(), height = ctx.meta.height, "end block");
            updates.extend(hook.end_block(ctx, summary)?);
        }
        Ok(updates)
    }
}

impl std::fmt::Debug for BlockHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |hooks: &[Arc<dyn BlockHook>]| -> Vec<&'static str> {
            hooks.iter().map(|hook| hook.name()).collect()
        };
        f.debug_struct("BlockHooks")
            .field("begin", &names(&self.begin))
            .field("mid", &names(&self.mid))
            .field("end", &names(&self.end))
            .finish()
    }
}

// ============================================================================
// Modules
// ============================================================================

/// Advances the epoch counter every `blocks_per_epoch` blocks.
pub struct EpochHook;

impl BlockHook for EpochHook {
    fn name(&self) -> &'static str {
        "epoch"
    }

    fn begin_block(&self, ctx: &mut HookContext<'_>) -> Result<(), HookError> {
        let length = ctx.config.blocks_per_epoch;
        if length == 0 || ctx.meta.height % length != 0 {
            return Ok(());
        }
        let epoch = ctx.store.u64(EPOCH_KEY) + 1;
        ctx.store.set_u64(EPOCH_KEY, epoch);
        ctx.events.push(
            Event::new("new_epoch")
                .attr("epoch", epoch)
                .attr("height", ctx.meta.height),
        );
        Ok(())
    }
}

/// Initialises the capability memstore on the first block after start.
pub struct CapabilityHook;

impl BlockHook for CapabilityHook {
    fn name(&self) -> &'static str {
        "capability"
    }

    fn begin_block(&self, ctx: &mut HookContext<'_>) -> Result<(), HookError> {
        if ctx.memstores.insert(CAPABILITY_MEMSTORE) {
            debug!("capability memstore initialised");
        }
        Ok(())
    }
}

/// Pays out the fees collected in the previous block to validators,
/// proportionally to their power. The rounding remainder goes to the
/// proposer.
pub struct DistributionHook;

impl BlockHook for DistributionHook {
    fn name(&self) -> &'static str {
        "distribution"
    }

    fn begin_block(&self, ctx: &mut HookContext<'_>) -> Result<(), HookError> {
        if !ctx.memstores.contains(CAPABILITY_MEMSTORE) {
            return Err(HookError::Failed {
                hook: self.name(),
                reason: "capability memstore is not initialised".to_string(),
            });
        }

        let collected = ctx.store.balance(FEE_COLLECTOR);
        if collected.is_zero() {
            return Ok(());
        }
        let validators = powers(&*ctx.store);
        let total = validators
            .iter()
            .fold(U256::ZERO, |sum, (_, power)| sum.saturating_add(*power));
        if total.is_zero() {
            return Ok(());
        }

        let mut paid = U256::ZERO;
        for (validator, power) in &validators {
            let share = collected.saturating_mul(*power) / total;
            if !share.is_zero() {
                ctx.store.credit(*validator, share);
                paid += share;
            }
        }
        let remainder = collected - paid;
        if !remainder.is_zero() {
            ctx.store.credit(ctx.meta.proposer, remainder);
        }

        let mut collector = ctx.store.account(FEE_COLLECTOR).unwrap_or_default();
        collector.balance = U256::ZERO;
        ctx.store.set_account(FEE_COLLECTOR, &collector);

        ctx.events.push(
            Event::new("rewards")
                .attr("amount", collected)
                .attr("validators", validators.len()),
        );
        Ok(())
    }
}

/// Records the block hash at begin block and EVM gas usage at end block.
pub struct EvmHook;

impl BlockHook for EvmHook {
    fn name(&self) -> &'static str {
        "evm"
    }

    fn begin_block(&self, ctx: &mut HookContext<'_>) -> Result<(), HookError> {
        let key = evm_block_hash_key(ctx.meta.height);
        ctx.store.set(&key, ctx.meta.hash.to_vec());
        Ok(())
    }

    fn end_block(
        &self,
        ctx: &mut HookContext<'_>,
        summary: &BlockSummary,
    ) -> Result<Vec<ValidatorUpdate>, HookError> {
        ctx.store
            .set_u64(&evm_block_gas_key(ctx.meta.height), summary.evm_gas_used);
        Ok(Vec::new())
    }
}

/// Tallies validator price votes into a median price and clears them.
pub struct OracleHook;

impl BlockHook for OracleHook {
    fn name(&self) -> &'static str {
        "oracle"
    }

    fn mid_block(&self, ctx: &mut HookContext<'_>) -> Result<(), HookError> {
        let votes = ctx.store.prefix_entries(VOTE_PREFIX);
        if votes.is_empty() {
            return Ok(());
        }

        let mut prices = Vec::with_capacity(votes.len());
        for (key, value) in &votes {
            let price = decode_u256(value).ok_or_else(|| HookError::Failed {
                hook: self.name(),
                reason: format!("malformed vote under {}", hex(key)),
            })?;
            prices.push(price);
            ctx.store.delete(key);
        }
        prices.sort_unstable();
        let mid = prices.len() / 2;
        let median = if prices.len() % 2 == 1 {
            prices[mid]
        } else {
            // Sorted, so the difference cannot underflow and the sum cannot wrap.
            prices[mid - 1] + (prices[mid] - prices[mid - 1]) / U256::from(2)
        };

        ctx.store.set_u256(PRICE_KEY, median);
        ctx.events.push(
            Event::new("price_update")
                .attr("price", median)
                .attr("votes", prices.len()),
        );
        Ok(())
    }
}

/// Checks that balances, unflushed fees and bonded tokens add up to the
/// recorded supply. A mismatch halts the block.
pub struct CrisisHook;

impl BlockHook for CrisisHook {
    fn name(&self) -> &'static str {
        "crisis"
    }

    fn end_block(
        &self,
        ctx: &mut HookContext<'_>,
        _summary: &BlockSummary,
    ) -> Result<Vec<ValidatorUpdate>, HookError> {
        let supply = ctx.store.u256(SUPPLY_KEY);
        let total = total_tokens(&*ctx.store);
        if total != supply {
            return Err(HookError::InvariantBroken(format!(
                "total supply: tracked {supply}, found {total}"
            )));
        }
        Ok(Vec::new())
    }
}

/// Reports validators whose power changed during the block.
pub struct StakingHook;

impl BlockHook for StakingHook {
    fn name(&self) -> &'static str {
        "staking"
    }

    fn end_block(
        &self,
        ctx: &mut HookContext<'_>,
        _summary: &BlockSummary,
    ) -> Result<Vec<ValidatorUpdate>, HookError> {
        let mut updates = Vec::new();
        for (key, _) in ctx.store.prefix_entries(DIRTY_PREFIX) {
            ctx.store.delete(&key);
            let Some(validator) = address_suffix(&key, DIRTY_PREFIX) else {
                continue;
            };
            let power = ctx.store.u256(&power_key(validator)).saturating_to::<u64>();
            updates.push(ValidatorUpdate { validator, power });
        }
        Ok(updates)
    }
}

/// Bonded power per validator, ordered by address.
fn powers<S: KvStore + ?Sized>(store: &S) -> Vec<(Address, U256)> {
    store
        .prefix_entries(POWER_PREFIX)
        .into_iter()
        .filter_map(|(key, value)| {
            Some((address_suffix(&key, POWER_PREFIX)?, decode_u256(&value)?))
        })
        .collect()
}

/// Balances plus unflushed deferred fees plus bonded power.
pub fn total_tokens<S: KvStore + ?Sized>(store: &S) -> U256 {
    let balances = store
        .prefix_entries(ACCOUNT_PREFIX)
        .into_iter()
        .filter_map(|(_, value)| decode_account(&value))
        .fold(U256::ZERO, |sum, info| sum.saturating_add(info.balance));
    let deferred = store
        .prefix_entries(DEFERRED_FEE_PREFIX)
        .into_iter()
        .filter_map(|(_, value)| decode_u256(&value))
        .fold(U256::ZERO, |sum, fee| sum.saturating_add(fee));
    let bonded = powers(store)
        .into_iter()
        .fold(U256::ZERO, |sum, (_, power)| sum.saturating_add(power));
    balances.saturating_add(deferred).saturating_add(bonded)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
