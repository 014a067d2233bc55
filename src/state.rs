//! State layout and value encodings.
//!
//! Every module keeps its data under its own key prefix in the single
//! key-value store:
//!
//! | prefix                 | value                                   |
//! |------------------------|-----------------------------------------|
//! | `acc/<addr>`           | account: nonce, balance, code hash      |
//! | `bank/deferred/<idx>`  | fee charged by transaction `idx`        |
//! | `bank/supply`          | total supply                            |
//! | `staking/power/<val>`  | tokens bonded to a validator            |
//! | `staking/dirty/<val>`  | validator power changed this block      |
//! | `oracle/vote/<val>`    | price vote for the current block        |
//! | `oracle/price`         | last tallied price                      |
//! | `epoch/current`        | current epoch number                    |
//! | `evm/...`              | contract storage and per-block records  |

use alloy_primitives::{Address, B256, U256};
use occ_executor::{Key, KvStore, KvStoreMut, Value};
use revm::{primitives::KECCAK_EMPTY, state::AccountInfo};

pub const ACCOUNT_PREFIX: &[u8] = b"acc/";
pub const DEFERRED_FEE_PREFIX: &[u8] = b"bank/deferred/";
pub const SUPPLY_KEY: &[u8] = b"bank/supply";
pub const POWER_PREFIX: &[u8] = b"staking/power/";
pub const DIRTY_PREFIX: &[u8] = b"staking/dirty/";
pub const VOTE_PREFIX: &[u8] = b"oracle/vote/";
pub const PRICE_KEY: &[u8] = b"oracle/price";
pub const EPOCH_KEY: &[u8] = b"epoch/current";
pub const EVM_STORAGE_PREFIX: &[u8] = b"evm/storage/";
pub const EVM_BLOCK_HASH_PREFIX: &[u8] = b"evm/block_hash/";
pub const EVM_BLOCK_GAS_PREFIX: &[u8] = b"evm/block_gas/";

/// Account that collects fees until they are distributed.
pub const FEE_COLLECTOR: Address = Address::new([0xfe; 20]);

fn prefixed(prefix: &[u8], suffix: &[u8]) -> Key {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

pub fn account_key(address: Address) -> Key {
    prefixed(ACCOUNT_PREFIX, address.as_slice())
}

pub fn deferred_fee_key(tx_index: usize) -> Key {
    prefixed(DEFERRED_FEE_PREFIX, &(tx_index as u64).to_be_bytes())
}

pub fn power_key(validator: Address) -> Key {
    prefixed(POWER_PREFIX, validator.as_slice())
}

pub fn dirty_key(validator: Address) -> Key {
    prefixed(DIRTY_PREFIX, validator.as_slice())
}

pub fn vote_key(voter: Address) -> Key {
    prefixed(VOTE_PREFIX, voter.as_slice())
}

pub fn evm_storage_key(contract: Address, slot: B256) -> Key {
    let mut key = prefixed(EVM_STORAGE_PREFIX, contract.as_slice());
    key.extend_from_slice(slot.as_slice());
    key
}

pub fn evm_block_hash_key(height: u64) -> Key {
    prefixed(EVM_BLOCK_HASH_PREFIX, &height.to_be_bytes())
}

pub fn evm_block_gas_key(height: u64) -> Key {
    prefixed(EVM_BLOCK_GAS_PREFIX, &height.to_be_bytes())
}

/// Exclusive upper bound of all keys starting with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Option<Key> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Address stored after `prefix` in `key`.
pub fn address_suffix(key: &[u8], prefix: &[u8]) -> Option<Address> {
    let suffix = key.strip_prefix(prefix)?;
    (suffix.len() == 20).then(|| Address::from_slice(suffix))
}

// ============================================================================
// Value encodings
// ============================================================================

/// Fresh externally owned account.
pub fn new_account(balance: U256) -> AccountInfo {
    AccountInfo {
        balance,
        nonce: 0,
        code_hash: KECCAK_EMPTY,
        code: None,
    }
}

/// `nonce (8) || balance (32) || code hash (32)`, all big-endian.
pub fn encode_account(info: &AccountInfo) -> Value {
    let mut buf = Vec::with_capacity(72);
    buf.extend_from_slice(&info.nonce.to_be_bytes());
    buf.extend_from_slice(&info.balance.to_be_bytes::<32>());
    buf.extend_from_slice(info.code_hash.as_slice());
    buf
}

pub fn decode_account(bytes: &[u8]) -> Option<AccountInfo> {
    if bytes.len() != 72 {
        return None;
    }
    let nonce = u64::from_be_bytes(bytes[..8].try_into().ok()?);
    let balance = U256::from_be_slice(&bytes[8..40]);
    let code_hash = B256::from_slice(&bytes[40..]);
    Some(AccountInfo {
        balance,
        nonce,
        code_hash,
        code: None,
    })
}

pub fn encode_u256(value: U256) -> Value {
    value.to_be_bytes::<32>().to_vec()
}

pub fn decode_u256(bytes: &[u8]) -> Option<U256> {
    (bytes.len() == 32).then(|| U256::from_be_slice(bytes))
}

pub fn encode_u64(value: u64) -> Value {
    value.to_be_bytes().to_vec()
}

pub fn decode_u64(bytes: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

// ============================================================================
// Direct store access
// ============================================================================

/// Typed access to a committed store, used by genesis and block hooks.
pub trait StoreExt: KvStore {
    fn account(&self, address: Address) -> Option<AccountInfo> {
        self.get(&account_key(address))
            .and_then(|bytes| decode_account(&bytes))
    }

    fn balance(&self, address: Address) -> U256 {
        self.account(address).map_or(U256::ZERO, |info| info.balance)
    }

    fn u256(&self, key: &[u8]) -> U256 {
        self.get(key)
            .and_then(|bytes| decode_u256(&bytes))
            .unwrap_or_default()
    }

    fn u64(&self, key: &[u8]) -> u64 {
        self.get(key)
            .and_then(|bytes| decode_u64(&bytes))
            .unwrap_or_default()
    }

    /// All entries under `prefix`, ascending.
    fn prefix_entries(&self, prefix: &[u8]) -> Vec<(Key, Value)> {
        let end = prefix_end(prefix);
        self.iterator(prefix, end.as_deref()).collect()
    }
}

impl<S: KvStore + ?Sized> StoreExt for S {}

/// Typed writes to a committed store.
pub trait StoreMutExt: KvStoreMut {
    fn set_account(&mut self, address: Address, info: &AccountInfo) {
        self.set(&account_key(address), encode_account(info));
    }

    /// Adds `amount` to the balance of `address`, creating the account.
    fn credit(&mut self, address: Address, amount: U256) {
        let mut info = self.account(address).unwrap_or_else(|| new_account(U256::ZERO));
        info.balance = info.balance.saturating_add(amount);
        self.set_account(address, &info);
    }

    fn set_u256(&mut self, key: &[u8], value: U256) {
        self.set(key, encode_u256(value));
    }

    fn set_u64(&mut self, key: &[u8], value: u64) {
        self.set(key, encode_u64(value));
    }
}

impl<S: KvStoreMut + ?Sized> StoreMutExt for S {}
