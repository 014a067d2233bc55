//! Block processing on top of optimistic concurrency control.
//!
//! This crate wires the generic OCC engine from [`occ_executor`] into a
//! small chain application: a transaction codec, an ante handler, a message
//! router, block hooks and the pipeline that runs them in order.
//!
//! # Architecture
//!
//! - **Pipeline**: begin-block hooks, then transaction batches, then
//!   end-block hooks, all on a working copy of the canonical store
//! - **Executor**: a strategy for running a batch (sequential or OCC)
//! - **Processor**: one transaction's ante handler and messages, against
//!   whatever [`occ_executor::TxnState`] the executor supplies
//!
//! # Quick Start
//!
//! ```
//! use occ_node::{BlockMeta, BlockPipeline, NodeConfig, Workload, WorkloadConfig};
//! use alloy_primitives::{Address, B256};
//!
//! let workload = Workload::generate(WorkloadConfig {
//!     num_accounts: 20,
//!     num_transactions: 50,
//!     ..WorkloadConfig::default()
//! })
//! .unwrap();
//!
//! let mut pipeline = BlockPipeline::new(NodeConfig {
//!     workers: 4,
//!     ..NodeConfig::default()
//! });
//! pipeline.init_genesis(&workload.genesis());
//!
//! let meta = BlockMeta {
//!     height: 1,
//!     time: 0,
//!     proposer: Address::ZERO,
//!     hash: B256::ZERO,
//! };
//! let outcome = pipeline.process_block(&workload.transactions, meta).unwrap();
//! println!("app hash: {}", outcome.app_hash);
//! ```

pub mod ante;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod gas;
pub mod hooks;
pub mod pipeline;
pub mod processor;
pub mod router;
pub mod state;
pub mod tx;

pub use config::NodeConfig;
pub use context::{BlockMeta, Event};
pub use error::{BlockError, ErrorKind, HookError, TxError};
pub use executor::{Executor, OccExecutor, SequentialExecutor};
pub use hooks::{BlockHook, BlockHooks, ValidatorUpdate};
pub use pipeline::{BlockOutcome, BlockPipeline, Genesis};
pub use processor::{BlockTx, ExecTxResult};

use alloy_primitives::{Address, Bytes, U256};
use k256::ecdsa::SigningKey;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::HashMap;
use tx::{Msg, MsgDelegate, MsgEvmCall, MsgOracleVote, MsgSend, TxBody};

// ============================================================================
// Account & Key Management
// ============================================================================

/// An account with its signing key for transaction signing.
#[derive(Clone)]
pub struct Account {
    /// The secp256k1 signing key.
    pub signing_key: SigningKey,
    /// The address derived from the public key.
    pub address: Address,
}

impl Account {
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = Address::from_private_key(&signing_key);
        Self {
            signing_key,
            address,
        }
    }

    /// Generates a deterministic account from a seed.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::from_signing_key(SigningKey::random(&mut rng))
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address)
            .finish()
    }
}

// ============================================================================
// Workload Configuration & Generation
// ============================================================================

/// Configuration for synthetic block generation.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Accounts sending transactions.
    pub num_accounts: usize,
    pub num_transactions: usize,
    /// 0.0 = transactions spread over all accounts, 1.0 = all transactions
    /// touch the same two accounts and the same contract slot.
    pub conflict_factor: f64,
    /// Validators; they also cast oracle votes.
    pub num_validators: usize,
    /// Share of transactions signed with a wrong nonce.
    pub invalid_ratio: f64,
    pub seed: u64,
    pub chain_id: u64,
    pub initial_balance: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_accounts: 1000,
            num_transactions: 100,
            conflict_factor: 0.0,
            num_validators: 4,
            invalid_ratio: 0.0,
            seed: 42,
            chain_id: 1,
            initial_balance: 1_000_000_000,
        }
    }
}

/// A pre-generated block with the accounts it needs at genesis.
#[derive(Debug, Clone)]
pub struct Workload {
    pub accounts: Vec<Account>,
    pub validators: Vec<Account>,
    /// Encoded, signed transactions in block order.
    pub transactions: Vec<Vec<u8>>,
    pub config: WorkloadConfig,
}

impl Workload {
    /// Generates a workload. All transactions are signed up front.
    ///
    /// Most transactions are sends; the rest are delegations, EVM-style
    /// calls and validator price votes.
    pub fn generate(config: WorkloadConfig) -> Result<Self, k256::ecdsa::Error> {
        let mut rng = StdRng::seed_from_u64(config.seed);

        let accounts: Vec<Account> = (0..config.num_accounts.max(2))
            .map(|i| Account::from_seed(config.seed.wrapping_add(i as u64)))
            .collect();
        let validators: Vec<Account> = (0..config.num_validators)
            .map(|i| Account::from_seed(config.seed.wrapping_add(1 << 32).wrapping_add(i as u64)))
            .collect();

        let hot_count = if config.conflict_factor > 0.0 {
            (2.0 + (1.0 - config.conflict_factor) * (accounts.len() as f64 - 2.0)).max(2.0)
                as usize
        } else {
            accounts.len()
        };
        let contract = Address::repeat_byte(0xcc);

        let mut nonces: HashMap<Address, u64> = HashMap::new();
        let mut transactions = Vec::with_capacity(config.num_transactions);

        for _ in 0..config.num_transactions {
            let pool = if rng.gen::<f64>() < config.conflict_factor {
                hot_count
            } else {
                accounts.len()
            };
            let from_idx = rng.gen_range(0..pool);
            let mut to_idx = rng.gen_range(0..pool);
            while to_idx == from_idx {
                to_idx = rng.gen_range(0..pool);
            }

            let roll = rng.gen_range(0..10);
            let (signer, msg) = if roll == 9 && !validators.is_empty() {
                let validator = &validators[rng.gen_range(0..validators.len())];
                let vote = Msg::OracleVote(MsgOracleVote {
                    price: U256::from(rng.gen_range(90..110u64)),
                });
                (validator, vote)
            } else if roll == 8 && !validators.is_empty() {
                let delegate = Msg::Delegate(MsgDelegate {
                    validator: validators[rng.gen_range(0..validators.len())].address,
                    amount: U256::from(rng.gen_range(1..1000u64)),
                });
                (&accounts[from_idx], delegate)
            } else if roll == 7 {
                let slot = if pool == hot_count { 0 } else { rng.gen_range(0..64u8) };
                let mut data = vec![0u8; 64];
                data[31] = slot;
                rng.fill(&mut data[32..]);
                let call = Msg::EvmCall(MsgEvmCall {
                    to: contract,
                    value: U256::from(rng.gen_range(0..100u64)),
                    data: Bytes::from(data),
                });
                (&accounts[from_idx], call)
            } else {
                let send = Msg::Send(MsgSend {
                    from: accounts[from_idx].address,
                    to: accounts[to_idx].address,
                    amount: U256::from(rng.gen_range(1..10_000u64)),
                });
                (&accounts[from_idx], send)
            };

            let nonce = nonces.entry(signer.address).or_insert(0);
            let signed_nonce = if rng.gen::<f64>() < config.invalid_ratio {
                *nonce + 1_000
            } else {
                let current = *nonce;
                *nonce += 1;
                current
            };

            let body = TxBody::new(
                config.chain_id,
                signer.address,
                signed_nonce,
                U256::from(rng.gen_range(0..10u64)),
                300_000,
                &[msg],
            );
            transactions.push(body.sign(&signer.signing_key)?.encoded());
        }

        Ok(Self {
            accounts,
            validators,
            transactions,
            config,
        })
    }

    /// Genesis funding every account and validator.
    pub fn genesis(&self) -> Genesis {
        let balance = U256::from(self.config.initial_balance);
        Genesis {
            accounts: self
                .accounts
                .iter()
                .chain(&self.validators)
                .map(|account| (account.address, balance))
                .collect(),
            validators: self
                .validators
                .iter()
                .map(|validator| (validator.address, U256::from(1_000u64)))
                .collect(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
