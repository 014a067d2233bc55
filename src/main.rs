//! CLI that drives synthetic blocks through the sequential and OCC
//! pipelines and checks that both reach the same state.

use alloy_primitives::{keccak256, Address, U256};
use clap::Parser;
use eyre::{bail, Result};
use occ_node::{BlockMeta, BlockPipeline, NodeConfig, Workload, WorkloadConfig};
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "occ-node", about = "Parallel block execution benchmark")]
struct Args {
    /// Accounts sending transactions.
    #[arg(long, default_value_t = 1000)]
    accounts: usize,
    /// Transactions per block.
    #[arg(long, default_value_t = 1000)]
    txs: usize,
    #[arg(long, default_value_t = 5)]
    blocks: u64,
    /// Share of transactions that touch a small hot set (0.0 to 1.0).
    #[arg(long, default_value_t = 0.25)]
    conflict: f64,
    #[arg(long, default_value_t = 4)]
    validators: usize,
    /// Share of transactions signed with a wrong nonce.
    #[arg(long, default_value_t = 0.0)]
    invalid_ratio: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Worker threads for the OCC pipeline, at least 2.
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long, default_value_t = 10)]
    max_incarnation: usize,
    /// Skip signature verification in the ante handler.
    #[arg(long)]
    no_verify: bool,
    /// Execute oracle votes in a batch before the other transactions.
    #[arg(long)]
    prioritize_votes: bool,
    /// Mark expected writes as estimates before execution.
    #[arg(long)]
    prefill: bool,
    #[arg(long, default_value_t = 0)]
    min_gas_price: u64,
}

impl Args {
    fn node_config(&self, workers: usize) -> NodeConfig {
        NodeConfig {
            workers,
            occ_enabled: true,
            max_incarnation: self.max_incarnation,
            verify_signatures: !self.no_verify,
            prioritize_oracle_votes: self.prioritize_votes,
            prefill_estimates: self.prefill,
            min_gas_price: U256::from(self.min_gas_price),
            ..NodeConfig::default()
        }
    }
}

/// Worker count for the OCC pipeline; a single worker would only repeat the
/// sequential run.
fn occ_workers(requested: Option<usize>) -> Result<usize> {
    match requested {
        Some(workers) if workers < 2 => {
            bail!("--workers must be at least 2 to run the OCC pipeline, got {workers}")
        }
        Some(workers) => Ok(workers),
        None => Ok(NodeConfig::default().workers.max(2)),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if !(0.0..=1.0).contains(&args.conflict) {
        bail!("--conflict must be within [0, 1], got {}", args.conflict);
    }
    let workers = occ_workers(args.workers)?;

    let workload = Workload::generate(WorkloadConfig {
        num_accounts: args.accounts,
        num_transactions: args.txs * args.blocks as usize,
        conflict_factor: args.conflict,
        num_validators: args.validators,
        invalid_ratio: args.invalid_ratio,
        seed: args.seed,
        ..WorkloadConfig::default()
    })?;
    info!(
        accounts = args.accounts,
        txs = workload.transactions.len(),
        blocks = args.blocks,
        workers,
        "generated workload"
    );

    let mut sequential = BlockPipeline::new(args.node_config(1));
    let mut occ = BlockPipeline::new(args.node_config(workers));
    let genesis = workload.genesis();
    if sequential.init_genesis(&genesis) != occ.init_genesis(&genesis) {
        bail!("genesis state differs between pipelines");
    }

    let mut sequential_time = Duration::ZERO;
    let mut occ_time = Duration::ZERO;
    for (i, block) in workload.transactions.chunks(args.txs.max(1)).enumerate() {
        let height = i as u64 + 1;
        let meta = BlockMeta {
            height,
            time: 1_700_000_000 + height,
            proposer: Address::repeat_byte(0xee),
            hash: keccak256(height.to_be_bytes()),
        };

        let start = Instant::now();
        let expected = sequential.process_block(block, meta.clone())?;
        sequential_time += start.elapsed();

        let start = Instant::now();
        let outcome = occ.process_block(block, meta)?;
        occ_time += start.elapsed();

        if outcome.app_hash != expected.app_hash {
            bail!(
                "block {height}: app hash {} does not match sequential {}",
                outcome.app_hash,
                expected.app_hash
            );
        }
        if outcome.tx_results != expected.tx_results {
            bail!("block {height}: transaction results differ from sequential");
        }

        let failed = outcome.tx_results.iter().filter(|r| !r.is_ok()).count();
        println!(
            "block {height:4} | {:5} txs | {:4} failed | {:5} executions | incarnation {:2} | {}",
            block.len(),
            failed,
            outcome.stats.executions,
            outcome.stats.highest_incarnation,
            outcome.app_hash
        );
    }

    let total = workload.transactions.len() as f64;
    println!(
        "sequential: {:8.2} ms ({:8.0} tx/s) | occ x{workers}: {:8.2} ms ({:8.0} tx/s)",
        sequential_time.as_secs_f64() * 1000.0,
        total / sequential_time.as_secs_f64(),
        occ_time.as_secs_f64() * 1000.0,
        total / occ_time.as_secs_f64(),
    );
    Ok(())
}
