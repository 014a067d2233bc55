//! Benchmark of block processing, sequential versus OCC, with varying
//! conflict levels.

use alloy_primitives::{Address, B256};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use occ_node::{BlockMeta, BlockPipeline, NodeConfig, Workload, WorkloadConfig};

fn meta() -> BlockMeta {
    BlockMeta {
        height: 1,
        time: 0,
        proposer: Address::ZERO,
        hash: B256::ZERO,
    }
}

fn run(workload: &Workload, workers: usize) -> usize {
    let mut pipeline = BlockPipeline::new(NodeConfig {
        workers,
        ..NodeConfig::default()
    });
    pipeline.init_genesis(&workload.genesis());
    pipeline
        .process_block(black_box(&workload.transactions), meta())
        .map(|outcome| outcome.tx_results.len())
        .unwrap_or_default()
}

/// Sequential against OCC across conflict factors.
fn bench_conflict_levels(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_pipeline/conflict_levels");
    let num_transactions = 1000;

    for &conflict_factor in &[0.0, 0.25, 0.5, 0.75, 1.0] {
        // Signing happens outside the measured loop.
        let workload = Workload::generate(WorkloadConfig {
            num_accounts: 1000,
            num_transactions,
            conflict_factor,
            ..WorkloadConfig::default()
        })
        .expect("workload signs");
        let label = format!("conflict_{:.0}%", conflict_factor * 100.0);

        group.throughput(Throughput::Elements(num_transactions as u64));
        for (name, workers) in [("sequential", 1), ("occ_4", 4), ("occ_8", 8)] {
            group.bench_with_input(BenchmarkId::new(name, &label), &workload, |b, workload| {
                b.iter(|| run(workload, workers));
            });
        }
    }

    group.finish();
}

/// OCC scaling with worker count on a low-conflict block.
fn bench_workers(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_pipeline/workers");
    let workload = Workload::generate(WorkloadConfig {
        num_accounts: 10_000,
        num_transactions: 2000,
        ..WorkloadConfig::default()
    })
    .expect("workload signs");

    group.throughput(Throughput::Elements(workload.transactions.len() as u64));
    for workers in [1, 2, 4, 8, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workload, |b, workload| {
            b.iter(|| run(workload, workers));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_conflict_levels, bench_workers);
criterion_main!(benches);
