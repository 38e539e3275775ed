// Criterion benchmarks for hasql-cluster
//
// Run benchmarks with:
//   cargo bench -p hasql-cluster
//
// For detailed output with plots:
//   cargo bench -p hasql-cluster -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hasql_cluster::{BalancerKind, ClusterState, MemoryCluster};
use hasql_common::Node;
use std::sync::Arc;

fn nodes(count: usize) -> Vec<Node> {
    (0..count)
        .map(|i| Node::new(format!("db{:02}", i), format!("memory://db{:02}", i)).with_weight(1 + i as u32 % 3))
        .collect()
}

fn bench_pick(c: &mut Criterion) {
    let mut group = c.benchmark_group("pick");

    for kind in BalancerKind::ALL {
        for node_count in [2, 5, 10, 20].iter() {
            let candidates = nodes(*node_count);
            let balancer = kind.build(Some(7));
            group.bench_with_input(
                BenchmarkId::new(kind.as_str(), node_count),
                &candidates,
                |b, candidates| {
                    b.iter(|| balancer.pick(black_box(candidates)));
                },
            );
        }
    }

    group.finish();
}

fn bench_round_robin_distribution(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_robin_distribution");

    group.bench_function("10_nodes_100_calls", |b| {
        let candidates = nodes(10);
        b.iter(|| {
            let balancer = BalancerKind::RoundRobin.build(None);
            for _ in 0..100 {
                let _ = black_box(balancer.pick(&candidates));
            }
        });
    });

    group.bench_function("shrinking_membership", |b| {
        let candidates = nodes(20);
        b.iter(|| {
            let balancer = BalancerKind::RoundRobin.build(None);
            for live in (1..=20).rev() {
                let _ = black_box(balancer.pick(&candidates[..live]));
            }
        });
    });

    group.finish();
}

fn bench_load_tracking(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_tracking");

    group.bench_function("start_finish_cycle", |b| {
        let candidates = nodes(5);
        let balancer = BalancerKind::Load.build(None);
        b.iter(|| {
            if let Ok(node) = balancer.pick(&candidates) {
                balancer.call_started(&node);
                balancer.call_finished(black_box(&node));
            }
        });
    });

    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(_) => return,
    };

    for node_count in [1, 3, 5].iter() {
        let cluster = runtime.block_on(async {
            ClusterState::builder(Arc::new(MemoryCluster::new()))
                .nodes(nodes(*node_count))
                .build()
                .await
        });
        let Ok(cluster) = cluster else { continue };
        let session = match runtime.block_on(cluster.data_source().connect()) {
            Ok(session) => session,
            Err(_) => continue,
        };

        group.bench_with_input(BenchmarkId::new("execute", node_count), node_count, |b, _| {
            b.to_async(&runtime)
                .iter(|| async { black_box(session.execute("put k v").await) });
        });
        group.bench_with_input(BenchmarkId::new("query", node_count), node_count, |b, _| {
            b.to_async(&runtime)
                .iter(|| async { black_box(session.query("get k").await) });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_pick,
    bench_round_robin_distribution,
    bench_load_tracking,
    bench_fan_out,
);
criterion_main!(benches);
