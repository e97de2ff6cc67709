//! Benchmarks for dependency resolution.

use buildflow::graph::DependencyGraph;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// A layered graph where every node depends on up to `fan_in` nodes of
/// the previous layer.
fn layered_graph(layers: usize, width: usize, fan_in: usize) -> DependencyGraph {
    let id = |layer: usize, i: usize| format!("repo-{layer}-{i}");
    let mut graph = DependencyGraph::new(
        (0..layers).flat_map(|layer| (0..width).map(move |i| id(layer, i))),
    );
    for layer in 1..layers {
        for i in 0..width {
            for k in 0..fan_in.min(width) {
                graph.add_dependency(id(layer, i), id(layer - 1, (i + k) % width));
            }
        }
    }
    graph
}

fn resolution_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");
    for &(layers, width) in &[(5, 4), (10, 20), (20, 50)] {
        let graph = layered_graph(layers, width, 3);
        let label = format!("{}x{}", layers, width);

        group.bench_with_input(BenchmarkId::new("order", &label), &graph, |b, g| {
            b.iter(|| black_box(g.order()));
        });
        group.bench_with_input(BenchmarkId::new("levels", &label), &graph, |b, g| {
            b.iter(|| black_box(g.levels()));
        });
    }
    group.finish();
}

criterion_group!(benches, resolution_benchmark);
criterion_main!(benches);
