//! Translation Benchmarks
//!
//! Expansion cost grows with nesting depth (every proxy hop is a lookup in
//! the enclosing patch) and removal cost grows with fan-out (every sibling
//! on a cleared output is reconnected).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use patchwork::prelude::*;

// ============================================================================
// Constants
// ============================================================================

const DEPTHS: [usize; 4] = [1, 2, 4, 8];
const FAN_OUTS: [usize; 4] = [2, 8, 32, 128];

// ============================================================================
// Helper Functions
// ============================================================================

/// osc -> subpatch^depth -> destination, one gain per level on the way in
fn create_nested_graph(depth: usize) -> Graph<RecordingEngine> {
    let mut graph = Graph::new(ModuleRegistry::new(), RecordingEngine::new());
    let root = graph.root();
    graph.add_module(root, "osc", vec![]).unwrap();
    graph.add_module(root, "output", vec![]).unwrap();

    let mut patch = root;
    for level in 0..depth {
        let key = graph.add_module(patch, "subpatch", vec![]).unwrap();
        let child = graph.tree().module(key).unwrap().child_patch().unwrap();
        if level > 0 {
            graph.add_connection(patch, "gain_1", 0, "subpatch_1", 0).unwrap();
            graph.add_connection(patch, "subpatch_1", 0, "output_1", 0).unwrap();
        }
        graph.add_module(child, "gain", vec![]).unwrap();
        graph.add_connection(child, "input_1", 0, "gain_1", 0).unwrap();
        patch = child;
    }
    if depth > 0 {
        graph.add_connection(patch, "gain_1", 0, "output_1", 0).unwrap();
    }

    graph.add_connection(root, "osc_1", 0, "subpatch_1", 0).unwrap();
    graph.add_destination_connection("subpatch_1", 0, "output_1").unwrap();
    graph
}

/// One oscillator feeding `fan_out` gains
fn create_fan_out_graph(fan_out: usize) -> Graph<RecordingEngine> {
    let mut graph = Graph::new(ModuleRegistry::new(), RecordingEngine::new());
    let root = graph.root();
    graph.add_module(root, "osc", vec![]).unwrap();
    for i in 1..=fan_out {
        graph.add_module(root, "gain", vec![]).unwrap();
        graph
            .add_connection(root, "osc_1", 0, &format!("gain_{}", i), 0)
            .unwrap();
    }
    graph
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_live_edges(c: &mut Criterion) {
    let mut group = c.benchmark_group("live_api_edges");

    for &depth in &DEPTHS {
        let graph = create_nested_graph(depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| black_box(graph.tree().live_api_edges()));
        });
    }

    group.finish();
}

fn bench_removal_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("removal_plan");

    for &fan_out in &FAN_OUTS {
        let graph = create_fan_out_graph(fan_out);
        let root = graph.root();
        let first = graph.tree().patch(root).unwrap().connections()[0];
        group.bench_with_input(BenchmarkId::from_parameter(fan_out), &fan_out, |b, _| {
            b.iter(|| black_box(graph.tree().removal_plan(first)));
        });
    }

    group.finish();
}

fn bench_disconnect_reconnect(c: &mut Criterion) {
    let mut group = c.benchmark_group("disconnect_reconnect");

    for &fan_out in &FAN_OUTS {
        group.bench_with_input(BenchmarkId::from_parameter(fan_out), &fan_out, |b, &fan_out| {
            let wire = ConnectionDef::new("osc_1", 0, "gain_1", 0);
            b.iter_batched(
                || create_fan_out_graph(fan_out),
                |mut graph| {
                    let root = graph.root();
                    graph.disconnect(root, &wire).unwrap();
                    graph.connect_wire(root, &wire).unwrap();
                    black_box(graph)
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_snapshot_roundtrip(c: &mut Criterion) {
    let source = create_nested_graph(4);
    let json = source.to_json().unwrap();

    c.bench_function("snapshot_roundtrip_depth_4", |b| {
        b.iter(|| {
            let mut graph = Graph::new(ModuleRegistry::new(), RecordingEngine::new());
            graph.load_json(black_box(&json)).unwrap();
            black_box(graph)
        });
    });
}

criterion_group!(
    translation_benches,
    bench_live_edges,
    bench_removal_plan,
);

criterion_group!(
    protocol_benches,
    bench_disconnect_reconnect,
    bench_snapshot_roundtrip,
);

criterion_main!(translation_benches, protocol_benches);
