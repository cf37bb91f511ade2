//! Net runner hot-path benchmarks: firing rate through the marking under
//! each join/split combination the control-flow patterns exercise.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use yawl_engine::net::runner::NetRunner;
use yawl_engine::net::{CancellationSet, Condition, Flow, JoinType, Net, SplitType, Task, TaskKind};

fn atomic(id: &str, join: JoinType, split: SplitType) -> Task {
    Task {
        id: id.into(),
        name: id.into(),
        join_type: join,
        split_type: split,
        kind: TaskKind::Atomic,
        cancellation_set: CancellationSet::default(),
    }
}

fn cond(id: &str) -> Condition {
    Condition { id: id.into(), name: id.into() }
}

fn flow(id: &str, from: &str, to: &str, idx: u32) -> Flow {
    Flow { id: id.into(), from: from.into(), to: to.into(), ordering_index: idx, predicate: None }
}

/// start -> A -> c1 -> B -> end, re-run by restarting the runner each
/// iteration since a net completes after one pass.
fn sequential_net() -> Arc<Net> {
    let mut conditions = HashMap::new();
    for c in ["start", "c1", "end"] {
        conditions.insert(c.to_string(), cond(c));
    }
    let mut tasks = HashMap::new();
    tasks.insert("A".to_string(), atomic("A", JoinType::Xor, SplitType::Xor));
    tasks.insert("B".to_string(), atomic("B", JoinType::Xor, SplitType::Xor));
    Arc::new(Net {
        id: "seq".into(),
        conditions,
        tasks,
        flows: vec![
            flow("f1", "start", "A", 0),
            flow("f2", "A", "c1", 0),
            flow("f3", "c1", "B", 0),
            flow("f4", "B", "end", 0),
        ],
        input_condition: "start".into(),
        output_condition: "end".into(),
    })
}

/// Split[AND] -> (A, B) -> Join[AND] -> end, the widest fan-out/fan-in this
/// crate's firing loop handles in one pass.
fn and_join_net() -> Arc<Net> {
    let mut conditions = HashMap::new();
    for c in ["start", "ca", "cb", "ca2", "cb2", "end"] {
        conditions.insert(c.to_string(), cond(c));
    }
    let mut tasks = HashMap::new();
    tasks.insert("Split".to_string(), atomic("Split", JoinType::Xor, SplitType::And));
    tasks.insert("A".to_string(), atomic("A", JoinType::Xor, SplitType::Xor));
    tasks.insert("B".to_string(), atomic("B", JoinType::Xor, SplitType::Xor));
    tasks.insert("Join".to_string(), atomic("Join", JoinType::And, SplitType::Xor));
    Arc::new(Net {
        id: "and".into(),
        conditions,
        tasks,
        flows: vec![
            flow("f1", "start", "Split", 0),
            flow("f2", "Split", "ca", 0),
            flow("f3", "Split", "cb", 1),
            flow("f4", "ca", "A", 0),
            flow("f5", "cb", "B", 0),
            flow("f6", "A", "ca2", 0),
            flow("f7", "B", "cb2", 0),
            flow("f8", "ca2", "Join", 0),
            flow("f9", "cb2", "Join", 0),
            flow("f10", "Join", "end", 0),
        ],
        input_condition: "start".into(),
        output_condition: "end".into(),
    })
}

fn bench_sequential_firing(c: &mut Criterion) {
    let net = sequential_net();
    let mut group = c.benchmark_group("net_runner_sequential");
    group.bench_function("start_fire_fire", |b| {
        b.iter(|| {
            let mut runner = NetRunner::new(net.clone());
            runner.start().unwrap();
            runner.fire(black_box("A"), &Value::Null, Value::Null, None).unwrap();
            runner.fire(black_box("B"), &Value::Null, Value::Null, None).unwrap();
            black_box(runner.is_completed())
        });
    });
    group.finish();
}

fn bench_and_split_join_firing(c: &mut Criterion) {
    let net = and_join_net();
    let mut group = c.benchmark_group("net_runner_and_split_join");
    group.bench_function("split_a_b_join", |b| {
        b.iter(|| {
            let mut runner = NetRunner::new(net.clone());
            runner.start().unwrap();
            runner.fire(black_box("Split"), &Value::Null, Value::Null, None).unwrap();
            runner.fire(black_box("A"), &Value::Null, Value::Null, None).unwrap();
            runner.fire(black_box("B"), &Value::Null, Value::Null, None).unwrap();
            runner.fire(black_box("Join"), &Value::Null, Value::Null, None).unwrap();
            black_box(runner.is_completed())
        });
    });
    group.finish();
}

fn bench_enabled_tasks_scan(c: &mut Criterion) {
    let net = and_join_net();

    let mut after_split = NetRunner::new(net.clone());
    after_split.start().unwrap();
    after_split.fire("Split", &Value::Null, Value::Null, None).unwrap();

    let mut after_a = NetRunner::new(net);
    after_a.start().unwrap();
    after_a.fire("Split", &Value::Null, Value::Null, None).unwrap();
    after_a.fire("A", &Value::Null, Value::Null, None).unwrap();

    let mut group = c.benchmark_group("net_runner_enabled_tasks");
    group.bench_with_input(BenchmarkId::new("scan", "after_split"), &after_split, |b, r| {
        b.iter(|| black_box(r.enabled_tasks()));
    });
    group.bench_with_input(BenchmarkId::new("scan", "after_a"), &after_a, |b, r| {
        b.iter(|| black_box(r.enabled_tasks()));
    });
    group.finish();
}

criterion_group!(
    net_runner_benches,
    bench_sequential_firing,
    bench_and_split_join_firing,
    bench_enabled_tasks_scan,
);
criterion_main!(net_runner_benches);
