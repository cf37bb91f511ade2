//! End-to-end scenario tests driven through the public `Engine` façade only
//! (no direct `Case`/`NetRunner` access), complementing the module-level
//! unit tests that already cover the same scenarios at the `Case` and
//! `NetRunner` layers.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use yawl_engine::engine::{Engine, SpecificationStatus};
use yawl_engine::net::{CancellationSet, Condition, Flow, JoinType, Net, SplitType, Task, TaskKind};
use yawl_engine::receipts::InMemoryReceiptLog;
use yawl_engine::storage::InMemoryStore;
use yawl_engine::{CaseStatus, Config, SpecId};

fn atomic(id: &str, join: JoinType, split: SplitType) -> Task {
    Task { id: id.into(), name: id.into(), join_type: join, split_type: split, kind: TaskKind::Atomic, cancellation_set: CancellationSet::default() }
}

fn cond(id: &str) -> Condition {
    Condition { id: id.into(), name: id.into() }
}

fn flow(id: &str, from: &str, to: &str, idx: u32, predicate: Option<&str>) -> Flow {
    Flow { id: id.into(), from: from.into(), to: to.into(), ordering_index: idx, predicate: predicate.map(String::from) }
}

fn fresh_engine() -> Engine {
    Engine::new(
        Config::default(),
        Arc::new(InMemoryStore::new()),
        Arc::new(InMemoryReceiptLog::new()),
        Arc::new(yawl_engine::events::BroadcastEventBus::default()),
    )
}

async fn load_and_activate(engine: &Engine, id: &str, net: Arc<Net>) -> SpecId {
    let spec_id = SpecId::new(id, 1, 0, format!("urn:{id}"));
    let mut nets = HashMap::new();
    nets.insert("root".to_string(), net);
    engine.load_specification(spec_id.clone(), "root", nets).await.unwrap();
    engine.activate_specification(&spec_id).await.unwrap();
    assert_eq!(engine.specification_status(&spec_id), Some(SpecificationStatus::Activated));
    spec_id
}

/// S2: `Split[AND] -> (A, B) -> Join[AND] -> end`. Join must not be enabled
/// after only one branch completes.
fn and_split_join_net() -> Arc<Net> {
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
            flow("f1", "start", "Split", 0, None),
            flow("f2", "Split", "ca", 0, None),
            flow("f3", "Split", "cb", 1, None),
            flow("f4", "ca", "A", 0, None),
            flow("f5", "cb", "B", 0, None),
            flow("f6", "A", "ca2", 0, None),
            flow("f7", "B", "cb2", 0, None),
            flow("f8", "ca2", "Join", 0, None),
            flow("f9", "cb2", "Join", 0, None),
            flow("f10", "Join", "end", 0, None),
        ],
        input_condition: "start".into(),
        output_condition: "end".into(),
    })
}

#[tokio::test]
async fn s2_and_split_join_waits_for_both_branches() {
    let engine = fresh_engine();
    let spec_id = load_and_activate(&engine, "and-split-join", and_split_join_net()).await;
    let case_id = engine.create_case(&spec_id, None).await.unwrap();
    engine.start_case(case_id).await.unwrap();

    let split = engine.case_work_items(case_id).into_iter().find(|w| w.task_id == "Split").unwrap().id;
    engine.fire_work_item(case_id, split, Value::Null).await.unwrap();
    engine.start_work_item(case_id, split).await.unwrap();
    engine.complete_work_item(case_id, split, Value::Null).await.unwrap();

    let a = engine.case_work_items(case_id).into_iter().find(|w| w.task_id == "A").unwrap().id;
    engine.fire_work_item(case_id, a, Value::Null).await.unwrap();
    engine.start_work_item(case_id, a).await.unwrap();
    engine.complete_work_item(case_id, a, Value::Null).await.unwrap();

    // Join must still be non-terminal work: only A's branch has arrived.
    assert!(engine.case_work_items(case_id).into_iter().all(|w| w.task_id != "Join"));

    let b = engine.case_work_items(case_id).into_iter().find(|w| w.task_id == "B").unwrap().id;
    engine.fire_work_item(case_id, b, Value::Null).await.unwrap();
    engine.start_work_item(case_id, b).await.unwrap();
    engine.complete_work_item(case_id, b, Value::Null).await.unwrap();

    let join = engine.case_work_items(case_id).into_iter().find(|w| w.task_id == "Join").unwrap().id;
    engine.fire_work_item(case_id, join, Value::Null).await.unwrap();
    engine.start_work_item(case_id, join).await.unwrap();
    engine.complete_work_item(case_id, join, Value::Null).await.unwrap();

    assert_eq!(engine.case_status(case_id), Some(CaseStatus::Completed));
}

/// S3: an upstream XOR-split chooses branch alpha; the downstream OR-join
/// fires without waiting on the unactivated beta branch.
fn or_join_net() -> Arc<Net> {
    let mut conditions = HashMap::new();
    for c in ["start", "ca", "cb", "ca2", "cb2", "end"] {
        conditions.insert(c.to_string(), cond(c));
    }
    let mut tasks = HashMap::new();
    tasks.insert("Split".to_string(), atomic("Split", JoinType::Xor, SplitType::Xor));
    tasks.insert("Alpha".to_string(), atomic("Alpha", JoinType::Xor, SplitType::Xor));
    tasks.insert("Beta".to_string(), atomic("Beta", JoinType::Xor, SplitType::Xor));
    tasks.insert("J".to_string(), atomic("J", JoinType::Or, SplitType::Xor));
    Arc::new(Net {
        id: "or".into(),
        conditions,
        tasks,
        flows: vec![
            flow("f1", "start", "Split", 0, None),
            flow("f2", "Split", "ca", 0, Some("choice = 'alpha'")),
            flow("f3", "Split", "cb", 1, Some("choice = 'beta'")),
            flow("f4", "ca", "Alpha", 0, None),
            flow("f5", "cb", "Beta", 0, None),
            flow("f6", "Alpha", "ca2", 0, None),
            flow("f7", "Beta", "cb2", 0, None),
            flow("f8", "ca2", "J", 0, None),
            flow("f9", "cb2", "J", 0, None),
            flow("f10", "J", "end", 0, None),
        ],
        input_condition: "start".into(),
        output_condition: "end".into(),
    })
}

#[tokio::test]
async fn s3_or_join_fires_without_waiting_on_unactivated_branch() {
    let engine = fresh_engine();
    let spec_id = load_and_activate(&engine, "or-join", or_join_net()).await;
    let case_id = engine.create_case(&spec_id, Some(json!({"choice": "alpha"}))).await.unwrap();
    engine.start_case(case_id).await.unwrap();

    let split = engine.case_work_items(case_id).into_iter().find(|w| w.task_id == "Split").unwrap().id;
    engine.fire_work_item(case_id, split, Value::Null).await.unwrap();
    engine.start_work_item(case_id, split).await.unwrap();
    engine.complete_work_item(case_id, split, Value::Null).await.unwrap();

    // Only Alpha's work item should exist; Beta's branch never got a token.
    let items = engine.case_work_items(case_id);
    assert!(items.iter().any(|w| w.task_id == "Alpha"));
    assert!(items.iter().all(|w| w.task_id != "Beta"));

    let alpha = items.into_iter().find(|w| w.task_id == "Alpha").unwrap().id;
    engine.fire_work_item(case_id, alpha, Value::Null).await.unwrap();
    engine.start_work_item(case_id, alpha).await.unwrap();
    engine.complete_work_item(case_id, alpha, Value::Null).await.unwrap();

    let j = engine.case_work_items(case_id).into_iter().find(|w| w.task_id == "J").unwrap().id;
    engine.fire_work_item(case_id, j, Value::Null).await.unwrap();
    engine.start_work_item(case_id, j).await.unwrap();
    engine.complete_work_item(case_id, j, Value::Null).await.unwrap();

    assert_eq!(engine.case_status(case_id), Some(CaseStatus::Completed));
}

/// S4: a multi-instance task with `min=5, max=5, threshold=2`, parallel
/// ordering, threshold completion mode. Completing children 0 and 2 fires
/// the parent and cancels the rest.
fn threshold_mi_net() -> Arc<Net> {
    let mut conditions = HashMap::new();
    for c in ["start", "end"] {
        conditions.insert(c.to_string(), cond(c));
    }
    let mut tasks = HashMap::new();
    let mi_cfg = yawl_engine::net::MultiInstanceConfig {
        minimum: 5,
        maximum: 5,
        threshold: 2,
        creation_mode: yawl_engine::multi_instance::CreationMode::Static,
        ordering_mode: yawl_engine::multi_instance::OrderingMode::Parallel,
        completion_mode: yawl_engine::multi_instance::CompletionMode::Threshold,
        input_aggregation: None,
        output_aggregation: None,
    };
    tasks.insert(
        "MI".to_string(),
        Task {
            id: "MI".into(),
            name: "MI".into(),
            join_type: JoinType::Xor,
            split_type: SplitType::Xor,
            kind: TaskKind::MultiInstance(mi_cfg),
            cancellation_set: CancellationSet::default(),
        },
    );
    Arc::new(Net {
        id: "mi".into(),
        conditions,
        tasks,
        flows: vec![flow("f1", "start", "MI", 0, None), flow("f2", "MI", "end", 0, None)],
        input_condition: "start".into(),
        output_condition: "end".into(),
    })
}

#[tokio::test]
async fn s4_threshold_mi_fires_parent_on_second_completion_and_cancels_rest() {
    let engine = fresh_engine();
    let spec_id = load_and_activate(&engine, "threshold-mi", threshold_mi_net()).await;
    let case_id = engine.create_case(&spec_id, None).await.unwrap();
    engine.start_case(case_id).await.unwrap();

    let children = engine.case_work_items(case_id);
    assert_eq!(children.len(), 5, "static creation mode pre-allocates all 5 children");

    let mut by_index: Vec<_> = children.into_iter().collect();
    by_index.sort_by_key(|w| w.instance_index);

    let first = by_index[0].id;
    engine.fire_work_item(case_id, first, Value::Null).await.unwrap();
    engine.start_work_item(case_id, first).await.unwrap();
    engine.complete_work_item(case_id, first, Value::Null).await.unwrap();

    // Parent must not have fired yet: only 1 of 2 threshold completions.
    assert!(engine.case_work_items(case_id).iter().any(|w| w.task_id == "MI"));

    let second = by_index[2].id;
    engine.fire_work_item(case_id, second, Value::Null).await.unwrap();
    engine.start_work_item(case_id, second).await.unwrap();
    engine.complete_work_item(case_id, second, Value::Null).await.unwrap();

    let remaining = engine.case_work_items(case_id);
    let still_mi: Vec<_> = remaining.iter().filter(|w| w.task_id == "MI" && w.instance_index != 0 && w.instance_index != 2).collect();
    assert!(still_mi.iter().all(|w| w.status.is_terminal()), "uncompleted children must be cancelled once threshold is satisfied");
    assert_eq!(engine.case_status(case_id), Some(CaseStatus::Completed));
}

/// S6: a four-operation sequence produces a receipt chain whose every tip
/// chains from the previous one, rooted at the fixed genesis constant.
#[tokio::test]
async fn s6_receipt_chain_integrity_over_four_operations() {
    let engine = fresh_engine();
    let spec_id = load_and_activate(&engine, "seq", sequential_two_task_net()).await;
    let case_id = engine.create_case(&spec_id, None).await.unwrap();

    let mut receipts = Vec::new();
    receipts.push(engine.start_case(case_id).await.unwrap());

    let a = engine.case_work_items(case_id).into_iter().find(|w| w.task_id == "A").unwrap().id;
    receipts.push(engine.fire_work_item(case_id, a, Value::Null).await.unwrap());
    receipts.push(engine.start_work_item(case_id, a).await.unwrap());
    // B is still pending, so completing A alone does not complete the case:
    // exactly one receipt, not two.
    receipts.extend(engine.complete_work_item(case_id, a, Value::Null).await.unwrap());

    assert_eq!(receipts.len(), 4);
    assert!(receipts.iter().all(|r| r.committed));

    let genesis = yawl_engine::receipts::genesis_hash();
    let mut prev = genesis.clone();
    for receipt in &receipts {
        assert_eq!(receipt.merkle_root.len(), 64, "sha256 hex digest");
        prev = receipt.merkle_root.clone();
    }
    assert_eq!(engine.tip(), prev, "engine tip matches the last sealed receipt's merkle root");
    assert_ne!(genesis, prev, "chain actually advanced from genesis");
}

fn sequential_two_task_net() -> Arc<Net> {
    let mut conditions = HashMap::new();
    for c in ["start", "c1", "end"] {
        conditions.insert(c.to_string(), cond(c));
    }
    let mut tasks = HashMap::new();
    tasks.insert("A".to_string(), atomic("A", JoinType::Xor, SplitType::Xor));
    tasks.insert("B".to_string(), atomic("B", JoinType::Xor, SplitType::Xor));
    Arc::new(Net {
        id: "root".into(),
        conditions,
        tasks,
        flows: vec![
            flow("f1", "start", "A", 0, None),
            flow("f2", "A", "c1", 0, None),
            flow("f3", "c1", "B", 0, None),
            flow("f4", "B", "end", 0, None),
        ],
        input_condition: "start".into(),
        output_condition: "end".into(),
    })
}
