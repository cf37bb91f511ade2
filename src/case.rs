//! Case manager (C8): case objects, their nets, status transitions, and
//! cancellation, grounded in the reference crate's `engine::case_store` and
//! `case` modules but reworked so one case owns *all* of its runners (root
//! net plus any sub-nets a composite task has started), matching §3's
//! ownership rule verbatim: "A case exclusively owns its runners, its
//! marking, its tokens, its work items, and its exception/timer handles."

use crate::error::{EngineError, EngineResult};
use crate::exception::CompensationEntry;
use crate::ids::{CaseId, NodeId, SpecId};
use crate::multi_instance::MultiInstanceContext;
use crate::net::runner::NetRunner;
use crate::net::{Net, TaskKind};
use crate::work_item::{WorkItem, WorkItemId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseStatus {
    Created,
    Running,
    Suspended,
    Completed,
    Cancelled,
    Failed,
}

/// One net identified by its id within a specification: the root net or one
/// of its sub-nets, each addressable by the `net_id` a composite task names.
pub struct Case {
    pub id: CaseId,
    pub spec_id: SpecId,
    pub status: CaseStatus,
    root_net_id: String,
    runners: HashMap<String, NetRunner>,
    nets: HashMap<String, Arc<Net>>,
    pub data: Value,
    work_items: HashMap<WorkItemId, WorkItem>,
    mi_contexts: HashMap<(String, NodeId), MultiInstanceContext>,
    compensation: crate::exception::CompensationStack,
}

impl Case {
    pub fn new(spec_id: SpecId, root_net_id: impl Into<String>, nets: HashMap<String, Arc<Net>>) -> Self {
        Self {
            id: CaseId::new(),
            spec_id,
            status: CaseStatus::Created,
            root_net_id: root_net_id.into(),
            runners: HashMap::new(),
            nets,
            data: Value::Object(Default::default()),
            work_items: HashMap::new(),
            mi_contexts: HashMap::new(),
            compensation: crate::exception::CompensationStack::new(),
        }
    }

    fn runner_for(&self, net_id: &str) -> Option<&NetRunner> {
        self.runners.get(net_id)
    }

    pub fn work_item(&self, id: WorkItemId) -> Option<&WorkItem> {
        self.work_items.get(&id)
    }

    pub fn work_items(&self) -> impl Iterator<Item = &WorkItem> {
        self.work_items.values()
    }

    pub fn compensation_stack(&mut self) -> &mut crate::exception::CompensationStack {
        &mut self.compensation
    }

    fn non_terminal_work_items(&self) -> usize {
        self.work_items.values().filter(|w| !w.status.is_terminal()).count()
    }

    fn ensure_runner(&mut self, net_id: &str) -> EngineResult<()> {
        if self.runners.contains_key(net_id) {
            return Ok(());
        }
        let net = self.nets.get(net_id).cloned().ok_or_else(|| EngineError::Unknown(net_id.to_string()))?;
        self.runners.insert(net_id.to_string(), NetRunner::new(net));
        Ok(())
    }

    /// `start_case` (§4.8): transitions to running, starts the root net,
    /// and creates work items for its initial enabled tasks.
    pub fn start(&mut self) -> EngineResult<Vec<WorkItemId>> {
        if self.status != CaseStatus::Created {
            return Err(EngineError::InvalidStateTransition {
                from: format!("{:?}", self.status),
                to: "Running".into(),
            });
        }
        let root_net_id = self.root_net_id.clone();
        self.ensure_runner(&root_net_id)?;
        self.runners.get_mut(&root_net_id).expect("just ensured").start()?;
        self.status = CaseStatus::Running;
        self.sync_enabled_work_items()
    }

    /// Creates an `Enabled` work item for every task across every owned
    /// runner whose `enabled_tasks()` includes it and which does not
    /// already have a non-terminal item, expanding multi-instance tasks
    /// into their configured child instances (§4.4).
    fn sync_enabled_work_items(&mut self) -> EngineResult<Vec<WorkItemId>> {
        let mut created = Vec::new();
        let net_ids: Vec<String> = self.runners.keys().cloned().collect();
        for net_id in net_ids {
            let enabled = self.runners[&net_id].enabled_tasks();
            for task_id in enabled {
                if self.has_active_item(&net_id, &task_id) {
                    continue;
                }
                let kind = self.runners[&net_id].net().task(&task_id)?.kind.clone();
                match kind {
                    TaskKind::MultiInstance(cfg) => {
                        created.extend(self.spawn_mi_context(&net_id, &task_id, &cfg)?);
                    }
                    _ => {
                        let item = WorkItem::new(self.id, net_id.clone(), task_id.clone(), 0);
                        created.push(item.id);
                        self.work_items.insert(item.id, item);
                    }
                }
            }
        }
        Ok(created)
    }

    fn has_active_item(&self, net_id: &str, task_id: &str) -> bool {
        self.work_items
            .values()
            .any(|w| w.net_id == net_id && w.task_id == task_id && !w.status.is_terminal())
            || self.mi_contexts.contains_key(&(net_id.to_string(), task_id.to_string()))
    }

    fn spawn_mi_context(
        &mut self,
        net_id: &str,
        task_id: &str,
        cfg: &crate::net::MultiInstanceConfig,
    ) -> EngineResult<Vec<WorkItemId>> {
        // `MultiInstanceContext::new` wants a plain `Fn`, so the initial
        // batch of work items is created up front and the spawn closure
        // just hands back the precomputed id at each index.
        let mut created = Vec::with_capacity(cfg.minimum as usize);
        let mut ids = Vec::with_capacity(cfg.minimum as usize);
        for index in 0..cfg.minimum {
            let item = WorkItem::new(self.id, net_id.to_string(), task_id.to_string(), index);
            ids.push(item.id);
            created.push(item.id);
            self.work_items.insert(item.id, item);
        }
        let ctx = MultiInstanceContext::new(
            task_id.to_string(),
            cfg.minimum,
            cfg.maximum,
            cfg.threshold,
            cfg.creation_mode,
            cfg.ordering_mode,
            cfg.completion_mode,
            move |index| ids[index as usize],
        );
        self.mi_contexts.insert((net_id.to_string(), task_id.to_string()), ctx);
        Ok(created)
    }

    pub fn fire_work_item(&mut self, work_item_id: WorkItemId, input_bindings: Value) -> EngineResult<()> {
        let item = self.work_items.get_mut(&work_item_id).ok_or_else(|| EngineError::Unknown(work_item_id.to_string()))?;
        item.fire(input_bindings)
    }

    pub fn start_work_item(&mut self, work_item_id: WorkItemId) -> EngineResult<()> {
        let item = self.work_items.get_mut(&work_item_id).ok_or_else(|| EngineError::Unknown(work_item_id.to_string()))?;
        item.start()
    }

    pub fn suspend_work_item(&mut self, work_item_id: WorkItemId) -> EngineResult<()> {
        let item = self.work_items.get_mut(&work_item_id).ok_or_else(|| EngineError::Unknown(work_item_id.to_string()))?;
        item.suspend()
    }

    pub fn resume_work_item(&mut self, work_item_id: WorkItemId) -> EngineResult<()> {
        let item = self.work_items.get_mut(&work_item_id).ok_or_else(|| EngineError::Unknown(work_item_id.to_string()))?;
        item.resume()
    }

    pub fn fail_work_item(&mut self, work_item_id: WorkItemId) -> EngineResult<()> {
        let item = self.work_items.get_mut(&work_item_id).ok_or_else(|| EngineError::Unknown(work_item_id.to_string()))?;
        item.fail()
    }

    /// `complete`: binds output data, fires the underlying net task exactly
    /// once completion-satisfied (immediately for non-MI tasks, on
    /// threshold/all satisfaction for MI tasks per §4.4), applies the
    /// task's cancellation set, records a compensation entry, discovers
    /// newly enabled work, and re-evaluates the completion policy.
    pub fn complete_work_item(&mut self, work_item_id: WorkItemId, output_bindings: Value) -> EngineResult<Vec<WorkItemId>> {
        let (net_id, task_id, instance_index) = {
            let item = self.work_items.get(&work_item_id).ok_or_else(|| EngineError::Unknown(work_item_id.to_string()))?;
            (item.net_id.clone(), item.task_id.clone(), item.instance_index)
        };

        {
            let item = self.work_items.get_mut(&work_item_id).expect("looked up above");
            item.complete(output_bindings.clone())?;
        }

        merge_into(&mut self.data, &output_bindings);

        let mi_key = (net_id.clone(), task_id.clone());
        let should_fire = if let Some(ctx) = self.mi_contexts.get_mut(&mi_key) {
            ctx.mark_completed(instance_index, output_bindings.clone())?;
            ctx.is_completion_satisfied()
        } else {
            true
        };

        if !should_fire {
            return Ok(Vec::new());
        }

        let fire_output = if let Some(ctx) = self.mi_contexts.remove(&mi_key) {
            for idx in ctx.remaining_non_terminal() {
                if let Some(child) = ctx.instance(idx) {
                    if let Some(child_item) = self.work_items.get_mut(&child.work_item_id) {
                        let _ = child_item.cancel();
                    }
                }
            }
            ctx.aggregate_outputs(|outputs| Value::Array(outputs.into_iter().cloned().collect()))
        } else {
            output_bindings
        };

        self.ensure_runner(&net_id)?;
        let runner = self.runners.get_mut(&net_id).expect("ensured above");
        let result = runner.fire(&task_id, &self.data, fire_output, None)?;

        for cancelled_task in &result.cancelled_tasks {
            for item in self.work_items.values_mut() {
                if &item.task_id == cancelled_task && item.net_id == net_id && !item.status.is_terminal() {
                    let _ = item.cancel();
                }
            }
        }

        self.compensation.push(CompensationEntry { task_id: task_id.clone(), work_item_id });

        if let Some(net) = self.nets.get(&net_id).cloned() {
            if let Ok(task) = net.task(&task_id) {
                if let TaskKind::Composite { sub_net } = task.kind.clone() {
                    self.ensure_runner(&sub_net)?;
                    self.runners.get_mut(&sub_net).expect("ensured above").start()?;
                }
            }
        }

        let created = self.sync_enabled_work_items()?;
        self.evaluate_completion();
        Ok(created)
    }

    /// `cancel_case` (§4.8): every non-terminal work item transitions to
    /// cancelled and the marking is cleared (§8 property 6, cancellation
    /// atomicity). Cancelling an already-terminal case fails.
    pub fn cancel(&mut self) -> EngineResult<()> {
        if matches!(self.status, CaseStatus::Completed | CaseStatus::Cancelled | CaseStatus::Failed) {
            return Err(EngineError::InvalidOperation("cannot cancel a terminal case".into()));
        }
        for item in self.work_items.values_mut() {
            if !item.status.is_terminal() {
                let _ = item.cancel();
            }
        }
        for runner in self.runners.values_mut() {
            for cond in runner.net().conditions.keys().cloned().collect::<Vec<_>>() {
                runner.marking_mut().clear_condition(&cond);
            }
        }
        self.mi_contexts.clear();
        self.status = CaseStatus::Cancelled;
        Ok(())
    }

    pub fn suspend(&mut self) -> EngineResult<()> {
        if self.status != CaseStatus::Running {
            return Err(EngineError::InvalidOperation("only a running case can be suspended".into()));
        }
        self.status = CaseStatus::Suspended;
        Ok(())
    }

    pub fn resume(&mut self) -> EngineResult<()> {
        if self.status != CaseStatus::Suspended {
            return Err(EngineError::InvalidOperation("only a suspended case can be resumed".into()));
        }
        self.status = CaseStatus::Running;
        Ok(())
    }

    /// Completion policy (§4.8): the root runner holds a token in its
    /// output condition *and* no work item remains non-terminal.
    fn evaluate_completion(&mut self) {
        if self.status != CaseStatus::Running {
            return;
        }
        let root_completed = self.runner_for(&self.root_net_id).map(|r| r.is_completed()).unwrap_or(false);
        if root_completed && self.non_terminal_work_items() == 0 {
            self.status = CaseStatus::Completed;
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == CaseStatus::Completed
    }

    pub fn root_snapshot(&self) -> HashMap<NodeId, Vec<crate::ids::TokenId>> {
        self.runner_for(&self.root_net_id).map(|r| r.snapshot()).unwrap_or_default()
    }
}

/// Shallow merge of `patch`'s object keys into `target`, used to bind
/// work-item output data back into the case-wide data dictionary (§4.7).
fn merge_into(target: &mut Value, patch: &Value) {
    let (Value::Object(target_map), Value::Object(patch_map)) = (target, patch) else { return };
    for (k, v) in patch_map {
        target_map.insert(k.clone(), v.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SpecId;
    use crate::net::{CancellationSet, Condition, Flow, JoinType, SplitType, Task};

    fn atomic(id: &str, join: JoinType, split: SplitType) -> Task {
        Task { id: id.into(), name: id.into(), join_type: join, split_type: split, kind: TaskKind::Atomic, cancellation_set: CancellationSet::default() }
    }

    fn cond(id: &str) -> Condition {
        Condition { id: id.into(), name: id.into() }
    }

    fn flow(id: &str, from: &str, to: &str) -> Flow {
        Flow { id: id.into(), from: from.into(), to: to.into(), ordering_index: 0, predicate: None }
    }

    fn sequential_net() -> Arc<Net> {
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
            flows: vec![flow("f1", "start", "A"), flow("f2", "A", "c1"), flow("f3", "c1", "B"), flow("f4", "B", "end")],
            input_condition: "start".into(),
            output_condition: "end".into(),
        })
    }

    fn case_with_sequential_net() -> Case {
        let net = sequential_net();
        let mut nets = HashMap::new();
        nets.insert("root".to_string(), net);
        Case::new(SpecId::new("seq", 1, 0, "urn:seq"), "root", nets)
    }

    /// S1: start -> A -> c1 -> B -> end, driven through the case API.
    #[test]
    fn s1_sequential_case_completes() {
        let mut case = case_with_sequential_net();
        case.start().unwrap();
        let a = case.work_items().find(|w| w.task_id == "A").unwrap().id;
        case.fire_work_item(a, Value::Null).unwrap();
        case.start_work_item(a).unwrap();
        case.complete_work_item(a, Value::Null).unwrap();

        let b = case.work_items().find(|w| w.task_id == "B").unwrap().id;
        case.fire_work_item(b, Value::Null).unwrap();
        case.start_work_item(b).unwrap();
        case.complete_work_item(b, Value::Null).unwrap();

        assert!(case.is_completed());
    }

    #[test]
    fn cancel_case_terminates_every_non_terminal_work_item() {
        let mut case = case_with_sequential_net();
        case.start().unwrap();
        assert!(!case.work_items().collect::<Vec<_>>().is_empty());
        case.cancel().unwrap();
        assert!(case.work_items().all(|w| w.status.is_terminal()));
        assert!(case.cancel().is_err(), "cancelling a terminal case must fail");
    }

    #[test]
    fn suspend_then_resume_round_trips_status() {
        let mut case = case_with_sequential_net();
        case.start().unwrap();
        case.suspend().unwrap();
        assert_eq!(case.status, CaseStatus::Suspended);
        case.resume().unwrap();
        assert_eq!(case.status, CaseStatus::Running);
    }
}
