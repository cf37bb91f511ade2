//! Net (C1/C3 data types) — the Petri-net graph a [`runner::NetRunner`] executes.

pub mod marking;
pub mod runner;

use crate::error::{EngineError, EngineResult};
use crate::ids::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    And,
    Xor,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitType {
    And,
    Xor,
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiInstanceConfig {
    pub minimum: u32,
    pub maximum: u32,
    pub threshold: u32,
    pub creation_mode: crate::multi_instance::CreationMode,
    pub ordering_mode: crate::multi_instance::OrderingMode,
    pub completion_mode: crate::multi_instance::CompletionMode,
    pub input_aggregation: Option<String>,
    pub output_aggregation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskKind {
    Atomic,
    Composite { sub_net: String },
    MultiInstance(MultiInstanceConfig),
}

/// A task's cancellation set: conditions whose tokens are cleared, and
/// task ids whose in-flight work items are cancelled, when the owning task
/// fires. Cancelling a task instance always cancels both its work item and
/// any tokens it produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancellationSet {
    pub conditions: Vec<NodeId>,
    pub tasks: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: NodeId,
    pub name: String,
    pub join_type: JoinType,
    pub split_type: SplitType,
    pub kind: TaskKind,
    pub cancellation_set: CancellationSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub id: NodeId,
    pub name: String,
}

/// A directed arc. Conditions connect only to tasks and vice versa.
/// `ordering_index` governs XOR/OR split evaluation order and is also the
/// primary sort key for deterministic flow iteration (§4.3.4); ties break
/// on `id` ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: NodeId,
    pub from: NodeId,
    pub to: NodeId,
    pub ordering_index: u32,
    pub predicate: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Net {
    pub id: String,
    pub conditions: HashMap<NodeId, Condition>,
    pub tasks: HashMap<NodeId, Task>,
    pub flows: Vec<Flow>,
    pub input_condition: NodeId,
    pub output_condition: NodeId,
}

impl Net {
    pub fn outgoing(&self, node: &str) -> Vec<&Flow> {
        let mut flows: Vec<&Flow> = self.flows.iter().filter(|f| f.from == node).collect();
        flows.sort_by(|a, b| a.ordering_index.cmp(&b.ordering_index).then(a.id.cmp(&b.id)));
        flows
    }

    pub fn incoming(&self, node: &str) -> Vec<&Flow> {
        let mut flows: Vec<&Flow> = self.flows.iter().filter(|f| f.to == node).collect();
        flows.sort_by(|a, b| a.ordering_index.cmp(&b.ordering_index).then(a.id.cmp(&b.id)));
        flows
    }

    pub fn task(&self, id: &str) -> EngineResult<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| EngineError::Unknown(id.to_string()))
    }

    /// Validate the structural invariants §3 demands: bipartite graph,
    /// input condition has no incoming arcs, output condition has no
    /// outgoing arcs, every task reachable from input and can reach output.
    pub fn validate(&self) -> EngineResult<()> {
        if !self.conditions.contains_key(&self.input_condition) {
            return Err(EngineError::ValidationFailure("missing input condition".into()));
        }
        if !self.conditions.contains_key(&self.output_condition) {
            return Err(EngineError::ValidationFailure("missing output condition".into()));
        }
        if !self.incoming(&self.input_condition).is_empty() {
            return Err(EngineError::ValidationFailure(
                "input condition has incoming arcs".into(),
            ));
        }
        if !self.outgoing(&self.output_condition).is_empty() {
            return Err(EngineError::ValidationFailure(
                "output condition has outgoing arcs".into(),
            ));
        }

        for flow in &self.flows {
            let from_is_cond = self.conditions.contains_key(&flow.from);
            let from_is_task = self.tasks.contains_key(&flow.from);
            let to_is_cond = self.conditions.contains_key(&flow.to);
            let to_is_task = self.tasks.contains_key(&flow.to);
            let bipartite = (from_is_cond && to_is_task) || (from_is_task && to_is_cond);
            if !bipartite {
                return Err(EngineError::ValidationFailure(format!(
                    "flow {} is not condition<->task",
                    flow.id
                )));
            }
        }

        let reachable_from_input = self.reachable_forward(&self.input_condition);
        let can_reach_output = self.reachable_backward(&self.output_condition);
        for task_id in self.tasks.keys() {
            if !reachable_from_input.contains(task_id) {
                return Err(EngineError::ValidationFailure(format!(
                    "task {task_id} not reachable from input"
                )));
            }
            if !can_reach_output.contains(task_id) {
                return Err(EngineError::ValidationFailure(format!(
                    "task {task_id} cannot reach output"
                )));
            }
        }
        Ok(())
    }

    fn reachable_forward(&self, from: &str) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = vec![from.to_string()];
        while let Some(node) = stack.pop() {
            if !seen.insert(node.clone()) {
                continue;
            }
            for flow in self.outgoing(&node) {
                stack.push(flow.to.clone());
            }
        }
        seen
    }

    fn reachable_backward(&self, to: &str) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = vec![to.to_string()];
        while let Some(node) = stack.pop() {
            if !seen.insert(node.clone()) {
                continue;
            }
            for flow in self.incoming(&node) {
                stack.push(flow.from.clone());
            }
        }
        seen
    }

    /// Backward-reachability set for an OR-join task, used by §4.3.3: every
    /// condition from which `task_id` is reachable without passing through
    /// `task_id` itself.
    pub fn or_join_dependency_set(&self, task_id: &str) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<NodeId> = self.incoming(task_id).iter().map(|f| f.from.clone()).collect();
        while let Some(node) = stack.pop() {
            if node == task_id {
                continue;
            }
            if !seen.insert(node.clone()) {
                continue;
            }
            for flow in self.incoming(&node) {
                if flow.from != task_id {
                    stack.push(flow.from.clone());
                }
            }
        }
        // Keep only conditions: the dependency set is expressed over places.
        seen.into_iter().filter(|n| self.conditions.contains_key(n)).collect()
    }
}
