//! Net runner (C3): fires tasks per control-flow rules and mutates the
//! marking. One runner owns one net and its marking; the case above it is
//! the single writer, so no internal locking is needed (§4.1, §5).

use super::marking::{Marking, Token};
use super::{JoinType, Net, SplitType};
use crate::error::{EngineError, EngineResult};
use crate::expr;
use crate::ids::{NodeId, TokenId};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct FireResult {
    pub consumed: Vec<TokenId>,
    pub produced: Vec<TokenId>,
    /// Tokens removed by the firing task's cancellation set.
    pub cancelled_tokens: Vec<TokenId>,
    /// Task ids whose in-flight instances the cancellation set says to
    /// cancel. The case layer is responsible for cancelling the
    /// corresponding work items; the runner only reports the ids.
    pub cancelled_tasks: Vec<NodeId>,
}

pub struct NetRunner {
    net: Arc<Net>,
    marking: Marking,
}

impl NetRunner {
    pub fn new(net: Arc<Net>) -> Self {
        Self { net, marking: Marking::new() }
    }

    pub fn net(&self) -> &Net {
        &self.net
    }

    /// Places one token on the input condition. Fails if the net has no
    /// input condition — which `Net::validate` already rejects at load
    /// time, so this only re-checks defensively.
    pub fn start(&mut self) -> EngineResult<TokenId> {
        if !self.net.conditions.contains_key(&self.net.input_condition) {
            return Err(EngineError::ValidationFailure("net has no input condition".into()));
        }
        let token = Token::new(self.net.input_condition.clone(), Value::Null, None);
        let id = token.id;
        self.marking.place(token);
        Ok(id)
    }

    fn input_conditions(&self, task_id: &str) -> Vec<NodeId> {
        self.net.incoming(task_id).into_iter().map(|f| f.from.clone()).collect()
    }

    pub fn is_enabled(&self, task_id: &str) -> bool {
        let Ok(task) = self.net.task(task_id) else { return false };
        let inputs = self.input_conditions(task_id);
        match task.join_type {
            JoinType::And => inputs.iter().all(|c| self.marking.has(c)),
            JoinType::Xor => inputs.iter().any(|c| self.marking.has(c)),
            JoinType::Or => self.or_join_enabled(task_id, &inputs),
        }
    }

    /// §4.3.3: active subset of the OR-join's dependency set, intersected
    /// with the dependency set itself, must all be marked.
    fn or_join_enabled(&self, task_id: &str, inputs: &[NodeId]) -> bool {
        let deps = self.net.or_join_dependency_set(task_id);
        if deps.is_empty() {
            return inputs.iter().any(|c| self.marking.has(c));
        }
        let marked: Vec<NodeId> = self.marking.marked_conditions();
        let active = self.reachable_forward_excluding(&marked, task_id);
        deps.iter()
            .filter(|c| active.contains(*c))
            .all(|c| self.marking.has(c))
    }

    fn reachable_forward_excluding(&self, starts: &[NodeId], excluded: &str) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<NodeId> = starts.to_vec();
        while let Some(node) = stack.pop() {
            if !seen.insert(node.clone()) {
                continue;
            }
            if node == excluded {
                continue;
            }
            for flow in self.net.outgoing(&node) {
                stack.push(flow.to.clone());
            }
        }
        seen
    }

    pub fn enabled_tasks(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .net
            .tasks
            .keys()
            .filter(|id| self.is_enabled(id))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Fires `task_id`. `case_data` is the read-only context predicates are
    /// evaluated against; `output_data` is carried onto every token this
    /// firing produces; `chosen_input` picks the consumed input condition
    /// for an XOR-join when more than one is marked (first-by-id otherwise).
    pub fn fire(
        &mut self,
        task_id: &str,
        case_data: &Value,
        output_data: Value,
        chosen_input: Option<&str>,
    ) -> EngineResult<FireResult> {
        if !self.net.tasks.contains_key(task_id) {
            return Err(EngineError::Unknown(task_id.to_string()));
        }
        if !self.is_enabled(task_id) {
            return Err(EngineError::NotEnabled(task_id.to_string()));
        }
        let task = self.net.task(task_id)?.clone();

        let mut result = FireResult::default();

        // 1. consume.
        match task.join_type {
            JoinType::And => {
                let mut inputs = self.input_conditions(task_id);
                inputs.sort();
                for cond in &inputs {
                    let tok = self
                        .marking
                        .remove_first(cond)
                        .ok_or_else(|| EngineError::NotEnabled(task_id.to_string()))?;
                    result.consumed.push(tok.id);
                }
            }
            JoinType::Xor => {
                let cond = if let Some(chosen) = chosen_input {
                    chosen.to_string()
                } else {
                    let mut inputs = self.input_conditions(task_id);
                    inputs.sort();
                    inputs
                        .into_iter()
                        .find(|c| self.marking.has(c))
                        .ok_or_else(|| EngineError::NotEnabled(task_id.to_string()))?
                };
                let tok = self
                    .marking
                    .remove_first(&cond)
                    .ok_or_else(|| EngineError::NotEnabled(task_id.to_string()))?;
                result.consumed.push(tok.id);
            }
            JoinType::Or => {
                let mut inputs = self.input_conditions(task_id);
                inputs.sort();
                for cond in &inputs {
                    if self.marking.has(cond) {
                        if let Some(tok) = self.marking.remove_first(cond) {
                            result.consumed.push(tok.id);
                        }
                    }
                }
            }
        }
        let canonical_parent = result.consumed.first().copied();
        let siblings: Vec<TokenId> = result.consumed.iter().skip(1).copied().collect();

        // 2. cancellation set.
        for cond in &task.cancellation_set.conditions {
            let cleared = self.marking.clear_condition(cond);
            result.cancelled_tokens.extend(cleared.into_iter().map(|t| t.id));
        }
        result.cancelled_tasks = task.cancellation_set.tasks.clone();

        // 3. produce per split type.
        let outgoing = self.net.outgoing(task_id);
        let produced_targets: Vec<NodeId> = match task.split_type {
            SplitType::And => outgoing.iter().map(|f| f.to.clone()).collect(),
            SplitType::Xor => {
                let matched = outgoing
                    .iter()
                    .find(|f| predicate_true(f.predicate.as_deref(), case_data));
                match matched.or_else(|| outgoing.last()) {
                    Some(f) => vec![f.to.clone()],
                    None => Vec::new(),
                }
            }
            SplitType::Or => {
                let matched: Vec<NodeId> = outgoing
                    .iter()
                    .filter(|f| predicate_true(f.predicate.as_deref(), case_data))
                    .map(|f| f.to.clone())
                    .collect();
                if matched.is_empty() {
                    outgoing
                        .iter()
                        .max_by_key(|f| f.ordering_index)
                        .map(|f| vec![f.to.clone()])
                        .unwrap_or_default()
                } else {
                    matched
                }
            }
        };

        for target in produced_targets {
            let mut token = Token::new(target, output_data.clone(), canonical_parent);
            token.siblings = siblings.clone();
            result.produced.push(token.id);
            self.marking.place(token);
        }

        Ok(result)
    }

    pub fn is_completed(&self) -> bool {
        self.marking.has(&self.net.output_condition)
    }

    pub fn is_deadlocked(&self) -> bool {
        !self.is_completed() && self.enabled_tasks().is_empty()
    }

    pub fn snapshot(&self) -> std::collections::HashMap<NodeId, Vec<TokenId>> {
        self.marking.snapshot()
    }

    pub fn marking(&self) -> &Marking {
        &self.marking
    }

    pub fn marking_mut(&mut self) -> &mut Marking {
        &mut self.marking
    }
}

fn predicate_true(predicate: Option<&str>, data: &Value) -> bool {
    match predicate {
        Some(p) => expr::evaluate_boolean(p, data),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{CancellationSet, Condition, Flow, JoinType as J, SplitType as S, Task, TaskKind};
    use std::collections::HashMap;

    fn atomic(id: &str, join: J, split: S) -> Task {
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

    fn flow(id: &str, from: &str, to: &str, idx: u32, predicate: Option<&str>) -> Flow {
        Flow { id: id.into(), from: from.into(), to: to.into(), ordering_index: idx, predicate: predicate.map(String::from) }
    }

    /// S1: start -> A -> c1 -> B -> end
    fn sequential_net() -> Net {
        let mut conditions = HashMap::new();
        for c in ["start", "c1", "end"] {
            conditions.insert(c.to_string(), cond(c));
        }
        let mut tasks = HashMap::new();
        tasks.insert("A".to_string(), atomic("A", J::Xor, S::Xor));
        tasks.insert("B".to_string(), atomic("B", J::Xor, S::Xor));

        Net {
            id: "seq".into(),
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
        }
    }

    #[test]
    fn s1_sequential_success() {
        let net = Arc::new(sequential_net());
        let mut runner = NetRunner::new(net);
        runner.start().unwrap();
        assert_eq!(runner.enabled_tasks(), vec!["A".to_string()]);

        runner.fire("A", &Value::Null, Value::Null, None).unwrap();
        assert_eq!(runner.enabled_tasks(), vec!["B".to_string()]);

        runner.fire("B", &Value::Null, Value::Null, None).unwrap();
        assert!(runner.is_completed());
        assert_eq!(runner.marking().count("end"), 1);
    }

    /// S2: Split[AND] -> (A, B) -> Join[AND] -> end
    fn and_split_join_net() -> Net {
        let mut conditions = HashMap::new();
        for c in ["start", "ca", "cb", "ca2", "cb2", "end"] {
            conditions.insert(c.to_string(), cond(c));
        }
        let mut tasks = HashMap::new();
        tasks.insert("Split".to_string(), atomic("Split", J::Xor, S::And));
        tasks.insert("A".to_string(), atomic("A", J::Xor, S::Xor));
        tasks.insert("B".to_string(), atomic("B", J::Xor, S::Xor));
        tasks.insert("Join".to_string(), atomic("Join", J::And, S::Xor));

        Net {
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
        }
    }

    #[test]
    fn s2_and_split_and_join() {
        let net = Arc::new(and_split_join_net());
        let mut runner = NetRunner::new(net);
        runner.start().unwrap();
        runner.fire("Split", &Value::Null, Value::Null, None).unwrap();
        assert_eq!(runner.enabled_tasks(), vec!["A".to_string(), "B".to_string()]);

        // Need distinct consumed-token identities so Join's two incoming
        // conditions each hold their own token — A and B consume from ca/cb.
        runner.fire("A", &Value::Null, Value::Null, None).unwrap();
        assert!(!runner.enabled_tasks().contains(&"Join".to_string()));

        runner.fire("B", &Value::Null, Value::Null, None).unwrap();
        assert!(runner.enabled_tasks().contains(&"Join".to_string()));

        runner.fire("Join", &Value::Null, Value::Null, None).unwrap();
        assert!(runner.is_completed());
    }

    /// S3: XOR-split to branch alpha/beta, both join at OR-join J.
    fn or_join_net() -> Net {
        let mut conditions = HashMap::new();
        for c in ["start", "ca", "cb", "ca2", "cb2", "end"] {
            conditions.insert(c.to_string(), cond(c));
        }
        let mut tasks = HashMap::new();
        tasks.insert("Split".to_string(), atomic("Split", J::Xor, S::Xor));
        tasks.insert("Alpha".to_string(), atomic("Alpha", J::Xor, S::Xor));
        tasks.insert("Beta".to_string(), atomic("Beta", J::Xor, S::Xor));
        tasks.insert("J".to_string(), atomic("J", J::Or, S::Xor));

        Net {
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
        }
    }

    #[test]
    fn s3_or_join_does_not_wait_for_unactivated_branch() {
        let net = Arc::new(or_join_net());
        let mut runner = NetRunner::new(net);
        runner.start().unwrap();

        let case_data = serde_json::json!({"choice": "alpha"});
        runner.fire("Split", &case_data, Value::Null, None).unwrap();
        assert!(runner.marking().has("ca"));
        assert!(!runner.marking().has("cb"));

        runner.fire("Alpha", &Value::Null, Value::Null, None).unwrap();
        assert!(runner.enabled_tasks().contains(&"J".to_string()), "J should fire without waiting for beta");

        runner.fire("J", &Value::Null, Value::Null, None).unwrap();
        assert!(runner.is_completed());
    }

    #[test]
    fn fire_unknown_task_is_an_error() {
        let net = Arc::new(sequential_net());
        let mut runner = NetRunner::new(net);
        runner.start().unwrap();
        assert!(runner.fire("nonexistent", &Value::Null, Value::Null, None).is_err());
    }

    #[test]
    fn fire_not_enabled_task_is_an_error() {
        let net = Arc::new(sequential_net());
        let mut runner = NetRunner::new(net);
        runner.start().unwrap();
        assert!(runner.fire("B", &Value::Null, Value::Null, None).is_err());
    }
}
