//! Multi-instance context (C4): fan-out/fan-in bookkeeping for one
//! multi-instance task, grounded in the reference crate's `multi_instance`
//! module but reworked around a minimum/maximum/threshold and
//! creation/ordering/completion-mode vocabulary (§4.4).

use crate::error::{EngineError, EngineResult};
use crate::ids::WorkItemId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreationMode {
    Static,
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderingMode {
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionMode {
    All,
    Threshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Pending,
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Completed | InstanceState::Cancelled | InstanceState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub index: u32,
    pub work_item_id: WorkItemId,
    pub state: InstanceState,
    pub output: Option<serde_json::Value>,
}

/// Tracks the children of a single multi-instance task invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiInstanceContext {
    pub task_id: String,
    pub minimum: u32,
    pub maximum: u32,
    pub threshold: u32,
    pub creation_mode: CreationMode,
    pub ordering_mode: OrderingMode,
    pub completion_mode: CompletionMode,
    instances: HashMap<u32, Instance>,
    next_index: u32,
}

impl MultiInstanceContext {
    pub fn new(
        task_id: impl Into<String>,
        minimum: u32,
        maximum: u32,
        threshold: u32,
        creation_mode: CreationMode,
        ordering_mode: OrderingMode,
        completion_mode: CompletionMode,
        spawn: impl Fn(u32) -> WorkItemId,
    ) -> Self {
        let mut instances = HashMap::new();
        for index in 0..minimum {
            instances.insert(
                index,
                Instance { index, work_item_id: spawn(index), state: InstanceState::Pending, output: None },
            );
        }
        Self {
            task_id: task_id.into(),
            minimum,
            maximum,
            threshold,
            creation_mode,
            ordering_mode,
            completion_mode,
            instances,
            next_index: minimum,
        }
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn instance(&self, index: u32) -> Option<&Instance> {
        self.instances.get(&index)
    }

    /// WCP-15: accepted only in dynamic mode, only while not
    /// completion-satisfied, and only below the configured maximum.
    pub fn add_instance(&mut self, spawn: impl FnOnce(u32) -> WorkItemId) -> EngineResult<u32> {
        if self.creation_mode != CreationMode::Dynamic {
            return Err(EngineError::InvalidOperation(
                "add_instance requires dynamic creation mode".into(),
            ));
        }
        if self.is_completion_satisfied() {
            return Err(EngineError::InvalidOperation(
                "multi-instance context is already completion-satisfied".into(),
            ));
        }
        if self.instances.len() as u32 >= self.maximum {
            return Err(EngineError::InvalidOperation(
                "multi-instance context is at its maximum".into(),
            ));
        }
        let index = self.next_index;
        self.next_index += 1;
        self.instances.insert(
            index,
            Instance { index, work_item_id: spawn(index), state: InstanceState::Pending, output: None },
        );
        Ok(index)
    }

    pub fn mark_active(&mut self, index: u32) -> EngineResult<()> {
        let instance = self.instance_mut(index)?;
        instance.state = InstanceState::Active;
        Ok(())
    }

    pub fn mark_completed(&mut self, index: u32, output: serde_json::Value) -> EngineResult<()> {
        let instance = self.instance_mut(index)?;
        instance.state = InstanceState::Completed;
        instance.output = Some(output);
        Ok(())
    }

    pub fn mark_failed(&mut self, index: u32) -> EngineResult<()> {
        let instance = self.instance_mut(index)?;
        instance.state = InstanceState::Failed;
        Ok(())
    }

    pub fn mark_cancelled(&mut self, index: u32) -> EngineResult<()> {
        let instance = self.instance_mut(index)?;
        instance.state = InstanceState::Cancelled;
        Ok(())
    }

    fn instance_mut(&mut self, index: u32) -> EngineResult<&mut Instance> {
        self.instances
            .get_mut(&index)
            .ok_or_else(|| EngineError::Unknown(format!("mi instance {index}")))
    }

    fn completed_count(&self) -> u32 {
        self.instances.values().filter(|i| i.state == InstanceState::Completed).count() as u32
    }

    pub fn is_completion_satisfied(&self) -> bool {
        match self.completion_mode {
            CompletionMode::All => self.instances.values().all(|i| i.state.is_terminal()),
            CompletionMode::Threshold => self.completed_count() >= self.threshold,
        }
    }

    /// Children not yet in a terminal state that must be cancelled once the
    /// threshold is satisfied (§4.4.6).
    pub fn remaining_non_terminal(&self) -> Vec<u32> {
        self.instances
            .values()
            .filter(|i| !i.state.is_terminal())
            .map(|i| i.index)
            .collect()
    }

    /// Combine every completed child's output via `aggregate`, used to build
    /// the parent task's output binding before it fires (§4.4.7).
    pub fn aggregate_outputs(
        &self,
        aggregate: impl Fn(Vec<&serde_json::Value>) -> serde_json::Value,
    ) -> serde_json::Value {
        let outputs: Vec<&serde_json::Value> = self
            .instances
            .values()
            .filter(|i| i.state == InstanceState::Completed)
            .filter_map(|i| i.output.as_ref())
            .collect();
        aggregate(outputs)
    }
}
