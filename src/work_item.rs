//! Work-item lifecycle (C7): the assignable unit of execution bound to a
//! `(case, task, instance-index)`, grounded in the reference crate's
//! `engine::y_work_item` but with the phase encoded as a plain enum rather
//! than a type-level marker — the engine façade is the exclusive mediator
//! of transitions (§4.7), so there is no compile-time benefit to phantom
//! phases here, only a runtime state machine to enforce.

use crate::error::{EngineError, EngineResult};
use crate::ids::{CaseId, NodeId, WorkItemId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical uppercase status strings (§6 "Wire-visible artifacts").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItemStatus {
    Enabled,
    Fired,
    Executing,
    Completed,
    Suspended,
    Cancelled,
    Failed,
}

impl WorkItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkItemStatus::Enabled => "ENABLED",
            WorkItemStatus::Fired => "FIRED",
            WorkItemStatus::Executing => "EXECUTING",
            WorkItemStatus::Completed => "COMPLETED",
            WorkItemStatus::Suspended => "SUSPENDED",
            WorkItemStatus::Cancelled => "CANCELLED",
            WorkItemStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkItemStatus::Completed | WorkItemStatus::Cancelled | WorkItemStatus::Failed)
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub case_id: CaseId,
    /// Id of the net (root or sub-net) whose task this item is bound to.
    pub net_id: String,
    pub task_id: NodeId,
    /// Multi-instance child index; `0` for single-instance tasks.
    pub instance_index: u32,
    pub status: WorkItemStatus,
    /// Bindings resolved from case data at `fire` time.
    pub input_bindings: Value,
    /// Data the performer hands back on `complete`.
    pub output_bindings: Option<Value>,
}

impl WorkItem {
    pub fn new(case_id: CaseId, net_id: impl Into<String>, task_id: NodeId, instance_index: u32) -> Self {
        Self {
            id: WorkItemId::new(),
            case_id,
            net_id: net_id.into(),
            task_id,
            instance_index,
            status: WorkItemStatus::Enabled,
            input_bindings: Value::Null,
            output_bindings: None,
        }
    }

    fn transition(&mut self, allowed_from: &[WorkItemStatus], to: WorkItemStatus) -> EngineResult<()> {
        if !allowed_from.contains(&self.status) {
            return Err(EngineError::InvalidStateTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// `enabled -> fired`, binding input parameters.
    pub fn fire(&mut self, input_bindings: Value) -> EngineResult<()> {
        self.transition(&[WorkItemStatus::Enabled], WorkItemStatus::Fired)?;
        self.input_bindings = input_bindings;
        Ok(())
    }

    /// `fired -> executing`.
    pub fn start(&mut self) -> EngineResult<()> {
        self.transition(&[WorkItemStatus::Fired], WorkItemStatus::Executing)
    }

    /// `executing -> completed`, binding output parameters.
    pub fn complete(&mut self, output_bindings: Value) -> EngineResult<()> {
        self.transition(&[WorkItemStatus::Executing], WorkItemStatus::Completed)?;
        self.output_bindings = Some(output_bindings);
        Ok(())
    }

    /// `fired|executing -> failed`.
    pub fn fail(&mut self) -> EngineResult<()> {
        self.transition(&[WorkItemStatus::Fired, WorkItemStatus::Executing], WorkItemStatus::Failed)
    }

    /// Any non-terminal status `-> suspended`.
    pub fn suspend(&mut self) -> EngineResult<()> {
        self.transition(
            &[WorkItemStatus::Enabled, WorkItemStatus::Fired, WorkItemStatus::Executing],
            WorkItemStatus::Suspended,
        )
    }

    /// `suspended -> executing`: the lateral pair to `suspend`.
    pub fn resume(&mut self) -> EngineResult<()> {
        self.transition(&[WorkItemStatus::Suspended], WorkItemStatus::Executing)
    }

    /// Any non-terminal status `-> cancelled`.
    pub fn cancel(&mut self) -> EngineResult<()> {
        if self.status.is_terminal() {
            return Err(EngineError::InvalidStateTransition {
                from: self.status.to_string(),
                to: WorkItemStatus::Cancelled.to_string(),
            });
        }
        self.status = WorkItemStatus::Cancelled;
        Ok(())
    }
}
