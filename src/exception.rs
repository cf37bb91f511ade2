//! Exception service (C10): a priority-ordered rule base reacting to
//! workflow-level exceptions with retry/compensation bookkeeping, grounded
//! in the reference crate's `compensation::CompensationRegistry` for the
//! LIFO undo stack, generalized with a rule base matching §4.10 and an
//! `ExceptionCategory` axis classifying *what* failed (state, data,
//! persistence, ...) orthogonally to `ExceptionKind`'s *why*.

use crate::ids::{NodeId, WorkItemId, WorkletId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Abstract error kinds from §7's taxonomy that can surface as a workflow
/// exception (task execution, timer, or validator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionKind {
    BindingFailure,
    TaskFailure,
    Timeout,
    ResourceUnavailable,
}

/// Classification axis orthogonal to `ExceptionKind`: *what* failed vs *why*.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionCategory {
    State,
    Data,
    Persistence,
    Query,
    Authentication,
    Connectivity,
    Validation,
}

#[derive(Debug, Clone)]
pub struct ExceptionEvent {
    pub kind: ExceptionKind,
    pub category: Option<ExceptionCategory>,
    pub task_id: Option<NodeId>,
    pub work_item_id: Option<WorkItemId>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Ignore,
    Retry,
    Skip,
    Complete,
    Fail,
    CancelTask,
    CancelCase,
    Suspend,
    Escalate,
    Compensate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub priority: i64,
    pub kinds: Vec<ExceptionKind>,
    pub task_filter: Option<NodeId>,
    pub action: Action,
    pub max_retries: Option<u32>,
    /// Opaque reference to a worklet the collaborator should run when
    /// `action == Compensate`; the engine never executes it itself.
    pub worklet: Option<WorkletId>,
}

impl Rule {
    /// Handler/action schema mismatch guard (§4.5.2): a rule whose action
    /// carries a precondition on its own fields but doesn't declare the
    /// field is rejected at registration rather than silently misbehaving
    /// the first time it matches.
    fn validate(&self) -> Result<(), String> {
        match self.action {
            Action::Retry if self.max_retries.is_none() => {
                Err(format!("rule {:?}: action Retry requires max_retries", self.id))
            }
            Action::Compensate if self.worklet.is_none() => {
                Err(format!("rule {:?}: action Compensate requires a worklet", self.id))
            }
            _ => Ok(()),
        }
    }

    fn matches(&self, event: &ExceptionEvent) -> bool {
        if !self.kinds.contains(&event.kind) {
            return false;
        }
        match (&self.task_filter, &event.task_id) {
            (Some(filter), Some(task_id)) => filter == task_id,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

/// Per-work-item attempt counter, consulted against a rule's `max_retries`.
#[derive(Debug, Default)]
struct RetryContext {
    attempts: u32,
}

/// One entry in the compensation stack: a task that completed successfully
/// and can be undone, in push order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationEntry {
    pub task_id: NodeId,
    pub work_item_id: WorkItemId,
}

/// LIFO record of completed tasks, consulted to undo work in reverse order
/// on compensation (§4.10).
#[derive(Debug, Default)]
pub struct CompensationStack {
    entries: Vec<CompensationEntry>,
}

impl CompensationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: CompensationEntry) {
        self.entries.push(entry);
    }

    /// Pops and returns every entry in reverse (most-recent-first) order.
    pub fn compensate_all(&mut self) -> Vec<CompensationEntry> {
        let mut popped: Vec<CompensationEntry> = std::mem::take(&mut self.entries);
        popped.reverse();
        popped
    }

    /// Pops entries until (but not including) the first one whose task id
    /// matches `task_id`, returned in pop order.
    pub fn compensate_to(&mut self, task_id: &str) -> Vec<CompensationEntry> {
        let mut popped = Vec::new();
        while let Some(top) = self.entries.last() {
            if top.task_id == task_id {
                break;
            }
            popped.push(self.entries.pop().unwrap());
        }
        popped
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Priority-ordered rule base (C10). One instance is shared across all
/// cases; retry contexts are keyed by work-item id so each running task
/// instance tracks its own attempt count.
pub struct ExceptionService {
    rules: Vec<Rule>,
    retry_contexts: HashMap<WorkItemId, RetryContext>,
    /// Fall-through action once a matching rule's `max_retries` is
    /// exceeded (§4.10: "default: fail").
    fallthrough: Action,
}

impl ExceptionService {
    pub fn new() -> Self {
        Self { rules: Vec::new(), retry_contexts: HashMap::new(), fallthrough: Action::Fail }
    }

    /// Registers `rule`, keeping the rule base sorted priority-descending,
    /// id-ascending on ties (the same tiebreak the hook registry uses).
    /// Rejects a rule whose action/field combination is incomplete (§4.5.2).
    pub fn add_rule(&mut self, rule: Rule) -> Result<(), String> {
        rule.validate()?;
        self.rules.push(rule);
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(())
    }

    pub fn remove_rule(&mut self, id: &str) {
        self.rules.retain(|r| r.id != id);
    }

    /// Selects the first matching enabled rule for `event` and resolves the
    /// action to apply, bumping the work item's retry counter when the
    /// matched action is `Retry`. Returns the fall-through action once
    /// `max_retries` is exceeded.
    pub fn resolve(&mut self, event: &ExceptionEvent) -> Action {
        let Some(rule) = self.rules.iter().find(|r| r.matches(event)).cloned() else {
            return self.fallthrough;
        };

        if rule.action != Action::Retry {
            return rule.action;
        }

        let Some(work_item_id) = event.work_item_id else {
            return rule.action;
        };
        let ctx = self.retry_contexts.entry(work_item_id).or_default();
        ctx.attempts += 1;
        match rule.max_retries {
            Some(max) if ctx.attempts > max => self.fallthrough,
            _ => Action::Retry,
        }
    }

    pub fn retry_count(&self, work_item_id: WorkItemId) -> u32 {
        self.retry_contexts.get(&work_item_id).map(|c| c.attempts).unwrap_or(0)
    }
}

impl Default for ExceptionService {
    fn default() -> Self {
        Self::new()
    }
}
