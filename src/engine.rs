//! Engine façade (C11): the single entry point a host embeds, grounded in
//! the reference crate's `engine::y_engine::YEngine` — a `DashMap`-keyed
//! specification/case registry wrapped by `Arc`-shared collaborators — but
//! reworked so every state-changing case or work-item operation is mediated
//! by the hook pipeline and seals a receipt (§4.11), instead of mutating the
//! registry directly.

use crate::case::{Case, CaseStatus};
use crate::delta::{Delta, Triple};
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventBus};
use crate::exception::{Action, ExceptionEvent, ExceptionService, Rule};
use crate::hooks::{Hook, HookRegistry, TxContext};
use crate::ids::{CaseId, SpecId, WorkItemId};
use crate::net::Net;
use crate::receipts::{Receipt, ReceiptChain, ReceiptLog};
use crate::storage::StorageCollaborator;
use crate::timer::{Deadline, ExpiryEvent, Timer, TimerService};
use crate::work_item::WorkItem;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::RwLock as AsyncRwLock;

/// Specification lifecycle (§3): *loaded → activated → (unloaded|locked
/// while any case references it)*. `Locked` is not a stored state; it is
/// the rejection reason `unload_specification` reports while cases remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecificationStatus {
    Loaded,
    Activated,
    Unloaded,
}

pub struct Specification {
    pub spec_id: SpecId,
    pub root_net_id: String,
    pub nets: HashMap<String, Arc<Net>>,
    pub status: SpecificationStatus,
}

fn case_iri(id: CaseId) -> String {
    format!("urn:case:{id}")
}

fn work_item_iri(id: WorkItemId) -> String {
    format!("urn:workitem:{id}")
}

fn status_delta(subject: String, status: &str) -> Delta {
    Delta::new(vec![Triple(subject, "status".into(), status.into())], vec![])
}

/// Turns a JSON object's fields into addition triples against `subject`.
/// Non-object bindings (including `Null`, the common "no data" case)
/// produce an empty delta rather than an error.
fn binding_delta(subject: String, bindings: &Value) -> Delta {
    match bindings {
        Value::Object(map) => Delta::new(
            map.iter().map(|(k, v)| Triple(subject.clone(), k.clone(), v.to_string())).collect(),
            Vec::new(),
        ),
        _ => Delta::default(),
    }
}

/// Owns the specification registry, the live case table, and every
/// collaborator the core depends on. Methods take `&self`: cases serialize
/// on their own `DashMap` entry (§5's per-case lock), independent cases run
/// concurrently.
pub struct Engine {
    config: crate::config::Config,
    specs: DashMap<SpecId, Specification>,
    cases: DashMap<CaseId, Case>,
    hooks: HookRegistry,
    receipts: ReceiptChain,
    receipt_log: Arc<dyn ReceiptLog>,
    storage: Arc<dyn StorageCollaborator>,
    events: Arc<dyn EventBus>,
    exceptions: AsyncRwLock<ExceptionService>,
    timers: Arc<TimerService>,
    /// Receipt storage ceiling healer (§4.5.2): once `receipt_log.len()`
    /// crosses `config.max_receipts_before_rotation`, new tips are refused
    /// until the host archives past receipts and calls
    /// `acknowledge_archive`. The flag is consumed by the next transaction
    /// past the ceiling, so the host must re-acknowledge each time it is
    /// crossed again.
    archive_acknowledged: AtomicBool,
}

impl Engine {
    pub fn new(
        config: crate::config::Config,
        storage: Arc<dyn StorageCollaborator>,
        receipt_log: Arc<dyn ReceiptLog>,
        events: Arc<dyn EventBus>,
    ) -> Self {
        let hook_timeout = Duration::from_millis(config.hook_timeout_ms);
        let timer_poll = Duration::from_millis(config.timer_poll_interval_ms);
        Self {
            specs: DashMap::new(),
            cases: DashMap::new(),
            hooks: HookRegistry::new(hook_timeout),
            receipts: ReceiptChain::new(),
            receipt_log,
            storage,
            events,
            exceptions: AsyncRwLock::new(ExceptionService::new()),
            timers: Arc::new(TimerService::new(timer_poll)),
            archive_acknowledged: AtomicBool::new(false),
            config,
        }
    }

    /// The host calls this after archiving receipts past the storage
    /// ceiling (§4.5.2). The acknowledgment is one-shot: it is consumed the
    /// next time the ceiling is crossed, so a host that ignores rotation
    /// entirely will be asked again on every subsequent crossing.
    pub fn acknowledge_archive(&self) {
        self.archive_acknowledged.store(true, Ordering::SeqCst);
    }

    /// Runs `apply` as the state mutation of one hook-mediated transaction
    /// over `delta`, seals and persists the resulting receipt, and
    /// best-effort mirrors a committed delta to the storage collaborator
    /// (§4.5, §6: "the engine must tolerate apply failing"). The oversized
    /// ingress guard (§4.5.1) rejects before any hook runs.
    async fn mediate<F>(&self, actor: String, delta: Delta, apply: F) -> EngineResult<Receipt>
    where
        F: FnOnce() -> EngineResult<()>,
    {
        if delta.len() > self.config.max_delta_size {
            return Err(EngineError::ValidationFailure(format!(
                "delta of {} operations exceeds max_delta_size {}",
                delta.len(),
                self.config.max_delta_size
            )));
        }
        if self.receipt_log.len().await as u64 >= self.config.max_receipts_before_rotation
            && !self.archive_acknowledged.swap(false, Ordering::SeqCst)
        {
            return Err(EngineError::StorageFailure(
                "receipt storage ceiling reached; archive past receipts and call acknowledge_archive before new tips are accepted".into(),
            ));
        }
        let tx_id = crate::ids::TxId::new();
        let prev_hash = self.receipts.tip();
        let logic_hash = self.hooks.logic_hash().await;
        let ctx = TxContext { tx_id, actor, prev_hash, timestamp: Utc::now(), delta: delta.clone() };

        let start = Instant::now();
        let outcome = self.hooks.run_transaction(ctx, apply).await;
        let duration_ns = start.elapsed().as_nanos();

        let receipt = self.receipts.seal(tx_id, logic_hash, &delta, &outcome, duration_ns);
        self.receipt_log.append(receipt.clone()).await;
        if receipt.committed {
            if let Err(err) = self.storage.apply(&delta).await {
                tracing::warn!(%tx_id, %err, "storage mirror apply failed after commit");
            }
        }
        Ok(receipt)
    }

    // ---- specification registry (bookkeeping; not hook-mediated, no receipt) ----

    pub async fn load_specification(
        &self,
        spec_id: SpecId,
        root_net_id: impl Into<String>,
        nets: HashMap<String, Arc<Net>>,
    ) -> EngineResult<()> {
        let root_net_id = root_net_id.into();
        if !nets.contains_key(&root_net_id) {
            return Err(EngineError::ValidationFailure("root net id not present among nets".into()));
        }
        for net in nets.values() {
            net.validate()?;
        }
        self.specs.insert(
            spec_id.clone(),
            Specification { spec_id: spec_id.clone(), root_net_id, nets, status: SpecificationStatus::Loaded },
        );
        self.events.emit(Event::SpecificationLoaded(spec_id));
        Ok(())
    }

    pub async fn activate_specification(&self, spec_id: &SpecId) -> EngineResult<()> {
        let mut spec = self.specs.get_mut(spec_id).ok_or_else(|| EngineError::Unknown(spec_id.to_string()))?;
        if spec.status != SpecificationStatus::Loaded {
            return Err(EngineError::InvalidStateTransition {
                from: format!("{:?}", spec.status),
                to: "Activated".into(),
            });
        }
        spec.status = SpecificationStatus::Activated;
        Ok(())
    }

    /// Rejected while any non-terminal case still references the
    /// specification (§3: "Unload is rejected while any case references
    /// it").
    pub async fn unload_specification(&self, spec_id: &SpecId) -> EngineResult<()> {
        let referenced = self.cases.iter().any(|entry| {
            entry.spec_id == *spec_id
                && !matches!(entry.status, CaseStatus::Completed | CaseStatus::Cancelled | CaseStatus::Failed)
        });
        if referenced {
            return Err(EngineError::InvalidOperation(
                "specification is locked while cases reference it".into(),
            ));
        }
        let mut spec = self.specs.get_mut(spec_id).ok_or_else(|| EngineError::Unknown(spec_id.to_string()))?;
        spec.status = SpecificationStatus::Unloaded;
        drop(spec);
        self.events.emit(Event::SpecificationUnloaded(spec_id.clone()));
        Ok(())
    }

    pub fn specification_status(&self, spec_id: &SpecId) -> Option<SpecificationStatus> {
        self.specs.get(spec_id).map(|s| s.status)
    }

    // ---- case lifecycle ----

    /// Requires the specification to be *activated* (§4.8). Case creation
    /// itself is registry bookkeeping, not a hook-mediated transaction: no
    /// receipt is produced until the case actually starts.
    pub async fn create_case(&self, spec_id: &SpecId, initial_data: Option<Value>) -> EngineResult<CaseId> {
        let spec = self.specs.get(spec_id).ok_or_else(|| EngineError::Unknown(spec_id.to_string()))?;
        if spec.status != SpecificationStatus::Activated {
            return Err(EngineError::InvalidOperation("specification must be activated to create a case".into()));
        }
        let mut case = Case::new(spec.spec_id.clone(), spec.root_net_id.clone(), spec.nets.clone());
        if let Some(data) = initial_data {
            case.data = data;
        }
        let case_id = case.id;
        drop(spec);
        self.cases.insert(case_id, case);
        Ok(case_id)
    }

    pub async fn start_case(&self, case_id: CaseId) -> EngineResult<Receipt> {
        {
            let case = self.cases.get(&case_id).ok_or_else(|| EngineError::Unknown(case_id.to_string()))?;
            if case.status != CaseStatus::Created {
                return Err(EngineError::InvalidStateTransition {
                    from: format!("{:?}", case.status),
                    to: "Running".into(),
                });
            }
        }
        let delta = status_delta(case_iri(case_id), "RUNNING");
        let mut created: Vec<WorkItemId> = Vec::new();
        let receipt = self
            .mediate(case_id.to_string(), delta, || {
                let mut case = self.cases.get_mut(&case_id).ok_or_else(|| EngineError::Unknown(case_id.to_string()))?;
                created = case.start()?;
                Ok(())
            })
            .await?;
        if receipt.committed {
            self.events.emit(Event::CaseStarted(case_id));
            for id in created {
                self.events.emit(Event::WorkItemEnabled(case_id, id));
            }
        }
        Ok(receipt)
    }

    /// Every non-terminal work item transitions to cancelled, the marking
    /// is cleared. Cancelling an already-terminal case is an error, not a
    /// rejected transaction (§4.8).
    pub async fn cancel_case(&self, case_id: CaseId) -> EngineResult<Receipt> {
        {
            let case = self.cases.get(&case_id).ok_or_else(|| EngineError::Unknown(case_id.to_string()))?;
            if matches!(case.status, CaseStatus::Completed | CaseStatus::Cancelled | CaseStatus::Failed) {
                return Err(EngineError::InvalidOperation("cannot cancel a terminal case".into()));
            }
        }
        let delta = status_delta(case_iri(case_id), "CANCELLED");
        let receipt = self
            .mediate(case_id.to_string(), delta, || {
                let mut case = self.cases.get_mut(&case_id).ok_or_else(|| EngineError::Unknown(case_id.to_string()))?;
                case.cancel()
            })
            .await?;
        if receipt.committed {
            self.events.emit(Event::CaseCancelled(case_id));
        }
        Ok(receipt)
    }

    /// While suspended, no firing occurs even if tasks become enabled by
    /// out-of-band data updates (§4.8); the engine rejects work-item
    /// transitions on a suspended case rather than silently queuing them.
    pub async fn suspend_case(&self, case_id: CaseId) -> EngineResult<Receipt> {
        let delta = status_delta(case_iri(case_id), "SUSPENDED");
        let receipt = self
            .mediate(case_id.to_string(), delta, || {
                let mut case = self.cases.get_mut(&case_id).ok_or_else(|| EngineError::Unknown(case_id.to_string()))?;
                case.suspend()
            })
            .await?;
        if receipt.committed {
            self.timers.mark_suspended(case_id).await;
        }
        Ok(receipt)
    }

    /// Resuming flushes any expiry events the timer service buffered while
    /// the case was suspended (§9: "queue until resume") before the case
    /// accepts further work-item transitions.
    pub async fn resume_case(&self, case_id: CaseId) -> EngineResult<Receipt> {
        let delta = status_delta(case_iri(case_id), "RUNNING");
        let receipt = self
            .mediate(case_id.to_string(), delta, || {
                let mut case = self.cases.get_mut(&case_id).ok_or_else(|| EngineError::Unknown(case_id.to_string()))?;
                case.resume()
            })
            .await?;
        if receipt.committed {
            self.timers.mark_resumed(case_id).await;
        }
        Ok(receipt)
    }

    fn require_running(&self, case_id: CaseId) -> EngineResult<()> {
        let case = self.cases.get(&case_id).ok_or_else(|| EngineError::Unknown(case_id.to_string()))?;
        if case.status != CaseStatus::Running {
            return Err(EngineError::InvalidOperation(format!(
                "case {case_id} is not running (status {:?})",
                case.status
            )));
        }
        Ok(())
    }

    // ---- work-item lifecycle ----

    pub async fn fire_work_item(&self, case_id: CaseId, work_item_id: WorkItemId, input_bindings: Value) -> EngineResult<Receipt> {
        self.require_running(case_id)?;
        let delta = binding_delta(work_item_iri(work_item_id), &input_bindings);
        self.mediate(case_id.to_string(), delta, || {
            let mut case = self.cases.get_mut(&case_id).ok_or_else(|| EngineError::Unknown(case_id.to_string()))?;
            case.fire_work_item(work_item_id, input_bindings.clone())
        })
        .await
    }

    pub async fn start_work_item(&self, case_id: CaseId, work_item_id: WorkItemId) -> EngineResult<Receipt> {
        self.require_running(case_id)?;
        let delta = status_delta(work_item_iri(work_item_id), "EXECUTING");
        let receipt = self
            .mediate(case_id.to_string(), delta, || {
                let mut case = self.cases.get_mut(&case_id).ok_or_else(|| EngineError::Unknown(case_id.to_string()))?;
                case.start_work_item(work_item_id)
            })
            .await?;
        if receipt.committed {
            self.events.emit(Event::WorkItemStarted(case_id, work_item_id));
        }
        Ok(receipt)
    }

    /// Binds output data, asks the net runner to fire the underlying task
    /// (possibly aggregating multi-instance children first), and discovers
    /// newly enabled work (§4.7). Returns one receipt for the completion
    /// itself, plus a second if this completion satisfies the case
    /// completion policy (§4.8) — matching the distinct "fire-X" and
    /// "case-complete" receipts counted in end-to-end scenarios.
    pub async fn complete_work_item(
        &self,
        case_id: CaseId,
        work_item_id: WorkItemId,
        output_bindings: Value,
    ) -> EngineResult<Vec<Receipt>> {
        self.require_running(case_id)?;
        let was_completed_before = {
            let case = self.cases.get(&case_id).ok_or_else(|| EngineError::Unknown(case_id.to_string()))?;
            case.is_completed()
        };

        let delta = binding_delta(work_item_iri(work_item_id), &output_bindings);
        let mut created: Vec<WorkItemId> = Vec::new();
        let receipt = self
            .mediate(case_id.to_string(), delta, || {
                let mut case = self.cases.get_mut(&case_id).ok_or_else(|| EngineError::Unknown(case_id.to_string()))?;
                created = case.complete_work_item(work_item_id, output_bindings.clone())?;
                Ok(())
            })
            .await?;

        let mut receipts = vec![receipt];
        if !receipts[0].committed {
            return Ok(receipts);
        }

        self.events.emit(Event::WorkItemCompleted(case_id, work_item_id));
        for id in created {
            self.events.emit(Event::WorkItemEnabled(case_id, id));
        }

        let now_completed = {
            let case = self.cases.get(&case_id).ok_or_else(|| EngineError::Unknown(case_id.to_string()))?;
            case.is_completed()
        };
        if !was_completed_before && now_completed {
            let delta = status_delta(case_iri(case_id), "COMPLETED");
            let complete_receipt = self.mediate(case_id.to_string(), delta, || Ok(())).await?;
            if complete_receipt.committed {
                self.events.emit(Event::CaseCompleted(case_id));
            }
            receipts.push(complete_receipt);
        }
        Ok(receipts)
    }

    pub async fn fail_work_item(&self, case_id: CaseId, work_item_id: WorkItemId) -> EngineResult<Receipt> {
        let delta = status_delta(work_item_iri(work_item_id), "FAILED");
        let receipt = self
            .mediate(case_id.to_string(), delta, || {
                let mut case = self.cases.get_mut(&case_id).ok_or_else(|| EngineError::Unknown(case_id.to_string()))?;
                case.fail_work_item(work_item_id)
            })
            .await?;
        if receipt.committed {
            self.events.emit(Event::WorkItemFailed(case_id, work_item_id));
        }
        Ok(receipt)
    }

    pub async fn suspend_work_item(&self, case_id: CaseId, work_item_id: WorkItemId) -> EngineResult<Receipt> {
        let delta = status_delta(work_item_iri(work_item_id), "SUSPENDED");
        self.mediate(case_id.to_string(), delta, || {
            let mut case = self.cases.get_mut(&case_id).ok_or_else(|| EngineError::Unknown(case_id.to_string()))?;
            case.suspend_work_item(work_item_id)
        })
        .await
    }

    pub async fn resume_work_item(&self, case_id: CaseId, work_item_id: WorkItemId) -> EngineResult<Receipt> {
        let delta = status_delta(work_item_iri(work_item_id), "EXECUTING");
        self.mediate(case_id.to_string(), delta, || {
            let mut case = self.cases.get_mut(&case_id).ok_or_else(|| EngineError::Unknown(case_id.to_string()))?;
            case.resume_work_item(work_item_id)
        })
        .await
    }

    // ---- hooks ----

    pub async fn register_hook(&self, hook: Hook) -> EngineResult<()> {
        self.hooks.register(hook).await
    }

    pub async fn unregister_hook(&self, id: &str) -> EngineResult<()> {
        self.hooks.unregister(id).await
    }

    pub async fn logic_hash(&self) -> String {
        self.hooks.logic_hash().await
    }

    // ---- timers and deadlines ----

    pub async fn register_case_timer_queue(&self, case_id: CaseId) -> mpsc::UnboundedReceiver<ExpiryEvent> {
        self.timers.register_case_queue(case_id).await
    }

    pub async fn schedule_timer(&self, timer: Timer) -> uuid::Uuid {
        self.timers.schedule_timer(timer).await
    }

    pub async fn schedule_deadline(&self, deadline: Deadline) -> uuid::Uuid {
        self.timers.schedule_deadline(deadline).await
    }

    pub async fn cancel_timer(&self, id: uuid::Uuid) {
        self.timers.cancel(id).await
    }

    /// Starts the timer service's one background poll task. The host calls
    /// this once, after constructing the engine inside an async runtime.
    pub fn spawn_timer_poll_loop(&self) -> tokio::task::JoinHandle<()> {
        self.timers.spawn_poll_loop()
    }

    // ---- exceptions ----

    pub async fn add_exception_rule(&self, rule: Rule) -> EngineResult<()> {
        self.exceptions
            .write()
            .await
            .add_rule(rule)
            .map_err(EngineError::ValidationFailure)
    }

    pub async fn remove_exception_rule(&self, id: &str) {
        self.exceptions.write().await.remove_rule(id);
    }

    pub async fn resolve_exception(&self, event: &ExceptionEvent) -> Action {
        self.exceptions.write().await.resolve(event)
    }

    // ---- read-only queries (never advance the tip) ----

    pub fn case_status(&self, case_id: CaseId) -> Option<CaseStatus> {
        self.cases.get(&case_id).map(|c| c.status)
    }

    pub fn case_work_items(&self, case_id: CaseId) -> Vec<WorkItem> {
        self.cases.get(&case_id).map(|c| c.work_items().cloned().collect()).unwrap_or_default()
    }

    pub fn root_marking_snapshot(&self, case_id: CaseId) -> HashMap<String, Vec<crate::ids::TokenId>> {
        self.cases.get(&case_id).map(|c| c.root_snapshot()).unwrap_or_default()
    }

    pub fn tip(&self) -> String {
        self.receipts.tip()
    }

    pub async fn receipt(&self, tx_id: crate::ids::TxId) -> Option<Receipt> {
        self.receipt_log.get(tx_id).await
    }
}
