//! Event bus collaborator (§6): write-only, loss-tolerant. Event delivery is
//! best-effort and never affects commit order (§4.11) — the engine never
//! awaits a listener finishing its own work, only the bounded send.

use crate::ids::{CaseId, SpecId, WorkItemId};
use async_trait::async_trait;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum Event {
    SpecificationLoaded(SpecId),
    SpecificationUnloaded(SpecId),
    CaseStarted(CaseId),
    CaseCompleted(CaseId),
    CaseCancelled(CaseId),
    WorkItemEnabled(CaseId, WorkItemId),
    WorkItemStarted(CaseId, WorkItemId),
    WorkItemCompleted(CaseId, WorkItemId),
    WorkItemFailed(CaseId, WorkItemId),
}

/// Write-only listener interface. Back-pressure must not block case
/// operations, so implementations should never let `emit` block on a slow
/// subscriber (the broadcast-channel default drops the oldest event).
#[async_trait]
pub trait EventBus: Send + Sync {
    fn emit(&self, event: Event);
}

/// Reference bus backed by a bounded `tokio::broadcast` channel. A full
/// channel drops the oldest unread event rather than applying back-pressure
/// to the caller, matching the "loss-tolerant" contract.
pub struct BroadcastEventBus {
    tx: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for BroadcastEventBus {
    fn emit(&self, event: Event) {
        // No subscribers is a normal, not an error, state.
        let _ = self.tx.send(event);
    }
}
