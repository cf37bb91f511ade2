//! Timer service (C9): relative timers and absolute deadlines, grounded in
//! the reference crate's `services::timer::TimerService` but reworked
//! around a trigger-event/expiry-action vocabulary (§4.9) instead of the
//! reference's pattern-specific transient/persistent timer kinds.
//!
//! The service owns one background task that only *enqueues* expiry events
//! onto a per-case queue (§5's shared-resources rule) — it never mutates
//! engine state directly. While a case is suspended, expiry events are
//! buffered internally rather than sent to its queue; `mark_resumed` flushes
//! them in expiry order once the engine resumes the case.
//!
//! A [`Deadline`] with a `warning_lead` fires a single `is_warning: true`
//! event at `at - warning_lead`, ahead of the real expiry at `at`; a
//! [`Timer`] with a `recurrence` is rescheduled `interval` after each firing
//! instead of being dropped.

use crate::ids::{CaseId, WorkItemId};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Duration;

/// The lifecycle event a relative timer counts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerEvent {
    Enabled,
    Offered,
    Allocated,
    Started,
}

/// What the timer service does once a timer or deadline expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpiryAction {
    Notify,
    Reassign,
    Escalate,
    Complete,
    Fail,
    Cancel,
}

/// An optional recurrence rule for a one-shot/recurring timer distinction.
/// A timer carrying one is rescheduled `interval` after each firing instead
/// of being dropped (§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer {
    pub id: uuid::Uuid,
    pub case_id: CaseId,
    pub work_item_id: Option<WorkItemId>,
    pub trigger: TriggerEvent,
    pub relative: Duration,
    pub action: ExpiryAction,
    pub recurrence: Option<RecurrenceRule>,
    pub due_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deadline {
    pub id: uuid::Uuid,
    pub case_id: CaseId,
    pub work_item_id: Option<WorkItemId>,
    pub at: DateTime<Utc>,
    pub warning_lead: Option<Duration>,
    pub action: ExpiryAction,
}

#[derive(Debug, Clone)]
pub struct ExpiryEvent {
    pub case_id: CaseId,
    pub work_item_id: Option<WorkItemId>,
    pub action: ExpiryAction,
    pub is_warning: bool,
}

#[derive(Debug)]
enum Entry {
    Timer(Timer),
    Deadline(Deadline),
}

impl Entry {
    fn due_at(&self) -> DateTime<Utc> {
        match self {
            Entry::Timer(t) => t.due_at,
            Entry::Deadline(d) => d.at,
        }
    }
}

/// Polls at a configurable interval; on expiry, enqueues an [`ExpiryEvent`]
/// onto the affected case's queue rather than mutating state directly
/// (§4.9, §5).
pub struct TimerService {
    entries: Arc<RwLock<HashMap<uuid::Uuid, Entry>>>,
    queues: Arc<RwLock<HashMap<CaseId, mpsc::UnboundedSender<ExpiryEvent>>>>,
    /// Cases currently suspended (§9: "queue until resume"). Expiry events
    /// for a suspended case are buffered here instead of sent to its queue,
    /// and flushed in order when `mark_resumed` is called.
    suspended: Arc<RwLock<HashMap<CaseId, Vec<ExpiryEvent>>>>,
    /// Deadline ids whose warning event has already fired, so a deadline
    /// polled repeatedly between its warning and its expiry only warns once.
    warned: Arc<RwLock<std::collections::HashSet<uuid::Uuid>>>,
    poll_interval: Duration,
}

impl TimerService {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            queues: Arc::new(RwLock::new(HashMap::new())),
            suspended: Arc::new(RwLock::new(HashMap::new())),
            warned: Arc::new(RwLock::new(std::collections::HashSet::new())),
            poll_interval,
        }
    }

    /// Registers the queue the engine will drain for `case_id`'s expiry
    /// events. Must be called before any timer for that case can be
    /// observed.
    pub async fn register_case_queue(&self, case_id: CaseId) -> mpsc::UnboundedReceiver<ExpiryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.queues.write().await.insert(case_id, tx);
        rx
    }

    pub async fn unregister_case(&self, case_id: CaseId) {
        self.queues.write().await.remove(&case_id);
        self.suspended.write().await.remove(&case_id);
        let mut warned = self.warned.write().await;
        self.entries.write().await.retain(|id, e| {
            let belongs = match e {
                Entry::Timer(t) => t.case_id == case_id,
                Entry::Deadline(d) => d.case_id == case_id,
            };
            if belongs {
                warned.remove(id);
            }
            !belongs
        });
    }

    /// Called by the engine on `suspend_case`: expiry events observed while
    /// `case_id` is suspended are buffered rather than dispatched (§9).
    pub async fn mark_suspended(&self, case_id: CaseId) {
        self.suspended.write().await.entry(case_id).or_default();
    }

    /// Called by the engine on `resume_case`: flushes any expiry events
    /// buffered while `case_id` was suspended, in the order they expired,
    /// then resumes dispatching new ones immediately.
    pub async fn mark_resumed(&self, case_id: CaseId) {
        let buffered = self.suspended.write().await.remove(&case_id);
        let Some(buffered) = buffered else { return };
        let queues = self.queues.read().await;
        if let Some(tx) = queues.get(&case_id) {
            for event in buffered {
                let _ = tx.send(event);
            }
        }
    }

    pub async fn schedule_timer(&self, mut timer: Timer) -> uuid::Uuid {
        timer.due_at = Utc::now() + ChronoDuration::from_std(timer.relative).unwrap_or_default();
        let id = timer.id;
        self.entries.write().await.insert(id, Entry::Timer(timer));
        id
    }

    pub async fn schedule_deadline(&self, deadline: Deadline) -> uuid::Uuid {
        let id = deadline.id;
        self.entries.write().await.insert(id, Entry::Deadline(deadline));
        id
    }

    pub async fn cancel(&self, id: uuid::Uuid) {
        self.entries.write().await.remove(&id);
        self.warned.write().await.remove(&id);
    }

    /// Runs the poll loop until the returned handle is dropped or aborted.
    /// Owns the one background task §5 grants the timer service.
    pub fn spawn_poll_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.poll_interval);
            loop {
                ticker.tick().await;
                service.poll_once().await;
            }
        })
    }

    /// One poll pass: emits warning events for deadlines entering their
    /// warning window, then fires every due entry's expiry event onto its
    /// case's queue — rescheduling a recurring [`Timer`] instead of dropping
    /// it, and dropping everything else once fired.
    pub async fn poll_once(&self) {
        let now = Utc::now();

        let due_ids: Vec<uuid::Uuid> = {
            let entries = self.entries.read().await;
            entries.iter().filter(|(_, e)| e.due_at() <= now).map(|(id, _)| *id).collect()
        };

        let pending_warnings: Vec<(uuid::Uuid, CaseId, Option<WorkItemId>, ExpiryAction)> = {
            let entries = self.entries.read().await;
            let warned = self.warned.read().await;
            entries
                .iter()
                .filter_map(|(id, e)| match e {
                    Entry::Deadline(d) => d.warning_lead.map(|lead| (*id, d.at, lead, d.case_id, d.work_item_id, d.action)),
                    Entry::Timer(_) => None,
                })
                .filter(|(id, at, lead, _, _, _)| {
                    !warned.contains(id) && *at > now && now >= *at - ChronoDuration::from_std(*lead).unwrap_or_default()
                })
                .map(|(id, _, _, case_id, work_item_id, action)| (id, case_id, work_item_id, action))
                .collect()
        };

        let queues = self.queues.read().await;
        let mut entries = self.entries.write().await;
        let mut suspended = self.suspended.write().await;

        if !pending_warnings.is_empty() {
            let mut warned = self.warned.write().await;
            for (id, case_id, work_item_id, action) in pending_warnings {
                warned.insert(id);
                let event = ExpiryEvent { case_id, work_item_id, action, is_warning: true };
                if let Some(buffer) = suspended.get_mut(&case_id) {
                    buffer.push(event);
                } else if let Some(tx) = queues.get(&case_id) {
                    let _ = tx.send(event);
                }
            }
        }

        for id in due_ids {
            let Some(entry) = entries.remove(&id) else { continue };
            let (case_id, work_item_id, action) = match &entry {
                Entry::Timer(t) => (t.case_id, t.work_item_id, t.action),
                Entry::Deadline(d) => (d.case_id, d.work_item_id, d.action),
            };
            let event = ExpiryEvent { case_id, work_item_id, action, is_warning: false };
            if let Some(buffer) = suspended.get_mut(&case_id) {
                buffer.push(event);
            } else if let Some(tx) = queues.get(&case_id) {
                let _ = tx.send(event);
            }

            if let Entry::Timer(mut t) = entry {
                if let Some(rule) = &t.recurrence {
                    t.due_at += ChronoDuration::from_std(rule.interval).unwrap_or_default();
                    entries.insert(id, Entry::Timer(t));
                }
            }
        }

        let mut warned = self.warned.write().await;
        warned.retain(|id| entries.contains_key(id));
    }
}
