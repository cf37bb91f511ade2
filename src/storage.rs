//! External collaborator interfaces (§6): the core treats persistence, the
//! event bus, and the binding evaluator as narrow traits it calls through,
//! never as concrete implementations it owns. Grounded in the reference
//! crate's pattern of trait-bounded `Timebase`/`StateStore` collaborators
//! (see `services/timer.rs`), generalized to this crate's triple-store
//! shaped storage boundary.

use crate::delta::{Delta, Triple};
use crate::error::EngineResult;
use async_trait::async_trait;
use std::collections::HashSet;
use tokio::sync::RwLock;

/// Delta match explosion guard (§4.5.2): a query whose observed match set
/// exceeds this bound is truncated rather than returned in full, so a
/// pathological pattern cannot make a PRE-hook pass run unbounded work.
pub const MAX_QUERY_MATCHES: usize = 4096;

/// A binding pattern over a triple's three positions; `None` matches any
/// value in that position.
#[derive(Debug, Clone, Default)]
pub struct Pattern {
    pub subject: Option<String>,
    pub predicate: Option<String>,
    pub object: Option<String>,
}

impl Pattern {
    fn matches(&self, triple: &Triple) -> bool {
        self.subject.as_deref().map(|s| s == triple.0).unwrap_or(true)
            && self.predicate.as_deref().map(|p| p == triple.1).unwrap_or(true)
            && self.object.as_deref().map(|o| o == triple.2).unwrap_or(true)
    }
}

/// Opaque handle returned by `snapshot`, accepted by `restore`. The core
/// never inspects its contents; it is a pass-through correlation token for
/// whatever durability strategy the collaborator uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle(pub String);

/// Abstract KV/triple store (§6). The engine must tolerate `apply` failing:
/// a failure becomes a PRE-hook-abort equivalent with the failing
/// operation's id recorded as the error (§7, *StorageFailure*).
#[async_trait]
pub trait StorageCollaborator: Send + Sync {
    async fn apply(&self, delta: &Delta) -> EngineResult<()>;
    async fn query(&self, pattern: &Pattern) -> Vec<Triple>;
    async fn ask(&self, pattern: &Pattern) -> bool;
    async fn snapshot(&self) -> SnapshotHandle;
    async fn restore(&self, handle: &SnapshotHandle) -> EngineResult<()>;
}

/// Reference in-memory triple store used by tests and as a default
/// collaborator for hosts that have not wired a real one yet.
#[derive(Default)]
pub struct InMemoryStore {
    triples: RwLock<HashSet<Triple>>,
    snapshots: RwLock<std::collections::HashMap<String, HashSet<Triple>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageCollaborator for InMemoryStore {
    async fn apply(&self, delta: &Delta) -> EngineResult<()> {
        let mut triples = self.triples.write().await;
        for t in &delta.removals {
            triples.remove(t);
        }
        for t in &delta.additions {
            triples.insert(t.clone());
        }
        Ok(())
    }

    async fn query(&self, pattern: &Pattern) -> Vec<Triple> {
        let matches: Vec<Triple> = self.triples.read().await.iter().filter(|t| pattern.matches(t)).cloned().collect();
        if matches.len() > MAX_QUERY_MATCHES {
            tracing::warn!(
                matches = matches.len(),
                bound = MAX_QUERY_MATCHES,
                "delta match explosion guard truncated query result"
            );
            matches.into_iter().take(MAX_QUERY_MATCHES).collect()
        } else {
            matches
        }
    }

    async fn ask(&self, pattern: &Pattern) -> bool {
        self.triples.read().await.iter().any(|t| pattern.matches(t))
    }

    async fn snapshot(&self) -> SnapshotHandle {
        let id = uuid::Uuid::new_v4().to_string();
        self.snapshots.write().await.insert(id.clone(), self.triples.read().await.clone());
        SnapshotHandle(id)
    }

    async fn restore(&self, handle: &SnapshotHandle) -> EngineResult<()> {
        let snapshots = self.snapshots.read().await;
        let Some(saved) = snapshots.get(&handle.0) else {
            return Err(crate::error::EngineError::StorageFailure(format!(
                "unknown snapshot handle {}",
                handle.0
            )));
        };
        *self.triples.write().await = saved.clone();
        Ok(())
    }
}
