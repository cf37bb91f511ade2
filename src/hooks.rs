//! Hook registry and pipeline (C5): deterministic ordered PRE/POST hooks
//! guarding and observing every state-changing transaction, grounded in the
//! reference crate's `hooks::registry` but reworked around a generic
//! per-delta transaction instead of a fixed set of lifecycle event types,
//! with higher-priority-first ordering and an id-ascending tiebreak (§4.5).

use crate::delta::Delta;
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookMode {
    Pre,
    Post,
}

/// Transaction context a hook handler observes. Handlers must not acquire
/// engine locks; they communicate only through this struct (§5).
#[derive(Debug, Clone)]
pub struct TxContext {
    pub tx_id: crate::ids::TxId,
    pub actor: String,
    pub prev_hash: String,
    pub timestamp: DateTime<Utc>,
    pub delta: Delta,
}

pub type HookHandler = Arc<
    dyn Fn(TxContext) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync,
>;

#[derive(Clone)]
pub struct Hook {
    pub id: String,
    pub mode: HookMode,
    pub priority: i64,
    pub handler: HookHandler,
}

impl Hook {
    /// `"{id}:{mode}:{priority}"` — the signature the receipt chain's logic
    /// hash is built from.
    pub fn signature(&self) -> String {
        let mode = match self.mode {
            HookMode::Pre => "PRE",
            HookMode::Post => "POST",
        };
        format!("{}:{}:{}", self.id, mode, self.priority)
    }
}

#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub hook_id: String,
    pub mode: HookMode,
    pub success: bool,
    pub duration_ns: u128,
}

pub struct PipelineOutcome {
    pub committed: bool,
    pub aborting_hook: Option<String>,
    pub hook_results: Vec<HookOutcome>,
}

/// Registration is idempotent by id; the ordered list is recomputed on
/// every register/unregister so execution order is a total deterministic
/// function of the current registry (§4.5).
pub struct HookRegistry {
    hooks: RwLock<HashMap<String, Hook>>,
    hook_timeout: Duration,
    /// Hook ids currently executing, guarding against the "circular hook
    /// chain" failure class (§4.5.2): a handler that re-enters the pipeline
    /// and ends up invoking its own hook id again is blocked rather than
    /// deadlocking or recursing.
    in_flight: RwLock<HashSet<String>>,
}

impl HookRegistry {
    pub fn new(hook_timeout: Duration) -> Self {
        Self { hooks: RwLock::new(HashMap::new()), hook_timeout, in_flight: RwLock::new(HashSet::new()) }
    }

    pub async fn register(&self, hook: Hook) -> EngineResult<()> {
        if hook.id.is_empty() {
            return Err(EngineError::ValidationFailure("hook id cannot be empty".into()));
        }
        self.hooks.write().await.insert(hook.id.clone(), hook);
        Ok(())
    }

    pub async fn unregister(&self, id: &str) -> EngineResult<()> {
        self.hooks
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| EngineError::Unknown(id.to_string()))
    }

    /// Priority higher-first, id ascending breaks ties (§4.5's stated
    /// tiebreak, deliberately different from the reference crate's
    /// lower-first unstable ordering).
    async fn ordered(&self, mode: HookMode) -> Vec<Hook> {
        let hooks = self.hooks.read().await;
        let mut list: Vec<Hook> = hooks.values().filter(|h| h.mode == mode).cloned().collect();
        list.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        list
    }

    /// `H(sorted(hook signatures))` over every registered hook regardless of
    /// mode, independent of any particular delta (§5: "depends only on the
    /// hook registry at transaction start").
    pub async fn logic_hash(&self) -> String {
        let hooks = self.hooks.read().await;
        let mut sigs: Vec<String> = hooks.values().map(|h| h.signature()).collect();
        sigs.sort();
        crate::receipts::sha256_hex(sigs.join(",").as_bytes())
    }

    /// Executes the PRE -> apply -> POST contract in §4.5 for one
    /// transaction. `apply` performs the actual state mutation and is only
    /// invoked if every PRE hook returns true.
    pub async fn run_transaction<F>(&self, ctx: TxContext, apply: F) -> PipelineOutcome
    where
        F: FnOnce() -> EngineResult<()>,
    {
        let mut hook_results = Vec::new();

        for hook in self.ordered(HookMode::Pre).await {
            let start = std::time::Instant::now();
            let passed = self.run_with_timeout(&hook, ctx.clone()).await;
            let duration_ns = start.elapsed().as_nanos();
            hook_results.push(HookOutcome { hook_id: hook.id.clone(), mode: HookMode::Pre, success: passed, duration_ns });
            if !passed {
                return PipelineOutcome { committed: false, aborting_hook: Some(hook.id), hook_results };
            }
        }

        if let Err(_err) = apply() {
            return PipelineOutcome { committed: false, aborting_hook: None, hook_results };
        }

        for hook in self.ordered(HookMode::Post).await {
            let start = std::time::Instant::now();
            let success = self.run_with_timeout(&hook, ctx.clone()).await;
            let duration_ns = start.elapsed().as_nanos();
            hook_results.push(HookOutcome { hook_id: hook.id.clone(), mode: HookMode::Post, success, duration_ns });
            // POST failures are logged, never abort (§4.5 step 4).
            if !success {
                tracing::warn!(hook_id = %hook.id, "post hook failed, continuing");
            }
        }

        PipelineOutcome { committed: true, aborting_hook: None, hook_results }
    }

    async fn run_with_timeout(&self, hook: &Hook, ctx: TxContext) -> bool {
        if !self.in_flight.write().await.insert(hook.id.clone()) {
            tracing::warn!(hook_id = %hook.id, "circular hook chain detected, blocking re-entry");
            return false;
        }
        let handler = hook.handler.clone();
        let outcome = tokio::time::timeout(self.hook_timeout, handler(ctx)).await;
        self.in_flight.write().await.remove(&hook.id);
        match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(hook_id = %hook.id, "hook timed out");
                false
            }
        }
    }

    pub async fn list(&self) -> Vec<Hook> {
        self.hooks.read().await.values().cloned().collect()
    }
}
