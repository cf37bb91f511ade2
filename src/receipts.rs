//! Receipt chain (C6): a rolling hash linking every committed transaction to
//! the previous tip, certifying state × logic × history (§4.6), grounded in
//! the reference crate's `receipts::receipt_generator`/`receipt_store` pair
//! but reworked around a single linear chain instead of a per-sigma log.

use crate::delta::Delta;
use crate::hooks::{HookOutcome, PipelineOutcome};
use crate::ids::TxId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// `SHA256("KNHK")`, the fixed seed hash at the root of every chain.
pub fn genesis_hash() -> String {
    sha256_hex(b"KNHK")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `H(prev ‖ delta_bytes)`.
fn merkle_root(prev: &str, delta_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev.as_bytes());
    hasher.update(delta_bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResultRecord {
    pub hook_id: String,
    pub mode: String,
    pub success: bool,
    pub duration_ns: u128,
}

impl From<&HookOutcome> for HookResultRecord {
    fn from(o: &HookOutcome) -> Self {
        let mode = match o.mode {
            crate::hooks::HookMode::Pre => "PRE",
            crate::hooks::HookMode::Post => "POST",
        };
        Self { hook_id: o.hook_id.clone(), mode: mode.to_string(), success: o.success, duration_ns: o.duration_ns }
    }
}

/// Immutable record of one transaction (§3 "Transaction receipt", §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_id: TxId,
    pub committed: bool,
    pub merkle_root: String,
    pub logic_hash: String,
    pub hook_results: Vec<HookResultRecord>,
    pub duration_ns: u128,
    pub error: Option<String>,
}

/// Append-only sink of receipt records (§6's receipt log collaborator).
/// `get`/`range` serve audit queries; retention policy is the
/// collaborator's responsibility, not the chain's.
#[async_trait::async_trait]
pub trait ReceiptLog: Send + Sync {
    async fn append(&self, receipt: Receipt);
    async fn get(&self, tx_id: TxId) -> Option<Receipt>;
    async fn range(&self, start_tx: TxId, end_tx: TxId) -> Vec<Receipt>;
    async fn len(&self) -> usize;
}

/// Reference in-memory receipt log. A production host would swap this for a
/// durable collaborator without changing the chain's contract.
#[derive(Default)]
pub struct InMemoryReceiptLog {
    order: RwLock<Vec<TxId>>,
    by_id: RwLock<HashMap<TxId, Receipt>>,
}

impl InMemoryReceiptLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ReceiptLog for InMemoryReceiptLog {
    async fn append(&self, receipt: Receipt) {
        let tx_id = receipt.tx_id;
        self.order.write().await.push(tx_id);
        self.by_id.write().await.insert(tx_id, receipt);
    }

    async fn get(&self, tx_id: TxId) -> Option<Receipt> {
        self.by_id.read().await.get(&tx_id).cloned()
    }

    async fn range(&self, start_tx: TxId, end_tx: TxId) -> Vec<Receipt> {
        let order = self.order.read().await;
        let by_id = self.by_id.read().await;
        let Some(start_idx) = order.iter().position(|id| *id == start_tx) else { return Vec::new() };
        let Some(end_idx) = order.iter().position(|id| *id == end_tx) else { return Vec::new() };
        if start_idx > end_idx {
            return Vec::new();
        }
        order[start_idx..=end_idx].iter().filter_map(|id| by_id.get(id).cloned()).collect()
    }

    async fn len(&self) -> usize {
        self.order.read().await.len()
    }
}

/// Holds the chain's sole mutable state: the current tip hash. Owned by the
/// engine; the receipt log persists past receipts (§3's ownership rules).
pub struct ReceiptChain {
    tip: parking_lot::Mutex<String>,
}

impl ReceiptChain {
    pub fn new() -> Self {
        Self { tip: parking_lot::Mutex::new(genesis_hash()) }
    }

    pub fn tip(&self) -> String {
        self.tip.lock().clone()
    }

    /// Seal a receipt for `outcome` against `delta`, advancing the tip iff
    /// `outcome.committed` (§4.5 step 5). Returns the sealed receipt; the
    /// caller is responsible for appending it to the receipt log.
    pub fn seal(&self, tx_id: TxId, logic_hash: String, delta: &Delta, outcome: &PipelineOutcome, duration_ns: u128) -> Receipt {
        let mut tip = self.tip.lock();
        let root = merkle_root(&tip, &delta.canonical_bytes());
        if outcome.committed {
            *tip = root.clone();
        }
        Receipt {
            tx_id,
            committed: outcome.committed,
            merkle_root: root,
            logic_hash,
            hook_results: outcome.hook_results.iter().map(HookResultRecord::from).collect(),
            duration_ns,
            error: outcome.aborting_hook.clone(),
        }
    }
}

impl Default for ReceiptChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::Triple;
    use crate::hooks::HookMode;

    fn committed_outcome() -> PipelineOutcome {
        PipelineOutcome {
            committed: true,
            aborting_hook: None,
            hook_results: vec![HookOutcome { hook_id: "h".into(), mode: HookMode::Pre, success: true, duration_ns: 1 }],
        }
    }

    #[test]
    fn genesis_chains_from_knhk_literal() {
        assert_eq!(genesis_hash(), sha256_hex(b"KNHK"));
    }

    /// S6: merkle_root_i == SHA256(merkle_root_{i-1} || canonical(delta_i)).
    #[test]
    fn s6_sealed_root_matches_prev_tip_and_canonical_delta() {
        let chain = ReceiptChain::new();
        let prev = chain.tip();
        let delta = Delta::new(vec![Triple("a".into(), "p".into(), "o".into())], vec![]);
        let receipt = chain.seal(TxId::new(), "logic".into(), &delta, &committed_outcome(), 0);
        assert_eq!(receipt.merkle_root, merkle_root(&prev, &delta.canonical_bytes()));
        assert_eq!(chain.tip(), receipt.merkle_root);
    }

    #[test]
    fn aborted_transaction_leaves_tip_unchanged() {
        let chain = ReceiptChain::new();
        let prev = chain.tip();
        let delta = Delta::default();
        let outcome = PipelineOutcome { committed: false, aborting_hook: Some("guard".into()), hook_results: vec![] };
        let receipt = chain.seal(TxId::new(), "logic".into(), &delta, &outcome, 0);
        assert!(!receipt.committed);
        assert_eq!(chain.tip(), prev, "abort must not advance the tip");
    }

    #[tokio::test]
    async fn in_memory_log_ranges_in_append_order() {
        let log = InMemoryReceiptLog::new();
        let ids: Vec<TxId> = (0..3).map(|_| TxId::new()).collect();
        for id in &ids {
            log.append(Receipt {
                tx_id: *id,
                committed: true,
                merkle_root: "r".into(),
                logic_hash: "l".into(),
                hook_results: vec![],
                duration_ns: 0,
                error: None,
            })
            .await;
        }
        let range = log.range(ids[0], ids[2]).await;
        assert_eq!(range.len(), 3);
        assert_eq!(log.len().await, 3);
    }
}
