//! The wire-visible delta the hook pipeline and receipt chain operate over.
//!
//! A delta is a set of additions and removals against the storage
//! collaborator's triple store. Its canonical serialization is what gets
//! hashed into the receipt chain, so ordering must be deterministic.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Triple(pub String, pub String, pub String);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub additions: Vec<Triple>,
    pub removals: Vec<Triple>,
}

impl Delta {
    pub fn new(mut additions: Vec<Triple>, mut removals: Vec<Triple>) -> Self {
        additions.sort();
        removals.sort();
        Self { additions, removals }
    }

    pub fn len(&self) -> usize {
        self.additions.len() + self.removals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }

    /// Canonical UTF-8 encoding used as hash input. Not meant to be the most
    /// compact form, only a deterministic one: sorted fields, stable key
    /// order, no whitespace ambiguity.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut additions = self.additions.clone();
        let mut removals = self.removals.clone();
        additions.sort();
        removals.sort();

        let encoded = serde_json::json!({
            "additions": additions,
            "removals": removals,
        });
        // serde_json's map serialization preserves insertion order for
        // `json!`, and the two keys above are always written in this order,
        // so the encoding is stable across runs.
        serde_json::to_vec(&encoded).expect("delta serializes")
    }
}
