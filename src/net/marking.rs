//! Marking (C1): a multiset assignment of tokens to conditions.
//!
//! Concurrent access is serialized by the owning case's single writer (§4.1);
//! this container has no internal locking of its own.

use crate::ids::{NodeId, TokenId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub condition: NodeId,
    pub data: serde_json::Value,
    /// Canonical parent: for an AND-join's consumed tokens, the first one.
    pub parent: Option<TokenId>,
    /// Other tokens consumed alongside the parent at the same firing, kept
    /// for lineage traversal without a cyclic object graph.
    pub siblings: Vec<TokenId>,
}

impl Token {
    pub fn new(condition: NodeId, data: serde_json::Value, parent: Option<TokenId>) -> Self {
        Self { id: TokenId::new(), condition, data, parent, siblings: Vec::new() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Marking {
    tokens: HashMap<NodeId, Vec<Token>>,
}

impl Marking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn place(&mut self, token: Token) {
        self.tokens.entry(token.condition.clone()).or_default().push(token);
    }

    /// Remove and return the token with `token_id` from `condition`, if present.
    pub fn remove(&mut self, condition: &str, token_id: TokenId) -> Option<Token> {
        let bucket = self.tokens.get_mut(condition)?;
        let idx = bucket.iter().position(|t| t.id == token_id)?;
        Some(bucket.remove(idx))
    }

    /// Remove and return the first token at `condition` by id ascending
    /// (§4.3.2's "first marked by id order if unspecified").
    pub fn remove_first(&mut self, condition: &str) -> Option<Token> {
        let bucket = self.tokens.get_mut(condition)?;
        if bucket.is_empty() {
            return None;
        }
        let idx = bucket
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| t.id)
            .map(|(i, _)| i)?;
        Some(bucket.remove(idx))
    }

    /// Remove every token at `condition`, returning them.
    pub fn clear_condition(&mut self, condition: &str) -> Vec<Token> {
        self.tokens.remove(condition).unwrap_or_default()
    }

    pub fn count(&self, condition: &str) -> usize {
        self.tokens.get(condition).map(|b| b.len()).unwrap_or(0)
    }

    pub fn has(&self, condition: &str) -> bool {
        self.count(condition) > 0
    }

    pub fn marked_conditions(&self) -> Vec<NodeId> {
        self.tokens
            .iter()
            .filter(|(_, toks)| !toks.is_empty())
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub fn snapshot(&self) -> HashMap<NodeId, Vec<TokenId>> {
        self.tokens
            .iter()
            .map(|(c, toks)| (c.clone(), toks.iter().map(|t| t.id).collect()))
            .collect()
    }

    pub fn tokens_at(&self, condition: &str) -> &[Token] {
        self.tokens.get(condition).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn place_then_count() {
        let mut m = Marking::new();
        m.place(Token::new("c1".into(), serde_json::json!({}), None));
        assert_eq!(m.count("c1"), 1);
        assert!(m.has("c1"));
        assert!(!m.has("c2"));
    }

    #[test]
    fn remove_first_picks_lowest_id() {
        let mut m = Marking::new();
        let t1 = Token::new("c1".into(), serde_json::json!({}), None);
        let t2 = Token::new("c1".into(), serde_json::json!({}), None);
        let expected = t1.id.min(t2.id);
        m.place(t1);
        m.place(t2);
        let removed = m.remove_first("c1").unwrap();
        assert_eq!(removed.id, expected);
        assert_eq!(m.count("c1"), 1);
    }

    #[test]
    fn clear_condition_empties_bucket() {
        let mut m = Marking::new();
        m.place(Token::new("c1".into(), serde_json::json!({}), None));
        m.place(Token::new("c1".into(), serde_json::json!({}), None));
        let cleared = m.clear_condition("c1");
        assert_eq!(cleared.len(), 2);
        assert_eq!(m.count("c1"), 0);
    }
}
