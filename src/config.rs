//! Engine tunables. A host process may deserialize this from TOML/JSON/env;
//! the crate itself never reads configuration from the process environment.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bounded-complexity ingress guard: reject a delta whose additions or
    /// removals exceed this count (§4.5.1).
    pub max_delta_size: usize,
    /// PRE/POST hook timeout before the self-healing envelope aborts it.
    pub hook_timeout_ms: u64,
    /// Depth at which the receipt chain is considered for rotation.
    pub max_chain_depth: u64,
    /// Receipt count ceiling before the storage-ceiling healer requires an
    /// archive+acknowledge round trip from the receipt log collaborator.
    pub max_receipts_before_rotation: u64,
    /// Timer service poll interval.
    pub timer_poll_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_delta_size: 64,
            hook_timeout_ms: 5_000,
            max_chain_depth: 1_000_000,
            max_receipts_before_rotation: 100_000,
            timer_poll_interval_ms: 100,
        }
    }
}
