use serde::Deserialize;

use crate::message::SyncMode;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// The mode new sync cycles default to.
    #[serde(default)]
    pub mode: SyncMode,
    /// Whether headers that were locally unknown before a successful insert
    /// still join the rollback list. Matches the original engine's
    /// belt-and-suspenders behaviour; disable to roll back only headers from
    /// batches that actually failed.
    #[serde(default = "default_rollback_unknown_headers")]
    pub rollback_unknown_headers: bool,
    /// Generations a clean trie node stays resident before eviction.
    #[serde(default = "default_trie_cache_limit")]
    pub trie_cache_limit: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            mode: SyncMode::default(),
            rollback_unknown_headers: default_rollback_unknown_headers(),
            trie_cache_limit: default_trie_cache_limit(),
        }
    }
}

fn default_rollback_unknown_headers() -> bool {
    true
}

fn default_trie_cache_limit() -> u16 {
    16
}
