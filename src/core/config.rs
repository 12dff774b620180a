//! Key classification and the `HybridConfig` prefix tables (spec §3, §4.4).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The routing class of a key, assigned by longest-prefix match against
/// [`HybridConfig`]'s prefix lists. Falls back to `Runtime` when nothing
/// matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Runtime,
    Persistent,
    Shared,
    SharedPersistent,
}

impl Default for Category {
    fn default() -> Self {
        Self::Runtime
    }
}

/// Mutable-at-runtime configuration for the hybrid router: prefix tables,
/// per-category TTL defaults, and whether the persistent tier is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridConfig {
    pub persistent_prefixes: Vec<String>,
    pub shared_prefixes: Vec<String>,
    pub shared_persistent_prefixes: Vec<String>,

    pub default_cache_ttl: Duration,
    pub persistent_cache_ttl: Duration,
    pub shared_cache_ttl: Duration,

    pub enable_persistent: bool,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            persistent_prefixes: vec![
                "tunnox:user:".to_string(),
                "tunnox:persist:".to_string(),
                "tunnox:stats:persistent:".to_string(),
            ],
            shared_prefixes: vec![
                "tunnox:conn_state:".to_string(),
                "tunnox:client_conn:".to_string(),
                "tunnox:tunnel_waiting:".to_string(),
                "tunnox:node:".to_string(),
                "tunnox:runtime:conncode:".to_string(),
                "tunnox:id:".to_string(),
                "tunnox:runtime:client:state:".to_string(),
            ],
            shared_persistent_prefixes: vec![
                "tunnox:client_mappings:".to_string(),
                "tunnox:user_mappings:".to_string(),
                "tunnox:port_mapping:".to_string(),
                "tunnox:mappings:list".to_string(),
            ],
            default_cache_ttl: Duration::from_secs(300),
            persistent_cache_ttl: Duration::from_secs(600),
            shared_cache_ttl: Duration::from_secs(300),
            enable_persistent: true,
        }
    }
}

impl HybridConfig {
    /// Classifies `key` by evaluating the prefix lists in the fixed order
    /// {SharedPersistent, Shared, Persistent}; first match wins, otherwise
    /// `Runtime`. Pure function of `(key, self)` — Testable Property 4.
    pub fn classify(&self, key: &str) -> Category {
        if longest_match(&self.shared_persistent_prefixes, key) {
            return Category::SharedPersistent;
        }
        if longest_match(&self.shared_prefixes, key) {
            return Category::Shared;
        }
        if longest_match(&self.persistent_prefixes, key) {
            return Category::Persistent;
        }
        Category::Runtime
    }

    /// Replaces the persistent prefix list. Callers hold this under a write
    /// lock in [`crate::storage::hybrid::Hybrid`]; this method itself does
    /// no locking.
    pub fn update_persistent_prefixes(&mut self, prefixes: Vec<String>) {
        self.persistent_prefixes = prefixes;
    }
}

/// Returns true iff any prefix in `prefixes` is a prefix of `key`. The spec
/// calls for "longest-prefix match" within a category's list, but category
/// membership only needs *a* match, not the longest one across categories:
/// ties within one list never disambiguate two different categories since
/// a key belongs to exactly one category by construction of the lists.
fn longest_match(prefixes: &[String], key: &str) -> bool {
    prefixes.iter().any(|p| key.starts_with(p.as_str()))
}
