//! Invalidation graph.
//!
//! Resolves an invalidation pattern (a key prefix) to the cache keys that
//! currently exist under it. Resolution always runs against the live store,
//! so a mutation never has to enumerate exact keys: invalidating
//! `["documents", "list"]` reaches every list variant whatever filters were
//! appended.
//!
//! Optional links add derived dependencies on top of prefix matching, e.g.
//! "any change under `["folders"]` also affects `["documents", "list"]`".

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use super::keys::CacheKey;
use super::lock::{read_lock, write_lock};
use super::store::CacheStore;

const COMPONENT: &str = "cache::graph";

/// Maps source prefixes to dependent prefixes.
pub struct InvalidationGraph {
    links: RwLock<BTreeMap<CacheKey, BTreeSet<CacheKey>>>,
}

impl InvalidationGraph {
    /// Create a graph without links: plain prefix matching.
    pub fn new() -> Self {
        Self {
            links: RwLock::new(BTreeMap::new()),
        }
    }

    /// Declare that invalidating anything overlapping `source` also
    /// invalidates `dependent`.
    pub fn link(&self, source: CacheKey, dependent: CacheKey) {
        write_lock(&self.links, COMPONENT, "link")
            .entry(source)
            .or_default()
            .insert(dependent);
    }

    /// Remove a single link. Returns whether it existed.
    pub fn unlink(&self, source: &CacheKey, dependent: &CacheKey) -> bool {
        let mut links = write_lock(&self.links, COMPONENT, "unlink");
        let Some(targets) = links.get_mut(source) else {
            return false;
        };
        let removed = targets.remove(dependent);
        if targets.is_empty() {
            links.remove(source);
        }
        removed
    }

    /// `pattern` plus every prefix reachable from it through links.
    ///
    /// A link fires when its source overlaps the pattern in either
    /// direction: the pattern lies under the source, or the source lies
    /// under the pattern. Cycles are followed once.
    pub fn expand(&self, pattern: &CacheKey) -> BTreeSet<CacheKey> {
        let links = read_lock(&self.links, COMPONENT, "expand");
        let mut expanded = BTreeSet::new();
        let mut pending = vec![pattern.clone()];

        while let Some(current) = pending.pop() {
            if !expanded.insert(current.clone()) {
                continue;
            }
            for (source, targets) in links.iter() {
                if current.starts_with(source) || source.starts_with(&current) {
                    pending.extend(targets.iter().filter(|t| !expanded.contains(*t)).cloned());
                }
            }
        }
        expanded
    }

    /// Keys currently in `store` affected by invalidating `pattern`.
    pub fn resolve(&self, store: &CacheStore, pattern: &CacheKey) -> BTreeSet<CacheKey> {
        self.expand(pattern)
            .iter()
            .flat_map(|prefix| store.keys_with_prefix(prefix))
            .collect()
    }

    /// Number of declared links.
    pub fn link_count(&self) -> usize {
        read_lock(&self.links, COMPONENT, "link_count")
            .values()
            .map(BTreeSet::len)
            .sum()
    }

    /// Remove all links.
    pub fn clear(&self) {
        write_lock(&self.links, COMPONENT, "clear").clear();
    }
}

impl Default for InvalidationGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn key(segments: &[&str]) -> CacheKey {
        CacheKey::from_segments(segments.iter().copied()).expect("valid key")
    }

    fn populated_store() -> CacheStore {
        let store = CacheStore::new(Duration::from_secs(300));
        for key in [
            CacheKey::root("documents").push("list").push(json!({"status": "active"})),
            CacheKey::root("documents").push("list").push(json!({"page": 2})),
            key(&["documents", "detail", "42"]),
            key(&["folders", "list"]),
            key(&["folders", "detail", "3"]),
            key(&["notifications", "list"]),
        ] {
            store.set_data(&key, 0_u8, Duration::MAX);
        }
        store
    }

    #[test]
    fn resolve_is_prefix_match_over_live_keys() {
        let store = populated_store();
        let graph = InvalidationGraph::new();

        let resolved = graph.resolve(&store, &key(&["documents", "list"]));
        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|k| k.starts_with(&key(&["documents", "list"]))));

        assert_eq!(graph.resolve(&store, &key(&["documents"])).len(), 3);
        assert!(graph.resolve(&store, &key(&["workflows"])).is_empty());
    }

    #[test]
    fn links_pull_in_dependents() {
        let store = populated_store();
        let graph = InvalidationGraph::new();
        graph.link(key(&["folders"]), key(&["documents", "list"]));

        let resolved = graph.resolve(&store, &key(&["folders", "detail", "3"]));
        assert!(resolved.contains(&key(&["folders", "detail", "3"])));
        assert_eq!(
            resolved
                .iter()
                .filter(|k| k.starts_with(&key(&["documents", "list"])))
                .count(),
            2
        );
        assert!(!resolved.contains(&key(&["folders", "list"])));
    }

    #[test]
    fn links_fire_when_pattern_covers_source() {
        let graph = InvalidationGraph::new();
        graph.link(key(&["folders", "detail"]), key(&["documents", "list"]));

        let expanded = graph.expand(&key(&["folders"]));
        assert!(expanded.contains(&key(&["documents", "list"])));
    }

    #[test]
    fn cycles_terminate() {
        let graph = InvalidationGraph::new();
        graph.link(key(&["a"]), key(&["b"]));
        graph.link(key(&["b"]), key(&["c"]));
        graph.link(key(&["c"]), key(&["a"]));

        let expanded = graph.expand(&key(&["a"]));
        assert_eq!(expanded.len(), 3);
    }

    #[test]
    fn unlink_and_clear() {
        let graph = InvalidationGraph::new();
        graph.link(key(&["a"]), key(&["b"]));
        graph.link(key(&["a"]), key(&["c"]));
        assert_eq!(graph.link_count(), 2);

        assert!(graph.unlink(&key(&["a"]), &key(&["b"])));
        assert!(!graph.unlink(&key(&["a"]), &key(&["b"])));
        assert_eq!(graph.link_count(), 1);

        graph.clear();
        assert_eq!(graph.link_count(), 0);
    }
}
