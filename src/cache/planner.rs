//! Invalidation plan generation.
//!
//! Merges the patterns declared by one or more mutations into the smallest
//! set of prefixes that covers them all.

use std::collections::BTreeSet;
use std::fmt;

use super::graph::InvalidationGraph;
use super::keys::CacheKey;
use super::store::CacheStore;

/// Prefixes to invalidate, deduplicated and with covered patterns removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvalidationPlan {
    patterns: Vec<CacheKey>,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InvalidationPlan {{ patterns: {} }}", self.patterns.len())?;
        for pattern in &self.patterns {
            write!(f, " {pattern}")?;
        }
        Ok(())
    }
}

impl InvalidationPlan {
    /// Merge patterns into a plan.
    ///
    /// - Deduplicates equal patterns
    /// - Drops patterns that already lie under another pattern
    pub fn from_patterns<I>(patterns: I) -> Self
    where
        I: IntoIterator<Item = CacheKey>,
    {
        let sorted: BTreeSet<CacheKey> = patterns.into_iter().collect();
        let mut kept: Vec<CacheKey> = Vec::with_capacity(sorted.len());

        // Canonical order places a prefix right before the keys under it, so
        // only the last kept pattern can cover the current one.
        for pattern in sorted {
            if kept.last().is_some_and(|last| pattern.starts_with(last)) {
                continue;
            }
            kept.push(pattern);
        }

        Self { patterns: kept }
    }

    /// Merge patterns after following the graph's links.
    pub fn expanded<I>(graph: &InvalidationGraph, patterns: I) -> Self
    where
        I: IntoIterator<Item = CacheKey>,
    {
        Self::from_patterns(
            patterns
                .into_iter()
                .flat_map(|pattern| graph.expand(&pattern)),
        )
    }

    pub fn patterns(&self) -> &[CacheKey] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Invalidate every pattern. Returns the number of entries marked stale.
    pub fn apply(&self, store: &CacheStore) -> usize {
        self.patterns
            .iter()
            .map(|pattern| store.invalidate(pattern))
            .sum()
    }
}
