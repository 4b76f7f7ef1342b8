//! Weight-bounded ordered map
//!
//! Storage backing a target's location table: an insertion-ordered map
//! augmented with a garbage-collection sweep that ranks entries by a
//! recency key and keeps the most recent entries whose cumulative weight
//! stays within a byte limit.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use crate::clock::ByteCount;
use crate::error::Result;

// == Eviction Map ==
/// Insertion-ordered key→value map with a size-bounded sweep.
///
/// Iteration order is insertion order; replacing an existing key keeps its
/// original position. The sweep in [`EvictionMap::gc`] breaks recency ties
/// in favour of the entry encountered first.
#[derive(Debug)]
pub struct EvictionMap<K, V> {
    entries: HashMap<K, V>,
    /// Keys in insertion order
    order: Vec<K>,
}

impl<K: Eq + Hash + Clone, V> EvictionMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    /// Inserts or replaces a value, returning the previous one.
    ///
    /// Replacing keeps the key's original insertion position.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.entries.insert(key.clone(), value);
        if previous.is_none() {
            self.order.push(key);
        }
        previous
    }

    /// Removes a key, returning its value if it was present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k != key);
        }
        removed
    }

    /// Keys in iteration order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.order.iter()
    }

    /// Entries in iteration order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.order.iter().map(move |key| (key, &self.entries[key]))
    }

    /// Sums `weigher` over every value, saturating at the top.
    ///
    /// A weigher error propagates and aborts the sum.
    pub fn weight(&self, weigher: impl Fn(&V) -> Result<ByteCount>) -> Result<ByteCount> {
        let mut total = ByteCount::ZERO;
        for key in &self.order {
            total = total.saturating_add(weigher(&self.entries[key])?);
        }
        Ok(total)
    }

    /// Retains entries greedily in descending `sort_key` order while their
    /// cumulative weight fits under `limit`; everything else is deleted.
    ///
    /// An entry that does not fit is skipped, not a stopping point: a less
    /// recent entry that still fits is kept. Entries weighed
    /// [`ByteCount::INF`] can never fit. Returns the retained cumulative
    /// weight. On a weigher error the map is left unmodified.
    pub fn gc<S: Ord>(
        &mut self,
        limit: ByteCount,
        sort_key: impl Fn(&V) -> S,
        weigher: impl Fn(&V) -> Result<ByteCount>,
    ) -> Result<ByteCount> {
        // Weigh everything up front so a failure cannot leave a half-swept map.
        let mut ranked: Vec<(K, S, ByteCount)> = Vec::with_capacity(self.order.len());
        for key in &self.order {
            let value = &self.entries[key];
            ranked.push((key.clone(), sort_key(value), weigher(value)?));
        }

        // Stable sort, most recent first; ties keep iteration order.
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        let mut retained = ByteCount::ZERO;
        let mut keep: HashSet<K> = HashSet::with_capacity(ranked.len());
        for (key, _, weight) in ranked {
            let candidate = retained.saturating_add(weight);
            if candidate <= limit {
                retained = candidate;
                keep.insert(key);
            }
        }

        self.order.retain(|key| keep.contains(key));
        self.entries.retain(|key, _| keep.contains(key));
        Ok(retained)
    }
}

impl<K: Eq + Hash + Clone, V> Default for EvictionMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
