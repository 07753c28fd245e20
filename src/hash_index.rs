//! Hash Index (spec §3, §9): the concurrent hash→backend routing table.
//!
//! Values are indices into the `InstanceRegistry`'s fixed instance slice
//! rather than `Arc<BackendInstance>` directly, since the registry's order
//! never changes after startup and a plain index keeps this map `Copy`.

use std::collections::HashMap;

use dashmap::DashMap;

pub struct HashIndex {
    map: DashMap<String, usize>,
}

impl HashIndex {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    pub fn get(&self, hash: &str) -> Option<usize> {
        self.map.get(hash).map(|entry| *entry)
    }

    /// Records that `hash` is owned by instance `idx`. Logs a move if the
    /// hash previously pointed at a different instance. Returns whether a
    /// move occurred.
    pub fn set(&self, hash: &str, idx: usize) -> bool {
        match self.map.insert(hash.to_string(), idx) {
            Some(previous) if previous != idx => {
                tracing::info!(hash, previous_instance = previous, new_instance = idx, "hash moved to a different backend");
                true
            }
            _ => false,
        }
    }

    /// Tallies hashes per instance index in `0..instance_count`, including
    /// instances with zero hashes (spec §4.2).
    pub fn counts_per_instance(&self, instance_count: usize) -> Vec<usize> {
        let mut counts = vec![0usize; instance_count];
        for entry in self.map.iter() {
            let idx = *entry.value();
            if idx < counts.len() {
                counts[idx] += 1;
            }
        }
        counts
    }

    /// Replaces the entire map (a full `/torrents/info` refresh, spec §3).
    pub fn replace_all(&self, new_map: HashMap<String, usize>) {
        self.map.clear();
        for (hash, idx) in new_map {
            self.map.insert(hash, idx);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for HashIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_none_for_unknown_hash() {
        let index = HashIndex::new();
        assert_eq!(index.get("aa"), None);
    }

    #[test]
    fn set_then_get_round_trips() {
        let index = HashIndex::new();
        index.set("aa", 2);
        assert_eq!(index.get("aa"), Some(2));
    }

    #[test]
    fn set_reports_move_when_instance_changes() {
        let index = HashIndex::new();
        assert!(!index.set("aa", 0));
        assert!(index.set("aa", 1));
        assert!(!index.set("aa", 1));
    }

    #[test]
    fn counts_per_instance_includes_zero_count_instances() {
        let index = HashIndex::new();
        index.set("aa", 0);
        index.set("bb", 0);
        index.set("cc", 2);
        assert_eq!(index.counts_per_instance(3), vec![2, 0, 1]);
    }

    #[test]
    fn replace_all_rebuilds_the_whole_map() {
        let index = HashIndex::new();
        index.set("stale", 0);
        let mut fresh = HashMap::new();
        fresh.insert("aa".to_string(), 1);
        index.replace_all(fresh);
        assert_eq!(index.get("stale"), None);
        assert_eq!(index.get("aa"), Some(1));
    }
}
