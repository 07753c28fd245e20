//! Instance Registry (spec §3, §4.2): an immutable ordered list of backends
//! after startup, plus a round-robin cursor behind its own lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::hash_index::HashIndex;
use crate::instance::BackendInstance;

pub struct InstanceRegistry {
    instances: Vec<Arc<BackendInstance>>,
    cursor: AtomicUsize,
}

impl InstanceRegistry {
    pub fn new(instances: Vec<Arc<BackendInstance>>) -> Self {
        Self {
            instances,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn instances(&self) -> &[Arc<BackendInstance>] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Advances the cursor, wrapping to zero at the length, and returns the
    /// selected instance.
    pub fn next_round_robin(&self) -> Arc<BackendInstance> {
        let len = self.instances.len();
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        self.instances[idx].clone()
    }

    /// Snapshots the Hash Index, tallies hashes per instance (zero-count
    /// instances included), and returns the instance with the fewest
    /// hashes. Ties are broken by host string ascending, making the
    /// selection deterministic (spec §4.2).
    pub fn least_busy(&self, hash_index: &HashIndex) -> Arc<BackendInstance> {
        let counts = hash_index.counts_per_instance(self.instances.len());
        let min = counts.iter().copied().min().unwrap_or(0);

        let mut ties: Vec<&Arc<BackendInstance>> = self
            .instances
            .iter()
            .zip(counts.iter())
            .filter(|(_, &count)| count == min)
            .map(|(instance, _)| instance)
            .collect();

        ties.sort_by(|a, b| a.host().cmp(&b.host()));
        ties[0].clone()
    }
}
