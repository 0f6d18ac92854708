//! Reverse index from entity ids to subscription ids.
//!
//! Two instances of the same generic type serve the service, one keyed by
//! system id and one by character id. Forward (entity to subscriptions) and
//! reverse (subscription to entities) maps live under one lock so removal is
//! cheap and the two can never disagree. Reads run in parallel; writes
//! serialize per index.

use super::SubscriptionId;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::mem;
use std::sync::RwLock;

#[derive(Clone, Copy, Debug, Serialize)]
pub struct IndexStats {
    pub entries: usize,
    pub mappings: usize,
    pub approx_bytes: usize,
}

struct IndexState<K> {
    forward: HashMap<K, HashSet<SubscriptionId>>,
    reverse: HashMap<SubscriptionId, HashSet<K>>,
}

pub struct SubscriptionIndex<K> {
    label: &'static str,
    state: RwLock<IndexState<K>>,
}

impl<K: Copy + Eq + Hash> SubscriptionIndex<K> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            state: RwLock::new(IndexState {
                forward: HashMap::new(),
                reverse: HashMap::new(),
            }),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn add(&self, subscription_id: &str, entity_ids: impl IntoIterator<Item = K>) {
        let mut state = self.state.write().unwrap();
        let keys = state
            .reverse
            .entry(subscription_id.to_string())
            .or_default();
        let added: Vec<K> = entity_ids
            .into_iter()
            .filter(|key| keys.insert(*key))
            .collect();
        for key in added {
            state
                .forward
                .entry(key)
                .or_default()
                .insert(subscription_id.to_string());
        }
    }

    /// Replace the subscription's entity set, diffing against the old one.
    pub fn update(&self, subscription_id: &str, entity_ids: &HashSet<K>) {
        let mut state = self.state.write().unwrap();
        let old = state
            .reverse
            .insert(subscription_id.to_string(), entity_ids.clone())
            .unwrap_or_default();
        for key in entity_ids.difference(&old) {
            state
                .forward
                .entry(*key)
                .or_default()
                .insert(subscription_id.to_string());
        }
        for key in old.difference(entity_ids) {
            if let Some(subscriptions) = state.forward.get_mut(key) {
                subscriptions.remove(subscription_id);
                if subscriptions.is_empty() {
                    state.forward.remove(key);
                }
            }
        }
    }

    pub fn remove(&self, subscription_id: &str) {
        let mut state = self.state.write().unwrap();
        let Some(keys) = state.reverse.remove(subscription_id) else {
            return;
        };
        for key in keys {
            if let Some(subscriptions) = state.forward.get_mut(&key) {
                subscriptions.remove(subscription_id);
                if subscriptions.is_empty() {
                    state.forward.remove(&key);
                }
            }
        }
    }

    pub fn find(&self, entity_id: K) -> Vec<SubscriptionId> {
        let state = self.state.read().unwrap();
        state
            .forward
            .get(&entity_id)
            .map(|subscriptions| subscriptions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Union of matches across `entity_ids`, deduplicated.
    pub fn find_union(&self, entity_ids: impl IntoIterator<Item = K>) -> HashSet<SubscriptionId> {
        let state = self.state.read().unwrap();
        let mut matched = HashSet::new();
        for entity_id in entity_ids {
            if let Some(subscriptions) = state.forward.get(&entity_id) {
                matched.extend(subscriptions.iter().cloned());
            }
        }
        matched
    }

    /// Every entity currently watched by at least one subscription.
    pub fn keys(&self) -> Vec<K> {
        self.state.read().unwrap().forward.keys().copied().collect()
    }

    pub fn stats(&self) -> IndexStats {
        let state = self.state.read().unwrap();
        let mappings: usize = state.forward.values().map(HashSet::len).sum();
        IndexStats {
            entries: state.forward.len(),
            mappings,
            approx_bytes: state.forward.len() * mem::size_of::<K>()
                + mappings * mem::size_of::<SubscriptionId>(),
        }
    }

    /// Defensive sweep: drop forward rows whose subscription set emptied.
    /// Normal removal already does this; the sweeper exists for belt and
    /// braces and reports what it found.
    pub fn sweep(&self) -> usize {
        let mut state = self.state.write().unwrap();
        let before = state.forward.len();
        state.forward.retain(|_, subscriptions| !subscriptions.is_empty());
        before - state.forward.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_remove_restores_empty_state() {
        let index: SubscriptionIndex<u64> = SubscriptionIndex::new("systems");
        index.add("sub-1", [30000142, 30000143]);
        assert_eq!(index.find(30000142), vec!["sub-1".to_string()]);

        index.remove("sub-1");
        assert!(index.find(30000142).is_empty());
        let stats = index.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.mappings, 0);
    }

    #[test]
    fn update_diffs_old_against_new() {
        let index: SubscriptionIndex<u64> = SubscriptionIndex::new("systems");
        index.add("sub-1", [1, 2, 3]);
        index.update("sub-1", &HashSet::from([2, 3, 4]));

        assert!(index.find(1).is_empty());
        assert_eq!(index.find(2).len(), 1);
        assert_eq!(index.find(4).len(), 1);
    }

    #[test]
    fn find_union_deduplicates() {
        let index: SubscriptionIndex<u64> = SubscriptionIndex::new("characters");
        index.add("sub-1", [10, 20]);
        index.add("sub-2", [20, 30]);

        let matched = index.find_union([10, 20, 30, 40]);
        assert_eq!(matched.len(), 2);
        assert!(matched.contains("sub-1"));
        assert!(matched.contains("sub-2"));
    }

    #[test]
    fn entries_are_shared_across_subscriptions() {
        let index: SubscriptionIndex<u64> = SubscriptionIndex::new("systems");
        index.add("sub-1", [7]);
        index.add("sub-2", [7]);
        assert_eq!(index.find(7).len(), 2);

        index.remove("sub-1");
        assert_eq!(index.find(7), vec!["sub-2".to_string()]);
    }

    #[test]
    fn add_is_idempotent_per_key() {
        let index: SubscriptionIndex<u64> = SubscriptionIndex::new("systems");
        index.add("sub-1", [7]);
        index.add("sub-1", [7]);
        assert_eq!(index.stats().mappings, 1);
    }

    #[test]
    fn thousand_characters_round_trip() {
        let index: SubscriptionIndex<u64> = SubscriptionIndex::new("characters");
        let ids: Vec<u64> = (1..=1000).collect();
        index.add("big", ids.clone());
        assert_eq!(index.stats().mappings, 1000);
        assert_eq!(index.find(500), vec!["big".to_string()]);

        index.update("big", &(500..=1500).collect());
        assert!(index.find(499).is_empty());
        assert_eq!(index.find(1500), vec!["big".to_string()]);

        index.remove("big");
        assert_eq!(index.stats().entries, 0);
    }

    #[test]
    fn sweep_reports_nothing_when_consistent() {
        let index: SubscriptionIndex<u64> = SubscriptionIndex::new("systems");
        index.add("sub-1", [1]);
        index.remove("sub-1");
        assert_eq!(index.sweep(), 0);
    }
}
