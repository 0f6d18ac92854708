//! In-memory event store: ordered killmail log with per-client read offsets.
//!
//! The event tables (log ordered by a globally monotonic sequence, plus
//! per-system sequence sets) live under one `RwLock`; inserts and GC take
//! it for writing, briefly. Offsets live outside that lock: a registry maps
//! each client to its own offset map behind its own mutex, so two clients
//! fetch concurrently under shared read guards and only same-client fetches
//! serialize. GC snapshots the offsets before touching the tables and never
//! holds both locks at once. Every stored event is published on a broadcast
//! channel for the fan-out path; reclamation is by minimum offset with a
//! per-system cap as secondary pressure.

use crate::config::StorageConfig;
use crate::metrics::{add, inc, Metrics};
use chrono::{DateTime, Utc};
use killfeed_types::{EventRecord, Killmail, Sequence, SystemId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;

const PUBLISH_CAPACITY: usize = 1024;

/// One client's per-system high-water marks, lockable independently of
/// every other client and of the event tables.
type ClientOffsets = Arc<Mutex<HashMap<SystemId, Sequence>>>;

#[derive(Default)]
struct EventTables {
    counter: Sequence,
    events: BTreeMap<Sequence, EventRecord>,
    by_system: HashMap<SystemId, BTreeSet<Sequence>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcOutcome {
    pub evicted_min_offset: usize,
    pub evicted_cap: usize,
    pub evicted_past_offset: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct StoreStats {
    pub events: usize,
    pub systems: usize,
    pub clients: usize,
    pub last_sequence: Sequence,
}

pub struct EventStore {
    tables: RwLock<EventTables>,
    offsets: RwLock<HashMap<String, ClientOffsets>>,
    publish_tx: broadcast::Sender<EventRecord>,
    streaming: bool,
    max_events_per_system: usize,
    metrics: Arc<Metrics>,
}

impl EventStore {
    pub fn new(config: &StorageConfig, metrics: Arc<Metrics>) -> Self {
        let (publish_tx, _) = broadcast::channel(PUBLISH_CAPACITY);
        Self {
            tables: RwLock::new(EventTables::default()),
            offsets: RwLock::new(HashMap::new()),
            publish_tx,
            streaming: config.enable_event_streaming,
            max_events_per_system: config.max_events_per_system,
            metrics,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.publish_tx.subscribe()
    }

    /// Assign the next sequence, append, and publish. Returns the sequence.
    pub fn insert(&self, system_id: SystemId, killmail: Arc<Killmail>) -> Sequence {
        let record = {
            let mut tables = self.tables.write().unwrap();
            tables.counter += 1;
            let sequence = tables.counter;
            let record = EventRecord {
                sequence,
                system_id,
                killmail,
            };
            tables.events.insert(sequence, record.clone());
            tables.by_system.entry(system_id).or_default().insert(sequence);
            record
        };
        inc(&self.metrics.store.inserted);
        if self.streaming {
            // No receivers is fine (e.g. headless tests).
            let _ = self.publish_tx.send(record.clone());
        }
        record.sequence
    }

    /// The client's offset map, registered on first use.
    fn client_offsets(&self, client_id: &str) -> ClientOffsets {
        if let Some(existing) = self.offsets.read().unwrap().get(client_id) {
            return existing.clone();
        }
        self.offsets
            .write()
            .unwrap()
            .entry(client_id.to_string())
            .or_default()
            .clone()
    }

    /// All events for `system_ids` beyond the client's offsets, ascending by
    /// sequence. Offsets advance to the maximum returned per system, so an
    /// immediate second call returns nothing new. Concurrent calls for other
    /// clients share the table read guard; same-client calls serialize on
    /// the client's offset lock.
    pub fn fetch_for_client(&self, client_id: &str, system_ids: &[SystemId]) -> Vec<EventRecord> {
        let client = self.client_offsets(client_id);
        let mut offsets = client.lock().unwrap();

        let mut matched: Vec<EventRecord> = Vec::new();
        {
            let tables = self.tables.read().unwrap();
            for &system_id in system_ids {
                let offset = offsets.get(&system_id).copied().unwrap_or(0);
                let Some(sequences) = tables.by_system.get(&system_id) else {
                    continue;
                };
                for &sequence in sequences.range((offset + 1)..) {
                    if let Some(record) = tables.events.get(&sequence) {
                        matched.push(record.clone());
                    }
                }
            }
        }
        matched.sort_by_key(|record| record.sequence);

        for record in &matched {
            let entry = offsets.entry(record.system_id).or_insert(0);
            *entry = (*entry).max(record.sequence);
        }
        matched
    }

    /// The single smallest unseen event across `system_ids`; only that
    /// system's offset advances.
    pub fn fetch_one_event(&self, client_id: &str, system_ids: &[SystemId]) -> Option<EventRecord> {
        let client = self.client_offsets(client_id);
        let mut offsets = client.lock().unwrap();

        let best = {
            let tables = self.tables.read().unwrap();
            let mut best: Option<EventRecord> = None;
            for &system_id in system_ids {
                let offset = offsets.get(&system_id).copied().unwrap_or(0);
                let Some(sequences) = tables.by_system.get(&system_id) else {
                    continue;
                };
                if let Some(&sequence) = sequences.range((offset + 1)..).next() {
                    if best.as_ref().map(|b| sequence < b.sequence).unwrap_or(true) {
                        if let Some(record) = tables.events.get(&sequence) {
                            best = Some(record.clone());
                        }
                    }
                }
            }
            best
        };
        if let Some(record) = &best {
            let entry = offsets.entry(record.system_id).or_insert(0);
            *entry = (*entry).max(record.sequence);
        }
        best
    }

    /// Forget a client's offsets. Harmless to skip; stale offsets only pin GC.
    pub fn remove_client(&self, client_id: &str) {
        self.offsets.write().unwrap().remove(client_id);
    }

    /// Read-only view for the REST surface and preload: the most recent
    /// `limit` events for a system at or after `since`, ascending by sequence.
    pub fn recent_for_system(
        &self,
        system_id: SystemId,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Vec<EventRecord> {
        let tables = self.tables.read().unwrap();
        let Some(sequences) = tables.by_system.get(&system_id) else {
            return Vec::new();
        };
        let mut picked: Vec<EventRecord> = Vec::new();
        for &sequence in sequences.iter().rev() {
            if picked.len() >= limit {
                break;
            }
            if let Some(record) = tables.events.get(&sequence) {
                if record.killmail.kill_time >= since {
                    picked.push(record.clone());
                }
            }
        }
        picked.reverse();
        picked
    }

    pub fn count_for_system(&self, system_id: SystemId) -> u64 {
        let tables = self.tables.read().unwrap();
        tables
            .by_system
            .get(&system_id)
            .map(|sequences| sequences.len() as u64)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> StoreStats {
        let clients = self.offsets.read().unwrap().len();
        let tables = self.tables.read().unwrap();
        StoreStats {
            events: tables.events.len(),
            systems: tables.by_system.len(),
            clients,
            last_sequence: tables.counter,
        }
    }

    /// Reclaim delivered events and enforce the per-system cap.
    pub fn gc(&self) -> GcOutcome {
        let mut outcome = GcOutcome::default();

        // Snapshot every client's offsets first; fetches keep flowing while
        // the tables are compacted, and the two locks are never nested.
        let snapshots: Vec<HashMap<SystemId, Sequence>> = {
            let registry = self.offsets.read().unwrap();
            registry
                .values()
                .map(|client| client.lock().unwrap().clone())
                .collect()
        };

        let mut tables = self.tables.write().unwrap();

        // Everything at or below the minimum offset has been seen by every
        // client. With no clients registered, retention falls to the cap.
        let min_offset = snapshots
            .iter()
            .flat_map(|offsets| offsets.values())
            .copied()
            .min();
        if let Some(min_offset) = min_offset {
            let reclaim: Vec<Sequence> = tables
                .events
                .range(..=min_offset)
                .map(|(&sequence, _)| sequence)
                .collect();
            for sequence in reclaim {
                if let Some(record) = tables.events.remove(&sequence) {
                    if let Some(sequences) = tables.by_system.get_mut(&record.system_id) {
                        sequences.remove(&sequence);
                        if sequences.is_empty() {
                            tables.by_system.remove(&record.system_id);
                        }
                    }
                    outcome.evicted_min_offset += 1;
                }
            }
        }

        // Secondary pressure: cap each system's retained events.
        let over_cap: Vec<(SystemId, Vec<Sequence>)> = tables
            .by_system
            .iter()
            .filter(|(_, sequences)| sequences.len() > self.max_events_per_system)
            .map(|(&system_id, sequences)| {
                let excess = sequences.len() - self.max_events_per_system;
                (system_id, sequences.iter().take(excess).copied().collect())
            })
            .collect();
        for (system_id, sequences) in over_cap {
            for sequence in sequences {
                // A lagging client whose offset is behind this sequence will
                // silently skip it on its next fetch; count those.
                let skipped = snapshots.iter().any(|offsets| {
                    offsets
                        .get(&system_id)
                        .map(|&offset| offset < sequence)
                        .unwrap_or(false)
                });
                if skipped {
                    outcome.evicted_past_offset += 1;
                }
                tables.events.remove(&sequence);
                if let Some(set) = tables.by_system.get_mut(&system_id) {
                    set.remove(&sequence);
                }
                outcome.evicted_cap += 1;
            }
            if tables
                .by_system
                .get(&system_id)
                .map(|set| set.is_empty())
                .unwrap_or(false)
            {
                tables.by_system.remove(&system_id);
            }
        }
        drop(tables);

        inc(&self.metrics.store.gc_runs);
        add(&self.metrics.store.evicted_min_offset, outcome.evicted_min_offset as u64);
        add(&self.metrics.store.evicted_cap, outcome.evicted_cap as u64);
        add(&self.metrics.store.evicted_past_offset, outcome.evicted_past_offset as u64);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_store(max_events_per_system: usize) -> EventStore {
        EventStore::new(
            &StorageConfig {
                enable_event_streaming: true,
                gc_interval: std::time::Duration::from_secs(60),
                max_events_per_system,
            },
            Arc::new(Metrics::new()),
        )
    }

    fn killmail(id: u64, system_id: SystemId) -> Arc<Killmail> {
        Arc::new(Killmail {
            id,
            kill_time: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            system_id,
            victim: killfeed_types::Victim {
                ship_type_id: 587,
                damage_taken: 100,
                ..Default::default()
            },
            attackers: vec![],
            zkb: None,
            enrichment_complete: true,
        })
    }

    #[test]
    fn sequences_are_strictly_increasing() {
        let store = test_store(100);
        let a = store.insert(1, killmail(10, 1));
        let b = store.insert(2, killmail(11, 2));
        let c = store.insert(1, killmail(12, 1));
        assert!(a < b && b < c);
    }

    #[test]
    fn insert_publishes_to_subscribers() {
        let store = test_store(100);
        let mut rx = store.subscribe();
        let sequence = store.insert(30000142, killmail(1001, 30000142));
        let record = rx.try_recv().unwrap();
        assert_eq!(record.sequence, sequence);
        assert_eq!(record.system_id, 30000142);
        assert_eq!(record.killmail.id, 1001);
    }

    #[test]
    fn fetch_for_client_returns_then_drains() {
        let store = test_store(100);
        for id in [1, 2, 3] {
            store.insert(30000142, killmail(id, 30000142));
        }

        let first = store.fetch_for_client("X", &[30000142]);
        assert_eq!(first.len(), 3);
        assert!(first.windows(2).all(|w| w[0].sequence < w[1].sequence));

        // No new inserts: the second call is empty.
        assert!(store.fetch_for_client("X", &[30000142]).is_empty());

        // A new insert resumes where the offset left off.
        store.insert(30000142, killmail(4, 30000142));
        let third = store.fetch_for_client("X", &[30000142]);
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].killmail.id, 4);
    }

    #[test]
    fn offsets_are_per_client() {
        let store = test_store(100);
        store.insert(1, killmail(1, 1));
        assert_eq!(store.fetch_for_client("a", &[1]).len(), 1);
        assert_eq!(store.fetch_for_client("b", &[1]).len(), 1);
        assert!(store.fetch_for_client("a", &[1]).is_empty());
    }

    #[test]
    fn fetch_one_event_advances_only_one_system() {
        let store = test_store(100);
        store.insert(1, killmail(1, 1));
        store.insert(2, killmail(2, 2));

        let first = store.fetch_one_event("c", &[1, 2]).unwrap();
        assert_eq!(first.system_id, 1);
        let second = store.fetch_one_event("c", &[1, 2]).unwrap();
        assert_eq!(second.system_id, 2);
        assert!(store.fetch_one_event("c", &[1, 2]).is_none());
    }

    #[test]
    fn concurrent_fetches_for_different_clients_make_progress() {
        let store = Arc::new(test_store(100));
        for id in 1..=50 {
            store.insert(1, killmail(id, 1));
        }

        // Readers only take the table read guard plus their own offset lock,
        // so a batch of clients fetching at once all complete.
        let handles: Vec<_> = (0..8)
            .map(|client| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let client_id = format!("client-{client}");
                    store.fetch_for_client(&client_id, &[1]).len()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 50);
        }
        assert_eq!(store.stats().clients, 8);
    }

    #[test]
    fn gc_reclaims_only_fully_delivered_events() {
        let store = test_store(100);
        for id in [1, 2, 3] {
            store.insert(1, killmail(id, 1));
        }
        // Client a has seen everything, client b nothing beyond seq 1.
        store.fetch_for_client("a", &[1]);
        store.fetch_one_event("b", &[1]);

        let outcome = store.gc();
        assert_eq!(outcome.evicted_min_offset, 1);
        assert_eq!(store.stats().events, 2);

        // Once b catches up, everything is reclaimable.
        store.fetch_for_client("b", &[1]);
        let outcome = store.gc();
        assert_eq!(outcome.evicted_min_offset, 2);
        assert_eq!(store.stats().events, 0);
    }

    #[test]
    fn gc_without_clients_applies_cap_only() {
        let store = test_store(2);
        for id in 1..=5 {
            store.insert(1, killmail(id, 1));
        }
        let outcome = store.gc();
        assert_eq!(outcome.evicted_min_offset, 0);
        assert_eq!(outcome.evicted_cap, 3);
        assert_eq!(store.count_for_system(1), 2);
        // Nobody was lagging because nobody was registered.
        assert_eq!(outcome.evicted_past_offset, 0);
    }

    #[test]
    fn cap_evictions_past_a_lagging_offset_are_counted() {
        let store = test_store(2);
        store.insert(1, killmail(1, 1));
        // Register the client at offset 1, then fall behind.
        store.fetch_for_client("slow", &[1]);
        for id in 2..=5 {
            store.insert(1, killmail(id, 1));
        }
        let outcome = store.gc();
        assert!(outcome.evicted_cap > 0);
        assert_eq!(outcome.evicted_past_offset, outcome.evicted_cap);
    }

    #[test]
    fn recent_for_system_limits_to_newest() {
        let store = test_store(100);
        for id in 1..=5 {
            store.insert(7, killmail(id, 7));
        }
        let since = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let picked = store.recent_for_system(7, since, 2);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].killmail.id, 4);
        assert_eq!(picked[1].killmail.id, 5);
    }

    #[test]
    fn remove_client_unpins_gc() {
        let store = test_store(100);
        store.insert(1, killmail(1, 1));
        store.fetch_for_client("x", &[1]);
        store.insert(1, killmail(2, 1));
        store.remove_client("x");
        let outcome = store.gc();
        // No offsets remain, so min-offset reclamation is skipped entirely.
        assert_eq!(outcome.evicted_min_offset, 0);
        assert_eq!(store.stats().events, 2);
    }
}
