//! Batched, cached enrichment of killmails with entity names.
//!
//! One batch makes at most one upstream fetch per unique id across the whole
//! batch: ids are collected into per-kind sets, split against the cache, and
//! only the misses go out, with bounded concurrency. A failed lookup leaves
//! the name null and the event flowing; a 404 is cached as known-absent so
//! repeat offenders do not churn the upstream.

use crate::cache::{Lookup, Namespace, NamespacedCache};
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::esi::EsiClient;
use futures::stream::{self, StreamExt};
use killfeed_types::Killmail;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum EntityKind {
    Character,
    Corporation,
    Alliance,
    ShipType,
}

impl EntityKind {
    fn namespace(&self) -> Namespace {
        match self {
            EntityKind::Character => Namespace::Characters,
            EntityKind::Corporation => Namespace::Corporations,
            EntityKind::Alliance => Namespace::Alliances,
            EntityKind::ShipType => Namespace::ShipTypes,
        }
    }
}

/// Resolved names for one batch. `None` means known-absent upstream.
type NameMap = HashMap<u64, Option<String>>;

pub struct EnrichmentFetcher {
    esi: Arc<EsiClient>,
    cache: Arc<NamespacedCache>,
    max_concurrency: usize,
    name_ttl: Duration,
    absent_ttl: Duration,
}

impl EnrichmentFetcher {
    pub fn new(
        esi: Arc<EsiClient>,
        cache: Arc<NamespacedCache>,
        max_concurrency: usize,
        cache_config: &CacheConfig,
    ) -> Self {
        Self {
            esi,
            cache,
            max_concurrency: max_concurrency.max(1),
            name_ttl: cache_config.esi_ttl,
            absent_ttl: cache_config.extraction_ttl,
        }
    }

    /// Enrich every killmail in place. Returns the number of killmails whose
    /// enrichment is incomplete (some lookup errored).
    pub async fn enrich_batch(&self, killmails: &mut [Killmail]) -> usize {
        let mut characters = HashSet::new();
        let mut corporations = HashSet::new();
        let mut alliances = HashSet::new();
        let mut ship_types = HashSet::new();
        for killmail in killmails.iter() {
            collect_ids(
                killmail,
                &mut characters,
                &mut corporations,
                &mut alliances,
                &mut ship_types,
            );
        }

        let (character_names, characters_failed) =
            self.resolve(EntityKind::Character, characters).await;
        let (corporation_names, corporations_failed) =
            self.resolve(EntityKind::Corporation, corporations).await;
        let (alliance_names, alliances_failed) =
            self.resolve(EntityKind::Alliance, alliances).await;
        let (ship_names, ship_types_failed) = self.resolve(EntityKind::ShipType, ship_types).await;

        let mut incomplete = 0;
        for killmail in killmails.iter_mut() {
            apply_names(
                killmail,
                &character_names,
                &corporation_names,
                &alliance_names,
                &ship_names,
            );
            let (mut c, mut co, mut al, mut st) =
                (HashSet::new(), HashSet::new(), HashSet::new(), HashSet::new());
            collect_ids(killmail, &mut c, &mut co, &mut al, &mut st);
            let complete = c.is_disjoint(&characters_failed)
                && co.is_disjoint(&corporations_failed)
                && al.is_disjoint(&alliances_failed)
                && st.is_disjoint(&ship_types_failed);
            killmail.enrichment_complete = complete;
            if !complete {
                incomplete += 1;
            }
        }
        incomplete
    }

    /// Split `ids` against the cache, fetch the misses concurrently, and
    /// return the combined name map plus the ids whose fetch errored.
    async fn resolve(&self, kind: EntityKind, ids: HashSet<u64>) -> (NameMap, HashSet<u64>) {
        let namespace = kind.namespace();
        let mut names = NameMap::with_capacity(ids.len());
        let mut misses = Vec::new();
        for id in ids {
            match self.cache.get::<Option<String>>(namespace, &id.to_string()) {
                Lookup::Hit(cached) => {
                    names.insert(id, cached);
                }
                _ => misses.push(id),
            }
        }

        let mut failed = HashSet::new();
        let mut fetched = stream::iter(misses)
            .map(|id| async move { (id, self.fetch(kind, id).await) })
            .buffer_unordered(self.max_concurrency);
        while let Some((id, result)) = fetched.next().await {
            match result {
                Ok(name) => {
                    self.cache
                        .put(namespace, &id.to_string(), &Some(name.clone()), self.name_ttl);
                    names.insert(id, Some(name));
                }
                Err(Error::NotFound(_)) => {
                    // Cache the absence briefly to stop repeat lookups.
                    self.cache
                        .put(namespace, &id.to_string(), &None::<String>, self.absent_ttl);
                    names.insert(id, None);
                }
                Err(err) => {
                    tracing::debug!(kind = ?kind, id, %err, "enrichment lookup failed");
                    failed.insert(id);
                }
            }
        }
        (names, failed)
    }

    async fn fetch(&self, kind: EntityKind, id: u64) -> Result<String> {
        match kind {
            EntityKind::Character => self.esi.character_name(id).await,
            EntityKind::Corporation => self.esi.corporation_name(id).await,
            EntityKind::Alliance => self.esi.alliance_name(id).await,
            EntityKind::ShipType => self.esi.ship_type_name(id).await,
        }
    }
}

fn collect_ids(
    killmail: &Killmail,
    characters: &mut HashSet<u64>,
    corporations: &mut HashSet<u64>,
    alliances: &mut HashSet<u64>,
    ship_types: &mut HashSet<u64>,
) {
    let victim = &killmail.victim;
    characters.extend(victim.character_id);
    corporations.extend(victim.corporation_id);
    alliances.extend(victim.alliance_id);
    ship_types.insert(victim.ship_type_id);
    for attacker in &killmail.attackers {
        characters.extend(attacker.character_id);
        corporations.extend(attacker.corporation_id);
        alliances.extend(attacker.alliance_id);
        ship_types.extend(attacker.ship_type_id);
    }
}

fn apply_names(
    killmail: &mut Killmail,
    characters: &NameMap,
    corporations: &NameMap,
    alliances: &NameMap,
    ship_types: &NameMap,
) {
    let lookup = |map: &NameMap, id: Option<u64>| -> Option<String> {
        id.and_then(|id| map.get(&id).cloned().flatten())
    };
    let victim = &mut killmail.victim;
    victim.character_name = lookup(characters, victim.character_id);
    victim.corporation_name = lookup(corporations, victim.corporation_id);
    victim.alliance_name = lookup(alliances, victim.alliance_id);
    victim.ship_name = lookup(ship_types, Some(victim.ship_type_id));
    for attacker in &mut killmail.attackers {
        attacker.character_name = lookup(characters, attacker.character_id);
        attacker.corporation_name = lookup(corporations, attacker.corporation_id);
        attacker.alliance_name = lookup(alliances, attacker.alliance_id);
        attacker.ship_name = lookup(ship_types, attacker.ship_type_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::esi::RetryPolicy;
    use axum::extract::{Path, State as AxumState};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use chrono::{TimeZone, Utc};
    use killfeed_types::{Attacker, Victim};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockEsi {
        characters: AtomicUsize,
        corporations: AtomicUsize,
        alliances: AtomicUsize,
        ship_types: AtomicUsize,
        fail_characters: bool,
    }

    async fn spawn_mock(state: Arc<MockEsi>) -> (String, tokio::task::JoinHandle<()>) {
        let router = Router::new()
            .route(
                "/characters/:id",
                get(|AxumState(state): AxumState<Arc<MockEsi>>, Path(id): Path<u64>| async move {
                    state.characters.fetch_add(1, Ordering::SeqCst);
                    if state.fail_characters {
                        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                    }
                    Json(serde_json::json!({"name": format!("Character {id}")})).into_response()
                }),
            )
            .route(
                "/corporations/:id",
                get(|AxumState(state): AxumState<Arc<MockEsi>>, Path(id): Path<u64>| async move {
                    state.corporations.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({"name": format!("Corp {id}")})).into_response()
                }),
            )
            .route(
                "/alliances/:id",
                get(|AxumState(state): AxumState<Arc<MockEsi>>, Path(_id): Path<u64>| async move {
                    state.alliances.fetch_add(1, Ordering::SeqCst);
                    StatusCode::NOT_FOUND.into_response()
                }),
            )
            .route(
                "/universe/types/:id",
                get(|AxumState(state): AxumState<Arc<MockEsi>>, Path(id): Path<u64>| async move {
                    state.ship_types.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({"name": format!("Ship {id}")})).into_response()
                }),
            )
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router.into_make_service()).await.unwrap();
        });
        (format!("http://{addr}"), handle)
    }

    fn fetcher(base_url: &str, cache: Arc<NamespacedCache>) -> EnrichmentFetcher {
        let retry = RetryPolicy {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            factor: 2,
        };
        let esi = Arc::new(EsiClient::new(base_url, retry).unwrap());
        EnrichmentFetcher::new(esi, cache, 10, &Config::default().cache)
    }

    fn killmail(id: u64, victim_character: u64, ship_type: u64) -> Killmail {
        Killmail {
            id,
            kill_time: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            system_id: 30000142,
            victim: Victim {
                character_id: Some(victim_character),
                corporation_id: Some(98000001),
                ship_type_id: ship_type,
                damage_taken: 100,
                ..Default::default()
            },
            attackers: vec![Attacker {
                character_id: Some(victim_character),
                damage_done: 100,
                final_blow: true,
                ..Default::default()
            }],
            zkb: None,
            enrichment_complete: false,
        }
    }

    #[tokio::test]
    async fn batch_fetches_each_unique_id_once() {
        let mock = Arc::new(MockEsi::default());
        let (base_url, handle) = spawn_mock(mock.clone()).await;
        let fetcher = fetcher(&base_url, Arc::new(NamespacedCache::new()));

        // 50 killmails, one victim character, three ship types.
        let mut batch: Vec<Killmail> = (0..50)
            .map(|i| killmail(1000 + i, 500, 580 + (i % 3)))
            .collect();
        let incomplete = fetcher.enrich_batch(&mut batch).await;

        assert_eq!(incomplete, 0);
        assert_eq!(mock.characters.load(Ordering::SeqCst), 1);
        assert_eq!(mock.ship_types.load(Ordering::SeqCst), 3);
        assert_eq!(mock.corporations.load(Ordering::SeqCst), 1);
        assert_eq!(batch[0].victim.character_name.as_deref(), Some("Character 500"));
        assert_eq!(batch[0].victim.ship_name.as_deref(), Some("Ship 580"));
        handle.abort();
    }

    #[tokio::test]
    async fn second_batch_is_served_from_cache() {
        let mock = Arc::new(MockEsi::default());
        let (base_url, handle) = spawn_mock(mock.clone()).await;
        let cache = Arc::new(NamespacedCache::new());
        let fetcher = fetcher(&base_url, cache);

        let mut batch = vec![killmail(1, 500, 587)];
        fetcher.enrich_batch(&mut batch).await;
        let mut batch = vec![killmail(2, 500, 587)];
        fetcher.enrich_batch(&mut batch).await;

        assert_eq!(mock.characters.load(Ordering::SeqCst), 1);
        assert_eq!(mock.ship_types.load(Ordering::SeqCst), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn missing_entities_are_cached_as_absent() {
        let mock = Arc::new(MockEsi::default());
        let (base_url, handle) = spawn_mock(mock.clone()).await;
        let cache = Arc::new(NamespacedCache::new());
        let fetcher = fetcher(&base_url, cache);

        let mut km = killmail(1, 500, 587);
        km.victim.alliance_id = Some(99000001);
        let incomplete = fetcher.enrich_batch(std::slice::from_mut(&mut km)).await;

        // 404 is a resolved answer, not a failure.
        assert_eq!(incomplete, 0);
        assert!(km.enrichment_complete);
        assert!(km.victim.alliance_name.is_none());

        let mut km = killmail(2, 500, 587);
        km.victim.alliance_id = Some(99000001);
        fetcher.enrich_batch(std::slice::from_mut(&mut km)).await;
        assert_eq!(mock.alliances.load(Ordering::SeqCst), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn lookup_failure_leaves_event_incomplete_but_named_where_possible() {
        let mock = Arc::new(MockEsi {
            fail_characters: true,
            ..Default::default()
        });
        let (base_url, handle) = spawn_mock(mock.clone()).await;
        let fetcher = fetcher(&base_url, Arc::new(NamespacedCache::new()));

        let mut km = killmail(1, 500, 587);
        let incomplete = fetcher.enrich_batch(std::slice::from_mut(&mut km)).await;

        assert_eq!(incomplete, 1);
        assert!(!km.enrichment_complete);
        assert!(km.victim.character_name.is_none());
        // Other dimensions still resolved.
        assert_eq!(km.victim.ship_name.as_deref(), Some("Ship 587"));
        handle.abort();
    }
}
