//! Ingest pipeline: normalize, classify, validate, filter, dedup, enrich,
//! store, publish.
//!
//! The single-event and batch paths share the same preparation stages; the
//! batch path runs enrichment once across all survivors so per-entity
//! lookups are amortized. Failures become typed errors and counter bumps;
//! nothing in here can halt the poller.

use crate::cache::{Namespace, NamespacedCache};
use crate::config::Config;
use crate::enrich::EnrichmentFetcher;
use crate::error::{Error, KillmailError, Result};
use crate::esi::EsiClient;
use crate::metrics::{add, inc, Metrics};
use crate::store::EventStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use killfeed_types::{Attacker, Killmail, Sequence, Victim, ZkbMetadata};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Terminal state of one killmail's trip through the pipeline.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Stored(Sequence),
    Duplicate,
    TooOld,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub stored: usize,
    pub duplicates: usize,
    pub too_old: usize,
    pub invalid: usize,
}

pub struct Pipeline {
    cache: Arc<NamespacedCache>,
    store: Arc<EventStore>,
    enricher: EnrichmentFetcher,
    esi: Arc<EsiClient>,
    metrics: Arc<Metrics>,
    cutoff: ChronoDuration,
    killmails_ttl: Duration,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        cache: Arc<NamespacedCache>,
        store: Arc<EventStore>,
        enricher: EnrichmentFetcher,
        esi: Arc<EsiClient>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cache,
            store,
            enricher,
            esi,
            metrics,
            cutoff: ChronoDuration::from_std(config.cutoff)
                .unwrap_or_else(|_| ChronoDuration::hours(24)),
            killmails_ttl: config.cache.killmails_ttl,
        }
    }

    /// Canonicalize upstream field names and flatten the queue package shape.
    /// Pure and idempotent: `normalize(normalize(x)) == normalize(x)`.
    pub fn normalize(value: Value) -> Value {
        let Value::Object(mut object) = value else {
            return value;
        };

        // Queue packages nest the record under "killmail" beside "zkb" and
        // a top-level "killID"; flatten so both shapes look alike.
        if let Some(Value::Object(inner)) = object.remove("killmail") {
            for (key, inner_value) in inner {
                object.entry(key).or_insert(inner_value);
            }
        }

        for (variant, canonical) in [
            ("killID", "id"),
            ("killmail_id", "id"),
            ("solarSystemID", "system_id"),
            ("solar_system_id", "system_id"),
            ("killmail_time", "kill_time"),
        ] {
            if let Some(moved) = object.remove(variant) {
                object.entry(canonical).or_insert(moved);
            }
        }

        Value::Object(object)
    }

    /// Run one killmail through every stage.
    pub async fn process_value(&self, raw: Value) -> Result<Outcome> {
        inc(&self.metrics.ingest.received);
        let prepared = match self.prepare(raw).await {
            Ok(Some(killmail)) => killmail,
            Ok(None) => return Ok(Outcome::Duplicate),
            Err(Error::Killmail(KillmailError::TooOld)) => return Ok(Outcome::TooOld),
            Err(err) => {
                inc(&self.metrics.ingest.invalid);
                return Err(err);
            }
        };
        let mut batch = [prepared];
        let incomplete = self.enricher.enrich_batch(&mut batch).await;
        add(&self.metrics.ingest.enrichment_failed, incomplete as u64);
        let [killmail] = batch;
        let sequence = self.commit(killmail);
        Ok(Outcome::Stored(sequence))
    }

    /// The batch path: every stage fans out, then one enrichment call covers
    /// all survivors, then all of them are committed in input order.
    pub async fn process_batch(&self, raws: Vec<Value>) -> BatchSummary {
        let mut summary = BatchSummary::default();
        let mut survivors: Vec<Killmail> = Vec::with_capacity(raws.len());
        for raw in raws {
            inc(&self.metrics.ingest.received);
            match self.prepare(raw).await {
                Ok(Some(killmail)) => {
                    // Upstream can repeat an id within one poll window.
                    if survivors.iter().any(|k| k.id == killmail.id) {
                        inc(&self.metrics.ingest.duplicates);
                        summary.duplicates += 1;
                    } else {
                        survivors.push(killmail);
                    }
                }
                Ok(None) => summary.duplicates += 1,
                Err(Error::Killmail(KillmailError::TooOld)) => summary.too_old += 1,
                Err(err) => {
                    inc(&self.metrics.ingest.invalid);
                    summary.invalid += 1;
                    tracing::debug!(%err, "killmail rejected");
                }
            }
        }

        let incomplete = self.enricher.enrich_batch(&mut survivors).await;
        add(&self.metrics.ingest.enrichment_failed, incomplete as u64);
        for killmail in survivors {
            self.commit(killmail);
            summary.stored += 1;
        }
        summary
    }

    /// Stages 1-7: normalize, resolve partial records, validate, build,
    /// time-filter, dedup. `Ok(None)` means an idempotent duplicate.
    async fn prepare(&self, raw: Value) -> Result<Option<Killmail>> {
        let mut value = Self::normalize(raw);

        // Partial records carry only the upstream ref; fetch and merge.
        if value.get("victim").is_none() {
            value = self.resolve_partial(value).await?;
        }

        let killmail = build_killmail(&value)?;

        let age = Utc::now().signed_duration_since(killmail.kill_time);
        if age > self.cutoff {
            inc(&self.metrics.ingest.skipped_old);
            return Err(KillmailError::TooOld.into());
        }

        if self.cache.contains(Namespace::Killmails, &killmail.id.to_string()) {
            inc(&self.metrics.ingest.duplicates);
            return Ok(None);
        }
        Ok(Some(killmail))
    }

    async fn resolve_partial(&self, value: Value) -> Result<Value> {
        let id = value
            .get("id")
            .and_then(Value::as_u64)
            .ok_or(KillmailError::MissingField("id"))?;
        let hash = value
            .pointer("/zkb/hash")
            .and_then(Value::as_str)
            .ok_or(KillmailError::MissingField("zkb.hash"))?
            .to_string();
        let fetched = self.esi.killmail(id, &hash).await?;
        let mut merged = Self::normalize(fetched);
        if let (Value::Object(merged), Some(zkb)) = (&mut merged, value.get("zkb")) {
            merged.insert("zkb".to_string(), zkb.clone());
            merged
                .entry("id")
                .or_insert_with(|| Value::from(id));
        }
        Ok(merged)
    }

    /// Stage 9: cache for dedup/reads, append to the store (which publishes).
    fn commit(&self, killmail: Killmail) -> Sequence {
        let id = killmail.id;
        let system_id = killmail.system_id;
        self.cache
            .put(Namespace::Killmails, &id.to_string(), &killmail, self.killmails_ttl);
        let sequence = self.store.insert(system_id, Arc::new(killmail));
        inc(&self.metrics.ingest.stored);
        sequence
    }
}

#[derive(Deserialize)]
struct RawKillmail {
    id: Option<u64>,
    kill_time: Option<String>,
    system_id: Option<u64>,
    victim: Option<Value>,
    attackers: Option<Vec<Value>>,
    zkb: Option<ZkbMetadata>,
}

/// Stage 4-5 and 7: structural validation and construction.
fn build_killmail(value: &Value) -> Result<Killmail> {
    let raw: RawKillmail = serde_json::from_value(value.clone())
        .map_err(|err| KillmailError::InvalidFormat(err.to_string()))?;

    let id = raw.id.ok_or(KillmailError::MissingField("id"))?;
    if id == 0 {
        return Err(KillmailError::InvalidFormat("id must be positive".into()).into());
    }
    let system_id = raw.system_id.ok_or(KillmailError::MissingField("system_id"))?;
    if system_id == 0 {
        return Err(KillmailError::InvalidFormat("system_id must be positive".into()).into());
    }
    let kill_time_raw = raw.kill_time.ok_or(KillmailError::MissingField("kill_time"))?;
    let kill_time: DateTime<Utc> = kill_time_raw
        .parse()
        .map_err(|_| KillmailError::InvalidFormat(format!("unparseable kill_time: {kill_time_raw}")))?;

    let victim_raw = raw.victim.ok_or(KillmailError::MissingField("victim"))?;
    let victim: Victim = serde_json::from_value(victim_raw)
        .map_err(|err| KillmailError::InvalidFormat(format!("victim: {err}")))?;

    let attackers_raw = raw.attackers.ok_or(KillmailError::MissingField("attackers"))?;
    let attackers: Vec<Attacker> = attackers_raw
        .into_iter()
        .map(|attacker| {
            serde_json::from_value(attacker)
                .map_err(|err| KillmailError::InvalidFormat(format!("attacker: {err}")))
        })
        .collect::<std::result::Result<_, _>>()?;

    let killmail = Killmail {
        id,
        kill_time,
        system_id,
        victim,
        attackers,
        zkb: raw.zkb,
        enrichment_complete: false,
    };
    if !killmail.final_blow_consistent() {
        return Err(
            KillmailError::InvalidFormat("expected exactly one final blow".into()).into(),
        );
    }
    // Only NPC victims (no character id) can die without attackers.
    if !killmail.is_npc_victim() && killmail.attackers.is_empty() {
        return Err(KillmailError::InvalidFormat(
            "player victim with no attackers".into(),
        )
        .into());
    }
    Ok(killmail)
}
