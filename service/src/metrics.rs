//! Process-wide counters and their snapshots.
//!
//! Counters are plain relaxed atomics; snapshots are serde structs served on
//! `/status` and rendered to Prometheus text on `/metrics/prometheus`.

use serde::Serialize;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use sysinfo::{Pid, ProcessesToUpdate, System};

#[derive(Default)]
pub struct IngestMetrics {
    pub received: AtomicU64,
    pub stored: AtomicU64,
    pub skipped_old: AtomicU64,
    pub invalid: AtomicU64,
    pub duplicates: AtomicU64,
    pub enrichment_failed: AtomicU64,
}

#[derive(Clone, Debug, Serialize)]
pub struct IngestSnapshot {
    pub received: u64,
    pub stored: u64,
    pub skipped_old: u64,
    pub invalid: u64,
    pub duplicates: u64,
    pub enrichment_failed: u64,
}

#[derive(Default)]
pub struct PollerMetrics {
    pub polls: AtomicU64,
    pub errors: AtomicU64,
    pub killmails_received: AtomicU64,
    pub older_killmails: AtomicU64,
    /// Gauge, maintained by the poller.
    pub active_systems: AtomicU64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PollerSnapshot {
    pub polls: u64,
    pub errors: u64,
    pub killmails_received: u64,
    pub older_killmails: u64,
    pub active_systems: u64,
}

#[derive(Default)]
pub struct StoreMetrics {
    pub inserted: AtomicU64,
    pub gc_runs: AtomicU64,
    pub evicted_min_offset: AtomicU64,
    pub evicted_cap: AtomicU64,
    /// Cap evictions that skipped past a lagging client offset. Intentional
    /// behavior, surfaced so operators can see slow consumers losing data.
    pub evicted_past_offset: AtomicU64,
}

#[derive(Clone, Debug, Serialize)]
pub struct StoreSnapshot {
    pub inserted: u64,
    pub gc_runs: u64,
    pub evicted_min_offset: u64,
    pub evicted_cap: u64,
    pub evicted_past_offset: u64,
}

#[derive(Default)]
pub struct DeliveryMetrics {
    pub matched: AtomicU64,
    pub channel_delivered: AtomicU64,
    pub webhook_delivered: AtomicU64,
    pub webhook_failed: AtomicU64,
    pub dropped_backpressure: AtomicU64,
    pub preload_delivered: AtomicU64,
    pub broadcast_lagged: AtomicU64,
    pub worker_crashes: AtomicU64,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeliverySnapshot {
    pub matched: u64,
    pub channel_delivered: u64,
    pub webhook_delivered: u64,
    pub webhook_failed: u64,
    pub dropped_backpressure: u64,
    pub preload_delivered: u64,
    pub broadcast_lagged: u64,
    pub worker_crashes: u64,
}

pub struct Metrics {
    pub ingest: IngestMetrics,
    pub poller: PollerMetrics,
    pub store: StoreMetrics,
    pub delivery: DeliveryMetrics,
    started_at: Instant,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub ingest: IngestSnapshot,
    pub poller: PollerSnapshot,
    pub store: StoreSnapshot,
    pub delivery: DeliverySnapshot,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ingest: IngestMetrics::default(),
            poller: PollerMetrics::default(),
            store: StoreMetrics::default(),
            delivery: DeliveryMetrics::default(),
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            ingest: IngestSnapshot {
                received: load(&self.ingest.received),
                stored: load(&self.ingest.stored),
                skipped_old: load(&self.ingest.skipped_old),
                invalid: load(&self.ingest.invalid),
                duplicates: load(&self.ingest.duplicates),
                enrichment_failed: load(&self.ingest.enrichment_failed),
            },
            poller: PollerSnapshot {
                polls: load(&self.poller.polls),
                errors: load(&self.poller.errors),
                killmails_received: load(&self.poller.killmails_received),
                older_killmails: load(&self.poller.older_killmails),
                active_systems: load(&self.poller.active_systems),
            },
            store: StoreSnapshot {
                inserted: load(&self.store.inserted),
                gc_runs: load(&self.store.gc_runs),
                evicted_min_offset: load(&self.store.evicted_min_offset),
                evicted_cap: load(&self.store.evicted_cap),
                evicted_past_offset: load(&self.store.evicted_past_offset),
            },
            delivery: DeliverySnapshot {
                matched: load(&self.delivery.matched),
                channel_delivered: load(&self.delivery.channel_delivered),
                webhook_delivered: load(&self.delivery.webhook_delivered),
                webhook_failed: load(&self.delivery.webhook_failed),
                dropped_backpressure: load(&self.delivery.dropped_backpressure),
                preload_delivered: load(&self.delivery.preload_delivered),
                broadcast_lagged: load(&self.delivery.broadcast_lagged),
                worker_crashes: load(&self.delivery.worker_crashes),
            },
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn add(counter: &AtomicU64, value: u64) {
    counter.fetch_add(value, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct SystemMetricsSnapshot {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
    pub cpu_usage_percent: f64,
}

pub struct SystemMetrics {
    system: Mutex<System>,
    pid: Pid,
}

impl SystemMetrics {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    pub fn snapshot(&self) -> SystemMetricsSnapshot {
        let mut system = self.system.lock().unwrap();
        system.refresh_cpu_usage();
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), false);

        if let Some(process) = system.process(self.pid) {
            SystemMetricsSnapshot {
                rss_bytes: process.memory().saturating_mul(1024),
                virtual_bytes: process.virtual_memory().saturating_mul(1024),
                cpu_usage_percent: process.cpu_usage() as f64,
            }
        } else {
            SystemMetricsSnapshot {
                rss_bytes: 0,
                virtual_bytes: 0,
                cpu_usage_percent: 0.0,
            }
        }
    }
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Render the counter set in Prometheus text exposition format.
pub fn render_prometheus(snapshot: &MetricsSnapshot, system: &SystemMetricsSnapshot) -> String {
    let mut out = String::new();

    append_counter(&mut out, "killfeed_ingest_received_total", snapshot.ingest.received);
    append_counter(&mut out, "killfeed_ingest_stored_total", snapshot.ingest.stored);
    append_counter(&mut out, "killfeed_ingest_skipped_old_total", snapshot.ingest.skipped_old);
    append_counter(&mut out, "killfeed_ingest_invalid_total", snapshot.ingest.invalid);
    append_counter(&mut out, "killfeed_ingest_duplicates_total", snapshot.ingest.duplicates);
    append_counter(
        &mut out,
        "killfeed_ingest_enrichment_failed_total",
        snapshot.ingest.enrichment_failed,
    );

    append_counter(&mut out, "killfeed_poller_polls_total", snapshot.poller.polls);
    append_counter(&mut out, "killfeed_poller_errors_total", snapshot.poller.errors);
    append_counter(
        &mut out,
        "killfeed_poller_killmails_received_total",
        snapshot.poller.killmails_received,
    );
    append_counter(
        &mut out,
        "killfeed_poller_older_killmails_total",
        snapshot.poller.older_killmails,
    );
    append_gauge(&mut out, "killfeed_poller_active_systems", snapshot.poller.active_systems);

    append_counter(&mut out, "killfeed_store_inserted_total", snapshot.store.inserted);
    append_counter(&mut out, "killfeed_store_gc_runs_total", snapshot.store.gc_runs);
    append_counter(
        &mut out,
        "killfeed_store_evicted_min_offset_total",
        snapshot.store.evicted_min_offset,
    );
    append_counter(&mut out, "killfeed_store_evicted_cap_total", snapshot.store.evicted_cap);
    append_counter(
        &mut out,
        "killfeed_store_evicted_past_offset_total",
        snapshot.store.evicted_past_offset,
    );

    append_counter(&mut out, "killfeed_delivery_matched_total", snapshot.delivery.matched);
    append_counter(
        &mut out,
        "killfeed_delivery_channel_total",
        snapshot.delivery.channel_delivered,
    );
    append_counter(
        &mut out,
        "killfeed_delivery_webhook_total",
        snapshot.delivery.webhook_delivered,
    );
    append_counter(
        &mut out,
        "killfeed_delivery_webhook_failed_total",
        snapshot.delivery.webhook_failed,
    );
    append_counter(
        &mut out,
        "killfeed_delivery_dropped_backpressure_total",
        snapshot.delivery.dropped_backpressure,
    );
    append_counter(
        &mut out,
        "killfeed_delivery_preload_total",
        snapshot.delivery.preload_delivered,
    );
    append_counter(
        &mut out,
        "killfeed_delivery_broadcast_lagged_total",
        snapshot.delivery.broadcast_lagged,
    );
    append_counter(
        &mut out,
        "killfeed_delivery_worker_crashes_total",
        snapshot.delivery.worker_crashes,
    );

    append_gauge(&mut out, "killfeed_system_rss_bytes", system.rss_bytes);
    append_gauge(&mut out, "killfeed_system_virtual_bytes", system.virtual_bytes);
    let _ = writeln!(out, "# TYPE killfeed_system_cpu_usage_percent gauge");
    let _ = writeln!(out, "killfeed_system_cpu_usage_percent {}", system.cpu_usage_percent);

    out
}

fn append_counter(out: &mut String, name: &str, value: u64) {
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn append_gauge(out: &mut String, name: &str, value: u64) {
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = Metrics::new();
        inc(&metrics.ingest.received);
        inc(&metrics.ingest.received);
        inc(&metrics.ingest.stored);
        add(&metrics.delivery.dropped_backpressure, 5);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.ingest.received, 2);
        assert_eq!(snapshot.ingest.stored, 1);
        assert_eq!(snapshot.delivery.dropped_backpressure, 5);
    }

    #[test]
    fn prometheus_rendering_includes_counters() {
        let metrics = Metrics::new();
        inc(&metrics.ingest.stored);
        let body = render_prometheus(
            &metrics.snapshot(),
            &SystemMetricsSnapshot {
                rss_bytes: 1,
                virtual_bytes: 2,
                cpu_usage_percent: 0.5,
            },
        );
        assert!(body.contains("killfeed_ingest_stored_total 1"));
        assert!(body.contains("# TYPE killfeed_poller_active_systems gauge"));
    }
}
