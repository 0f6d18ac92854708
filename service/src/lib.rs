//! Real-time killmail distribution service.
//!
//! Ingest: a long-poll loop pops the upstream queue, the pipeline validates
//! and enriches each killmail, the store sequences it, and the broadcaster
//! fans it out to per-subscription workers over channel and webhook
//! transports. Everything lives in memory; recovery after a restart is
//! re-polling the queue.

pub mod api;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod enrich;
pub mod error;
pub mod esi;
pub mod metrics;
pub mod pipeline;
pub mod poller;
pub mod store;
pub mod subs;
pub mod webhook;
pub mod zkb;

use crate::broadcast::Broadcaster;
use crate::cache::NamespacedCache;
use crate::config::Config;
use crate::enrich::EnrichmentFetcher;
use crate::error::Result;
use crate::esi::{EsiClient, RetryPolicy};
use crate::metrics::{Metrics, SystemMetrics};
use crate::pipeline::Pipeline;
use crate::poller::StreamPoller;
use crate::store::EventStore;
use crate::subs::SubscriptionRegistry;
use crate::webhook::WebhookDispatcher;
use crate::zkb::QueueClient;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// The assembled service: every component constructed at boot and shared by
/// the background tasks and the API surface.
pub struct App {
    pub config: Config,
    pub metrics: Arc<Metrics>,
    pub system_metrics: SystemMetrics,
    pub cache: Arc<NamespacedCache>,
    pub store: Arc<EventStore>,
    pub registry: SubscriptionRegistry,
    pub webhooks: Arc<WebhookDispatcher>,
    pub pipeline: Arc<Pipeline>,
    shutdown_tx: watch::Sender<bool>,
}

impl App {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(NamespacedCache::new());
        let store = Arc::new(EventStore::new(&config.storage, metrics.clone()));
        let esi = Arc::new(EsiClient::new(
            &config.esi_url,
            RetryPolicy::from(&config.enrichment),
        )?);
        let enricher = EnrichmentFetcher::new(
            esi.clone(),
            cache.clone(),
            config.enrichment.max_concurrency,
            &config.cache,
        );
        let webhooks = Arc::new(WebhookDispatcher::new(config.webhook.clone(), metrics.clone())?);
        let registry = SubscriptionRegistry::new(
            config.subscription.clone(),
            config.channel.clone(),
            webhooks.clone(),
            metrics.clone(),
        );
        let pipeline = Arc::new(Pipeline::new(
            &config,
            cache.clone(),
            store.clone(),
            enricher,
            esi,
            metrics.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            metrics,
            system_metrics: SystemMetrics::new(),
            cache,
            store,
            registry,
            webhooks,
            pipeline,
            shutdown_tx,
        }))
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn the ingest loop and every housekeeping task. The broadcaster is
    /// always started; the poller too (headless mode only disables the
    /// inbound surface, never ingest).
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let broadcaster = Broadcaster::new(
            self.registry.clone(),
            self.cache.clone(),
            self.metrics.clone(),
            self.config.cache.extraction_ttl,
        );
        tokio::spawn(broadcaster.run(self.store.subscribe(), self.shutdown_signal()));

        let poller = StreamPoller::new(
            QueueClient::new(&self.config.queue_url)?,
            self.pipeline.clone(),
            self.config.stream.clone(),
            self.metrics.clone(),
            self.shutdown_signal(),
        );
        tokio::spawn(poller.run());

        self.spawn_periodic("cache-sweeper", self.config.cache.sweep_interval, {
            let cache = self.cache.clone();
            move || {
                let swept = cache.sweep();
                if swept > 0 {
                    tracing::debug!(swept, "cache sweep reclaimed entries");
                }
            }
        });

        self.spawn_periodic("store-gc", self.config.storage.gc_interval, {
            let store = self.store.clone();
            move || {
                let outcome = store.gc();
                if outcome != Default::default() {
                    tracing::debug!(?outcome, "event store gc");
                }
            }
        });

        self.spawn_periodic(
            "index-sweeper",
            self.config.subscription.index_sweep_interval,
            {
                let registry = self.registry.clone();
                move || {
                    let swept =
                        registry.system_index().sweep() + registry.character_index().sweep();
                    if swept > 0 {
                        tracing::warn!(swept, "index sweeper found orphaned rows");
                    }
                }
            },
        );

        self.spawn_periodic("status", self.config.monitoring.status_interval, {
            let metrics = self.metrics.clone();
            let store = self.store.clone();
            let registry = self.registry.clone();
            move || {
                let snapshot = metrics.snapshot();
                let store_stats = store.stats();
                tracing::info!(
                    uptime_secs = snapshot.uptime_secs,
                    received = snapshot.ingest.received,
                    stored = snapshot.ingest.stored,
                    skipped_old = snapshot.ingest.skipped_old,
                    invalid = snapshot.ingest.invalid,
                    events = store_stats.events,
                    subscriptions = registry.len(),
                    "status"
                );
            }
        });

        self.spawn_periodic(
            "system-stats",
            self.config.monitoring.system_stats_interval,
            {
                let registry = self.registry.clone();
                let store = self.store.clone();
                move || {
                    let now = Utc::now();
                    for system_id in registry.system_index().keys() {
                        let kill_count = store.count_for_system(system_id);
                        if kill_count > 0 {
                            registry.notify_system_stats(system_id, kill_count, now);
                        }
                    }
                }
            },
        );

        Ok(())
    }

    fn spawn_periodic(
        &self,
        name: &'static str,
        interval: Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) {
        let mut shutdown = self.shutdown_signal();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first interval tick fires immediately; skip it.
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = timer.tick() => tick(),
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(task = name, "periodic task stopped");
        });
    }

    /// Cancel the poller and background tasks, then drain the subscription
    /// workers (which flushes in-flight webhook posts, bounded by the drain
    /// timeout).
    pub async fn shutdown(&self) {
        tracing::info!("shutting down");
        let _ = self.shutdown_tx.send(true);
        self.registry.stop_all().await;
    }
}
