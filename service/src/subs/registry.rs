//! Per-subscription workers and their lifecycle.
//!
//! Every subscription owns one tokio task with a bounded inbox. The
//! broadcaster fires deliveries at the inbox and never blocks: a full inbox
//! drops the delivery and bumps a counter. A watcher task per worker gives
//! one-for-one supervision: whatever way the worker dies (connection gone,
//! stop, panic) the watcher scrubs the subscription out of both indexes, so
//! a crash in one subscription cannot touch another.

use super::{SubscriptionId, SubscriptionIndex};
use crate::config::{ChannelConfig, SubscriptionConfig};
use crate::error::{Error, Result};
use crate::metrics::{inc, Metrics};
use crate::webhook::WebhookDispatcher;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use killfeed_types::{
    CharacterId, EventRecord, ServerFrame, SubscriptionView, SystemId,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

/// How a subscription receives its events.
pub enum Transport {
    /// Bound to a live channel connection; frames go out its send queue.
    Channel {
        outbound: mpsc::Sender<ServerFrame>,
    },
    /// Stateless HTTP callback.
    Webhook { callback_url: String },
}

pub struct SubscriptionSpec {
    pub subscriber_id: String,
    pub systems: HashSet<SystemId>,
    pub characters: HashSet<CharacterId>,
    pub transport: Transport,
}

enum WorkerMessage {
    Deliver(Vec<EventRecord>),
    Preload(Vec<EventRecord>),
    SystemStats {
        system_id: SystemId,
        kill_count: u64,
        timestamp: DateTime<Utc>,
    },
    UpdateSystems(HashSet<SystemId>),
    UpdateCharacters(HashSet<CharacterId>),
}

struct WorkerHandle {
    inbox: mpsc::Sender<WorkerMessage>,
    worker_abort: AbortHandle,
    watcher: JoinHandle<()>,
    subscriber_id: String,
    callback_url: Option<String>,
    created_at: DateTime<Utc>,
    systems: HashSet<SystemId>,
    characters: HashSet<CharacterId>,
}

struct RegistryInner {
    workers: DashMap<SubscriptionId, WorkerHandle>,
    system_index: SubscriptionIndex<SystemId>,
    character_index: SubscriptionIndex<CharacterId>,
    config: SubscriptionConfig,
    channel_config: ChannelConfig,
    webhooks: Arc<WebhookDispatcher>,
    metrics: Arc<Metrics>,
}

#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(
        config: SubscriptionConfig,
        channel_config: ChannelConfig,
        webhooks: Arc<WebhookDispatcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                workers: DashMap::new(),
                system_index: SubscriptionIndex::new("systems"),
                character_index: SubscriptionIndex::new("characters"),
                config,
                channel_config,
                webhooks,
                metrics,
            }),
        }
    }

    pub fn system_index(&self) -> &SubscriptionIndex<SystemId> {
        &self.inner.system_index
    }

    pub fn character_index(&self) -> &SubscriptionIndex<CharacterId> {
        &self.inner.character_index
    }

    /// Create the subscription, index it, and spawn its worker. Returns the
    /// new subscription id.
    pub fn register(&self, spec: SubscriptionSpec) -> Result<SubscriptionId> {
        self.validate_sets(&spec.systems, &spec.characters)?;

        let id: SubscriptionId = Uuid::new_v4().to_string();
        self.inner.system_index.add(&id, spec.systems.iter().copied());
        self.inner
            .character_index
            .add(&id, spec.characters.iter().copied());

        let (inbox_tx, inbox_rx) = mpsc::channel(self.inner.config.inbox_capacity);
        let worker = Worker {
            id: id.clone(),
            subscriber_id: spec.subscriber_id.clone(),
            transport: spec.transport,
            systems: spec.systems.clone(),
            characters: spec.characters.clone(),
            webhooks: self.inner.webhooks.clone(),
            metrics: self.inner.metrics.clone(),
        };
        let callback_url = match &worker.transport {
            Transport::Webhook { callback_url } => Some(callback_url.clone()),
            Transport::Channel { .. } => None,
        };
        let worker_handle = tokio::spawn(worker.run(inbox_rx));
        let worker_abort = worker_handle.abort_handle();

        // One-for-one supervision: the watcher scrubs this subscription on
        // any exit, panics included, and nothing else.
        let watcher = {
            let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
            let id = id.clone();
            tokio::spawn(async move {
                let outcome = worker_handle.await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(err) = outcome {
                    if err.is_panic() {
                        inc(&inner.metrics.delivery.worker_crashes);
                        tracing::warn!(subscription_id = %id, "subscription worker panicked");
                    }
                }
                inner.system_index.remove(&id);
                inner.character_index.remove(&id);
                inner.workers.remove(&id);
                tracing::debug!(subscription_id = %id, "subscription cleaned up");
            })
        };

        self.inner.workers.insert(
            id.clone(),
            WorkerHandle {
                inbox: inbox_tx,
                worker_abort,
                watcher,
                subscriber_id: spec.subscriber_id,
                callback_url,
                created_at: Utc::now(),
                systems: spec.systems,
                characters: spec.characters,
            },
        );
        tracing::info!(subscription_id = %id, "subscription registered");
        Ok(id)
    }

    /// Fire-and-forget delivery; a slow subscriber loses events, not the
    /// ingest path.
    pub fn deliver(&self, subscription_id: &str, events: Vec<EventRecord>) {
        self.send(subscription_id, WorkerMessage::Deliver(events));
    }

    /// Trickle `events` to the subscription in bounded chunks so a large
    /// backfill cannot starve real-time pushes.
    pub fn schedule_preload(&self, subscription_id: &str, events: Vec<EventRecord>) {
        if events.is_empty() {
            return;
        }
        let registry = self.clone();
        let id = subscription_id.to_string();
        let chunk = self.inner.channel_config.preload_chunk.max(1);
        let interval = self.inner.channel_config.preload_interval;
        tokio::spawn(async move {
            for chunk in events.chunks(chunk) {
                registry.send(&id, WorkerMessage::Preload(chunk.to_vec()));
                tokio::time::sleep(interval).await;
            }
        });
    }

    /// Push a `system_stats` frame to every channel subscription watching
    /// `system_id`.
    pub fn notify_system_stats(
        &self,
        system_id: SystemId,
        kill_count: u64,
        timestamp: DateTime<Utc>,
    ) {
        for subscription_id in self.inner.system_index.find(system_id) {
            self.send(
                &subscription_id,
                WorkerMessage::SystemStats {
                    system_id,
                    kill_count,
                    timestamp,
                },
            );
        }
    }

    pub fn replace_systems(&self, subscription_id: &str, systems: HashSet<SystemId>) -> Result<()> {
        let Some(mut handle) = self.inner.workers.get_mut(subscription_id) else {
            return Err(Error::NotFound(format!("subscription {subscription_id}")));
        };
        self.validate_sets(&systems, &handle.characters)?;
        self.inner.system_index.update(subscription_id, &systems);
        handle.systems = systems.clone();
        drop(handle);
        self.send(subscription_id, WorkerMessage::UpdateSystems(systems));
        Ok(())
    }

    pub fn replace_characters(
        &self,
        subscription_id: &str,
        characters: HashSet<CharacterId>,
    ) -> Result<()> {
        let Some(mut handle) = self.inner.workers.get_mut(subscription_id) else {
            return Err(Error::NotFound(format!("subscription {subscription_id}")));
        };
        self.validate_sets(&handle.systems, &characters)?;
        self.inner
            .character_index
            .update(subscription_id, &characters);
        handle.characters = characters.clone();
        drop(handle);
        self.send(subscription_id, WorkerMessage::UpdateCharacters(characters));
        Ok(())
    }

    /// Current entity sets, for delta subscribe/unsubscribe operations.
    pub fn entity_sets(
        &self,
        subscription_id: &str,
    ) -> Option<(HashSet<SystemId>, HashSet<CharacterId>)> {
        self.inner
            .workers
            .get(subscription_id)
            .map(|handle| (handle.systems.clone(), handle.characters.clone()))
    }

    /// Stop the worker, draining queued deliveries within the configured
    /// timeout, then clean up.
    pub async fn stop(&self, subscription_id: &str) {
        let Some((id, handle)) = self.inner.workers.remove(subscription_id) else {
            return;
        };
        self.inner.system_index.remove(&id);
        self.inner.character_index.remove(&id);
        // Dropping the only inbox sender lets the worker drain and exit.
        let WorkerHandle {
            inbox,
            worker_abort,
            watcher,
            ..
        } = handle;
        drop(inbox);
        if tokio::time::timeout(self.inner.config.drain_timeout, watcher)
            .await
            .is_err()
        {
            worker_abort.abort();
            tracing::debug!(subscription_id = %id, "worker drain timed out, aborted");
        }
    }

    /// Remove every subscription registered by `subscriber_id`. Returns how
    /// many were stopped.
    pub async fn stop_by_subscriber(&self, subscriber_id: &str) -> usize {
        let ids: Vec<SubscriptionId> = self
            .inner
            .workers
            .iter()
            .filter(|entry| entry.subscriber_id == subscriber_id)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &ids {
            self.stop(id).await;
        }
        ids.len()
    }

    /// Drain all workers, bounded per worker. Used at shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<SubscriptionId> = self
            .inner
            .workers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in &ids {
            self.stop(id).await;
        }
    }

    pub fn views(&self) -> Vec<SubscriptionView> {
        self.inner
            .workers
            .iter()
            .map(|entry| view_of(entry.key(), &entry))
            .collect()
    }

    pub fn view(&self, subscription_id: &str) -> Option<SubscriptionView> {
        self.inner
            .workers
            .get(subscription_id)
            .map(|handle| view_of(subscription_id, &handle))
    }

    pub fn len(&self) -> usize {
        self.inner.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.workers.is_empty()
    }

    /// Abort a worker without going through the registry bookkeeping, as a
    /// crash would. Test-only.
    #[cfg(test)]
    pub(crate) fn kill_worker(&self, subscription_id: &str) {
        if let Some(handle) = self.inner.workers.get(subscription_id) {
            handle.worker_abort.abort();
        }
    }

    fn validate_sets(
        &self,
        systems: &HashSet<SystemId>,
        characters: &HashSet<CharacterId>,
    ) -> Result<()> {
        if systems.is_empty() && characters.is_empty() {
            return Err(Error::Validation(
                "subscription needs at least one system or character".into(),
            ));
        }
        if systems.len() > self.inner.config.max_systems {
            return Err(Error::Validation(format!(
                "too many systems: {} (max {})",
                systems.len(),
                self.inner.config.max_systems
            )));
        }
        if characters.len() > self.inner.config.max_characters {
            return Err(Error::Validation(format!(
                "too many characters: {} (max {})",
                characters.len(),
                self.inner.config.max_characters
            )));
        }
        Ok(())
    }

    fn send(&self, subscription_id: &str, message: WorkerMessage) {
        let Some(handle) = self.inner.workers.get(subscription_id) else {
            return;
        };
        match handle.inbox.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                inc(&self.inner.metrics.delivery.dropped_backpressure);
                tracing::warn!(subscription_id, "worker inbox full, delivery dropped");
            }
            // Worker already dying; the watcher will clean up.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

fn view_of(id: &str, handle: &WorkerHandle) -> SubscriptionView {
    let mut system_ids: Vec<SystemId> = handle.systems.iter().copied().collect();
    system_ids.sort_unstable();
    let mut character_ids: Vec<CharacterId> = handle.characters.iter().copied().collect();
    character_ids.sort_unstable();
    SubscriptionView {
        id: id.to_string(),
        subscriber_id: handle.subscriber_id.clone(),
        system_ids,
        character_ids,
        callback_url: handle.callback_url.clone(),
        created_at: handle.created_at,
    }
}

/// State owned exclusively by the worker task.
struct Worker {
    id: SubscriptionId,
    subscriber_id: String,
    transport: Transport,
    systems: HashSet<SystemId>,
    characters: HashSet<CharacterId>,
    webhooks: Arc<WebhookDispatcher>,
    metrics: Arc<Metrics>,
}

impl Worker {
    async fn run(mut self, mut inbox: mpsc::Receiver<WorkerMessage>) {
        // recv() drains remaining messages after the registry drops the
        // sender, which is exactly the stop-with-drain contract.
        while let Some(message) = inbox.recv().await {
            let alive = match message {
                WorkerMessage::Deliver(events) => self.forward(events, false).await,
                WorkerMessage::Preload(events) => self.forward(events, true).await,
                WorkerMessage::SystemStats {
                    system_id,
                    kill_count,
                    timestamp,
                } => {
                    self.push_frame(ServerFrame::SystemStats {
                        system_id,
                        kill_count,
                        timestamp,
                    })
                    .await
                }
                WorkerMessage::UpdateSystems(systems) => {
                    self.systems = systems;
                    tracing::debug!(
                        subscription_id = %self.id,
                        systems = self.systems.len(),
                        "subscription systems updated"
                    );
                    true
                }
                WorkerMessage::UpdateCharacters(characters) => {
                    self.characters = characters;
                    tracing::debug!(
                        subscription_id = %self.id,
                        characters = self.characters.len(),
                        "subscription characters updated"
                    );
                    true
                }
            };
            if !alive {
                tracing::debug!(
                    subscription_id = %self.id,
                    subscriber_id = %self.subscriber_id,
                    "transport gone, worker exiting"
                );
                break;
            }
        }
    }

    /// Returns false when the transport is dead and the worker should exit.
    async fn forward(&self, events: Vec<EventRecord>, preload: bool) -> bool {
        match &self.transport {
            Transport::Channel { outbound } => {
                for event in events {
                    let frame = ServerFrame::KillmailUpdate {
                        killmail: (*event.killmail).clone(),
                    };
                    if outbound.send(frame).await.is_err() {
                        return false;
                    }
                    if preload {
                        inc(&self.metrics.delivery.preload_delivered);
                    } else {
                        inc(&self.metrics.delivery.channel_delivered);
                    }
                }
                true
            }
            Transport::Webhook { callback_url } => {
                let mut by_system: HashMap<SystemId, Vec<EventRecord>> = HashMap::new();
                for event in events {
                    by_system.entry(event.system_id).or_default().push(event);
                }
                for (system_id, group) in by_system {
                    let kills = group
                        .into_iter()
                        .map(|event| (*event.killmail).clone())
                        .collect();
                    if let Err(err) = self.webhooks.deliver(callback_url, system_id, kills).await {
                        // Webhook failures are logged and bounded; they do
                        // not terminate the subscription.
                        tracing::warn!(
                            subscription_id = %self.id,
                            %callback_url,
                            %err,
                            "webhook delivery failed"
                        );
                    }
                }
                true
            }
        }
    }

    async fn push_frame(&self, frame: ServerFrame) -> bool {
        match &self.transport {
            Transport::Channel { outbound } => outbound.send(frame).await.is_ok(),
            Transport::Webhook { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::TimeZone;
    use killfeed_types::{Killmail, Victim};
    use std::time::Duration;

    fn registry() -> SubscriptionRegistry {
        let config = Config::default();
        let metrics = Arc::new(Metrics::new());
        let webhooks =
            Arc::new(WebhookDispatcher::new(config.webhook.clone(), metrics.clone()).unwrap());
        SubscriptionRegistry::new(
            config.subscription.clone(),
            config.channel.clone(),
            webhooks,
            metrics,
        )
    }

    fn record(id: u64, system_id: SystemId) -> EventRecord {
        EventRecord {
            sequence: id,
            system_id,
            killmail: Arc::new(Killmail {
                id,
                kill_time: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
                system_id,
                victim: Victim {
                    ship_type_id: 587,
                    damage_taken: 1,
                    ..Default::default()
                },
                attackers: vec![],
                zkb: None,
                enrichment_complete: true,
            }),
        }
    }

    fn channel_spec(
        systems: impl IntoIterator<Item = SystemId>,
    ) -> (SubscriptionSpec, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(64);
        (
            SubscriptionSpec {
                subscriber_id: "tester".into(),
                systems: systems.into_iter().collect(),
                characters: HashSet::new(),
                transport: Transport::Channel { outbound: tx },
            },
            rx,
        )
    }

    #[tokio::test]
    async fn register_indexes_and_delivers() {
        let registry = registry();
        let (spec, mut rx) = channel_spec([30000142]);
        let id = registry.register(spec).unwrap();

        assert_eq!(registry.system_index().find(30000142), vec![id.clone()]);

        registry.deliver(&id, vec![record(1001, 30000142)]);
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match frame {
            ServerFrame::KillmailUpdate { killmail } => assert_eq!(killmail.id, 1001),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_subscription_is_rejected() {
        let registry = registry();
        let (tx, _rx) = mpsc::channel(1);
        let err = registry
            .register(SubscriptionSpec {
                subscriber_id: "tester".into(),
                systems: HashSet::new(),
                characters: HashSet::new(),
                transport: Transport::Channel { outbound: tx },
            })
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn limits_are_enforced() {
        let registry = registry();
        let (tx, _rx) = mpsc::channel(1);
        let err = registry
            .register(SubscriptionSpec {
                subscriber_id: "tester".into(),
                systems: (1..=101).collect(),
                characters: HashSet::new(),
                transport: Transport::Channel { outbound: tx },
            })
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let (spec, _rx) = channel_spec([1]);
        let id = registry.register(spec).unwrap();
        let err = registry
            .replace_characters(&id, (1..=1001).collect())
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn replace_systems_updates_index_and_worker() {
        let registry = registry();
        let (spec, mut rx) = channel_spec([1]);
        let id = registry.register(spec).unwrap();

        registry.replace_systems(&id, HashSet::from([2])).unwrap();
        assert!(registry.system_index().find(1).is_empty());
        assert_eq!(registry.system_index().find(2), vec![id.clone()]);

        registry.deliver(&id, vec![record(7, 2)]);
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(frame, ServerFrame::KillmailUpdate { .. }));
    }

    #[tokio::test]
    async fn connection_death_cleans_up_subscription() {
        let registry = registry();
        let (spec, rx) = channel_spec([30000142]);
        let id = registry.register(spec).unwrap();

        // Simulate the channel connection dying.
        drop(rx);
        registry.deliver(&id, vec![record(1, 30000142)]);

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if registry.is_empty() && registry.system_index().find(30000142).is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dead connection was not cleaned up");
    }

    #[tokio::test]
    async fn worker_crash_is_isolated() {
        let registry = registry();
        let (spec_a, _rx_a) = channel_spec([30000142]);
        let (spec_b, mut rx_b) = channel_spec([30000142]);
        let id_a = registry.register(spec_a).unwrap();
        let id_b = registry.register(spec_b).unwrap();

        registry.kill_worker(&id_a);

        // The dead worker's entries disappear...
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if registry.view(&id_a).is_none()
                    && !registry.system_index().find(30000142).contains(&id_a)
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("crashed worker was not cleaned up");

        // ...while the survivor keeps receiving.
        registry.deliver(&id_b, vec![record(5, 30000142)]);
        let frame = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(frame, ServerFrame::KillmailUpdate { .. }));
    }

    #[tokio::test]
    async fn full_inbox_drops_deliveries_and_counts_them() {
        let config = Config::default();
        let mut subscription_config = config.subscription.clone();
        subscription_config.inbox_capacity = 1;
        let metrics = Arc::new(Metrics::new());
        let webhooks =
            Arc::new(WebhookDispatcher::new(config.webhook.clone(), metrics.clone()).unwrap());
        let registry = SubscriptionRegistry::new(
            subscription_config,
            config.channel.clone(),
            webhooks,
            metrics.clone(),
        );

        // An outbound queue of one that nobody drains wedges the worker on
        // its second frame; the inbox then fills and overflows.
        let (tx, _rx) = mpsc::channel(1);
        let id = registry
            .register(SubscriptionSpec {
                subscriber_id: "tester".into(),
                systems: HashSet::from([1]),
                characters: HashSet::new(),
                transport: Transport::Channel { outbound: tx },
            })
            .unwrap();

        for _ in 0..4 {
            registry.deliver(&id, vec![record(1, 1), record(2, 1)]);
        }

        let snapshot = metrics.snapshot();
        assert!(
            snapshot.delivery.dropped_backpressure >= 2,
            "expected drops, got {}",
            snapshot.delivery.dropped_backpressure
        );
    }

    #[tokio::test]
    async fn stop_drains_pending_deliveries() {
        let registry = registry();
        let (spec, mut rx) = channel_spec([1]);
        let id = registry.register(spec).unwrap();

        registry.deliver(&id, vec![record(1, 1), record(2, 1)]);
        registry.stop(&id).await;

        // Both events made it out before the worker exited.
        let mut seen = 0;
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            if matches!(frame, ServerFrame::KillmailUpdate { .. }) {
                seen += 1;
            }
        }
        assert_eq!(seen, 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn stop_by_subscriber_removes_all_of_theirs() {
        let registry = registry();
        let (spec_a, _rx_a) = channel_spec([1]);
        let (spec_b, _rx_b) = channel_spec([2]);
        let (mut spec_c, _rx_c) = channel_spec([3]);
        spec_c.subscriber_id = "other".into();
        registry.register(spec_a).unwrap();
        registry.register(spec_b).unwrap();
        let id_keep = registry.register(spec_c).unwrap();

        let stopped = registry.stop_by_subscriber("tester").await;
        assert_eq!(stopped, 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.view(&id_keep).is_some());
    }
}
