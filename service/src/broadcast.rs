//! Fan-out: match stored events to subscriptions and hand them to workers.
//!
//! Consumes the store's publish stream. Events ready at the same moment are
//! drained into a micro-batch and grouped per subscription so an active
//! subscriber gets one combined delivery instead of one message per kill.
//! Matching is the OR of the system index and the character index; the
//! character set of an event is cached so replays do not re-walk attacker
//! lists.

use crate::cache::{Lookup, Namespace, NamespacedCache};
use crate::metrics::{add, Metrics};
use crate::subs::{SubscriptionId, SubscriptionRegistry};
use killfeed_types::{CharacterId, EventRecord};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

const MAX_BATCH: usize = 64;

pub struct Broadcaster {
    registry: SubscriptionRegistry,
    cache: Arc<NamespacedCache>,
    metrics: Arc<Metrics>,
    extraction_ttl: Duration,
}

impl Broadcaster {
    pub fn new(
        registry: SubscriptionRegistry,
        cache: Arc<NamespacedCache>,
        metrics: Arc<Metrics>,
        extraction_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            cache,
            metrics,
            extraction_ttl,
        }
    }

    pub async fn run(
        self,
        mut events: broadcast::Receiver<EventRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!("broadcaster started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                received = events.recv() => match received {
                    Ok(first) => {
                        let mut batch = vec![first];
                        while batch.len() < MAX_BATCH {
                            match events.try_recv() {
                                Ok(event) => batch.push(event),
                                Err(_) => break,
                            }
                        }
                        self.dispatch(batch);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        add(&self.metrics.delivery.broadcast_lagged, skipped);
                        tracing::warn!(skipped, "broadcaster lagged behind the store");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::info!("broadcaster stopped");
    }

    /// Match every event, group per subscription, fire-and-forget deliver.
    pub fn dispatch(&self, batch: Vec<EventRecord>) {
        let mut per_subscription: HashMap<SubscriptionId, Vec<EventRecord>> = HashMap::new();
        for event in batch {
            let characters = self.character_ids(&event);
            let mut matched = self.registry.system_index().find_union([event.system_id]);
            matched.extend(self.registry.character_index().find_union(characters));
            for subscription_id in matched {
                per_subscription
                    .entry(subscription_id)
                    .or_default()
                    .push(event.clone());
            }
        }
        for (subscription_id, events) in per_subscription {
            add(&self.metrics.delivery.matched, events.len() as u64);
            self.registry.deliver(&subscription_id, events);
        }
    }

    fn character_ids(&self, event: &EventRecord) -> Vec<CharacterId> {
        let key = event.killmail.id.to_string();
        if let Lookup::Hit(ids) = self
            .cache
            .get::<Vec<CharacterId>>(Namespace::CharacterExtraction, &key)
        {
            return ids;
        }
        let ids = event.killmail.character_ids();
        self.cache
            .put(Namespace::CharacterExtraction, &key, &ids, self.extraction_ttl);
        ids
    }
}
