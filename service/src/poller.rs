//! Long-poll loop over the upstream kill queue.
//!
//! One cooperative task: poll, feed the pipeline, pace the next poll. A
//! payload means poll again soon (`fast_interval`), an empty answer means
//! relax (`idle_interval`), a transport error means jittered exponential
//! backoff capped at `backoff_max`. Cancellation is checked between
//! iterations so an in-flight poll finishes first.

use crate::config::StreamConfig;
use crate::metrics::{inc, Metrics};
use crate::pipeline::{Outcome, Pipeline};
use crate::zkb::QueueClient;
use killfeed_types::SystemId;
use rand::Rng;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct StreamPoller {
    queue: QueueClient,
    pipeline: Arc<Pipeline>,
    config: StreamConfig,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
    active_systems: HashSet<SystemId>,
}

impl StreamPoller {
    pub fn new(
        queue: QueueClient,
        pipeline: Arc<Pipeline>,
        config: StreamConfig,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            pipeline,
            config,
            metrics,
            shutdown,
            active_systems: HashSet::new(),
        }
    }

    pub async fn run(mut self) {
        // Popping the queue is the implicit ack: a response dropped on the
        // wire (or a cancel mid-poll) costs at most one message, which
        // upstream does not replay.
        tracing::info!("stream poller started");
        let mut backoff = self.config.backoff_base;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            inc(&self.metrics.poller.polls);
            match self.queue.poll().await {
                Ok(Some(package)) => {
                    backoff = self.config.backoff_base;
                    inc(&self.metrics.poller.killmails_received);
                    self.ingest(package).await;
                    self.wait(self.config.fast_interval).await;
                }
                Ok(None) => {
                    backoff = self.config.backoff_base;
                    self.wait(self.config.idle_interval).await;
                }
                Err(err) => {
                    inc(&self.metrics.poller.errors);
                    tracing::warn!(%err, ?backoff, "queue poll failed, backing off");
                    self.wait(jittered(backoff)).await;
                    backoff = next_backoff(backoff, self.config.backoff_max);
                }
            }
        }
        tracing::info!("stream poller stopped");
    }

    async fn ingest(&mut self, package: Value) {
        // Normalize up front so the system gauge can be tracked; the
        // pipeline normalizes idempotently.
        let normalized = Pipeline::normalize(package);
        if let Some(system_id) = normalized.get("system_id").and_then(Value::as_u64) {
            if self.active_systems.insert(system_id) {
                self.metrics
                    .poller
                    .active_systems
                    .store(self.active_systems.len() as u64, Ordering::Relaxed);
            }
        }
        match self.pipeline.process_value(normalized).await {
            Ok(Outcome::Stored(sequence)) => {
                tracing::debug!(sequence, "killmail stored");
            }
            Ok(Outcome::Duplicate) => {}
            Ok(Outcome::TooOld) => {
                inc(&self.metrics.poller.older_killmails);
            }
            Err(err) => {
                tracing::warn!(%err, "killmail processing failed");
            }
        }
    }

    async fn wait(&mut self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.changed() => {}
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Spread a retry delay over the upper half of its window. Every poller
/// instance recovering from the same queue outage would otherwise knock on
/// the upstream at the same instant.
fn jittered(backoff: Duration) -> Duration {
    let window_ms = backoff.as_millis() as u64;
    if window_ms <= 1 {
        return backoff;
    }
    Duration::from_millis(rand::thread_rng().gen_range(window_ms / 2..=window_ms))
}
