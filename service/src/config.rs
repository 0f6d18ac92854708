//! Runtime configuration.
//!
//! Defaults are code-level; every knob can be overridden from the
//! environment and the important ones again from the CLI (see `main.rs`).

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    /// Listen port for the inbound HTTP/channel surface.
    pub port: u16,
    /// Disable the inbound surface entirely; poller and indexes still run.
    pub headless: bool,
    /// Upstream queue long-poll endpoint.
    pub queue_url: String,
    /// Upstream metadata resolver base URL.
    pub esi_url: String,
    /// Killmails older than this horizon are dropped as expected noise.
    pub cutoff: Duration,
    pub cache: CacheConfig,
    pub stream: StreamConfig,
    pub storage: StorageConfig,
    pub enrichment: EnrichmentConfig,
    pub subscription: SubscriptionConfig,
    pub monitoring: MonitoringConfig,
    pub channel: ChannelConfig,
    pub webhook: WebhookConfig,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub killmails_ttl: Duration,
    pub system_ttl: Duration,
    pub esi_ttl: Duration,
    /// TTL for cached character-id extractions and upstream 404 markers.
    pub extraction_ttl: Duration,
    pub sweep_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Delay before the next poll after a payload with content.
    pub fast_interval: Duration,
    /// Delay before the next poll after an empty payload.
    pub idle_interval: Duration,
    /// Transport-error backoff, exponential between these bounds.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub enable_event_streaming: bool,
    pub gc_interval: Duration,
    pub max_events_per_system: usize,
}

#[derive(Clone, Debug)]
pub struct EnrichmentConfig {
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_factor: u32,
}

#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    pub max_systems: usize,
    pub max_characters: usize,
    /// High-water mark of a worker inbox; deliveries above it are dropped.
    pub inbox_capacity: usize,
    pub drain_timeout: Duration,
    pub index_sweep_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct MonitoringConfig {
    pub status_interval: Duration,
    pub system_stats_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub outbound_capacity: usize,
    pub send_timeout: Duration,
    /// Preload trickle: at most `preload_chunk` killmails per
    /// `preload_interval` per subscription, yielding to real-time pushes.
    pub preload_chunk: usize,
    pub preload_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4004,
            headless: false,
            queue_url: "https://zkillredisq.stream/listen.php".to_string(),
            esi_url: "https://esi.evetech.net/latest".to_string(),
            cutoff: Duration::from_secs(24 * 3600),
            cache: CacheConfig {
                killmails_ttl: Duration::from_secs(300),
                system_ttl: Duration::from_secs(3600),
                esi_ttl: Duration::from_secs(24 * 3600),
                extraction_ttl: Duration::from_secs(300),
                sweep_interval: Duration::from_secs(60),
            },
            stream: StreamConfig {
                fast_interval: Duration::from_millis(1_000),
                idle_interval: Duration::from_millis(5_000),
                backoff_base: Duration::from_secs(5),
                backoff_max: Duration::from_secs(60),
            },
            storage: StorageConfig {
                enable_event_streaming: true,
                gc_interval: Duration::from_secs(60),
                max_events_per_system: 10_000,
            },
            enrichment: EnrichmentConfig {
                max_concurrency: 10,
                max_retries: 3,
                retry_base: Duration::from_secs(1),
                retry_factor: 2,
            },
            subscription: SubscriptionConfig {
                max_systems: 100,
                max_characters: 1000,
                inbox_capacity: 256,
                drain_timeout: Duration::from_millis(1_000),
                index_sweep_interval: Duration::from_secs(300),
            },
            monitoring: MonitoringConfig {
                status_interval: Duration::from_secs(60),
                system_stats_interval: Duration::from_secs(60),
            },
            channel: ChannelConfig {
                outbound_capacity: 256,
                send_timeout: Duration::from_secs(2),
                preload_chunk: 10,
                preload_interval: Duration::from_millis(100),
            },
            webhook: WebhookConfig {
                timeout: Duration::from_secs(5),
                max_attempts: 3,
                backoff_base: Duration::from_secs(1),
            },
        }
    }
}

impl Config {
    /// Defaults overridden by whatever the environment provides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.port = read_u16("PORT", config.port);
        config.headless = read_bool("HEADLESS", config.headless);
        config.queue_url = read_string("KILLFEED_QUEUE_URL", config.queue_url);
        config.esi_url = read_string("KILLFEED_ESI_URL", config.esi_url);
        config.cutoff = Duration::from_secs(
            u64::from(read_u32("KILL_CUTOFF_HOURS", (config.cutoff.as_secs() / 3600) as u32))
                * 3600,
        );

        config.cache.killmails_ttl = read_secs("CACHE_KILLMAILS_TTL_SECS", config.cache.killmails_ttl);
        config.cache.system_ttl = read_secs("CACHE_SYSTEM_TTL_SECS", config.cache.system_ttl);
        config.cache.esi_ttl = read_secs("CACHE_ESI_TTL_SECS", config.cache.esi_ttl);

        config.stream.fast_interval = read_ms("STREAM_FAST_INTERVAL_MS", config.stream.fast_interval);
        config.stream.idle_interval = read_ms("STREAM_IDLE_INTERVAL_MS", config.stream.idle_interval);

        config.storage.enable_event_streaming = read_bool(
            "STORAGE_ENABLE_EVENT_STREAMING",
            config.storage.enable_event_streaming,
        );
        config.storage.gc_interval = read_ms("STORAGE_GC_INTERVAL_MS", config.storage.gc_interval);
        config.storage.max_events_per_system = read_usize(
            "STORAGE_MAX_EVENTS_PER_SYSTEM",
            config.storage.max_events_per_system,
        );

        config.enrichment.max_concurrency =
            read_usize("ENRICHMENT_MAX_CONCURRENCY", config.enrichment.max_concurrency);
        config.enrichment.max_retries = read_u32("ENRICHMENT_RETRY_MAX", config.enrichment.max_retries);
        config.enrichment.retry_base = read_ms("ENRICHMENT_RETRY_BASE_MS", config.enrichment.retry_base);
        config.enrichment.retry_factor =
            read_u32("ENRICHMENT_RETRY_FACTOR", config.enrichment.retry_factor);

        config.subscription.max_systems =
            read_usize("SUBSCRIPTION_MAX_SYSTEMS", config.subscription.max_systems);
        config.subscription.max_characters =
            read_usize("SUBSCRIPTION_MAX_CHARACTERS", config.subscription.max_characters);

        config.monitoring.status_interval =
            read_ms("MONITORING_STATUS_INTERVAL_MS", config.monitoring.status_interval);

        config
    }
}

fn read_string(key: &str, fallback: String) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(fallback)
}

fn read_bool(key: &str, fallback: bool) -> bool {
    match std::env::var(key).as_deref() {
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES") => true,
        Ok("0") | Ok("false") | Ok("FALSE") | Ok("no") | Ok("NO") => false,
        _ => fallback,
    }
}

fn read_u16(key: &str, fallback: u16) -> u16 {
    std::env::var(key).ok().and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

fn read_u32(key: &str, fallback: u32) -> u32 {
    std::env::var(key).ok().and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

fn read_usize(key: &str, fallback: usize) -> usize {
    std::env::var(key).ok().and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

fn read_ms(key: &str, fallback: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(fallback)
}

fn read_secs(key: &str, fallback: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.port, 4004);
        assert_eq!(config.cache.killmails_ttl, Duration::from_secs(300));
        assert_eq!(config.storage.max_events_per_system, 10_000);
        assert_eq!(config.enrichment.max_concurrency, 10);
        assert_eq!(config.subscription.max_systems, 100);
        assert_eq!(config.subscription.max_characters, 1000);
        assert_eq!(config.stream.backoff_max, Duration::from_secs(60));
    }
}
