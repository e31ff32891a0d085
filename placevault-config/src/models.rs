use std::{fmt, path::PathBuf, time::Duration};

use placevault_core::{
    ArchiverConfig,
    backoff::BackoffPolicy,
    connection::redact_credentials,
    diff::DEFAULT_ANOMALY_THRESHOLD,
    event_log::{DEFAULT_MAX_LEN, DEFAULT_STREAM_KEY},
    feed::{
        DEFAULT_FEED_ORIGIN, DEFAULT_FEED_URL, DEFAULT_META_KEY, DEFAULT_TEAM_OWNER,
        DEFAULT_TOKEN_PAGE, DEFAULT_TOKEN_TTL, SubscriptionSettings,
    },
    jobs::JobPolicyTable,
    lease::DEFAULT_LEASE_TTL,
    resolve::{BatchConfig, DEFAULT_PENDING_KEY},
};

pub const DEFAULT_RESOLVER_URL: &str = "https://gql-realtime-2.reddit.com/query";

#[derive(Debug, Clone)]
pub struct Config {
    pub redis: Option<RedisConfig>,
    pub database: Option<DatabaseConfig>,
    pub feed: FeedConfig,
    pub resolver: ResolverConfig,
    pub blob: BlobConfig,
    pub pipeline: PipelineConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Clone, PartialEq)]
pub struct RedisConfig {
    pub url: String,
    pub stream_key: String,
    pub pending_key: String,
    pub meta_key: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            pending_key: DEFAULT_PENDING_KEY.to_string(),
            meta_key: DEFAULT_META_KEY.to_string(),
        }
    }
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &redact_credentials(&self.url))
            .field("stream_key", &self.stream_key)
            .field("pending_key", &self.pending_key)
            .field("meta_key", &self.meta_key)
            .finish()
    }
}

#[derive(Clone, PartialEq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &redact_credentials(&self.url))
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Where the feed and resolver bearer token comes from.
#[derive(Clone, PartialEq)]
pub enum TokenSource {
    Static(String),
    Page { url: String, ttl: Duration },
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenSource::Static(_) => f.debug_tuple("Static").field(&"<redacted>").finish(),
            TokenSource::Page { url, ttl } => f
                .debug_struct("Page")
                .field("url", url)
                .field("ttl", ttl)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    pub url: String,
    pub origin: Option<String>,
    pub team_owner: String,
    pub token: TokenSource,
    pub subscription: SubscriptionSettings,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.to_string(),
            origin: Some(DEFAULT_FEED_ORIGIN.to_string()),
            team_owner: DEFAULT_TEAM_OWNER.to_string(),
            token: TokenSource::Page {
                url: DEFAULT_TOKEN_PAGE.to_string(),
                ttl: DEFAULT_TOKEN_TTL,
            },
            subscription: SubscriptionSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolverConfig {
    pub url: String,
    pub origin: Option<String>,
    pub timeout: Duration,
    pub batch: BatchConfig,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RESOLVER_URL.to_string(),
            origin: Some(DEFAULT_FEED_ORIGIN.to_string()),
            timeout: Duration::from_secs(30),
            batch: BatchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlobConfig {
    /// `cacache` directory; snapshots stay in memory when unset.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub worker_count: usize,
    pub lease_ttl: Duration,
    pub anomaly_threshold: usize,
    pub event_log_max_len: usize,
    pub download_timeout: Duration,
    pub reclaim_interval: Duration,
    pub queue_report_interval: Duration,
    pub shutdown_grace: Duration,
    /// Refuse to start on in-memory backends.
    pub require_durable: bool,
    pub policies: JobPolicyTable,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let archiver = ArchiverConfig::default();
        Self {
            worker_count: archiver.worker_count,
            lease_ttl: DEFAULT_LEASE_TTL,
            anomaly_threshold: DEFAULT_ANOMALY_THRESHOLD,
            event_log_max_len: DEFAULT_MAX_LEN,
            download_timeout: Duration::from_secs(60),
            reclaim_interval: archiver.reclaim_interval,
            queue_report_interval: archiver.queue_report_interval,
            shutdown_grace: archiver.shutdown_grace,
            require_durable: false,
            policies: archiver.policies,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

impl Config {
    /// Runtime tunables handed to the archiver.
    pub fn archiver_config(&self) -> ArchiverConfig {
        ArchiverConfig {
            worker_count: self.pipeline.worker_count,
            lease_ttl: self.pipeline.lease_ttl,
            anomaly_threshold: self.pipeline.anomaly_threshold,
            batch: self.resolver.batch,
            subscription: self.feed.subscription,
            policies: self.pipeline.policies,
            reclaim_interval: self.pipeline.reclaim_interval,
            queue_report_interval: self.pipeline.queue_report_interval,
            shutdown_grace: self.pipeline.shutdown_grace,
        }
    }

    pub fn is_fully_durable(&self) -> bool {
        self.redis.is_some() && self.database.is_some() && self.blob.root.is_some()
    }
}

pub(crate) fn apply_backoff(
    policy: &mut BackoffPolicy,
    base: Option<Duration>,
    cap: Option<Duration>,
) {
    if let Some(base) = base {
        policy.base_ms = base.as_millis() as u64;
    }
    if let Some(cap) = cap {
        policy.max_ms = cap.as_millis() as u64;
    }
}
