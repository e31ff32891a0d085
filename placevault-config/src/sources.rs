use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::util::{EnvValue, non_empty_var, parse_bool_var, parse_var};

/// Raw configuration as defined in a TOML file. Durations are humantime
/// strings (`"60s"`, `"2m"`).
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct FileConfig {
    pub redis: Option<FileRedisConfig>,
    pub database: Option<FileDatabaseConfig>,
    #[serde(default)]
    pub feed: FileFeedConfig,
    #[serde(default)]
    pub resolver: FileResolverConfig,
    #[serde(default)]
    pub blob: FileBlobConfig,
    #[serde(default)]
    pub pipeline: FilePipelineConfig,
    #[serde(default)]
    pub policies: FilePolicyTable,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRedisConfig {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileFeedConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_page: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_base: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_cap: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stability_window: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileResolverConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_wait: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileBlobConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FilePipelineConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly_threshold: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_log_max_len: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reclaim_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_report_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_grace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_durable: Option<bool>,
}

/// Per-kind overrides; anything left out keeps the built-in policy.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FilePolicyTable {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_snapshot: Option<FilePolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_snapshot: Option<FilePolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolve_batch: Option<FilePolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolve_single: Option<FilePolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_pixel: Option<FilePolicy>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FilePolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<placevault_core::backoff::BackoffShape>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay: Option<String>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub database_max_connections: Option<EnvValue<u32>>,
    pub feed_url: Option<String>,
    pub feed_origin: Option<String>,
    pub feed_team_owner: Option<String>,
    pub feed_token: Option<String>,
    pub token_page: Option<String>,
    pub resolver_url: Option<String>,
    pub resolver_origin: Option<String>,
    pub resolver_batch_size: Option<EnvValue<usize>>,
    pub blob_root: Option<PathBuf>,
    pub worker_count: Option<EnvValue<usize>>,
    pub lease_ttl: Option<String>,
    pub anomaly_threshold: Option<EnvValue<usize>>,
    pub event_log_max_len: Option<EnvValue<usize>>,
    pub require_durable: Option<EnvValue<bool>>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: non_empty_var("PLACEVAULT_CONFIG").map(PathBuf::from),
            redis_url: non_empty_var("REDIS_URL"),
            database_url: non_empty_var("DATABASE_URL"),
            database_max_connections: parse_var("DATABASE_MAX_CONNECTIONS"),
            feed_url: non_empty_var("FEED_URL"),
            feed_origin: non_empty_var("FEED_ORIGIN"),
            feed_team_owner: non_empty_var("FEED_TEAM_OWNER"),
            feed_token: non_empty_var("FEED_TOKEN"),
            token_page: non_empty_var("TOKEN_PAGE_URL"),
            resolver_url: non_empty_var("RESOLVER_URL"),
            resolver_origin: non_empty_var("RESOLVER_ORIGIN"),
            resolver_batch_size: parse_var("RESOLVER_BATCH_SIZE"),
            blob_root: non_empty_var("BLOB_ROOT").map(PathBuf::from),
            worker_count: parse_var("WORKER_COUNT"),
            lease_ttl: non_empty_var("LEASE_TTL"),
            anomaly_threshold: parse_var("ANOMALY_THRESHOLD"),
            event_log_max_len: parse_var("EVENT_LOG_MAX_LEN"),
            require_durable: parse_bool_var("REQUIRE_DURABLE_BACKENDS"),
        }
    }

    /// Variables that were set but could not be parsed.
    pub fn invalid_values(&self) -> Vec<(&'static str, &str)> {
        fn check<'a, T>(
            out: &mut Vec<(&'static str, &'a str)>,
            name: &'static str,
            value: &'a Option<EnvValue<T>>,
        ) {
            if let Some(EnvValue::Invalid(raw)) = value {
                out.push((name, raw.as_str()));
            }
        }

        let mut out = Vec::new();
        check(&mut out, "DATABASE_MAX_CONNECTIONS", &self.database_max_connections);
        check(&mut out, "RESOLVER_BATCH_SIZE", &self.resolver_batch_size);
        check(&mut out, "WORKER_COUNT", &self.worker_count);
        check(&mut out, "ANOMALY_THRESHOLD", &self.anomaly_threshold);
        check(&mut out, "EVENT_LOG_MAX_LEN", &self.event_log_max_len);
        check(&mut out, "REQUIRE_DURABLE_BACKENDS", &self.require_durable);
        out
    }
}
