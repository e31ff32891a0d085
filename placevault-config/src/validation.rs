use url::Url;

use crate::error::ConfigLoadError;
use crate::models::{Config, TokenSource};

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

const WS_SCHEMES: &[&str] = &["ws", "wss"];
const HTTP_SCHEMES: &[&str] = &["http", "https"];
const REDIS_SCHEMES: &[&str] = &["redis", "rediss", "redis+unix", "unix"];
const POSTGRES_SCHEMES: &[&str] = &["postgres", "postgresql"];

/// Reject settings the archiver cannot run with and collect the ones it can
/// run with but probably should not.
pub fn validate(config: &Config) -> Result<ConfigWarnings, ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    check_url("feed.url", &config.feed.url, WS_SCHEMES)?;
    check_url("resolver.url", &config.resolver.url, HTTP_SCHEMES)?;
    if let TokenSource::Page { url, .. } = &config.feed.token {
        check_url("feed.token_page", url, HTTP_SCHEMES)?;
    }
    for (field, origin) in [
        ("feed.origin", &config.feed.origin),
        ("resolver.origin", &config.resolver.origin),
    ] {
        if let Some(origin) = origin {
            check_url(field, origin, HTTP_SCHEMES)?;
        }
    }
    if let Some(redis) = &config.redis {
        check_url("redis.url", &redis.url, REDIS_SCHEMES)?;
    }
    if let Some(database) = &config.database {
        check_url("database.url", &database.url, POSTGRES_SCHEMES)?;
        if database.max_connections == 0 {
            return Err(ConfigLoadError::Invalid(
                "database.max_connections must be at least 1".into(),
            ));
        }
    }

    if config.pipeline.event_log_max_len == 0 {
        return Err(ConfigLoadError::Invalid(
            "event log max length must be at least 1".into(),
        ));
    }
    if config.pipeline.download_timeout.is_zero() {
        return Err(ConfigLoadError::Invalid(
            "download timeout must be non-zero".into(),
        ));
    }
    config
        .archiver_config()
        .validate()
        .map_err(|err| ConfigLoadError::Invalid(err.to_string()))?;

    if config.pipeline.require_durable && !config.is_fully_durable() {
        return Err(ConfigLoadError::Invalid(
            "durable backends required but REDIS_URL, DATABASE_URL or BLOB_ROOT is unset".into(),
        ));
    }
    if config.redis.is_none() {
        warnings.push_with_hint(
            "REDIS_URL not set; event log, leases and pending coordinates are process-local",
            "Set REDIS_URL to share state between archiver instances",
        );
    }
    if config.database.is_none() {
        warnings.push_with_hint(
            "DATABASE_URL not set; jobs and history are kept in memory and lost on exit",
            "Set DATABASE_URL to a PostgreSQL database",
        );
    }
    if config.blob.root.is_none() {
        warnings.push("BLOB_ROOT not set; snapshots are kept in memory");
    }
    if config.pipeline.download_timeout > config.pipeline.lease_ttl {
        warnings.push(format!(
            "download timeout ({:?}) exceeds the download lease TTL ({:?}); a slow fetch can lose its lease mid-flight",
            config.pipeline.download_timeout, config.pipeline.lease_ttl
        ));
    }

    Ok(warnings)
}

fn check_url(
    field: &'static str,
    raw: &str,
    expected: &'static [&'static str],
) -> Result<Url, ConfigLoadError> {
    let url = Url::parse(raw).map_err(|source| ConfigLoadError::InvalidUrl {
        field,
        raw: raw.to_string(),
        source,
    })?;
    if !expected.contains(&url.scheme()) {
        return Err(ConfigLoadError::UnsupportedScheme {
            field,
            scheme: url.scheme().to_string(),
            expected,
        });
    }
    Ok(url)
}
