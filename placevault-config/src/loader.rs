use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use placevault_core::{
    backoff::BackoffPolicy,
    feed::{DEFAULT_TOKEN_PAGE, DEFAULT_TOKEN_TTL},
    jobs::{JobKind, JobPolicy},
};

use crate::{
    error::ConfigLoadError,
    models::{
        BlobConfig, Config, ConfigMetadata, DatabaseConfig, FeedConfig, PipelineConfig,
        RedisConfig, ResolverConfig, TokenSource, apply_backoff,
    },
    sources::{EnvConfig, FileConfig, FilePolicy, FileRedisConfig},
    util::parse_duration,
    validation::{self, ConfigWarnings},
};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["placevault.toml", "config/placevault.toml"];
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// `.env` first, then the TOML file, then the process environment.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| ()),
            None => dotenvy::dotenv().map(|_| ()),
        };
        let env_file_loaded = match loaded {
            Ok(()) => true,
            Err(dotenvy::Error::Io(_)) => false,
            Err(err) => return Err(err.into()),
        };

        self.load_with_env(EnvConfig::gather(), env_file_loaded)
    }

    pub(crate) fn load_with_env(
        &self,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;

        let mut warnings = ConfigWarnings::default();
        if config_path.is_none() {
            warnings.push_with_hint(
                "No placevault.toml detected; using environment variables and defaults",
                "Pass --config or set PLACEVAULT_CONFIG to use a configuration file",
            );
        }
        for (name, raw) in env.invalid_values() {
            warnings.push(format!("ignoring unparseable {name}='{raw}'"));
        }

        let config = compose_config(
            file_config.unwrap_or_default(),
            env,
            ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        )?;
        warnings.extend(validation::validate(&config)?);

        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match explicit {
            Some(path) if !path.exists() => {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            Some(path) => path,
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(Path::new)
                .find(|candidate| candidate.exists())
            {
                Some(found) => found.to_path_buf(),
                None => return Ok((None, None)),
            },
        };

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
                path: path.clone(),
                source,
            })?;

        Ok((Some(file_config), Some(path)))
    }
}

fn duration(
    field: &'static str,
    raw: Option<&String>,
) -> Result<Option<Duration>, ConfigLoadError> {
    raw.map(|raw| parse_duration(field, raw)).transpose()
}

fn compose_config(
    file: FileConfig,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> Result<Config, ConfigLoadError> {
    let FileConfig {
        redis: file_redis,
        database: file_database,
        feed: file_feed,
        resolver: file_resolver,
        blob: file_blob,
        pipeline: file_pipeline,
        policies: file_policies,
    } = file;

    let redis = match (env.redis_url.clone(), file_redis) {
        (Some(url), Some(file)) => Some(RedisConfig {
            url,
            ..redis_from_file(file)
        }),
        (Some(url), None) => Some(RedisConfig::new(url)),
        (None, Some(file)) => Some(redis_from_file(file)),
        (None, None) => None,
    };

    let database = env
        .database_url
        .clone()
        .or(file_database.as_ref().map(|db| db.url.clone()))
        .map(|url| DatabaseConfig {
            url,
            max_connections: env
                .database_max_connections
                .as_ref()
                .and_then(|v| v.parsed().copied())
                .or(file_database.as_ref().and_then(|db| db.max_connections))
                .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
        });

    let mut feed = FeedConfig::default();
    if let Some(url) = env.feed_url.clone().or(file_feed.url) {
        feed.url = url;
    }
    if let Some(origin) = env.feed_origin.clone().or(file_feed.origin) {
        feed.origin = Some(origin).filter(|o| o != "none");
    }
    if let Some(owner) = env.feed_team_owner.clone().or(file_feed.team_owner) {
        feed.team_owner = owner;
    }
    feed.token = match env.feed_token.clone().or(file_feed.token) {
        Some(token) => TokenSource::Static(token),
        None => TokenSource::Page {
            url: env
                .token_page
                .clone()
                .or(file_feed.token_page)
                .unwrap_or_else(|| DEFAULT_TOKEN_PAGE.to_string()),
            ttl: duration("feed.token_ttl", file_feed.token_ttl.as_ref())?
                .unwrap_or(DEFAULT_TOKEN_TTL),
        },
    };
    apply_backoff(
        &mut feed.subscription.backoff,
        duration("feed.reconnect_base", file_feed.reconnect_base.as_ref())?,
        duration("feed.reconnect_cap", file_feed.reconnect_cap.as_ref())?,
    );
    if let Some(window) = duration("feed.stability_window", file_feed.stability_window.as_ref())? {
        feed.subscription.stability_window = window;
    }
    if let Some(idle) = duration("feed.idle_timeout", file_feed.idle_timeout.as_ref())? {
        feed.subscription.idle_timeout = idle;
    }

    let mut resolver = ResolverConfig::default();
    if let Some(url) = env.resolver_url.clone().or(file_resolver.url) {
        resolver.url = url;
    }
    if let Some(origin) = env.resolver_origin.clone().or(file_resolver.origin) {
        resolver.origin = Some(origin).filter(|o| o != "none");
    }
    if let Some(timeout) = duration("resolver.timeout", file_resolver.timeout.as_ref())? {
        resolver.timeout = timeout;
    }
    if let Some(size) = env
        .resolver_batch_size
        .as_ref()
        .and_then(|v| v.parsed().copied())
        .or(file_resolver.batch_size)
    {
        resolver.batch.batch_size = size;
    }
    if let Some(poll) = duration("resolver.poll_interval", file_resolver.poll_interval.as_ref())? {
        resolver.batch.poll_interval = poll;
    }
    if let Some(wait) = duration("resolver.partial_wait", file_resolver.partial_wait.as_ref())? {
        resolver.batch.partial_wait = wait;
    }

    let blob = BlobConfig {
        root: env.blob_root.clone().or(file_blob.root),
    };

    let mut pipeline = PipelineConfig::default();
    if let Some(count) = env
        .worker_count
        .as_ref()
        .and_then(|v| v.parsed().copied())
        .or(file_pipeline.worker_count)
    {
        pipeline.worker_count = count;
    }
    let lease_ttl = match env.lease_ttl.as_ref() {
        Some(raw) => Some(parse_duration("LEASE_TTL", raw)?),
        None => duration("pipeline.lease_ttl", file_pipeline.lease_ttl.as_ref())?,
    };
    if let Some(ttl) = lease_ttl {
        pipeline.lease_ttl = ttl;
    }
    if let Some(threshold) = env
        .anomaly_threshold
        .as_ref()
        .and_then(|v| v.parsed().copied())
        .or(file_pipeline.anomaly_threshold)
    {
        pipeline.anomaly_threshold = threshold;
    }
    if let Some(max_len) = env
        .event_log_max_len
        .as_ref()
        .and_then(|v| v.parsed().copied())
        .or(file_pipeline.event_log_max_len)
    {
        pipeline.event_log_max_len = max_len;
    }
    if let Some(timeout) = duration("pipeline.download_timeout", file_pipeline.download_timeout.as_ref())? {
        pipeline.download_timeout = timeout;
    }
    if let Some(every) = duration("pipeline.reclaim_interval", file_pipeline.reclaim_interval.as_ref())? {
        pipeline.reclaim_interval = every;
    }
    if let Some(every) = duration(
        "pipeline.queue_report_interval",
        file_pipeline.queue_report_interval.as_ref(),
    )? {
        pipeline.queue_report_interval = every;
    }
    if let Some(grace) = duration("pipeline.shutdown_grace", file_pipeline.shutdown_grace.as_ref())? {
        pipeline.shutdown_grace = grace;
    }
    pipeline.require_durable = env
        .require_durable
        .as_ref()
        .and_then(|v| v.parsed().copied())
        .or(file_pipeline.require_durable)
        .unwrap_or(false);

    for (kind, policy) in [
        (JobKind::DownloadSnapshot, file_policies.download_snapshot),
        (JobKind::DiffSnapshot, file_policies.diff_snapshot),
        (JobKind::ResolveBatch, file_policies.resolve_batch),
        (JobKind::ResolveSingle, file_policies.resolve_single),
        (JobKind::PersistPixel, file_policies.persist_pixel),
    ] {
        if let Some(policy) = policy {
            apply_policy(pipeline.policies.for_kind_mut(kind), policy)?;
        }
    }

    Ok(Config {
        redis,
        database,
        feed,
        resolver,
        blob,
        pipeline,
        metadata,
    })
}

fn redis_from_file(file: FileRedisConfig) -> RedisConfig {
    let mut redis = RedisConfig::new(file.url);
    if let Some(key) = file.stream_key {
        redis.stream_key = key;
    }
    if let Some(key) = file.pending_key {
        redis.pending_key = key;
    }
    if let Some(key) = file.meta_key {
        redis.meta_key = key;
    }
    redis
}

fn apply_policy(
    target: &mut JobPolicy,
    file: FilePolicy,
) -> Result<(), ConfigLoadError> {
    if let Some(priority) = file.priority {
        target.priority = priority;
    }
    if let Some(max_attempts) = file.max_attempts {
        target.max_attempts = max_attempts;
    }
    if let Some(shape) = file.shape {
        target.backoff = BackoffPolicy {
            shape,
            ..target.backoff
        };
    }
    apply_backoff(
        &mut target.backoff,
        duration("policies.base_delay", file.base_delay.as_ref())?,
        duration("policies.max_delay", file.max_delay.as_ref())?,
    );
    Ok(())
}
