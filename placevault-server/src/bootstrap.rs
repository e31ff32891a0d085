//! Turns a loaded [`Config`] into concrete backends.
//!
//! Each backend group falls back to its in-memory implementation when the
//! corresponding setting is absent: Redis carries the event log, leases,
//! pending coordinates and the partition ceiling; PostgreSQL carries the job
//! queue and both history tables; `cacache` carries snapshot blobs.

use std::{fmt, sync::Arc};

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use placevault_config::{Config, TokenSource};
use placevault_core::{
    ArchivePorts, MIGRATOR,
    blob::{BlobRoot, BlobStore, CacacheBlobStore, InMemoryBlobStore},
    connection::RedisHandle,
    download::HttpSnapshotFetcher,
    event_log::{EventLog, InMemoryEventLog, RedisEventLog},
    feed::{
        CeilingStore, ConfigTracker, InMemoryCeilingStore, PageTokenProvider, RedisCeilingStore,
        StaticTokenProvider, TokenProvider, WsFeedTransport,
    },
    jobs::{InMemoryTaskScheduler, JobEventBus, PostgresTaskScheduler, TaskScheduler},
    lease::{InMemoryLeaseStore, LeaseStore, RedisLeaseStore},
    persist::{
        InMemoryPixelHistory, InMemorySnapshotRepository, PixelHistoryRepository,
        PostgresPixelHistory, PostgresSnapshotRepository, SnapshotRepository,
    },
    resolve::{
        GraphqlTileHistoryResolver, InMemoryPendingCoordinates, PendingCoordinates,
        RedisPendingCoordinates,
    },
};

/// Which implementation each backend group ended up with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendSummary {
    pub redis: bool,
    pub postgres: bool,
    pub blob_dir: bool,
}

impl fmt::Display for BackendSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = |durable: bool, backend: &'static str| if durable { backend } else { "memory" };
        write!(
            f,
            "log/leases={} jobs/history={} blobs={}",
            name(self.redis, "redis"),
            name(self.postgres, "postgres"),
            name(self.blob_dir, "cacache"),
        )
    }
}

struct RedisPorts {
    event_log: Arc<dyn EventLog>,
    leases: Arc<dyn LeaseStore>,
    pending: Arc<dyn PendingCoordinates>,
    ceiling: Arc<dyn CeilingStore>,
}

struct PostgresPorts {
    scheduler: Arc<dyn TaskScheduler>,
    snapshots: Arc<dyn SnapshotRepository>,
    pixels: Arc<dyn PixelHistoryRepository>,
}

pub async fn build_ports(config: &Config) -> anyhow::Result<(ArchivePorts, BackendSummary)> {
    let pipeline = &config.pipeline;
    let events = JobEventBus::default();

    let redis = match &config.redis {
        Some(redis) => {
            let handle = RedisHandle::connect(&redis.url)
                .await
                .context("failed to connect to Redis")?;
            RedisPorts {
                event_log: Arc::new(RedisEventLog::new(
                    handle.clone(),
                    redis.stream_key.clone(),
                    pipeline.event_log_max_len,
                )),
                leases: Arc::new(RedisLeaseStore::new(handle.clone())),
                pending: Arc::new(RedisPendingCoordinates::new(
                    handle.clone(),
                    redis.pending_key.clone(),
                )),
                ceiling: Arc::new(RedisCeilingStore::new(handle, redis.meta_key.clone())),
            }
        }
        None => RedisPorts {
            event_log: Arc::new(InMemoryEventLog::new(pipeline.event_log_max_len)),
            leases: Arc::new(InMemoryLeaseStore::new()),
            pending: Arc::new(InMemoryPendingCoordinates::new()),
            ceiling: Arc::new(InMemoryCeilingStore::new()),
        },
    };

    let postgres = match &config.database {
        Some(database) => {
            info!(max_connections = database.max_connections, "connecting to PostgreSQL");
            let pool = PgPoolOptions::new()
                .max_connections(database.max_connections)
                .connect(&database.url)
                .await
                .context("failed to connect to PostgreSQL")?;
            MIGRATOR
                .run(&pool)
                .await
                .context("database migration failed")?;
            PostgresPorts {
                scheduler: Arc::new(PostgresTaskScheduler::new(
                    pool.clone(),
                    pipeline.policies,
                    events.clone(),
                )),
                snapshots: Arc::new(PostgresSnapshotRepository::new(pool.clone())),
                pixels: Arc::new(PostgresPixelHistory::new(pool)),
            }
        }
        None => PostgresPorts {
            scheduler: Arc::new(InMemoryTaskScheduler::new(pipeline.policies, events.clone())),
            snapshots: Arc::new(InMemorySnapshotRepository::new()),
            pixels: Arc::new(InMemoryPixelHistory::new()),
        },
    };

    let blobs: Arc<dyn BlobStore> = match &config.blob.root {
        Some(root) => {
            info!(root = %root.display(), "storing snapshots with cacache");
            Arc::new(CacacheBlobStore::new(BlobRoot::new(root.clone())))
        }
        None => Arc::new(InMemoryBlobStore::new()),
    };

    let tokens: Arc<dyn TokenProvider> = match &config.feed.token {
        TokenSource::Static(token) => Arc::new(StaticTokenProvider::new(token.clone())),
        TokenSource::Page { url, ttl } => Arc::new(
            PageTokenProvider::new(url.clone(), *ttl)
                .context("failed to build the token page client")?,
        ),
    };

    let fetcher = HttpSnapshotFetcher::new(pipeline.download_timeout)
        .context("failed to build the snapshot HTTP client")?;
    let resolver = GraphqlTileHistoryResolver::new(
        config.resolver.url.clone(),
        config.resolver.origin.clone(),
        Arc::clone(&tokens),
        config.resolver.timeout,
    )
    .context("failed to build the resolver HTTP client")?;
    let transport = WsFeedTransport::new(
        config.feed.url.clone(),
        config.feed.origin.clone(),
        config.feed.team_owner.clone(),
        tokens,
    );

    let summary = BackendSummary {
        redis: config.redis.is_some(),
        postgres: config.database.is_some(),
        blob_dir: config.blob.root.is_some(),
    };

    let ports = ArchivePorts {
        event_log: redis.event_log,
        leases: redis.leases,
        scheduler: postgres.scheduler,
        blobs,
        snapshots: postgres.snapshots,
        pixels: postgres.pixels,
        pending: redis.pending,
        fetcher: Arc::new(fetcher),
        resolver: Arc::new(resolver),
        transport: Arc::new(transport),
        tracker: ConfigTracker::new(redis.ceiling),
        events,
    };
    Ok((ports, summary))
}
