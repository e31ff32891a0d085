use std::fmt;

use async_trait::async_trait;
use sqlx::PgPool;

use super::{InsertOutcome, PixelHistoryRepository, SnapshotRepository};
use crate::error::Result;
use crate::types::{PixelRecord, SnapshotRecord};

#[derive(Clone)]
pub struct PostgresSnapshotRepository {
    pool: PgPool,
}

impl fmt::Debug for PostgresSnapshotRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresSnapshotRepository")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresSnapshotRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotRepository for PostgresSnapshotRepository {
    async fn insert_snapshot(&self, record: &SnapshotRecord) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO snapshot_urls (url, fetched_at, size)
            VALUES ($1, $2, $3)
            ON CONFLICT (url) DO NOTHING
            "#,
        )
        .bind(&record.url)
        .bind(record.fetched_at)
        .bind(record.size)
        .execute(&self.pool)
        .await?;

        Ok(InsertOutcome::from_rows_affected(result.rows_affected()))
    }

    async fn snapshot_exists(&self, url: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM snapshot_urls WHERE url = $1)")
                .bind(url)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }
}

#[derive(Clone)]
pub struct PostgresPixelHistory {
    pool: PgPool,
}

impl fmt::Debug for PostgresPixelHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresPixelHistory")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresPixelHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PixelHistoryRepository for PostgresPixelHistory {
    async fn insert_pixel(&self, record: &PixelRecord) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO pixel_history (partition_id, x, y, modified, author)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (partition_id, x, y, modified) DO NOTHING
            "#,
        )
        .bind(record.partition.0 as i32)
        .bind(record.x as i32)
        .bind(record.y as i32)
        .bind(record.modified)
        .bind(&record.author)
        .execute(&self.pool)
        .await?;

        Ok(InsertOutcome::from_rows_affected(result.rows_affected()))
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pixel_history")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::timestamp_from_millis;
    use crate::types::PartitionId;
    use chrono::Utc;

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    #[ignore = "requires DATABASE_URL"]
    async fn pixel_insert_is_idempotent(pool: PgPool) {
        let repo = PostgresPixelHistory::new(pool);
        let record = PixelRecord {
            partition: PartitionId(2),
            x: 999,
            y: 3,
            modified: timestamp_from_millis(1_649_100_000_000).expect("ts"),
            author: "someone".into(),
        };

        assert_eq!(repo.insert_pixel(&record).await.expect("insert"), InsertOutcome::Inserted);
        assert_eq!(
            repo.insert_pixel(&record).await.expect("second insert"),
            InsertOutcome::AlreadyPresent
        );
        assert_eq!(repo.count().await.expect("count"), 1);
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    #[ignore = "requires DATABASE_URL"]
    async fn snapshot_url_is_write_once(pool: PgPool) {
        let repo = PostgresSnapshotRepository::new(pool);
        let record = SnapshotRecord {
            url: "https://cdn.test/frames/0/a.png".into(),
            fetched_at: Utc::now(),
            size: 128,
        };

        assert_eq!(repo.insert_snapshot(&record).await.expect("insert"), InsertOutcome::Inserted);
        let again = SnapshotRecord {
            size: 4096,
            ..record.clone()
        };
        assert_eq!(
            repo.insert_snapshot(&again).await.expect("duplicate"),
            InsertOutcome::AlreadyPresent
        );
        assert!(repo.snapshot_exists(&record.url).await.expect("exists"));
    }
}
