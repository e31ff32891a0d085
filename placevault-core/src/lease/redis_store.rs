use std::{fmt, time::Duration};

use async_trait::async_trait;
use redis::Script;
use tracing::debug;

use super::{LeaseStore, LeaseToken, ReleaseOutcome};
use crate::connection::RedisHandle;
use crate::error::Result;

/// Delete the key only when it still carries our token.
fn compare_and_delete() -> Script {
    Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        "#,
    )
}

/// Cluster-wide leases on top of `SET NX PX`.
#[derive(Clone)]
pub struct RedisLeaseStore {
    redis: RedisHandle,
}

impl fmt::Debug for RedisLeaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisLeaseStore").finish_non_exhaustive()
    }
}

impl RedisLeaseStore {
    pub fn new(redis: RedisHandle) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>> {
        let mut conn = self.redis.conn();
        let token = LeaseToken::new();
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token.to_string())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        debug!(key, acquired = reply.is_some(), "lease acquire");
        Ok(reply.map(|_| token))
    }

    async fn release(&self, key: &str, token: LeaseToken) -> Result<ReleaseOutcome> {
        let mut conn = self.redis.conn();
        let deleted: i64 = compare_and_delete()
            .key(key)
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await?;

        Ok(if deleted == 1 {
            ReleaseOutcome::Released
        } else {
            ReleaseOutcome::NotHeld
        })
    }
}
