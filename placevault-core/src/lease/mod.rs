//! Time-bounded exclusive claims on resource keys.
//!
//! A lease always carries a TTL; expiry is the only recovery path for a
//! holder that crashed. Release compares the holder token, so a late release
//! after expiry (when someone else may hold the key) is reported as
//! [`ReleaseOutcome::NotHeld`] instead of deleting the new holder's claim.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

pub mod memory;
pub mod redis_store;

pub use memory::InMemoryLeaseStore;
pub use redis_store::RedisLeaseStore;

/// Default TTL for download leases.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(pub Uuid);

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The lease had already expired or moved to another holder.
    NotHeld,
}

#[async_trait]
pub trait LeaseStore: Send + Sync + fmt::Debug {
    /// Try to take `key` for `ttl`. `None` means someone else holds it.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>>;

    async fn release(&self, key: &str, token: LeaseToken) -> Result<ReleaseOutcome>;
}

pub fn download_key(url: &str) -> String {
    format!("download:{url}")
}
