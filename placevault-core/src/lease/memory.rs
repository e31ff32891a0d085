use std::{collections::HashMap, fmt, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{LeaseStore, LeaseToken, ReleaseOutcome};
use crate::error::Result;

#[derive(Clone, Copy)]
struct Held {
    token: LeaseToken,
    expires_at: Instant,
}

/// Single-process lease table. Expiry follows the tokio clock so tests can
/// pause and advance time.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    held: Mutex<HashMap<String, Held>>,
}

impl fmt::Debug for InMemoryLeaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryLeaseStore")
            .field("held", &self.held.lock().len())
            .finish()
    }
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .get(key)
            .is_some_and(|held| held.expires_at > Instant::now())
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseToken>> {
        let now = Instant::now();
        let mut held = self.held.lock();
        if let Some(current) = held.get(key)
            && current.expires_at > now
        {
            return Ok(None);
        }

        let token = LeaseToken::new();
        held.insert(
            key.to_string(),
            Held {
                token,
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: LeaseToken) -> Result<ReleaseOutcome> {
        let now = Instant::now();
        let mut held = self.held.lock();
        match held.get(key) {
            Some(current) if current.token == token && current.expires_at > now => {
                held.remove(key);
                Ok(ReleaseOutcome::Released)
            }
            _ => Ok(ReleaseOutcome::NotHeld),
        }
    }
}
