//! Scale leases.
//!
//! At most one scale decision per environment may be in flight among the
//! callers sharing a lease. A decision path takes the lease for its
//! environment before reading the inventory and holds it until it has
//! finished acting. Leases expire after a TTL so a crashed holder cannot
//! wedge the pool.
//!
//! [`LocalLease`] only serializes decisions inside one process: the `run`
//! worker, and tasks sharing one `ScalePolicy`. Separate invocations of the
//! binary each build their own table and are not excluded from each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;

/// Exclusive, expiring lease keyed by environment.
#[async_trait]
pub trait ScaleLease: Send + Sync {
    /// Take the lease for `key`, or `None` if another holder has it.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseGuard>>;
}

/// Held lease. Released on drop.
pub struct LeaseGuard {
    key: String,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl LeaseGuard {
    pub fn new(key: impl Into<String>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            key: key.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard").field("key", &self.key).finish()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    token: u64,
    expires_at: Instant,
}

/// In-process lease table. Not shared across processes.
#[derive(Debug, Default, Clone)]
pub struct LocalLease {
    holders: Arc<Mutex<HashMap<String, Holder>>>,
    next_token: Arc<AtomicU64>,
}

impl LocalLease {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `key` is currently held.
    pub fn is_held(&self, key: &str) -> bool {
        let holders = self.holders.lock().unwrap_or_else(PoisonError::into_inner);
        holders
            .get(key)
            .is_some_and(|holder| holder.expires_at > Instant::now())
    }
}

#[async_trait]
impl ScaleLease for LocalLease {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LeaseGuard>> {
        let now = Instant::now();
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);

        {
            let mut holders = self.holders.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(holder) = holders.get(key) {
                if holder.expires_at > now {
                    debug!(key = %key, "Scale lease is held");
                    return Ok(None);
                }
                debug!(key = %key, "Taking over expired scale lease");
            }
            holders.insert(
                key.to_string(),
                Holder {
                    token,
                    expires_at: now + ttl,
                },
            );
        }

        let holders = Arc::clone(&self.holders);
        let owned_key = key.to_string();
        Ok(Some(LeaseGuard::new(key, move || {
            let mut holders = holders.lock().unwrap_or_else(PoisonError::into_inner);
            // A holder that outlived its TTL must not release its successor.
            if holders.get(&owned_key).is_some_and(|h| h.token == token) {
                holders.remove(&owned_key);
            }
        })))
    }
}
