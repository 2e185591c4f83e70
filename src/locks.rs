//! Per-user serialization for tracking mutations
//!
//! Consumption and conversion read-modify-write the same tracking row. Two
//! concurrent consumptions for one user must not interleave their
//! increment-then-convert steps, so both paths take the user's lock from this
//! registry first. Different users never contend.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry handing out one async mutex per user
#[derive(Default)]
pub struct UserLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self { locks: DashMap::new() }
    }

    /// Acquire the lock for a user, creating it on first use
    pub async fn acquire(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}
