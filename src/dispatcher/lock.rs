//! Per-execution advisory lock (spec §4.2, C4): serializes handler
//! invocations for the same execution so two concurrently-delivered
//! messages never race on the same in-memory snapshot.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

/// Tracks which execution ids are currently being handled and since when, so
/// a stuck handler's lock can be reclaimed after its TTL elapses rather than
/// wedging that execution forever.
#[derive(Debug, Default)]
pub struct ExecutionLock {
    held: DashMap<Uuid, DateTime<Utc>>,
}

impl ExecutionLock {
    pub fn new() -> Self {
        Self {
            held: DashMap::new(),
        }
    }

    /// Attempt to acquire the lock for `execution_id`. Succeeds immediately
    /// if free, or if the existing holder's lock is older than `ttl`
    /// (reclaimed as abandoned).
    pub fn try_acquire(
        &self,
        execution_id: Uuid,
        now: DateTime<Utc>,
        ttl: std::time::Duration,
    ) -> bool {
        match self.held.entry(execution_id) {
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let age = now.signed_duration_since(*entry.get());
                if age.to_std().map(|a| a >= ttl).unwrap_or(false) {
                    entry.insert(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn release(&self, execution_id: Uuid) {
        self.held.remove(&execution_id);
    }
}
