//! Short-lived deduplication of triggers.
//!
//! A key is reserved with a time-to-live. While the reservation lives, further
//! reservations of the same key are refused and see the recorded outcome of
//! the first caller, if any.

use chrono::{DateTime, Duration, Utc};

use crate::db::idempotency_repo::{self, CacheEntry, InsertResult};
use crate::db::{Database, DatabaseError};

/// Result of a reservation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// The caller owns the key and should perform the guarded action.
    Granted,
    /// Someone else holds the key. `outcome` is what they recorded, if
    /// they got that far.
    AlreadyReserved { outcome: Option<serde_json::Value> },
}

impl Reservation {
    pub fn is_granted(&self) -> bool {
        matches!(self, Reservation::Granted)
    }
}

/// Store-backed idempotency cache.
#[derive(Clone)]
pub struct IdempotencyCache {
    db: Database,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(db: Database, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Reserves `key` for the default TTL.
    pub fn reserve(&self, key: &str) -> Result<Reservation, DatabaseError> {
        self.reserve_for(key, self.ttl)
    }

    /// Reserves `key` for `ttl`. Atomic: of two concurrent callers exactly
    /// one is granted.
    pub fn reserve_for(&self, key: &str, ttl: Duration) -> Result<Reservation, DatabaseError> {
        self.reserve_at(key, ttl, Utc::now())
    }

    pub(crate) fn reserve_at(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Reservation, DatabaseError> {
        match idempotency_repo::try_insert(&self.db, key, now, now + ttl)? {
            InsertResult::Inserted => {
                log::debug!("Reserved idempotency key {}", key);
                Ok(Reservation::Granted)
            }
            InsertResult::Existing(entry) => {
                log::debug!("Idempotency key {} already reserved", key);
                Ok(Reservation::AlreadyReserved {
                    outcome: entry.outcome,
                })
            }
        }
    }

    /// Records what the guarded action produced, for later duplicates to see.
    pub fn record_outcome(&self, key: &str, outcome: &serde_json::Value) -> Result<(), DatabaseError> {
        if !idempotency_repo::set_outcome(&self.db, key, outcome)? {
            log::warn!("Idempotency key {} vanished before its outcome was recorded", key);
        }
        Ok(())
    }

    /// Returns the live entry for `key`, if any.
    pub fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, DatabaseError> {
        idempotency_repo::find_unexpired(&self.db, key, Utc::now())
    }

    /// Drops a reservation so the action can be attempted again right away.
    pub fn release(&self, key: &str) -> Result<(), DatabaseError> {
        idempotency_repo::delete(&self.db, key)?;
        Ok(())
    }

    /// Deletes every entry whose TTL elapsed before `now`.
    pub fn expire_all_before(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        idempotency_repo::delete_expired(&self.db, now)
    }
}

/// Key guarding an orchestration trigger for a search.
pub fn orchestrate_key(search_id: &str) -> String {
    format!("orchestrate:{}", search_id)
}

/// Key guarding a retry trigger for a search.
pub fn retry_key(search_id: &str) -> String {
    format!("retry:{}", search_id)
}
