//! Idempotency repository: the `idempotency_cache` table.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{format_timestamp, optional_json_column, timestamp_column, Database, DatabaseError};

/// A stored reservation.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub outcome: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub ttl_at: DateTime<Utc>,
}

impl CacheEntry {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            key: row.get("key")?,
            outcome: optional_json_column(row, "outcome")?,
            created_at: timestamp_column(row, "created_at")?,
            ttl_at: timestamp_column(row, "ttl_at")?,
        })
    }
}

/// Result of an insert-if-absent.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertResult {
    Inserted,
    Existing(CacheEntry),
}

/// Inserts `key` unless an unexpired entry already holds it.
///
/// An entry whose `ttl_at` has passed is replaced in the same transaction.
pub fn try_insert(
    db: &Database,
    key: &str,
    now: DateTime<Utc>,
    ttl_at: DateTime<Utc>,
) -> Result<InsertResult, DatabaseError> {
    let now_str = format_timestamp(now);
    let ttl_str = format_timestamp(ttl_at);

    db.with_tx(|tx| {
        tx.execute(
            "DELETE FROM idempotency_cache WHERE key = ?1 AND ttl_at <= ?2",
            params![key, now_str],
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO idempotency_cache (key, outcome, created_at, ttl_at)
             VALUES (?1, NULL, ?2, ?3)",
            params![key, now_str, ttl_str],
        )?;
        if inserted == 1 {
            return Ok(InsertResult::Inserted);
        }
        let existing = tx.query_row(
            "SELECT * FROM idempotency_cache WHERE key = ?1",
            params![key],
            CacheEntry::from_row,
        )?;
        Ok(InsertResult::Existing(existing))
    })
}

/// Stores the outcome of the guarded action. Returns `false` if the key is gone.
pub fn set_outcome(
    db: &Database,
    key: &str,
    outcome: &serde_json::Value,
) -> Result<bool, DatabaseError> {
    let outcome = serde_json::to_string(outcome)?;
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE idempotency_cache SET outcome = ?2 WHERE key = ?1",
            params![key, outcome],
        )?;
        Ok(changed == 1)
    })
}

/// Finds an entry that has not yet expired at `now`.
pub fn find_unexpired(
    db: &Database,
    key: &str,
    now: DateTime<Utc>,
) -> Result<Option<CacheEntry>, DatabaseError> {
    db.with_conn(|conn| {
        let entry = conn
            .query_row(
                "SELECT * FROM idempotency_cache WHERE key = ?1 AND ttl_at > ?2",
                params![key, format_timestamp(now)],
                CacheEntry::from_row,
            )
            .optional()?;
        Ok(entry)
    })
}

/// Removes an entry regardless of its expiry.
pub fn delete(db: &Database, key: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "DELETE FROM idempotency_cache WHERE key = ?1",
            params![key],
        )?;
        Ok(changed == 1)
    })
}

/// Deletes every entry with `ttl_at < now`, returning how many were removed.
pub fn delete_expired(db: &Database, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute(
            "DELETE FROM idempotency_cache WHERE ttl_at < ?1",
            params![format_timestamp(now)],
        )?;
        Ok(deleted)
    })
}
