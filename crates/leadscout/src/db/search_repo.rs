//! Search repository: rows of the `searches` table.
//!
//! Every state transition is a conditional `UPDATE` whose `WHERE` clause
//! encodes the state machine, so callers learn from the affected-row count
//! whether the transition actually happened.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{
    format_timestamp, json_column, parse_column, timestamp_column, Database, DatabaseError,
};
use crate::search::{Search, SearchPhase, SearchStatus};

fn search_from_row(row: &Row<'_>) -> Result<Search, rusqlite::Error> {
    Ok(Search {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        orientation: parse_column(row, "orientation")?,
        product: row.get("product")?,
        industries: json_column(row, "industries")?,
        countries: json_column(row, "countries")?,
        status: parse_column(row, "status")?,
        phase: parse_column(row, "phase")?,
        progress_pct: row.get("progress_pct")?,
        error: row.get("error")?,
        created_at: timestamp_column(row, "created_at")?,
        updated_at: timestamp_column(row, "updated_at")?,
    })
}

/// Inserts a new search row.
pub fn insert(db: &Database, search: &Search) -> Result<(), DatabaseError> {
    let industries = serde_json::to_string(&search.industries)?;
    let countries = serde_json::to_string(&search.countries)?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO searches (id, owner_id, orientation, product, industries, countries,
             status, phase, progress_pct, error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                search.id,
                search.owner_id,
                search.orientation.as_str(),
                search.product,
                industries,
                countries,
                search.status.as_str(),
                search.phase.as_str(),
                search.progress_pct,
                search.error,
                format_timestamp(search.created_at),
                format_timestamp(search.updated_at),
            ],
        )?;
        Ok(())
    })
}

/// Finds a search by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<Search>, DatabaseError> {
    db.with_conn(|conn| {
        let search = conn
            .query_row(
                "SELECT * FROM searches WHERE id = ?1",
                params![id],
                search_from_row,
            )
            .optional()?;
        Ok(search)
    })
}

/// Moves an in-progress search to `phase` with `progress_pct`.
///
/// Returns `false` when the search is no longer in progress (cancelled,
/// failed or completed meanwhile) or when the write would lower progress.
pub fn advance_phase(
    db: &Database,
    id: &str,
    phase: SearchPhase,
    progress_pct: u8,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE searches SET phase = ?2, progress_pct = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'in_progress' AND progress_pct <= ?3",
            params![id, phase.as_str(), progress_pct, format_timestamp(now)],
        )?;
        Ok(changed == 1)
    })
}

/// Marks an in-progress search as completed at 100%.
pub fn mark_completed(db: &Database, id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE searches SET status = 'completed', phase = 'completed', progress_pct = 100,
             error = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'in_progress'",
            params![id, format_timestamp(now)],
        )?;
        Ok(changed == 1)
    })
}

/// Marks an in-progress search as failed. The phase is left at the last
/// successful step and progress drops to zero.
pub fn mark_failed(
    db: &Database,
    id: &str,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE searches SET status = 'failed', progress_pct = 0, error = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'in_progress'",
            params![id, error, format_timestamp(now)],
        )?;
        Ok(changed == 1)
    })
}

/// Minimal failure write used when [`mark_failed`] itself could not be
/// persisted. Touches only status and progress.
pub fn force_failed(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE searches SET status = 'failed', progress_pct = 0
             WHERE id = ?1 AND status = 'in_progress'",
            params![id],
        )?;
        Ok(changed == 1)
    })
}

/// Sets status and phase to `cancelled` unless the search already completed.
///
/// Returns `false` when no such row exists or the search is completed.
pub fn mark_cancelled(db: &Database, id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE searches SET status = 'cancelled', phase = 'cancelled', updated_at = ?2
             WHERE id = ?1 AND status != 'completed'",
            params![id, format_timestamp(now)],
        )?;
        Ok(changed == 1)
    })
}

/// Puts a failed or completed search back in progress at `phase`.
pub fn reopen(
    db: &Database,
    id: &str,
    phase: SearchPhase,
    progress_pct: u8,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE searches SET status = 'in_progress', phase = ?2, progress_pct = ?3,
             error = NULL, updated_at = ?4
             WHERE id = ?1 AND status IN ('failed', 'completed')",
            params![id, phase.as_str(), progress_pct, format_timestamp(now)],
        )?;
        Ok(changed == 1)
    })
}

/// Lists searches for one owner, newest first.
pub fn list_by_owner(
    db: &Database,
    owner_id: &str,
    status: Option<SearchStatus>,
) -> Result<Vec<Search>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM searches WHERE owner_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(
                params![owner_id, status.map(SearchStatus::as_str)],
                search_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
