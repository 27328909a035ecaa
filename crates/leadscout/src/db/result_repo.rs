//! Result-set repository: `personas`, `businesses`, `decision_makers` and
//! `market_insights`.
//!
//! Table names are taken from [`EntityKind::table`], never from input.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::{format_timestamp, json_column, parse_column, timestamp_column, Database, DatabaseError};
use crate::stage::{EntityKind, ResultRecord, StageKind, StageRecord};

fn record_from_row(entity: EntityKind, row: &Row<'_>) -> Result<ResultRecord, rusqlite::Error> {
    Ok(ResultRecord {
        id: row.get("id")?,
        search_id: row.get("search_id")?,
        entity,
        stage: parse_column(row, "stage")?,
        title: row.get("title")?,
        data: json_column(row, "data")?,
        created_at: timestamp_column(row, "created_at")?,
    })
}

/// Stores one record written by `stage`.
pub fn insert(
    db: &Database,
    search_id: &str,
    stage: StageKind,
    record: &StageRecord,
    now: DateTime<Utc>,
) -> Result<ResultRecord, DatabaseError> {
    let entity = stage.entity();
    let stored = ResultRecord {
        id: uuid::Uuid::new_v4().to_string(),
        search_id: search_id.to_string(),
        entity,
        stage,
        title: record.title.clone(),
        data: record.data.clone(),
        created_at: now,
    };
    let data = serde_json::to_string(&stored.data)?;

    db.with_conn(|conn| {
        conn.execute(
            &format!(
                "INSERT INTO {} (id, search_id, stage, title, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                entity.table()
            ),
            params![
                stored.id,
                stored.search_id,
                stage.as_str(),
                stored.title,
                data,
                format_timestamp(now),
            ],
        )?;
        Ok(())
    })?;

    Ok(stored)
}

/// Removes everything `stage` previously wrote for a search.
pub fn delete_by_stage(
    db: &Database,
    search_id: &str,
    stage: StageKind,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute(
            &format!(
                "DELETE FROM {} WHERE search_id = ?1 AND stage = ?2",
                stage.entity().table()
            ),
            params![search_id, stage.as_str()],
        )?;
        if deleted > 0 {
            log::info!(
                "Cleared {} {} rows from a previous run of search {}",
                deleted,
                stage,
                search_id
            );
        }
        Ok(deleted)
    })
}

/// Lists the records of one result set, optionally narrowed to one stage.
pub fn list(
    db: &Database,
    search_id: &str,
    entity: EntityKind,
    stage: Option<StageKind>,
) -> Result<Vec<ResultRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} WHERE search_id = ?1 AND (?2 IS NULL OR stage = ?2)
             ORDER BY created_at ASC, rowid ASC",
            entity.table()
        ))?;
        let rows = stmt
            .query_map(params![search_id, stage.map(StageKind::as_str)], |row| {
                record_from_row(entity, row)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts the records of one result set.
pub fn count(db: &Database, search_id: &str, entity: EntityKind) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE search_id = ?1", entity.table()),
            params![search_id],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Counts the records written by one stage.
pub fn count_by_stage(
    db: &Database,
    search_id: &str,
    stage: StageKind,
) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE search_id = ?1 AND stage = ?2",
                stage.entity().table()
            ),
            params![search_id, stage.as_str()],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}
