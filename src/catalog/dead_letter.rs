//! Dead-letter store for notifications that could not be applied.
//!
//! Letters keep the full notification so they can be replayed once the cause
//! (missing schema, storage outage) is fixed. When the database itself is
//! unreachable the letter is appended to `dead_letters.jsonl` instead and
//! imported on the next replay.

use crate::core::db;
use crate::core::error::CatalogError;
use crate::core::pool;
use crate::core::store::Store;
use crate::core::time;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    SchemaConflict,
    StorageUnavailable,
    Malformed,
}

impl DeadLetterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterKind::SchemaConflict => "schema_conflict",
            DeadLetterKind::StorageUnavailable => "storage_unavailable",
            DeadLetterKind::Malformed => "malformed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CatalogError> {
        match raw {
            "schema_conflict" => Ok(DeadLetterKind::SchemaConflict),
            "storage_unavailable" => Ok(DeadLetterKind::StorageUnavailable),
            "malformed" => Ok(DeadLetterKind::Malformed),
            other => Err(CatalogError::ValidationError(format!(
                "Invalid dead-letter kind '{}'. Must be one of: schema_conflict, storage_unavailable, malformed",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub event_id: String,
    pub kind: DeadLetterKind,
    pub reason: String,
    /// The notification exactly as received.
    pub payload: JsonValue,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
}

impl DeadLetter {
    pub fn new(
        event_id: &str,
        kind: DeadLetterKind,
        reason: String,
        payload: JsonValue,
        attempts: u32,
    ) -> Self {
        Self {
            id: time::new_id("DL"),
            event_id: event_id.to_string(),
            kind,
            reason,
            payload,
            attempts,
            dead_lettered_at: time::now(),
            replayed_at: None,
        }
    }
}

/// Where a dead letter ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stored {
    Database,
    Fallback,
}

pub fn insert(conn: &Connection, letter: &DeadLetter) -> Result<(), CatalogError> {
    conn.execute(
        "INSERT OR IGNORE INTO dead_letters(id, event_id, kind, reason, payload, attempts,
            dead_lettered_at, replayed_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            letter.id,
            letter.event_id,
            letter.kind.as_str(),
            letter.reason,
            serde_json::to_string(&letter.payload)?,
            letter.attempts as i64,
            time::to_db(&letter.dead_lettered_at),
            letter.replayed_at.as_ref().map(time::to_db),
        ],
    )?;
    Ok(())
}

fn append_fallback(store: &Store, letter: &DeadLetter) -> Result<(), CatalogError> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(store.dead_letter_fallback_path())
        .map_err(CatalogError::IoError)?;
    writeln!(f, "{}", serde_json::to_string(letter)?).map_err(CatalogError::IoError)?;
    Ok(())
}

/// Persist a dead letter, falling back to the JSONL file if the database write fails.
pub fn record(store: &Store, letter: &DeadLetter) -> Result<Stored, CatalogError> {
    let db_path = db::catalog_db_path(&store.root);
    tracing::warn!(
        event_id = %letter.event_id,
        kind = letter.kind.as_str(),
        attempts = letter.attempts,
        reason = %letter.reason,
        "event dead-lettered"
    );
    match pool::global_pool().with_write(&db_path, |conn| insert(conn, letter)) {
        Ok(()) => Ok(Stored::Database),
        Err(e) => {
            tracing::error!(error = %e, event_id = %letter.event_id, "dead-letter table unavailable, using fallback file");
            append_fallback(store, letter)?;
            Ok(Stored::Fallback)
        }
    }
}

/// Move letters from the fallback file into the table. Returns how many were imported.
pub fn import_fallback(store: &Store, conn: &Connection) -> Result<usize, CatalogError> {
    let path = store.dead_letter_fallback_path();
    if !path.exists() {
        return Ok(0);
    }
    let file = fs::File::open(&path).map_err(CatalogError::IoError)?;
    let mut imported = 0;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(CatalogError::IoError)?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let letter: DeadLetter = serde_json::from_str(line).map_err(|e| {
            CatalogError::ValidationError(format!("Invalid dead-letter JSON: {}", e))
        })?;
        insert(conn, &letter)?;
        imported += 1;
    }
    fs::remove_file(&path).map_err(CatalogError::IoError)?;
    Ok(imported)
}

pub fn list(
    conn: &Connection,
    kind: Option<DeadLetterKind>,
    include_replayed: bool,
) -> Result<Vec<DeadLetter>, CatalogError> {
    let mut sql = String::from(
        "SELECT id, event_id, kind, reason, payload, attempts, dead_lettered_at, replayed_at
         FROM dead_letters WHERE (?1 IS NULL OR kind = ?1)",
    );
    if !include_replayed {
        sql.push_str(" AND replayed_at IS NULL");
    }
    sql.push_str(" ORDER BY dead_lettered_at, id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![kind.map(|k| k.as_str())], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(id, event_id, kind, reason, payload, attempts, dead_lettered_at, replayed_at)| {
                Ok(DeadLetter {
                    id,
                    event_id,
                    kind: DeadLetterKind::parse(&kind)?,
                    reason,
                    payload: serde_json::from_str(&payload)?,
                    attempts: attempts.max(0) as u32,
                    dead_lettered_at: time::from_db(&dead_lettered_at)?,
                    replayed_at: replayed_at.as_deref().map(time::from_db).transpose()?,
                })
            },
        )
        .collect()
}

pub fn mark_replayed(conn: &Connection, id: &str, at: &DateTime<Utc>) -> Result<bool, CatalogError> {
    let changed = conn.execute(
        "UPDATE dead_letters SET replayed_at = ?1 WHERE id = ?2 AND replayed_at IS NULL",
        params![time::to_db(at), id],
    )?;
    Ok(changed > 0)
}
