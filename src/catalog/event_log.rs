//! Event Log: append-only record of every accepted change notification.
//!
//! Rows are never updated. `seq` is the log position; replaying entries in
//! `seq` order reproduces the projections exactly. Retention may remove whole
//! months from the table after archiving them (see `retention`).

use crate::catalog::model::{
    ChangeNotification, EntityKey, EventType, RelationshipChange, TraceContext,
};
use crate::core::error::CatalogError;
use crate::core::time;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub seq: i64,
    pub event_id: String,
    pub entity: EntityKey,
    pub event_type: EventType,
    pub version: i64,
    pub schema_version: Option<i64>,
    pub changed_fields: Vec<String>,
    pub payload: JsonMap<String, JsonValue>,
    pub relationships: Vec<RelationshipChange>,
    pub contains_pii: bool,
    pub occurred_at: DateTime<Utc>,
    pub consumed_at: DateTime<Utc>,
    pub month: String,
    pub trace_context: Option<TraceContext>,
}

impl EventLogEntry {
    /// Ordering key for version dominance: version, then occurred_at, then event_id.
    pub fn dominance_key(&self) -> (i64, DateTime<Utc>, &str) {
        (self.version, self.occurred_at, self.event_id.as_str())
    }
}

struct RawEntry {
    seq: i64,
    event_id: String,
    entity_type: String,
    source_system: String,
    source_entity_id: String,
    event_type: String,
    version: i64,
    schema_version: Option<i64>,
    changed_fields: String,
    payload: String,
    relationships: String,
    contains_pii: bool,
    occurred_at: String,
    consumed_at: String,
    month: String,
    trace_id: Option<String>,
    span_id: Option<String>,
}

const SELECT_ENTRY: &str = "SELECT seq, event_id, entity_type, source_system, source_entity_id, event_type,
        version, schema_version, changed_fields, payload, relationships, contains_pii,
        occurred_at, consumed_at, month, trace_id, span_id
     FROM event_log";

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        seq: row.get(0)?,
        event_id: row.get(1)?,
        entity_type: row.get(2)?,
        source_system: row.get(3)?,
        source_entity_id: row.get(4)?,
        event_type: row.get(5)?,
        version: row.get(6)?,
        schema_version: row.get(7)?,
        changed_fields: row.get(8)?,
        payload: row.get(9)?,
        relationships: row.get(10)?,
        contains_pii: row.get(11)?,
        occurred_at: row.get(12)?,
        consumed_at: row.get(13)?,
        month: row.get(14)?,
        trace_id: row.get(15)?,
        span_id: row.get(16)?,
    })
}

fn decode(raw: RawEntry) -> Result<EventLogEntry, CatalogError> {
    let trace_context = match (raw.trace_id, raw.span_id) {
        (Some(trace_id), Some(span_id)) => Some(TraceContext { trace_id, span_id }),
        _ => None,
    };
    Ok(EventLogEntry {
        seq: raw.seq,
        event_id: raw.event_id,
        entity: EntityKey {
            entity_type: raw.entity_type,
            source_system: raw.source_system,
            source_entity_id: raw.source_entity_id,
        },
        event_type: EventType::parse(&raw.event_type)?,
        version: raw.version,
        schema_version: raw.schema_version,
        changed_fields: serde_json::from_str(&raw.changed_fields)?,
        payload: serde_json::from_str(&raw.payload)?,
        relationships: serde_json::from_str(&raw.relationships)?,
        contains_pii: raw.contains_pii,
        occurred_at: time::from_db(&raw.occurred_at)?,
        consumed_at: time::from_db(&raw.consumed_at)?,
        month: raw.month,
        trace_context,
    })
}

fn query_entries(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<EventLogEntry>, CatalogError> {
    let mut stmt = conn.prepare(sql)?;
    let raws = stmt
        .query_map(params, read_raw)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(decode).collect()
}

pub fn contains(conn: &Connection, event_id: &str) -> Result<bool, CatalogError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM event_log WHERE event_id = ?1",
        params![event_id],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Append an accepted notification. This is the durability boundary.
pub fn append(
    conn: &Connection,
    n: &ChangeNotification,
    schema_version: Option<i64>,
    consumed_at: DateTime<Utc>,
) -> Result<EventLogEntry, CatalogError> {
    let occurred_at = time::normalize(n.occurred_at);
    let consumed_at = time::normalize(consumed_at);
    let month = time::month_of(&consumed_at);
    conn.execute(
        "INSERT INTO event_log(event_id, entity_type, source_system, source_entity_id, event_type,
            version, schema_version, changed_fields, payload, relationships, contains_pii,
            occurred_at, consumed_at, month, trace_id, span_id)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            n.event_id,
            n.entity_type,
            n.source_system,
            n.source_entity_id,
            n.event_type.as_str(),
            n.version,
            schema_version,
            serde_json::to_string(&n.changed_fields)?,
            serde_json::to_string(&n.payload)?,
            serde_json::to_string(&n.relationships)?,
            n.contains_pii,
            time::to_db(&occurred_at),
            time::to_db(&consumed_at),
            month,
            n.trace_context.as_ref().map(|t| t.trace_id.clone()),
            n.trace_context.as_ref().map(|t| t.span_id.clone()),
        ],
    )?;
    Ok(EventLogEntry {
        seq: conn.last_insert_rowid(),
        event_id: n.event_id.clone(),
        entity: n.key(),
        event_type: n.event_type,
        version: n.version,
        schema_version,
        changed_fields: n.changed_fields.clone(),
        payload: n.payload.clone(),
        relationships: n.relationships.clone(),
        contains_pii: n.contains_pii,
        occurred_at,
        consumed_at,
        month,
        trace_context: n.trace_context.clone(),
    })
}

pub fn get(conn: &Connection, event_id: &str) -> Result<Option<EventLogEntry>, CatalogError> {
    conn.query_row(
        &format!("{} WHERE event_id = ?1", SELECT_ENTRY),
        params![event_id],
        read_raw,
    )
    .optional()?
    .map(decode)
    .transpose()
}

/// Entries for one entity in log order, optionally only those that occurred at or before `until`.
pub fn for_entity(
    conn: &Connection,
    key: &EntityKey,
    until: Option<&DateTime<Utc>>,
) -> Result<Vec<EventLogEntry>, CatalogError> {
    match until {
        Some(t) => query_entries(
            conn,
            &format!(
                "{} WHERE entity_type = ?1 AND source_system = ?2 AND source_entity_id = ?3
                   AND occurred_at <= ?4 ORDER BY seq",
                SELECT_ENTRY
            ),
            params![
                key.entity_type,
                key.source_system,
                key.source_entity_id,
                time::to_db(t)
            ],
        ),
        None => query_entries(
            conn,
            &format!(
                "{} WHERE entity_type = ?1 AND source_system = ?2 AND source_entity_id = ?3 ORDER BY seq",
                SELECT_ENTRY
            ),
            params![key.entity_type, key.source_system, key.source_entity_id],
        ),
    }
}

pub fn all_ordered(conn: &Connection) -> Result<Vec<EventLogEntry>, CatalogError> {
    query_entries(conn, &format!("{} ORDER BY seq", SELECT_ENTRY), [])
}

pub fn in_month(conn: &Connection, month: &str) -> Result<Vec<EventLogEntry>, CatalogError> {
    query_entries(
        conn,
        &format!("{} WHERE month = ?1 ORDER BY seq", SELECT_ENTRY),
        params![month],
    )
}

/// Months present in the live table with their entry counts, oldest first.
pub fn months(conn: &Connection) -> Result<Vec<(String, i64)>, CatalogError> {
    let mut stmt =
        conn.prepare("SELECT month, COUNT(*) FROM event_log GROUP BY month ORDER BY month")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn delete_month(conn: &Connection, month: &str) -> Result<usize, CatalogError> {
    Ok(conn.execute("DELETE FROM event_log WHERE month = ?1", params![month])?)
}

pub fn count(conn: &Connection) -> Result<i64, CatalogError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM event_log", [], |r| r.get(0))?)
}
