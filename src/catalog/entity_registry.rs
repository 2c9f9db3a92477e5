//! Entity Registry: materialized current state per entity, derived from the
//! event log.
//!
//! Writes go through [`upsert`] with optimistic concurrency; only the
//! ingestion pipeline calls it. Point-in-time reads fold the event log
//! directly, so they never depend on projection history.

use crate::catalog::event_log::{self, EventLogEntry};
use crate::catalog::model::{Attributes, EntityKey, EventType};
use crate::catalog::schema_registry;
use crate::core::error::CatalogError;
use crate::core::time;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: String,
    pub source_system: String,
    pub source_entity_id: String,
    /// Canonical `<source_system>:<source_entity_id>`.
    pub entity_id: String,
    pub version: i64,
    pub schema_version: Option<i64>,
    pub attributes: Attributes,
    pub contains_pii: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_event_id: String,
}

impl Entity {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(
            &self.entity_type,
            &self.source_system,
            &self.source_entity_id,
        )
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Same ordering as [`EventLogEntry::dominance_key`] for the event that produced this state.
    pub fn dominance_key(&self) -> (i64, DateTime<Utc>, &str) {
        (self.version, self.updated_at, self.last_event_id.as_str())
    }

    /// State implied by a single dominant event.
    pub fn from_event(
        entry: &EventLogEntry,
        attributes: Attributes,
        contains_pii: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_type: entry.entity.entity_type.clone(),
            source_system: entry.entity.source_system.clone(),
            source_entity_id: entry.entity.source_entity_id.clone(),
            entity_id: entry.entity.entity_id(),
            version: entry.version,
            schema_version: entry.schema_version,
            attributes,
            contains_pii,
            created_at: created_at.min(entry.occurred_at),
            updated_at: entry.occurred_at,
            deleted_at: (entry.event_type == EventType::Deleted).then_some(entry.occurred_at),
            last_event_id: entry.event_id.clone(),
        }
    }
}

struct RawEntity {
    entity_type: String,
    source_system: String,
    source_entity_id: String,
    version: i64,
    schema_version: Option<i64>,
    attributes: String,
    contains_pii: bool,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
    last_event_id: String,
}

const SELECT_ENTITY: &str = "SELECT entity_type, source_system, source_entity_id, version, schema_version,
        attributes, contains_pii, created_at, updated_at, deleted_at, last_event_id
     FROM entities";

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntity> {
    Ok(RawEntity {
        entity_type: row.get(0)?,
        source_system: row.get(1)?,
        source_entity_id: row.get(2)?,
        version: row.get(3)?,
        schema_version: row.get(4)?,
        attributes: row.get(5)?,
        contains_pii: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        deleted_at: row.get(9)?,
        last_event_id: row.get(10)?,
    })
}

fn decode(raw: RawEntity) -> Result<Entity, CatalogError> {
    let entity_id = format!("{}:{}", raw.source_system, raw.source_entity_id);
    Ok(Entity {
        entity_type: raw.entity_type,
        source_system: raw.source_system,
        source_entity_id: raw.source_entity_id,
        entity_id,
        version: raw.version,
        schema_version: raw.schema_version,
        attributes: serde_json::from_str(&raw.attributes)?,
        contains_pii: raw.contains_pii,
        created_at: time::from_db(&raw.created_at)?,
        updated_at: time::from_db(&raw.updated_at)?,
        deleted_at: raw.deleted_at.as_deref().map(time::from_db).transpose()?,
        last_event_id: raw.last_event_id,
    })
}

pub fn get(conn: &Connection, key: &EntityKey) -> Result<Option<Entity>, CatalogError> {
    conn.query_row(
        &format!(
            "{} WHERE entity_type = ?1 AND source_system = ?2 AND source_entity_id = ?3",
            SELECT_ENTITY
        ),
        params![key.entity_type, key.source_system, key.source_entity_id],
        read_raw,
    )
    .optional()?
    .map(decode)
    .transpose()
}

pub fn require(conn: &Connection, key: &EntityKey) -> Result<Entity, CatalogError> {
    get(conn, key)?.ok_or_else(|| CatalogError::NotFound(format!("Entity '{}' not found", key)))
}

/// Write `entity` if the stored version still equals `expected_version`
/// (`None` = the entity must not exist yet).
pub fn upsert(
    conn: &Connection,
    entity: &Entity,
    expected_version: Option<i64>,
) -> Result<Entity, CatalogError> {
    let attributes = serde_json::to_string(&entity.attributes)?;
    let created_at = time::to_db(&entity.created_at);
    let updated_at = time::to_db(&entity.updated_at);
    let deleted_at = entity.deleted_at.as_ref().map(time::to_db);

    let changed = match expected_version {
        None => conn.execute(
            "INSERT OR IGNORE INTO entities(entity_type, source_system, source_entity_id, version,
                schema_version, attributes, contains_pii, created_at, updated_at, deleted_at, last_event_id)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entity.entity_type,
                entity.source_system,
                entity.source_entity_id,
                entity.version,
                entity.schema_version,
                attributes,
                entity.contains_pii,
                created_at,
                updated_at,
                deleted_at,
                entity.last_event_id,
            ],
        )?,
        Some(expected) => conn.execute(
            "UPDATE entities SET version = ?1, schema_version = ?2, attributes = ?3, contains_pii = ?4,
                created_at = ?5, updated_at = ?6, deleted_at = ?7, last_event_id = ?8
             WHERE entity_type = ?9 AND source_system = ?10 AND source_entity_id = ?11 AND version = ?12",
            params![
                entity.version,
                entity.schema_version,
                attributes,
                entity.contains_pii,
                created_at,
                updated_at,
                deleted_at,
                entity.last_event_id,
                entity.entity_type,
                entity.source_system,
                entity.source_entity_id,
                expected,
            ],
        )?,
    };

    if changed == 0 {
        let found = get(conn, &entity.key())?.map(|e| e.version);
        return Err(CatalogError::VersionConflict {
            entity: entity.key().to_string(),
            expected: expected_version,
            found,
        });
    }
    Ok(entity.clone())
}

/// Pull `created_at` back to `ts` if it is earlier; used for events that
/// lose on dominance but still occurred first.
pub fn lower_created_at(
    conn: &Connection,
    key: &EntityKey,
    ts: &DateTime<Utc>,
) -> Result<bool, CatalogError> {
    let raw = time::to_db(ts);
    let changed = conn.execute(
        "UPDATE entities SET created_at = ?1
         WHERE entity_type = ?2 AND source_system = ?3 AND source_entity_id = ?4 AND created_at > ?1",
        params![raw, key.entity_type, key.source_system, key.source_entity_id],
    )?;
    Ok(changed > 0)
}

pub fn list(
    conn: &Connection,
    entity_type: &str,
    source_system: Option<&str>,
    include_deleted: bool,
    limit: usize,
) -> Result<Vec<Entity>, CatalogError> {
    let mut sql = format!("{} WHERE entity_type = ?1 AND (?2 IS NULL OR source_system = ?2)", SELECT_ENTITY);
    if !include_deleted {
        sql.push_str(" AND deleted_at IS NULL");
    }
    sql.push_str(" ORDER BY source_system, source_entity_id LIMIT ?3");
    let mut stmt = conn.prepare(&sql)?;
    let raws = stmt
        .query_map(params![entity_type, source_system, limit as i64], read_raw)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(decode).collect()
}

pub fn count(conn: &Connection) -> Result<i64, CatalogError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))?)
}

/// The dominant entry and the earliest `occurred_at` among `entries`.
/// Independent of the order of `entries`.
pub fn fold_dominant(entries: &[EventLogEntry]) -> Option<(&EventLogEntry, DateTime<Utc>)> {
    let dominant = entries.iter().max_by(|a, b| a.dominance_key().cmp(&b.dominance_key()))?;
    let earliest = entries.iter().map(|e| e.occurred_at).min()?;
    Some((dominant, earliest))
}

/// Entity state as of `at`, folded from the event log.
pub fn get_as_of(
    conn: &Connection,
    key: &EntityKey,
    at: &DateTime<Utc>,
) -> Result<Option<Entity>, CatalogError> {
    let entries = event_log::for_entity(conn, key, Some(at))?;
    let Some((dominant, earliest)) = fold_dominant(&entries) else {
        return Ok(None);
    };
    let (attributes, schema) = schema_registry::attributes_for(
        conn,
        &dominant.entity.entity_type,
        dominant.schema_version,
        &dominant.payload,
        dominant.event_type,
    )?;
    let contains_pii =
        dominant.contains_pii || schema.as_ref().is_some_and(|s| s.pii_present(&attributes));
    Ok(Some(Entity::from_event(
        dominant,
        attributes,
        contains_pii,
        earliest,
    )))
}
