//! Lineage Tracker: append-only upstream -> downstream transformation edges.

use crate::catalog::model::{EntityRef, validate_ident};
use crate::core::error::CatalogError;
use crate::core::time;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// What produced the downstream entity from the upstream one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form producer details (job id, SQL, commit, ...).
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub details: JsonValue,
}

impl Transformation {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            details: JsonValue::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEdge {
    pub lineage_id: String,
    pub upstream: EntityRef,
    pub downstream: EntityRef,
    pub transformation: Transformation,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageAck {
    pub lineage_id: String,
    pub recorded_at: DateTime<Utc>,
}

pub fn record(
    conn: &Connection,
    upstream: &EntityRef,
    downstream: &EntityRef,
    transformation: &Transformation,
    recorded_at: DateTime<Utc>,
) -> Result<LineageAck, CatalogError> {
    for r in [upstream, downstream] {
        validate_ident("entity_type", &r.entity_type)?;
        r.key()?;
    }
    if upstream == downstream {
        return Err(CatalogError::ValidationError(format!(
            "Lineage edge from '{}' to itself",
            upstream
        )));
    }
    if transformation.name.trim().is_empty() {
        return Err(CatalogError::ValidationError(
            "transformation name must not be empty".to_string(),
        ));
    }

    let recorded_at = time::normalize(recorded_at);
    let lineage_id = time::new_id("LN");
    conn.execute(
        "INSERT INTO lineage(lineage_id, upstream_type, upstream_id, downstream_type, downstream_id,
            transformation, recorded_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            lineage_id,
            upstream.entity_type,
            upstream.entity_id,
            downstream.entity_type,
            downstream.entity_id,
            serde_json::to_string(transformation)?,
            time::to_db(&recorded_at),
        ],
    )?;
    tracing::info!(%lineage_id, %upstream, %downstream, transformation = %transformation.name, "lineage recorded");
    Ok(LineageAck {
        lineage_id,
        recorded_at,
    })
}

/// Edges where `node` is upstream or downstream, oldest first; with `as_of`,
/// only those recorded at or before it.
pub fn get(
    conn: &Connection,
    node: &EntityRef,
    as_of: Option<&DateTime<Utc>>,
) -> Result<Vec<LineageEdge>, CatalogError> {
    let cutoff = as_of.map(time::to_db);
    let mut stmt = conn.prepare(
        "SELECT lineage_id, upstream_type, upstream_id, downstream_type, downstream_id,
                transformation, recorded_at
         FROM lineage
         WHERE ((upstream_type = ?1 AND upstream_id = ?2) OR (downstream_type = ?1 AND downstream_id = ?2))
           AND (?3 IS NULL OR recorded_at <= ?3)
         ORDER BY recorded_at, lineage_id",
    )?;
    let rows = stmt
        .query_map(params![node.entity_type, node.entity_id, cutoff], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(id, ut, uid, dt, did, transformation, recorded_at)| {
            Ok(LineageEdge {
                lineage_id: id,
                upstream: EntityRef {
                    entity_type: ut,
                    entity_id: uid,
                },
                downstream: EntityRef {
                    entity_type: dt,
                    entity_id: did,
                },
                transformation: serde_json::from_str(&transformation)?,
                recorded_at: time::from_db(&recorded_at)?,
            })
        })
        .collect()
}

pub fn count(conn: &Connection) -> Result<i64, CatalogError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM lineage", [], |r| r.get(0))?)
}
