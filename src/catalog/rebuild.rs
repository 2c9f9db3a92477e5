//! Deterministic rebuild of the projections from the event log.
//!
//! Replays archived and live entries in `seq` order through the same
//! [`ingest::project`] used by live ingestion. `canonical_state_hash` digests
//! the projections so two stores (or a store and its replay) can be compared.

use crate::catalog::event_log::{self, EventLogEntry};
use crate::catalog::ingest::{self, History, Projection};
use crate::catalog::retention;
use crate::core::db;
use crate::core::error::CatalogError;
use crate::core::pool;
use crate::core::store::Store;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub archived_events: usize,
    pub live_events: usize,
    pub dominant: usize,
    pub stale: usize,
    pub entities: i64,
    pub edges: i64,
    pub state_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub live_hash: String,
    pub replayed_hash: String,
    pub matches: bool,
}

/// Archived entries followed by live ones, deduplicated on `seq`.
fn full_log(store: &Store, conn: &Connection) -> Result<(usize, usize, Vec<EventLogEntry>), CatalogError> {
    let archived = retention::read_archives(store)?;
    let live = event_log::all_ordered(conn)?;
    let (archived_count, live_count) = (archived.len(), live.len());
    let mut by_seq: BTreeMap<i64, EventLogEntry> = BTreeMap::new();
    for entry in archived.into_iter().chain(live) {
        by_seq.insert(entry.seq, entry);
    }
    Ok((archived_count, live_count, by_seq.into_values().collect()))
}

/// Clear the projections in `conn` and replay `entries` into them.
pub fn replay_into(
    conn: &Connection,
    entries: &[EventLogEntry],
) -> Result<(usize, usize), CatalogError> {
    conn.execute("DELETE FROM relationships", [])?;
    conn.execute("DELETE FROM entities", [])?;
    let (mut dominant, mut stale) = (0, 0);
    for entry in entries {
        match ingest::project(conn, entry, History::Loaded(entries))? {
            Projection::Dominant => dominant += 1,
            Projection::Stale { .. } => stale += 1,
        }
    }
    Ok((dominant, stale))
}

fn hash_table(hasher: &mut Sha256, conn: &Connection, sql: &str) -> Result<(), CatalogError> {
    let mut stmt = conn.prepare(sql)?;
    let columns = stmt.column_count();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        for i in 0..columns {
            match row.get_ref(i)? {
                ValueRef::Null => hasher.update(b"\0"),
                ValueRef::Integer(v) => hasher.update(v.to_string().as_bytes()),
                ValueRef::Real(v) => hasher.update(v.to_string().as_bytes()),
                ValueRef::Text(t) | ValueRef::Blob(t) => hasher.update(t),
            }
            hasher.update(b"|");
        }
        hasher.update(b"\n");
    }
    Ok(())
}

/// SHA-256 over every projected entity and edge in a fixed order.
pub fn canonical_state_hash(conn: &Connection) -> Result<String, CatalogError> {
    let mut hasher = Sha256::new();
    hash_table(
        &mut hasher,
        conn,
        "SELECT entity_type, source_system, source_entity_id, version, schema_version, attributes,
                contains_pii, created_at, updated_at, deleted_at, last_event_id
         FROM entities ORDER BY entity_type, source_system, source_entity_id",
    )?;
    hasher.update(b"--\n");
    hash_table(
        &mut hasher,
        conn,
        "SELECT edge_id, subject_type, subject_id, relation_type, object_type, object_id,
                valid_from, valid_to, origin, event_id
         FROM relationships ORDER BY edge_id",
    )?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Replace the projections with a fresh replay of the full log.
pub fn rebuild_projections(store: &Store) -> Result<RebuildReport, CatalogError> {
    let db_path = db::catalog_db_path(&store.root);
    let report = pool::global_pool().with_write(&db_path, |conn| {
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
        let (archived_events, live_events, entries) = full_log(store, &tx)?;
        let (dominant, stale) = replay_into(&tx, &entries)?;
        let state_hash = canonical_state_hash(&tx)?;
        let entities: i64 = tx.query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))?;
        let edges: i64 = tx.query_row("SELECT COUNT(*) FROM relationships", [], |r| r.get(0))?;
        tx.commit()?;
        Ok(RebuildReport {
            archived_events,
            live_events,
            dominant,
            stale,
            entities,
            edges,
            state_hash,
        })
    })?;
    tracing::info!(
        events = report.archived_events + report.live_events,
        entities = report.entities,
        edges = report.edges,
        hash = %report.state_hash,
        "projections rebuilt"
    );
    Ok(report)
}

/// Replay the log into a scratch in-memory database and compare hashes
/// with the live projections. The live store is not modified.
pub fn verify_replay(store: &Store) -> Result<VerifyReport, CatalogError> {
    let db_path = db::catalog_db_path(&store.root);
    let live_hash = pool::global_pool().with_read(&db_path, canonical_state_hash)?;

    let scratch = Connection::open_in_memory()?;
    db::ensure_schema(&scratch)?;
    scratch.execute(
        "ATTACH DATABASE ?1 AS live",
        params![db_path.to_string_lossy()],
    )?;
    scratch.execute_batch(
        "INSERT INTO main.schemas SELECT * FROM live.schemas;
         INSERT INTO main.event_log SELECT * FROM live.event_log;
         DETACH DATABASE live;",
    )?;
    let (_, _, entries) = full_log(store, &scratch)?;
    replay_into(&scratch, &entries)?;
    let replayed_hash = canonical_state_hash(&scratch)?;

    let matches = live_hash == replayed_hash;
    if matches {
        tracing::info!(hash = %live_hash, "replay matches live projections");
    } else {
        tracing::warn!(%live_hash, %replayed_hash, "replay diverges from live projections");
    }
    Ok(VerifyReport {
        live_hash,
        replayed_hash,
        matches,
    })
}
