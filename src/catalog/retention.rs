//! Monthly retention for the event log.
//!
//! Old months are first written to `archive/events-YYYY-MM.jsonl` (merged
//! with any existing archive for that month), then removed from the live
//! table. Rebuild reads the archives back, so projections stay reproducible.
//! Deduplication only sees the live table: an event redelivered after its
//! month was pruned is treated as new.

use crate::catalog::event_log::{self, EventLogEntry};
use crate::core::db;
use crate::core::error::CatalogError;
use crate::core::pool;
use crate::core::store::Store;
use crate::core::time;
use chrono::{DateTime, Utc};
use rusqlite::{Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub fn archive_path(store: &Store, month: &str) -> PathBuf {
    store.archive_dir().join(format!("events-{}.jsonl", month))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedMonth {
    pub month: String,
    pub events: usize,
    pub archive: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    /// Oldest month kept in the live table.
    pub keep_from: String,
    pub pruned: Vec<ArchivedMonth>,
}

fn read_archive(path: &Path) -> Result<Vec<EventLogEntry>, CatalogError> {
    let file = fs::File::open(path).map_err(CatalogError::IoError)?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(CatalogError::IoError)?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry: EventLogEntry = serde_json::from_str(line).map_err(|e| {
            CatalogError::ValidationError(format!(
                "Invalid archived event in {}: {}",
                path.display(),
                e
            ))
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Write `entries` to `path` atomically (temp file + rename).
fn write_archive(path: &Path, entries: &[EventLogEntry]) -> Result<(), CatalogError> {
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut f = fs::File::create(&tmp).map_err(CatalogError::IoError)?;
        for entry in entries {
            writeln!(f, "{}", serde_json::to_string(entry)?).map_err(CatalogError::IoError)?;
        }
        f.sync_all().map_err(CatalogError::IoError)?;
    }
    fs::rename(&tmp, path).map_err(CatalogError::IoError)?;
    Ok(())
}

/// Every archived entry, in log (`seq`) order.
pub fn read_archives(store: &Store) -> Result<Vec<EventLogEntry>, CatalogError> {
    let dir = store.archive_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut by_seq = BTreeMap::new();
    for dirent in fs::read_dir(&dir).map_err(CatalogError::IoError)? {
        let path = dirent.map_err(CatalogError::IoError)?.path();
        let is_archive = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("events-") && n.ends_with(".jsonl"));
        if !is_archive {
            continue;
        }
        for entry in read_archive(&path)? {
            by_seq.insert(entry.seq, entry);
        }
    }
    Ok(by_seq.into_values().collect())
}

/// Archive and drop every month older than the newest `keep_months` months
/// (the current month counts as one).
pub fn prune(
    store: &Store,
    keep_months: u32,
    now: DateTime<Utc>,
) -> Result<PruneReport, CatalogError> {
    if keep_months == 0 {
        return Err(CatalogError::ValidationError(
            "retention must keep at least one month".to_string(),
        ));
    }
    let keep_from = time::month_minus(&now, keep_months - 1);
    let db_path = db::catalog_db_path(&store.root);
    fs::create_dir_all(store.archive_dir()).map_err(CatalogError::IoError)?;

    let pruned = pool::global_pool().with_write(&db_path, |conn| {
        let mut pruned = Vec::new();
        for (month, _) in event_log::months(conn)? {
            if month >= keep_from {
                continue;
            }
            let path = archive_path(store, &month);
            let mut by_seq: BTreeMap<i64, EventLogEntry> = BTreeMap::new();
            if path.exists() {
                for entry in read_archive(&path)? {
                    by_seq.insert(entry.seq, entry);
                }
            }
            let live = event_log::in_month(conn, &month)?;
            let events = live.len();
            for entry in live {
                by_seq.insert(entry.seq, entry);
            }
            let merged: Vec<_> = by_seq.into_values().collect();
            write_archive(&path, &merged)?;

            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            event_log::delete_month(&tx, &month)?;
            tx.commit()?;

            tracing::info!(%month, events, archive = %path.display(), "event log month archived");
            pruned.push(ArchivedMonth {
                month,
                events,
                archive: path,
            });
        }
        Ok(pruned)
    })?;

    Ok(PruneReport { keep_from, pruned })
}
