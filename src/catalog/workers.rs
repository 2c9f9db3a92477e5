//! Partitioned ingestion workers.
//!
//! Each worker thread owns one partition and applies its events strictly in
//! submission order. Events for the same `(source_system, source_entity_id)`
//! always land on the same worker.

use crate::catalog::ingest::{IngestStats, Pipeline};
use crate::catalog::model::ChangeNotification;
use crate::core::error::CatalogError;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

/// Stable partition for an entity.
pub fn partition_for(source_system: &str, source_entity_id: &str, partitions: usize) -> usize {
    let mut hasher = FxHasher::default();
    source_system.hash(&mut hasher);
    source_entity_id.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

pub struct WorkerPool {
    senders: Vec<Sender<ChangeNotification>>,
    handles: Vec<JoinHandle<IngestStats>>,
}

impl WorkerPool {
    pub fn start(pipeline: Arc<Pipeline>, workers: usize) -> Result<Self, CatalogError> {
        if workers == 0 {
            return Err(CatalogError::ConfigError(
                "worker pool needs at least one worker".to_string(),
            ));
        }
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::channel::<ChangeNotification>();
            let pipeline = Arc::clone(&pipeline);
            let handle = thread::Builder::new()
                .name(format!("meshcat-ingest-{}", index))
                .spawn(move || {
                    let mut stats = IngestStats::default();
                    for n in rx {
                        let result = pipeline.apply(&n);
                        stats.record(&n.event_id, &result);
                    }
                    tracing::debug!(worker = index, applied = stats.applied, failed = stats.failed, "ingest worker drained");
                    stats
                })
                .map_err(CatalogError::IoError)?;
            senders.push(tx);
            handles.push(handle);
        }
        tracing::info!(workers, "ingest worker pool started");
        Ok(Self { senders, handles })
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Queue a notification on its entity's partition.
    pub fn submit(&self, n: ChangeNotification) -> Result<(), CatalogError> {
        let idx = partition_for(&n.source_system, &n.source_entity_id, self.senders.len());
        self.senders[idx].send(n).map_err(|e| {
            CatalogError::ValidationError(format!(
                "ingest worker {} stopped; event '{}' not queued",
                idx, e.0.event_id
            ))
        })
    }

    /// Close the queues, wait for every worker to drain, and merge their counters.
    pub fn shutdown(self) -> Result<IngestStats, CatalogError> {
        drop(self.senders);
        let mut total = IngestStats::default();
        for handle in self.handles {
            let stats = handle.join().map_err(|_| {
                CatalogError::ValidationError("ingest worker panicked".to_string())
            })?;
            total.merge(stats);
        }
        tracing::info!(
            applied = total.applied,
            stale = total.stale,
            duplicate = total.duplicate,
            failed = total.failed,
            "ingest worker pool stopped"
        );
        Ok(total)
    }
}
