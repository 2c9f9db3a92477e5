//! Outbound invalidation signals for downstream caches.
//!
//! Delivery is best-effort: a failing sink is logged and never fails the
//! ingestion that triggered it.

use crate::core::error::CatalogError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::mpsc::Sender;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationSignal {
    pub entity_type: String,
    pub entity_id: String,
    pub changed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_fields: Vec<String>,
}

pub trait InvalidationSink: Send + Sync {
    fn emit(&self, signal: &InvalidationSignal) -> Result<(), CatalogError>;
}

/// Discards every signal.
#[derive(Debug, Default)]
pub struct NullSink;

impl InvalidationSink for NullSink {
    fn emit(&self, _signal: &InvalidationSignal) -> Result<(), CatalogError> {
        Ok(())
    }
}

/// Appends one JSON line per signal.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }
}

impl InvalidationSink for JsonlSink {
    fn emit(&self, signal: &InvalidationSignal) -> Result<(), CatalogError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| CatalogError::Internal("Invalidation sink lock poisoned".to_string()))?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(CatalogError::IoError)?;
        writeln!(f, "{}", serde_json::to_string(signal)?).map_err(CatalogError::IoError)?;
        Ok(())
    }
}

/// Forwards signals to an in-process receiver.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Mutex<Sender<InvalidationSignal>>,
}

impl ChannelSink {
    pub fn new(tx: Sender<InvalidationSignal>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl InvalidationSink for ChannelSink {
    fn emit(&self, signal: &InvalidationSignal) -> Result<(), CatalogError> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| CatalogError::Internal("Invalidation channel lock poisoned".to_string()))?;
        tx.send(signal.clone())
            .map_err(|_| CatalogError::ValidationError("Invalidation receiver dropped".to_string()))
    }
}

/// Emit, logging instead of propagating failures.
pub fn emit_best_effort(sink: &dyn InvalidationSink, signal: &InvalidationSignal) {
    if let Err(e) = sink.emit(signal) {
        tracing::warn!(
            entity_type = %signal.entity_type,
            entity_id = %signal.entity_id,
            error = %e,
            "invalidation signal not delivered"
        );
    }
}
