//! Ingestion pipeline: validate, log, project, signal.
//!
//! Per event, in one IMMEDIATE transaction:
//! 1. dedupe by `event_id` (a duplicate is a successful no-op)
//! 2. resolve and check the schema
//! 3. append to the event log
//! 4. fold into the entity registry by version dominance
//! 5. apply relationship changes
//!
//! Relationship edges are the fold of an entity's events in dominance order.
//! A dominant event extends that fold directly; a stale one lands in the
//! middle of it, so the subject's outgoing edges are re-derived from its full
//! history (archived months included).
//!
//! After commit an invalidation signal is emitted. Transient storage failures
//! are retried with backoff; anything that cannot be applied is dead-lettered.

use crate::catalog::dead_letter::{self, DeadLetter, DeadLetterKind};
use crate::catalog::entity_registry::{self, Entity};
use crate::catalog::event_log::{self, EventLogEntry};
use crate::catalog::graph::{self, EdgeOrigin};
use crate::catalog::invalidation::{self, InvalidationSignal, InvalidationSink};
use crate::catalog::model::{
    AttrValue, Attributes, ChangeNotification, EntityKey, EntityRef, EventType,
    RelationshipAction,
};
use crate::catalog::retention;
use crate::catalog::schema_registry::{self, SchemaDefinition};
use crate::core::config::IngestConfig;
use crate::core::db;
use crate::core::error::{CatalogError, ErrorClass};
use crate::core::pool::{self, RetryExhausted};
use crate::core::store::Store;
use crate::core::time;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

/// Re-reads allowed when the entity row moves under us.
const MAX_UPSERT_ROUNDS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Logged and now the entity's dominant state.
    Applied {
        seq: i64,
        entity_type: String,
        entity_id: String,
        version: i64,
    },
    /// Logged, but an equal-or-newer state was already current. Its
    /// relationship changes still take effect at their place in the history.
    Stale {
        seq: i64,
        entity_type: String,
        entity_id: String,
        version: i64,
        current_version: i64,
    },
    /// `event_id` already in the log; nothing changed.
    Duplicate { event_id: String },
}

/// Result of folding one logged entry into the projections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    Dominant,
    Stale { current_version: i64 },
}

/// Typed attributes plus PII flag for a logged entry.
fn materialize(
    conn: &Connection,
    entry: &EventLogEntry,
) -> Result<(Entity, Option<SchemaDefinition>), CatalogError> {
    let (attributes, schema) = schema_registry::attributes_for(
        conn,
        &entry.entity.entity_type,
        entry.schema_version,
        &entry.payload,
        entry.event_type,
    )?;
    let contains_pii =
        entry.contains_pii || schema.as_ref().is_some_and(|s| s.pii_present(&attributes));
    Ok((
        Entity::from_event(entry, attributes, contains_pii, entry.occurred_at),
        schema,
    ))
}

/// Where an entity's earlier events are found when its edges are re-derived.
#[derive(Debug, Clone, Copy)]
pub enum History<'a> {
    /// The live table, plus archived months read from the store.
    Store(&'a Store),
    /// The whole log already in memory, archived entries included.
    Loaded(&'a [EventLogEntry]),
}

impl History<'_> {
    /// Events of `key` logged up to `seq`, one per `event_id`, in dominance order.
    fn for_entity(
        &self,
        conn: &Connection,
        key: &EntityKey,
        seq: i64,
    ) -> Result<Vec<EventLogEntry>, CatalogError> {
        let mut entries: Vec<EventLogEntry> = match self {
            History::Store(store) => {
                let mut entries: Vec<_> = retention::read_archives(store)?
                    .into_iter()
                    .filter(|e| &e.entity == key)
                    .collect();
                entries.extend(event_log::for_entity(conn, key, None)?);
                entries
            }
            History::Loaded(log) => log.iter().filter(|e| &e.entity == key).cloned().collect(),
        };
        entries.retain(|e| e.seq <= seq);
        // a redelivery after retention is logged twice; the first one counts
        entries.sort_by_key(|e| e.seq);
        let mut seen = FxHashSet::default();
        entries.retain(|e| seen.insert(e.event_id.clone()));
        entries.sort_by(|a, b| a.dominance_key().cmp(&b.dominance_key()));
        Ok(entries)
    }
}

/// Drop the subject's edges and fold its history back into them.
fn refold_relationships(
    conn: &Connection,
    entry: &EventLogEntry,
    history: History<'_>,
) -> Result<(), CatalogError> {
    let events = history.for_entity(conn, &entry.entity, entry.seq)?;
    let subject = entry.entity.to_ref();
    graph::delete_outgoing(conn, &subject)?;
    for event in &events {
        let (entity, schema) = materialize(conn, event)?;
        apply_relationships(conn, event, schema.as_ref(), &entity.attributes)?;
    }
    tracing::debug!(%subject, events = events.len(), "edges re-derived for late event");
    Ok(())
}

/// Fold one event-log entry into the entity and relationship projections.
///
/// Shared by live ingestion and rebuild, so both make identical decisions.
pub fn project(
    conn: &Connection,
    entry: &EventLogEntry,
    history: History<'_>,
) -> Result<Projection, CatalogError> {
    let key = &entry.entity;
    for _ in 0..MAX_UPSERT_ROUNDS {
        let current = entity_registry::get(conn, key)?;
        if let Some(current) = &current
            && current.dominance_key() >= entry.dominance_key()
        {
            entity_registry::lower_created_at(conn, key, &entry.occurred_at)?;
            refold_relationships(conn, entry, history)?;
            return Ok(Projection::Stale {
                current_version: current.version,
            });
        }

        let (mut entity, schema) = materialize(conn, entry)?;
        if let Some(current) = &current {
            entity.created_at = entity.created_at.min(current.created_at);
        }
        match entity_registry::upsert(conn, &entity, current.as_ref().map(|c| c.version)) {
            Ok(_) => {
                apply_relationships(conn, entry, schema.as_ref(), &entity.attributes)?;
                return Ok(Projection::Dominant);
            }
            Err(CatalogError::VersionConflict { found, .. }) => {
                tracing::debug!(entity = %key, ?found, "entity moved during upsert, re-reading");
            }
            Err(e) => return Err(e),
        }
    }
    Err(CatalogError::VersionConflict {
        entity: key.to_string(),
        expected: None,
        found: entity_registry::get(conn, key)?.map(|e| e.version),
    })
}

/// Reference values a field populates: one id for strings, each string for lists.
fn referenced_ids(value: &AttrValue) -> Vec<&str> {
    match value {
        AttrValue::Text(s) if !s.is_empty() => vec![s.as_str()],
        AttrValue::List(items) => items
            .iter()
            .filter_map(AttrValue::as_text)
            .filter(|s| !s.is_empty())
            .collect(),
        _ => vec![],
    }
}

fn apply_relationships(
    conn: &Connection,
    entry: &EventLogEntry,
    schema: Option<&SchemaDefinition>,
    attributes: &Attributes,
) -> Result<(), CatalogError> {
    let subject = entry.entity.to_ref();
    let at = &entry.occurred_at;
    let system = &entry.entity.source_system;

    if entry.event_type == EventType::Deleted {
        let closed = graph::close_all_outgoing(conn, &subject, at)?;
        if closed > 0 {
            tracing::debug!(%subject, closed, "outgoing edges closed by delete");
        }
        return Ok(());
    }

    for rel in &entry.relationships {
        let object = EntityRef::qualify(&rel.object_type, &rel.object_id, system);
        match rel.action {
            RelationshipAction::Add => {
                graph::open_edge(
                    conn,
                    &subject,
                    &rel.relation_type,
                    &object,
                    EdgeOrigin::Explicit,
                    at,
                    &entry.event_id,
                )?;
            }
            RelationshipAction::Remove => {
                graph::close_edge(conn, &subject, &rel.relation_type, &object, at)?;
            }
        }
    }

    let Some(schema) = schema else {
        return Ok(());
    };
    let mut desired: BTreeSet<(String, EntityRef)> = BTreeSet::new();
    for field in schema.reference_fields() {
        let (Some(target), Some(value)) = (&field.references, attributes.get(&field.name)) else {
            continue;
        };
        for id in referenced_ids(value) {
            desired.insert((field.name.clone(), EntityRef::qualify(target, id, system)));
        }
    }

    for edge in graph::active_outgoing(conn, &subject, Some(EdgeOrigin::Inferred))? {
        let pair = (edge.relation_type.clone(), edge.object.clone());
        if !desired.remove(&pair) {
            graph::close_edge(conn, &subject, &edge.relation_type, &edge.object, at)?;
        }
    }
    for (relation_type, object) in desired {
        graph::open_edge(
            conn,
            &subject,
            &relation_type,
            &object,
            EdgeOrigin::Inferred,
            at,
            &entry.event_id,
        )?;
    }
    Ok(())
}

/// Steps 1-5 for one notification inside a single transaction.
fn try_apply(
    conn: &Connection,
    store: &Store,
    n: &ChangeNotification,
    require_schema: bool,
    consumed_at: DateTime<Utc>,
) -> Result<ApplyOutcome, CatalogError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    if event_log::contains(&tx, &n.event_id)? {
        return Ok(ApplyOutcome::Duplicate {
            event_id: n.event_id.clone(),
        });
    }

    let schema = schema_registry::resolve_for_event(&tx, n, require_schema)?;
    let entry = event_log::append(&tx, n, schema.as_ref().map(|s| s.version), consumed_at)?;
    let projection = project(&tx, &entry, History::Store(store))?;
    tx.commit()?;

    let entity_id = entry.entity.entity_id();
    Ok(match projection {
        Projection::Dominant => ApplyOutcome::Applied {
            seq: entry.seq,
            entity_type: entry.entity.entity_type,
            entity_id,
            version: entry.version,
        },
        Projection::Stale { current_version } => ApplyOutcome::Stale {
            seq: entry.seq,
            entity_type: entry.entity.entity_type,
            entity_id,
            version: entry.version,
            current_version,
        },
    })
}

/// An event the pipeline gave up on.
#[derive(Debug)]
pub struct Rejection {
    pub error: CatalogError,
    pub attempts: u32,
    /// Dead-letter category, or `None` for internal errors that are only reported.
    pub kind: Option<DeadLetterKind>,
}

impl Rejection {
    fn from_exhausted(exhausted: RetryExhausted) -> Self {
        let RetryExhausted { error, attempts } = exhausted;
        if error.is_transient() {
            return Self {
                kind: Some(DeadLetterKind::StorageUnavailable),
                error: CatalogError::StorageUnavailable {
                    attempts,
                    reason: error.to_string(),
                },
                attempts,
            };
        }
        let kind = match error.class() {
            ErrorClass::Conflict if matches!(error, CatalogError::SchemaConflict { .. }) => {
                Some(DeadLetterKind::SchemaConflict)
            }
            ErrorClass::Malformed => Some(DeadLetterKind::Malformed),
            _ => None,
        };
        Self {
            error,
            attempts,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEvent {
    pub event_id: String,
    pub class: ErrorClass,
    pub error: String,
}

/// Running counters for a batch or a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub applied: usize,
    pub stale: usize,
    pub duplicate: usize,
    pub failed: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailedEvent>,
}

impl IngestStats {
    pub fn record(&mut self, event_id: &str, result: &Result<ApplyOutcome, CatalogError>) {
        match result {
            Ok(ApplyOutcome::Applied { .. }) => self.applied += 1,
            Ok(ApplyOutcome::Stale { .. }) => self.stale += 1,
            Ok(ApplyOutcome::Duplicate { .. }) => self.duplicate += 1,
            Err(e) => {
                self.failed += 1;
                self.failures.push(FailedEvent {
                    event_id: event_id.to_string(),
                    class: e.class(),
                    error: e.to_string(),
                });
            }
        }
    }

    pub fn merge(&mut self, other: IngestStats) {
        self.applied += other.applied;
        self.stale += other.stale;
        self.duplicate += other.duplicate;
        self.failed += other.failed;
        self.failures.extend(other.failures);
    }

    pub fn total(&self) -> usize {
        self.applied + self.stale + self.duplicate + self.failed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub imported_from_fallback: usize,
    pub replayed: usize,
    pub still_failing: usize,
}

pub struct Pipeline {
    store: Store,
    db_path: PathBuf,
    config: IngestConfig,
    sink: Arc<dyn InvalidationSink>,
}

impl Pipeline {
    /// The catalog database under `store` must already be initialized.
    pub fn new(store: Store, config: IngestConfig, sink: Arc<dyn InvalidationSink>) -> Self {
        let db_path = db::catalog_db_path(&store.root);
        Self {
            store,
            db_path,
            config,
            sink,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Apply without dead-lettering; used directly by dead-letter replay.
    fn execute(&self, n: &ChangeNotification) -> Result<ApplyOutcome, Rejection> {
        if let Err(error) = n.check_well_formed() {
            return Err(Rejection {
                error,
                attempts: 1,
                kind: Some(DeadLetterKind::Malformed),
            });
        }

        let _span = tracing::info_span!(
            "ingest",
            event_id = %n.event_id,
            trace_id = n.trace_context.as_ref().map(|t| t.trace_id.as_str()).unwrap_or("")
        )
        .entered();

        let consumed_at = time::now();
        let outcome = self
            .config
            .retry_policy()
            .run(|| {
                pool::global_pool().with_write(&self.db_path, |conn| {
                    try_apply(conn, &self.store, n, self.config.require_schema, consumed_at)
                })
            })
            .map_err(Rejection::from_exhausted)?;

        match &outcome {
            ApplyOutcome::Applied {
                entity_type,
                entity_id,
                version,
                ..
            } => {
                tracing::info!(%entity_type, %entity_id, version, event_type = n.event_type.as_str(), "event applied");
                invalidation::emit_best_effort(
                    self.sink.as_ref(),
                    &InvalidationSignal {
                        entity_type: entity_type.clone(),
                        entity_id: entity_id.clone(),
                        changed_at: time::normalize(n.occurred_at),
                        changed_fields: n.changed_fields.clone(),
                    },
                );
            }
            ApplyOutcome::Stale {
                entity_id,
                version,
                current_version,
                ..
            } => {
                tracing::info!(%entity_id, version, current_version, "stale event logged, entity state unchanged");
            }
            ApplyOutcome::Duplicate { .. } => {
                tracing::debug!("duplicate event ignored");
            }
        }
        Ok(outcome)
    }

    fn dead_letter(&self, event_id: &str, payload: JsonValue, rejection: &Rejection) {
        let Some(kind) = rejection.kind else {
            tracing::error!(%event_id, error = %rejection.error, "event failed with internal error");
            return;
        };
        let letter = DeadLetter::new(
            event_id,
            kind,
            rejection.error.to_string(),
            payload,
            rejection.attempts,
        );
        if let Err(e) = dead_letter::record(&self.store, &letter) {
            tracing::error!(%event_id, error = %e, "dead letter lost");
        }
    }

    /// Apply one notification; failures are dead-lettered and returned.
    pub fn apply(&self, n: &ChangeNotification) -> Result<ApplyOutcome, CatalogError> {
        self.execute(n).map_err(|rejection| {
            let payload = serde_json::to_value(n).unwrap_or(JsonValue::Null);
            self.dead_letter(&n.event_id, payload, &rejection);
            rejection.error
        })
    }

    /// Parse and apply one raw JSON notification. Unparseable input is dead-lettered as malformed.
    pub fn apply_json(&self, raw: &str) -> Result<ApplyOutcome, CatalogError> {
        match serde_json::from_str::<ChangeNotification>(raw) {
            Ok(n) => self.apply(&n),
            Err(e) => {
                let payload = serde_json::from_str::<JsonValue>(raw)
                    .unwrap_or_else(|_| JsonValue::String(raw.to_string()));
                let event_id = payload
                    .get("event_id")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("")
                    .to_string();
                let rejection = Rejection {
                    error: CatalogError::ValidationError(format!(
                        "Invalid change notification: {}",
                        e
                    )),
                    attempts: 1,
                    kind: Some(DeadLetterKind::Malformed),
                };
                self.dead_letter(&event_id, payload, &rejection);
                Err(rejection.error)
            }
        }
    }

    /// Apply sequentially; one failure never blocks the rest.
    pub fn apply_batch(&self, notifications: &[ChangeNotification]) -> IngestStats {
        let mut stats = IngestStats::default();
        for n in notifications {
            let result = self.apply(n);
            stats.record(&n.event_id, &result);
        }
        stats
    }

    /// Re-submit unreplayed dead letters (optionally of one kind).
    pub fn replay_dead_letters(
        &self,
        kind: Option<DeadLetterKind>,
    ) -> Result<ReplayReport, CatalogError> {
        let (imported, letters) = pool::global_pool().with_write(&self.db_path, |conn| {
            let imported = dead_letter::import_fallback(&self.store, conn)?;
            Ok((imported, dead_letter::list(conn, kind, false)?))
        })?;

        let mut report = ReplayReport {
            imported_from_fallback: imported,
            ..ReplayReport::default()
        };
        for letter in letters {
            let result = serde_json::from_value::<ChangeNotification>(letter.payload.clone())
                .map_err(CatalogError::from)
                .and_then(|n| self.execute(&n).map_err(|r| r.error));
            match result {
                Ok(_) => {
                    let now = time::now();
                    pool::global_pool().with_write(&self.db_path, |conn| {
                        dead_letter::mark_replayed(conn, &letter.id, &now)
                    })?;
                    report.replayed += 1;
                }
                Err(e) => {
                    tracing::info!(id = %letter.id, event_id = %letter.event_id, error = %e, "dead letter still failing");
                    report.still_failing += 1;
                }
            }
        }
        tracing::info!(
            replayed = report.replayed,
            still_failing = report.still_failing,
            "dead-letter replay finished"
        );
        Ok(report)
    }
}
