//! Query Engine: the catalog's public façade.
//!
//! `Catalog` owns the store, its configuration and the ingestion pipeline.
//! Reads open their own WAL read connection and never wait on ingestion.

use crate::catalog::dead_letter::{self, DeadLetter, DeadLetterKind};
use crate::catalog::entity_registry::{self, Entity};
use crate::catalog::event_log::{self, EventLogEntry};
use crate::catalog::graph::{self, Direction, NodeSummary, RelationshipEdge, Subgraph, TraversalRequest};
use crate::catalog::ingest::{ApplyOutcome, IngestStats, Pipeline, ReplayReport};
use crate::catalog::invalidation::{InvalidationSink, JsonlSink};
use crate::catalog::lineage::{self, LineageAck, LineageEdge, Transformation};
use crate::catalog::model::{ChangeNotification, EntityRef};
use crate::catalog::rebuild::{self, RebuildReport, VerifyReport};
use crate::catalog::retention::{self, PruneReport};
use crate::catalog::schema_registry::{
    self, CompatibilityClass, FieldDef, RegisterOutcome, SchemaDefinition,
};
use crate::catalog::workers::WorkerPool;
use crate::core::config::{self, CatalogConfig};
use crate::core::db;
use crate::core::error::CatalogError;
use crate::core::pool;
use crate::core::store::Store;
use crate::core::time;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Parameters of a relationship-graph query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphQuery {
    pub entity_type: String,
    pub entity_id: String,
    /// Defaults to `query.default_depth`.
    pub max_depth: Option<usize>,
    pub relation_filter: Option<Vec<String>>,
    pub as_of: Option<DateTime<Utc>>,
    #[serde(default)]
    pub direction: Direction,
    /// Overrides `query.timeout_ms`.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl GraphQuery {
    pub fn new(entity_type: &str, entity_id: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            ..Self::default()
        }
    }
}

pub struct Catalog {
    store: Store,
    db_path: PathBuf,
    config: CatalogConfig,
    pipeline: Arc<Pipeline>,
}

impl Catalog {
    /// Open the store at `root` with its `meshcat.toml` (if any), publishing
    /// invalidations to `invalidations.jsonl`.
    pub fn open(root: &Path) -> Result<Self, CatalogError> {
        let config = config::load_config(root)?;
        let store = Store::open(root)?;
        let sink = Arc::new(JsonlSink::new(store.invalidations_path()));
        Self::open_with(root, config, sink)
    }

    pub fn open_with(
        root: &Path,
        config: CatalogConfig,
        sink: Arc<dyn InvalidationSink>,
    ) -> Result<Self, CatalogError> {
        config.validate()?;
        let store = Store::open(root)?;
        db::initialize_catalog_db(&store.root)?;
        let db_path = db::catalog_db_path(&store.root);
        let pipeline = Arc::new(Pipeline::new(store.clone(), config.ingest.clone(), sink));
        Ok(Self {
            store,
            db_path,
            config,
            pipeline,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline)
    }

    fn read<F, R>(&self, f: F) -> Result<R, CatalogError>
    where
        F: FnOnce(&Connection) -> Result<R, CatalogError>,
    {
        pool::global_pool().with_read(&self.db_path, f)
    }

    fn write<F, R>(&self, f: F) -> Result<R, CatalogError>
    where
        F: FnOnce(&Connection) -> Result<R, CatalogError>,
    {
        pool::global_pool().with_write(&self.db_path, f)
    }

    // --- Ingestion ---

    pub fn apply(&self, n: &ChangeNotification) -> Result<ApplyOutcome, CatalogError> {
        self.pipeline.apply(n)
    }

    pub fn apply_batch(&self, notifications: &[ChangeNotification]) -> IngestStats {
        self.pipeline.apply_batch(notifications)
    }

    /// Start `ingest.workers` partitioned workers sharing this catalog's pipeline.
    pub fn start_workers(&self) -> Result<WorkerPool, CatalogError> {
        WorkerPool::start(self.pipeline(), self.config.ingest.workers)
    }

    // --- Entities ---

    /// Current state, or the state as of `as_of` folded from the event log.
    /// Soft-deleted entities are returned with `deleted_at` set.
    pub fn get_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Entity, CatalogError> {
        let key = EntityRef::new(entity_type, entity_id).key()?;
        self.read(|conn| match as_of {
            None => entity_registry::require(conn, &key),
            Some(at) => entity_registry::get_as_of(conn, &key, &time::normalize(at))?
                .ok_or_else(|| {
                    CatalogError::NotFound(format!(
                        "Entity '{}' did not exist at {}",
                        key,
                        time::to_db(&at)
                    ))
                }),
        })
    }

    pub fn list_entities(
        &self,
        entity_type: &str,
        source_system: Option<&str>,
        include_deleted: bool,
        limit: usize,
    ) -> Result<Vec<Entity>, CatalogError> {
        self.read(|conn| {
            entity_registry::list(conn, entity_type, source_system, include_deleted, limit)
        })
    }

    /// Event log entries for one entity, in log order.
    pub fn entity_history(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<EventLogEntry>, CatalogError> {
        let key = EntityRef::new(entity_type, entity_id).key()?;
        self.read(|conn| event_log::for_entity(conn, &key, None))
    }

    // --- Graph ---

    fn summarize(
        conn: &Connection,
        node: &EntityRef,
        as_of: Option<&DateTime<Utc>>,
    ) -> Result<Option<NodeSummary>, CatalogError> {
        let Ok(key) = node.key() else {
            return Ok(None);
        };
        let entity = match as_of {
            None => entity_registry::get(conn, &key)?,
            Some(at) => entity_registry::get_as_of(conn, &key, at)?,
        };
        Ok(entity.map(|e| NodeSummary {
            version: e.version,
            updated_at: e.updated_at,
            deleted: e.is_deleted(),
        }))
    }

    /// Bounded-depth traversal from an entity. Depth is checked before any
    /// storage access; a timeout discards the whole result.
    pub fn query_relationship_graph(&self, q: &GraphQuery) -> Result<Subgraph, CatalogError> {
        let max = self.config.query.max_depth;
        let depth = q.max_depth.unwrap_or(self.config.query.default_depth);
        if depth > max {
            return Err(CatalogError::TraversalDepthExceeded {
                requested: depth,
                max,
            });
        }
        if let Some(filter) = &q.relation_filter
            && filter.is_empty()
        {
            return Err(CatalogError::ValidationError(
                "relation filter must name at least one relation type".to_string(),
            ));
        }
        let start = EntityRef::new(&q.entity_type, &q.entity_id);
        let key = start.key()?;
        let as_of = q.as_of.map(time::normalize);
        let timeout = q.timeout.or(self.config.query_timeout());
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);

        let req = TraversalRequest {
            start,
            max_depth: depth,
            relation_filter: q.relation_filter.clone(),
            as_of,
            direction: q.direction,
        };

        let subgraph = self.read(|conn| {
            if Self::summarize(conn, &req.start, as_of.as_ref())?.is_none() {
                return Err(CatalogError::NotFound(format!("Entity '{}' not found", key)));
            }
            let mut subgraph = graph::traverse(conn, &req, deadline)?;
            for node in &mut subgraph.nodes {
                node.summary = Self::summarize(conn, &node.node, as_of.as_ref())?;
            }
            Ok(subgraph)
        })?;

        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(CatalogError::QueryTimeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }
        tracing::debug!(
            root = %subgraph.root,
            depth,
            nodes = subgraph.nodes.len(),
            edges = subgraph.edges.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "graph traversal finished"
        );
        Ok(subgraph)
    }

    /// Full edge history (active and closed) with the entity as subject.
    pub fn edge_history(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<RelationshipEdge>, CatalogError> {
        let subject = EntityRef::new(entity_type, entity_id);
        subject.key()?;
        self.read(|conn| graph::history(conn, &subject))
    }

    // --- Schemas ---

    pub fn register_schema(
        &self,
        entity_type: &str,
        version: i64,
        fields: &[FieldDef],
        class: Option<CompatibilityClass>,
    ) -> Result<RegisterOutcome, CatalogError> {
        self.write(|conn| {
            schema_registry::register(conn, entity_type, version, fields, class.unwrap_or_default())
        })
    }

    pub fn get_schema(
        &self,
        entity_type: &str,
        version: Option<i64>,
    ) -> Result<SchemaDefinition, CatalogError> {
        self.read(|conn| schema_registry::get(conn, entity_type, version))
    }

    pub fn list_schemas(&self, entity_type: &str) -> Result<Vec<SchemaDefinition>, CatalogError> {
        self.read(|conn| schema_registry::list(conn, entity_type))
    }

    // --- Lineage ---

    pub fn record_lineage(
        &self,
        upstream: &EntityRef,
        downstream: &EntityRef,
        transformation: &Transformation,
    ) -> Result<LineageAck, CatalogError> {
        self.write(|conn| lineage::record(conn, upstream, downstream, transformation, time::now()))
    }

    pub fn get_lineage(
        &self,
        entity_type: &str,
        entity_id: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Vec<LineageEdge>, CatalogError> {
        let node = EntityRef::new(entity_type, entity_id);
        node.key()?;
        let as_of = as_of.map(time::normalize);
        self.read(|conn| lineage::get(conn, &node, as_of.as_ref()))
    }

    // --- Operations ---

    pub fn dead_letters(
        &self,
        kind: Option<DeadLetterKind>,
        include_replayed: bool,
    ) -> Result<Vec<DeadLetter>, CatalogError> {
        self.read(|conn| dead_letter::list(conn, kind, include_replayed))
    }

    pub fn replay_dead_letters(
        &self,
        kind: Option<DeadLetterKind>,
    ) -> Result<ReplayReport, CatalogError> {
        self.pipeline.replay_dead_letters(kind)
    }

    pub fn rebuild(&self) -> Result<RebuildReport, CatalogError> {
        rebuild::rebuild_projections(&self.store)
    }

    pub fn verify(&self) -> Result<VerifyReport, CatalogError> {
        rebuild::verify_replay(&self.store)
    }

    pub fn state_hash(&self) -> Result<String, CatalogError> {
        self.read(rebuild::canonical_state_hash)
    }

    /// Apply retention. `keep_months` overrides `retention.months`.
    pub fn prune(
        &self,
        keep_months: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<PruneReport, CatalogError> {
        let months = keep_months.or(self.config.retention.months).ok_or_else(|| {
            CatalogError::ConfigError(
                "retention.months is not configured and no month count was given".to_string(),
            )
        })?;
        retention::prune(&self.store, months, now)
    }
}
