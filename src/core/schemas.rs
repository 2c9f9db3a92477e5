//! Centralized database schema definitions for the catalog database.
//!
//! Everything lives in one SQLite file (`catalog.db`):
//! 1. Authoritative tables: `schemas`, `event_log`, `lineage`, `dead_letters`.
//! 2. Projections rebuilt from the event log: `entities`, `relationships`.

pub const CATALOG_DB_NAME: &str = "catalog.db";
pub const CATALOG_SCHEMA_VERSION: u32 = 1;

pub const CATALOG_DB_SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

// --- Schema Registry ---

pub const CATALOG_DB_SCHEMA_SCHEMAS: &str = "
    CREATE TABLE IF NOT EXISTS schemas (
        entity_type TEXT NOT NULL,
        version INTEGER NOT NULL,
        fields TEXT NOT NULL, -- JSON array of field definitions
        compatibility_class TEXT NOT NULL DEFAULT 'backward',
        fingerprint TEXT NOT NULL,
        registered_at TEXT NOT NULL,
        PRIMARY KEY(entity_type, version)
    )
";

// --- Event Log ---

pub const CATALOG_DB_SCHEMA_EVENT_LOG: &str = "
    CREATE TABLE IF NOT EXISTS event_log (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id TEXT NOT NULL UNIQUE,
        entity_type TEXT NOT NULL,
        source_system TEXT NOT NULL,
        source_entity_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        version INTEGER NOT NULL,
        schema_version INTEGER,
        changed_fields TEXT NOT NULL, -- JSON array
        payload TEXT NOT NULL, -- producer JSON object, stored verbatim
        relationships TEXT NOT NULL, -- JSON array of relationship changes
        contains_pii INTEGER NOT NULL DEFAULT 0,
        occurred_at TEXT NOT NULL,
        consumed_at TEXT NOT NULL,
        month TEXT NOT NULL, -- YYYY-MM of consumed_at, retention unit
        trace_id TEXT,
        span_id TEXT
    )
";
pub const CATALOG_DB_INDEX_EVENT_LOG_ENTITY: &str = "CREATE INDEX IF NOT EXISTS idx_event_log_entity ON event_log(entity_type, source_system, source_entity_id)";
pub const CATALOG_DB_INDEX_EVENT_LOG_MONTH: &str =
    "CREATE INDEX IF NOT EXISTS idx_event_log_month ON event_log(month)";

// --- Entity Registry (projection) ---

pub const CATALOG_DB_SCHEMA_ENTITIES: &str = "
    CREATE TABLE IF NOT EXISTS entities (
        entity_type TEXT NOT NULL,
        source_system TEXT NOT NULL,
        source_entity_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        schema_version INTEGER,
        attributes TEXT NOT NULL, -- JSON map of tagged attribute values
        contains_pii INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL, -- occurred_at of the dominant event
        deleted_at TEXT,
        last_event_id TEXT NOT NULL,
        PRIMARY KEY(entity_type, source_system, source_entity_id)
    )
";
pub const CATALOG_DB_INDEX_ENTITIES_TYPE_SYSTEM: &str =
    "CREATE INDEX IF NOT EXISTS idx_entities_type_system ON entities(entity_type, source_system)";

// --- Relationship Graph Store (projection) ---

pub const CATALOG_DB_SCHEMA_RELATIONSHIPS: &str = "
    CREATE TABLE IF NOT EXISTS relationships (
        edge_id TEXT PRIMARY KEY,
        subject_type TEXT NOT NULL,
        subject_id TEXT NOT NULL,
        relation_type TEXT NOT NULL,
        object_type TEXT NOT NULL,
        object_id TEXT NOT NULL,
        valid_from TEXT NOT NULL,
        valid_to TEXT,
        origin TEXT NOT NULL, -- explicit | inferred
        event_id TEXT NOT NULL
    )
";
pub const CATALOG_DB_INDEX_RELATIONSHIPS_SUBJECT: &str = "CREATE INDEX IF NOT EXISTS idx_relationships_subject ON relationships(subject_type, subject_id)";
pub const CATALOG_DB_INDEX_RELATIONSHIPS_OBJECT: &str = "CREATE INDEX IF NOT EXISTS idx_relationships_object ON relationships(object_type, object_id)";
/// At most one open window per (subject, relation, object).
pub const CATALOG_DB_INDEX_RELATIONSHIPS_ACTIVE: &str = "CREATE UNIQUE INDEX IF NOT EXISTS idx_relationships_active ON relationships(subject_type, subject_id, relation_type, object_type, object_id) WHERE valid_to IS NULL";

// --- Lineage ---

pub const CATALOG_DB_SCHEMA_LINEAGE: &str = "
    CREATE TABLE IF NOT EXISTS lineage (
        lineage_id TEXT PRIMARY KEY,
        upstream_type TEXT NOT NULL,
        upstream_id TEXT NOT NULL,
        downstream_type TEXT NOT NULL,
        downstream_id TEXT NOT NULL,
        transformation TEXT NOT NULL, -- JSON descriptor
        recorded_at TEXT NOT NULL
    )
";
pub const CATALOG_DB_INDEX_LINEAGE_UPSTREAM: &str =
    "CREATE INDEX IF NOT EXISTS idx_lineage_upstream ON lineage(upstream_type, upstream_id)";
pub const CATALOG_DB_INDEX_LINEAGE_DOWNSTREAM: &str =
    "CREATE INDEX IF NOT EXISTS idx_lineage_downstream ON lineage(downstream_type, downstream_id)";

// --- Dead letters ---

pub const CATALOG_DB_SCHEMA_DEAD_LETTERS: &str = "
    CREATE TABLE IF NOT EXISTS dead_letters (
        id TEXT PRIMARY KEY,
        event_id TEXT NOT NULL,
        kind TEXT NOT NULL, -- schema_conflict | storage_unavailable | malformed
        reason TEXT NOT NULL,
        payload TEXT NOT NULL, -- full change notification JSON
        attempts INTEGER NOT NULL,
        dead_lettered_at TEXT NOT NULL,
        replayed_at TEXT
    )
";
pub const CATALOG_DB_INDEX_DEAD_LETTERS_KIND: &str =
    "CREATE INDEX IF NOT EXISTS idx_dead_letters_kind ON dead_letters(kind, replayed_at)";

/// DDL applied, in order, when a catalog database is initialized.
pub const CATALOG_DB_DDL: &[&str] = &[
    CATALOG_DB_SCHEMA_META,
    CATALOG_DB_SCHEMA_SCHEMAS,
    CATALOG_DB_SCHEMA_EVENT_LOG,
    CATALOG_DB_INDEX_EVENT_LOG_ENTITY,
    CATALOG_DB_INDEX_EVENT_LOG_MONTH,
    CATALOG_DB_SCHEMA_ENTITIES,
    CATALOG_DB_INDEX_ENTITIES_TYPE_SYSTEM,
    CATALOG_DB_SCHEMA_RELATIONSHIPS,
    CATALOG_DB_INDEX_RELATIONSHIPS_SUBJECT,
    CATALOG_DB_INDEX_RELATIONSHIPS_OBJECT,
    CATALOG_DB_INDEX_RELATIONSHIPS_ACTIVE,
    CATALOG_DB_SCHEMA_LINEAGE,
    CATALOG_DB_INDEX_LINEAGE_UPSTREAM,
    CATALOG_DB_INDEX_LINEAGE_DOWNSTREAM,
    CATALOG_DB_SCHEMA_DEAD_LETTERS,
    CATALOG_DB_INDEX_DEAD_LETTERS_KIND,
];
