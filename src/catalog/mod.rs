//! The metadata catalog.
//!
//! Leaves first: `model`, `schema_registry`, `event_log`, `entity_registry`,
//! `graph`, `lineage`; then `ingest` (with `workers`, `dead_letter`,
//! `invalidation`), `rebuild`, `retention`; `query` is the façade on top.

pub mod dead_letter;
pub mod entity_registry;
pub mod event_log;
pub mod graph;
pub mod ingest;
pub mod invalidation;
pub mod lineage;
pub mod model;
pub mod query;
pub mod rebuild;
pub mod retention;
pub mod schema_registry;
pub mod workers;

pub use query::{Catalog, GraphQuery};
