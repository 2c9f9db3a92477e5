//! meshcat: an event-sourced metadata catalog for a data mesh.
//!
//! Producers publish change notifications about entities they own. The
//! catalog reconciles those out-of-order, at-least-once notifications into
//! a consistent registry of entities, versioned schemas, a temporal
//! relationship graph and a lineage record.
//!
//! # Architecture
//!
//! - The **event log** is the source of truth. Entity and relationship
//!   tables are projections that `rebuild` reproduces bit-for-bit.
//! - **Version dominance** (version, then `occurred_at`, then `event_id`)
//!   makes the entity state independent of delivery order.
//! - Everything lives in one SQLite database (`catalog.db`, WAL) under the
//!   store root; writes are serialized per database, reads never block.
//!
//! # Crate Structure
//!
//! - [`core`]: storage, errors, configuration, logging, time helpers
//! - [`catalog`]: registry, graph, lineage, ingestion and the query façade

pub mod catalog;
pub mod core;
mod cli;

use crate::catalog::dead_letter::DeadLetterKind;
use crate::catalog::graph::Direction;
use crate::catalog::invalidation::JsonlSink;
use crate::catalog::lineage::Transformation;
use crate::catalog::model::{ChangeNotification, EntityRef};
use crate::catalog::schema_registry::{CompatibilityClass, FieldDef, RegisterOutcome};
use crate::catalog::{Catalog, GraphQuery};
use crate::cli::{
    Cli, Command, CompatibilityArg, DeadLetterKindArg, DeadLettersCommand, DirectionArg,
    EntityCommand, LineageCommand, OutputFormat, SchemaCommand,
};
use crate::core::error::CatalogError;
use crate::core::{config, logging, store::Store, time};
use clap::Parser;
use colored::Colorize;
use serde::Serialize;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_ROOT: &str = ".meshcat";

fn resolve_root(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os("MESHCAT_ROOT").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT))
}

/// Parse `<entity_type>/<entity_id>`.
fn parse_ref(raw: &str) -> Result<EntityRef, CatalogError> {
    let (entity_type, entity_id) = raw.split_once('/').ok_or_else(|| {
        CatalogError::ValidationError(format!(
            "Expected <entity_type>/<source_system>:<source_entity_id>, got '{}'",
            raw
        ))
    })?;
    let r = EntityRef::new(entity_type, entity_id);
    r.key()?;
    Ok(r)
}

fn emit<T: Serialize>(
    format: OutputFormat,
    value: &T,
    text: impl FnOnce(&T),
) -> Result<(), CatalogError> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => text(value),
    }
    Ok(())
}

fn kind_of(arg: Option<DeadLetterKindArg>) -> Option<DeadLetterKind> {
    arg.map(|k| match k {
        DeadLetterKindArg::SchemaConflict => DeadLetterKind::SchemaConflict,
        DeadLetterKindArg::StorageUnavailable => DeadLetterKind::StorageUnavailable,
        DeadLetterKindArg::Malformed => DeadLetterKind::Malformed,
    })
}

fn open_lines(file: &Path) -> Result<Box<dyn BufRead>, CatalogError> {
    if file.as_os_str() == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let f = fs::File::open(file).map_err(CatalogError::IoError)?;
    Ok(Box::new(BufReader::new(f)))
}

fn run_apply(
    catalog: &Catalog,
    file: &Path,
    workers: Option<usize>,
    format: OutputFormat,
) -> Result<(), CatalogError> {
    let workers = workers.unwrap_or(catalog.config().ingest.workers).max(1);
    let pipeline = catalog.pipeline();
    let mut stats = crate::catalog::ingest::IngestStats::default();

    if workers == 1 {
        for line in open_lines(file)?.lines() {
            let line = line.map_err(CatalogError::IoError)?;
            if line.trim().is_empty() {
                continue;
            }
            let result = pipeline.apply_json(&line);
            let event_id = serde_json::from_str::<serde_json::Value>(&line)
                .ok()
                .and_then(|v| v.get("event_id").and_then(|e| e.as_str()).map(str::to_string))
                .unwrap_or_default();
            stats.record(&event_id, &result);
        }
    } else {
        let pool = crate::catalog::workers::WorkerPool::start(Arc::clone(&pipeline), workers)?;
        for line in open_lines(file)?.lines() {
            let line = line.map_err(CatalogError::IoError)?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ChangeNotification>(&line) {
                Ok(n) => pool.submit(n)?,
                Err(_) => {
                    let result = pipeline.apply_json(&line);
                    stats.record("", &result);
                }
            }
        }
        stats.merge(pool.shutdown()?);
    }

    emit(format, &stats, |s| {
        println!(
            "{} applied, {} stale, {} duplicate, {} failed",
            s.applied.to_string().green(),
            s.stale,
            s.duplicate,
            if s.failed > 0 {
                s.failed.to_string().red()
            } else {
                s.failed.to_string().normal()
            }
        );
        for f in &s.failures {
            println!("  {} {}: {}", "x".red(), f.event_id, f.error);
        }
    })
}

pub fn run() -> Result<(), CatalogError> {
    let cli = Cli::parse();
    let root = resolve_root(cli.root);
    let format = cli.format;

    let config = config::load_config(&root)?;
    logging::init_logging(&config.logging.filter);
    let store = Store::open(&root)?;
    let sink = Arc::new(JsonlSink::new(store.invalidations_path()));
    let catalog = Catalog::open_with(&root, config, sink)?;

    match cli.command {
        Command::Init => emit(format, &serde_json::json!({"root": root, "status": "ok"}), |_| {
            println!("{} catalog ready at {}", "✓".green(), root.display());
        }),

        Command::Apply { file, workers } => run_apply(&catalog, &file, workers, format),

        Command::Entity(entity_cli) => match entity_cli.command {
            EntityCommand::Get {
                entity_type,
                entity_id,
                as_of,
            } => {
                let entity = catalog.get_entity(&entity_type, &entity_id, as_of)?;
                emit(format, &entity, |e| {
                    println!("{} {}/{}", "Entity".bold(), e.entity_type, e.entity_id);
                    println!("Version:    {}", e.version);
                    println!("Schema:     {}", e.schema_version.map_or("-".to_string(), |v| v.to_string()));
                    println!("PII:        {}", e.contains_pii);
                    println!("Created:    {}", time::to_db(&e.created_at));
                    println!("Updated:    {}", time::to_db(&e.updated_at));
                    if let Some(d) = &e.deleted_at {
                        println!("Deleted:    {}", time::to_db(d).red());
                    }
                    for (k, v) in &e.attributes {
                        println!("  {} = {}", k, v.to_json());
                    }
                })
            }
            EntityCommand::List {
                entity_type,
                system,
                include_deleted,
                limit,
            } => {
                let entities =
                    catalog.list_entities(&entity_type, system.as_deref(), include_deleted, limit)?;
                emit(format, &entities, |list| {
                    for e in list {
                        let marker = if e.is_deleted() { " (deleted)" } else { "" };
                        println!("{}  v{}{}", e.entity_id, e.version, marker);
                    }
                })
            }
            EntityCommand::History {
                entity_type,
                entity_id,
            } => {
                let entries = catalog.entity_history(&entity_type, &entity_id)?;
                emit(format, &entries, |list| {
                    for e in list {
                        println!(
                            "#{} {} v{} {} {}",
                            e.seq,
                            e.event_type.as_str(),
                            e.version,
                            time::to_db(&e.occurred_at),
                            e.event_id
                        );
                    }
                })
            }
            EntityCommand::Edges {
                entity_type,
                entity_id,
            } => {
                let edges = catalog.edge_history(&entity_type, &entity_id)?;
                emit(format, &edges, |list| {
                    for e in list {
                        let until = e.valid_to.as_ref().map_or("open".to_string(), time::to_db);
                        println!(
                            "{} -[{}]-> {}  [{} .. {}]",
                            e.subject, e.relation_type, e.object, time::to_db(&e.valid_from), until
                        );
                    }
                })
            }
        },

        Command::Graph {
            entity_type,
            entity_id,
            depth,
            relations,
            as_of,
            direction,
            timeout_ms,
        } => {
            let query = GraphQuery {
                max_depth: depth,
                relation_filter: (!relations.is_empty()).then_some(relations),
                as_of,
                direction: match direction {
                    DirectionArg::Outgoing => Direction::Outgoing,
                    DirectionArg::Incoming => Direction::Incoming,
                    DirectionArg::Both => Direction::Both,
                },
                timeout: timeout_ms.map(Duration::from_millis),
                ..GraphQuery::new(&entity_type, &entity_id)
            };
            let subgraph = catalog.query_relationship_graph(&query)?;
            emit(format, &subgraph, |g| {
                println!(
                    "{} {} ({} nodes, {} edges)",
                    "Graph".bold(),
                    g.root,
                    g.nodes.len(),
                    g.edges.len()
                );
                for n in &g.nodes {
                    println!("{}{}", "  ".repeat(n.depth), n.node);
                }
                for e in &g.edges {
                    println!("  {} -[{}]-> {}", e.subject, e.relation_type, e.object);
                }
            })
        }

        Command::Schema(schema_cli) => match schema_cli.command {
            SchemaCommand::Register {
                entity_type,
                version,
                fields,
                compatibility,
            } => {
                let raw = fs::read_to_string(&fields).map_err(CatalogError::IoError)?;
                let fields: Vec<FieldDef> = serde_json::from_str(&raw)?;
                let class = compatibility.map(|c| match c {
                    CompatibilityArg::Backward => CompatibilityClass::Backward,
                    CompatibilityArg::Full => CompatibilityClass::Full,
                });
                let outcome = catalog.register_schema(&entity_type, version, &fields, class)?;
                emit(format, &outcome, |o| match o {
                    RegisterOutcome::Accepted { idempotent, .. } => {
                        let note = if *idempotent { " (already registered)" } else { "" };
                        println!("{} {} v{}{}", "accepted".green(), entity_type, version, note);
                    }
                    RegisterOutcome::Rejected { reason, .. } => {
                        println!("{} {} v{}: {}", "rejected".red(), entity_type, version, reason);
                    }
                })?;
                outcome.into_result().map(|_| ())
            }
            SchemaCommand::Get {
                entity_type,
                version,
            } => {
                let schema = catalog.get_schema(&entity_type, version)?;
                emit(format, &schema, |s| {
                    println!(
                        "{} {} v{} ({})",
                        "Schema".bold(),
                        s.entity_type,
                        s.version,
                        s.compatibility_class.as_str()
                    );
                    for f in &s.fields {
                        let req = if f.required { "required" } else { "optional" };
                        let pii = if f.pii { " pii" } else { "" };
                        println!("  {}: {:?} {}{}", f.name, f.field_type, req, pii);
                    }
                })
            }
            SchemaCommand::List { entity_type } => {
                let schemas = catalog.list_schemas(&entity_type)?;
                emit(format, &schemas, |list| {
                    for s in list {
                        println!("{} v{}  {} fields", s.entity_type, s.version, s.fields.len());
                    }
                })
            }
        },

        Command::Lineage(lineage_cli) => match lineage_cli.command {
            LineageCommand::Record {
                upstream,
                downstream,
                transformation,
                description,
            } => {
                let t = Transformation {
                    description,
                    ..Transformation::named(&transformation)
                };
                let ack = catalog.record_lineage(&parse_ref(&upstream)?, &parse_ref(&downstream)?, &t)?;
                emit(format, &ack, |a| println!("Lineage recorded: {}", a.lineage_id))
            }
            LineageCommand::Get {
                entity_type,
                entity_id,
                as_of,
            } => {
                let edges = catalog.get_lineage(&entity_type, &entity_id, as_of)?;
                emit(format, &edges, |list| {
                    for e in list {
                        println!(
                            "{} -> {}  via {}",
                            e.upstream, e.downstream, e.transformation.name
                        );
                    }
                })
            }
        },

        Command::DeadLetters(dl_cli) => match dl_cli.command {
            DeadLettersCommand::List { kind, all } => {
                let letters = catalog.dead_letters(kind_of(kind), all)?;
                emit(format, &letters, |list| {
                    for l in list {
                        println!(
                            "{} {} [{}] {}",
                            l.id,
                            l.event_id,
                            l.kind.as_str().yellow(),
                            l.reason
                        );
                    }
                })
            }
            DeadLettersCommand::Replay { kind } => {
                let report = catalog.replay_dead_letters(kind_of(kind))?;
                emit(format, &report, |r| {
                    println!("{} replayed, {} still failing", r.replayed, r.still_failing)
                })
            }
        },

        Command::Rebuild => {
            let report = catalog.rebuild()?;
            emit(format, &report, |r| {
                println!(
                    "Rebuilt {} entities and {} edges from {} events",
                    r.entities,
                    r.edges,
                    r.archived_events + r.live_events
                );
                println!("State hash: {}", r.state_hash);
            })
        }

        Command::Verify => {
            let report = catalog.verify()?;
            emit(format, &report, |r| {
                if r.matches {
                    println!("{} replay matches ({})", "✓".green(), r.live_hash);
                } else {
                    println!(
                        "{} replay diverges: live {} vs replayed {}",
                        "✗".red(),
                        r.live_hash,
                        r.replayed_hash
                    );
                }
            })
        }

        Command::Hash => {
            let hash = catalog.state_hash()?;
            emit(format, &serde_json::json!({"state_hash": hash}), |_| println!("{}", hash))
        }

        Command::Prune { months } => {
            let report = catalog.prune(months, time::now())?;
            emit(format, &report, |r| {
                println!("Keeping months from {}", r.keep_from);
                for m in &r.pruned {
                    println!("  archived {} ({} events)", m.month, m.events);
                }
            })
        }
    }
}
