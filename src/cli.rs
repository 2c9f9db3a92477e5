//! CLI struct definitions for the `meshcat` command-line interface.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum DirectionArg {
    Outgoing,
    Incoming,
    Both,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum CompatibilityArg {
    Backward,
    Full,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum DeadLetterKindArg {
    SchemaConflict,
    StorageUnavailable,
    Malformed,
}

#[derive(Parser, Debug)]
#[clap(
    name = "meshcat",
    version = env!("CARGO_PKG_VERSION"),
    about = "Event-sourced metadata catalog: entities, schemas, relationship graph and lineage."
)]
pub(crate) struct Cli {
    /// Store directory (defaults to $MESHCAT_ROOT, then ./.meshcat).
    #[clap(long, global = true)]
    pub root: Option<PathBuf>,
    #[clap(long, global = true, value_enum, default_value = "text")]
    pub format: OutputFormat,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create the store and its database
    Init,
    /// Ingest change notifications from a JSONL file ('-' for stdin)
    Apply {
        file: PathBuf,
        /// Worker threads (defaults to ingest.workers)
        #[clap(long)]
        workers: Option<usize>,
    },
    /// Entity lookups
    Entity(EntityCli),
    /// Bounded-depth relationship traversal
    Graph {
        entity_type: String,
        entity_id: String,
        #[clap(long)]
        depth: Option<usize>,
        /// Follow only these relation types (repeatable)
        #[clap(long = "relation")]
        relations: Vec<String>,
        #[clap(long)]
        as_of: Option<DateTime<Utc>>,
        #[clap(long, value_enum, default_value = "outgoing")]
        direction: DirectionArg,
        /// Overrides query.timeout_ms
        #[clap(long)]
        timeout_ms: Option<u64>,
    },
    /// Schema registry
    Schema(SchemaCli),
    /// Lineage tracker
    Lineage(LineageCli),
    /// Inspect and replay dead letters
    DeadLetters(DeadLettersCli),
    /// Rebuild entity and relationship projections from the event log
    Rebuild,
    /// Replay the log into a scratch database and compare with live state
    Verify,
    /// Print the canonical state hash of the projections
    Hash,
    /// Archive and drop old event-log months
    Prune {
        /// Months to keep (defaults to retention.months)
        #[clap(long)]
        months: Option<u32>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct EntityCli {
    #[clap(subcommand)]
    pub command: EntityCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum EntityCommand {
    Get {
        entity_type: String,
        /// `<source_system>:<source_entity_id>`
        entity_id: String,
        #[clap(long)]
        as_of: Option<DateTime<Utc>>,
    },
    List {
        entity_type: String,
        #[clap(long)]
        system: Option<String>,
        #[clap(long)]
        include_deleted: bool,
        #[clap(long, default_value = "100")]
        limit: usize,
    },
    /// Event log entries for an entity
    History {
        entity_type: String,
        entity_id: String,
    },
    /// All relationship edges (active and closed) from an entity
    Edges {
        entity_type: String,
        entity_id: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct SchemaCli {
    #[clap(subcommand)]
    pub command: SchemaCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum SchemaCommand {
    Register {
        entity_type: String,
        version: i64,
        /// JSON file holding the field array
        #[clap(long)]
        fields: PathBuf,
        #[clap(long, value_enum)]
        compatibility: Option<CompatibilityArg>,
    },
    Get {
        entity_type: String,
        #[clap(long)]
        version: Option<i64>,
    },
    List {
        entity_type: String,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct LineageCli {
    #[clap(subcommand)]
    pub command: LineageCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum LineageCommand {
    Record {
        /// `<entity_type>/<source_system>:<source_entity_id>`
        #[clap(long)]
        upstream: String,
        #[clap(long)]
        downstream: String,
        #[clap(long)]
        transformation: String,
        #[clap(long)]
        description: Option<String>,
    },
    Get {
        entity_type: String,
        entity_id: String,
        #[clap(long)]
        as_of: Option<DateTime<Utc>>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct DeadLettersCli {
    #[clap(subcommand)]
    pub command: DeadLettersCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum DeadLettersCommand {
    List {
        #[clap(long, value_enum)]
        kind: Option<DeadLetterKindArg>,
        /// Include letters that were already replayed
        #[clap(long)]
        all: bool,
    },
    Replay {
        #[clap(long, value_enum)]
        kind: Option<DeadLetterKindArg>,
    },
}
