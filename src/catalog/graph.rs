//! Relationship Graph Store and bounded-depth traversal.
//!
//! Edges carry a validity window `[valid_from, valid_to)`; `valid_to = NULL`
//! marks the active edge. History is kept: closing an edge only sets its
//! `valid_to`, and rows are only deleted when a subject's edges are re-derived
//! from the log. At most one active edge exists per (subject, relation, object).

use crate::catalog::model::EntityRef;
use crate::core::error::CatalogError;
use crate::core::time;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeOrigin {
    /// Carried in a notification's `relationships` list.
    Explicit,
    /// Derived from a schema field with `references`.
    Inferred,
}

impl EdgeOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeOrigin::Explicit => "explicit",
            EdgeOrigin::Inferred => "inferred",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CatalogError> {
        match raw {
            "explicit" => Ok(EdgeOrigin::Explicit),
            "inferred" => Ok(EdgeOrigin::Inferred),
            other => Err(CatalogError::ValidationError(format!(
                "Invalid edge origin '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub edge_id: String,
    pub subject: EntityRef,
    pub relation_type: String,
    pub object: EntityRef,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub origin: EdgeOrigin,
    /// Event that opened the edge.
    pub event_id: String,
}

impl RelationshipEdge {
    pub fn is_active(&self) -> bool {
        self.valid_to.is_none()
    }

    pub fn valid_at(&self, at: &DateTime<Utc>) -> bool {
        self.valid_from <= *at && self.valid_to.is_none_or(|to| to > *at)
    }
}

/// Deterministic edge id, so a rebuild reproduces identical rows.
fn edge_id(
    event_id: &str,
    subject: &EntityRef,
    relation_type: &str,
    object: &EntityRef,
    ordinal: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}|{}|{}|{}|{}",
            event_id, subject, relation_type, object, ordinal
        )
        .as_bytes(),
    );
    let digest = format!("{:x}", hasher.finalize());
    format!("E_{}", &digest[..24])
}

const SELECT_EDGE: &str = "SELECT edge_id, subject_type, subject_id, relation_type, object_type, object_id,
        valid_from, valid_to, origin, event_id
     FROM relationships";

type RawEdge = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
);

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEdge> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn decode(raw: RawEdge) -> Result<RelationshipEdge, CatalogError> {
    let (
        edge_id,
        subject_type,
        subject_id,
        relation_type,
        object_type,
        object_id,
        valid_from,
        valid_to,
        origin,
        event_id,
    ) = raw;
    Ok(RelationshipEdge {
        edge_id,
        subject: EntityRef {
            entity_type: subject_type,
            entity_id: subject_id,
        },
        relation_type,
        object: EntityRef {
            entity_type: object_type,
            entity_id: object_id,
        },
        valid_from: time::from_db(&valid_from)?,
        valid_to: valid_to.as_deref().map(time::from_db).transpose()?,
        origin: EdgeOrigin::parse(&origin)?,
        event_id,
    })
}

fn query_edges(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<RelationshipEdge>, CatalogError> {
    let mut stmt = conn.prepare(sql)?;
    let raws = stmt
        .query_map(params, read_raw)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(decode).collect()
}

/// Open an edge at `at`. Returns `None` when an identical edge is already active.
pub fn open_edge(
    conn: &Connection,
    subject: &EntityRef,
    relation_type: &str,
    object: &EntityRef,
    origin: EdgeOrigin,
    at: &DateTime<Utc>,
    event_id: &str,
) -> Result<Option<RelationshipEdge>, CatalogError> {
    let active: i64 = conn.query_row(
        "SELECT COUNT(*) FROM relationships
         WHERE subject_type = ?1 AND subject_id = ?2 AND relation_type = ?3
           AND object_type = ?4 AND object_id = ?5 AND valid_to IS NULL",
        params![
            subject.entity_type,
            subject.entity_id,
            relation_type,
            object.entity_type,
            object.entity_id
        ],
        |r| r.get(0),
    )?;
    if active > 0 {
        return Ok(None);
    }

    // an event may reopen an edge it closed itself; keep ids distinct
    let ordinal: i64 = conn.query_row(
        "SELECT COUNT(*) FROM relationships
         WHERE event_id = ?1 AND subject_type = ?2 AND subject_id = ?3 AND relation_type = ?4
           AND object_type = ?5 AND object_id = ?6",
        params![
            event_id,
            subject.entity_type,
            subject.entity_id,
            relation_type,
            object.entity_type,
            object.entity_id
        ],
        |r| r.get(0),
    )?;

    let edge = RelationshipEdge {
        edge_id: edge_id(event_id, subject, relation_type, object, ordinal),
        subject: subject.clone(),
        relation_type: relation_type.to_string(),
        object: object.clone(),
        valid_from: *at,
        valid_to: None,
        origin,
        event_id: event_id.to_string(),
    };
    conn.execute(
        "INSERT INTO relationships(edge_id, subject_type, subject_id, relation_type, object_type,
            object_id, valid_from, valid_to, origin, event_id)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?9)",
        params![
            edge.edge_id,
            subject.entity_type,
            subject.entity_id,
            relation_type,
            object.entity_type,
            object.entity_id,
            time::to_db(at),
            origin.as_str(),
            event_id,
        ],
    )?;
    Ok(Some(edge))
}

/// Close the active (subject, relation, object) edge. `valid_to` never precedes `valid_from`.
pub fn close_edge(
    conn: &Connection,
    subject: &EntityRef,
    relation_type: &str,
    object: &EntityRef,
    at: &DateTime<Utc>,
) -> Result<bool, CatalogError> {
    let changed = conn.execute(
        "UPDATE relationships
         SET valid_to = CASE WHEN valid_from > ?1 THEN valid_from ELSE ?1 END
         WHERE subject_type = ?2 AND subject_id = ?3 AND relation_type = ?4
           AND object_type = ?5 AND object_id = ?6 AND valid_to IS NULL",
        params![
            time::to_db(at),
            subject.entity_type,
            subject.entity_id,
            relation_type,
            object.entity_type,
            object.entity_id
        ],
    )?;
    Ok(changed > 0)
}

pub fn close_all_outgoing(
    conn: &Connection,
    subject: &EntityRef,
    at: &DateTime<Utc>,
) -> Result<usize, CatalogError> {
    Ok(conn.execute(
        "UPDATE relationships
         SET valid_to = CASE WHEN valid_from > ?1 THEN valid_from ELSE ?1 END
         WHERE subject_type = ?2 AND subject_id = ?3 AND valid_to IS NULL",
        params![time::to_db(at), subject.entity_type, subject.entity_id],
    )?)
}

/// Physically remove every edge with `subject` as its subject, closed ones included.
pub fn delete_outgoing(conn: &Connection, subject: &EntityRef) -> Result<usize, CatalogError> {
    Ok(conn.execute(
        "DELETE FROM relationships WHERE subject_type = ?1 AND subject_id = ?2",
        params![subject.entity_type, subject.entity_id],
    )?)
}

pub fn active_outgoing(
    conn: &Connection,
    subject: &EntityRef,
    origin: Option<EdgeOrigin>,
) -> Result<Vec<RelationshipEdge>, CatalogError> {
    let edges = query_edges(
        conn,
        &format!(
            "{} WHERE subject_type = ?1 AND subject_id = ?2 AND valid_to IS NULL ORDER BY edge_id",
            SELECT_EDGE
        ),
        params![subject.entity_type, subject.entity_id],
    )?;
    Ok(match origin {
        Some(o) => edges.into_iter().filter(|e| e.origin == o).collect(),
        None => edges,
    })
}

/// Every edge (active and closed) with `subject` as its subject, oldest first.
pub fn history(conn: &Connection, subject: &EntityRef) -> Result<Vec<RelationshipEdge>, CatalogError> {
    query_edges(
        conn,
        &format!(
            "{} WHERE subject_type = ?1 AND subject_id = ?2 ORDER BY valid_from, edge_id",
            SELECT_EDGE
        ),
        params![subject.entity_type, subject.entity_id],
    )
}

pub fn all_edges(conn: &Connection) -> Result<Vec<RelationshipEdge>, CatalogError> {
    query_edges(conn, &format!("{} ORDER BY edge_id", SELECT_EDGE), [])
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Outgoing,
    Incoming,
    Both,
}

impl Direction {
    pub fn parse(raw: &str) -> Result<Self, CatalogError> {
        match raw {
            "outgoing" | "out" => Ok(Direction::Outgoing),
            "incoming" | "in" => Ok(Direction::Incoming),
            "both" => Ok(Direction::Both),
            other => Err(CatalogError::ValidationError(format!(
                "Invalid direction '{}'. Must be one of: outgoing, incoming, both",
                other
            ))),
        }
    }
}

/// Edges adjacent to `node` in `direction` that are active now, or valid at `as_of`.
pub fn edges_touching(
    conn: &Connection,
    node: &EntityRef,
    direction: Direction,
    as_of: Option<&DateTime<Utc>>,
) -> Result<Vec<RelationshipEdge>, CatalogError> {
    let sides: &[&str] = match direction {
        Direction::Outgoing => &["subject"],
        Direction::Incoming => &["object"],
        Direction::Both => &["subject", "object"],
    };
    let mut edges = Vec::new();
    for side in sides {
        let found = match as_of {
            None => query_edges(
                conn,
                &format!(
                    "{} WHERE {side}_type = ?1 AND {side}_id = ?2 AND valid_to IS NULL
                     ORDER BY valid_from, edge_id",
                    SELECT_EDGE
                ),
                params![node.entity_type, node.entity_id],
            )?,
            Some(at) => query_edges(
                conn,
                &format!(
                    "{} WHERE {side}_type = ?1 AND {side}_id = ?2
                       AND valid_from <= ?3 AND (valid_to IS NULL OR valid_to > ?3)
                     ORDER BY valid_from, edge_id",
                    SELECT_EDGE
                ),
                params![node.entity_type, node.entity_id, time::to_db(at)],
            )?,
        };
        edges.extend(found);
    }
    Ok(edges)
}

// --- Traversal ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraversalRequest {
    pub start: EntityRef,
    pub max_depth: usize,
    /// Only follow these relation types; `None` follows all.
    pub relation_filter: Option<Vec<String>>,
    pub as_of: Option<DateTime<Utc>>,
    pub direction: Direction,
}

/// Short entity summary attached to traversal nodes when the entity is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubgraphNode {
    #[serde(flatten)]
    pub node: EntityRef,
    /// BFS distance from the start entity.
    pub depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<NodeSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subgraph {
    pub root: EntityRef,
    pub max_depth: usize,
    pub as_of: Option<DateTime<Utc>>,
    pub nodes: Vec<SubgraphNode>,
    pub edges: Vec<RelationshipEdge>,
}

fn neighbor_of<'a>(
    edge: &'a RelationshipEdge,
    node: &EntityRef,
    direction: Direction,
) -> Option<&'a EntityRef> {
    match direction {
        Direction::Outgoing => (edge.subject == *node).then_some(&edge.object),
        Direction::Incoming => (edge.object == *node).then_some(&edge.subject),
        Direction::Both if edge.subject == *node => Some(&edge.object),
        Direction::Both if edge.object == *node => Some(&edge.subject),
        Direction::Both => None,
    }
}

/// Breadth-first expansion from `req.start`, with adjacency supplied by `neighbors`.
///
/// A node is expanded at most once; edges into already-visited nodes are kept
/// but not followed, so cycles terminate. Nodes at `max_depth` are reported
/// but not expanded. If `deadline` passes, the whole result is discarded.
pub fn bfs<F>(
    req: &TraversalRequest,
    deadline: Option<Instant>,
    mut neighbors: F,
) -> Result<Subgraph, CatalogError>
where
    F: FnMut(&EntityRef) -> Result<Vec<RelationshipEdge>, CatalogError>,
{
    let started = Instant::now();
    let mut index: FxHashMap<EntityRef, usize> = FxHashMap::default();
    let mut nodes = vec![SubgraphNode {
        node: req.start.clone(),
        depth: 0,
        summary: None,
    }];
    index.insert(req.start.clone(), 0);
    let mut seen_edges: FxHashSet<String> = FxHashSet::default();
    let mut edges = Vec::new();
    let mut queue = VecDeque::from([0usize]);

    while let Some(slot) = queue.pop_front() {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(CatalogError::QueryTimeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }
        let depth = nodes[slot].depth;
        if depth >= req.max_depth {
            continue;
        }
        let current = nodes[slot].node.clone();
        for edge in neighbors(&current)? {
            if let Some(filter) = &req.relation_filter
                && !filter.iter().any(|r| *r == edge.relation_type)
            {
                continue;
            }
            let Some(next) = neighbor_of(&edge, &current, req.direction) else {
                continue;
            };
            if !index.contains_key(next) {
                index.insert(next.clone(), nodes.len());
                queue.push_back(nodes.len());
                nodes.push(SubgraphNode {
                    node: next.clone(),
                    depth: depth + 1,
                    summary: None,
                });
            }
            if seen_edges.insert(edge.edge_id.clone()) {
                edges.push(edge);
            }
        }
    }

    Ok(Subgraph {
        root: req.start.clone(),
        max_depth: req.max_depth,
        as_of: req.as_of,
        nodes,
        edges,
    })
}

/// Traverse the stored graph.
pub fn traverse(
    conn: &Connection,
    req: &TraversalRequest,
    deadline: Option<Instant>,
) -> Result<Subgraph, CatalogError> {
    bfs(req, deadline, |node| {
        edges_touching(conn, node, req.direction, req.as_of.as_ref())
    })
}
