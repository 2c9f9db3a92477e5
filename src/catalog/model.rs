//! Shared catalog types: entity addressing, typed attribute values and the
//! inbound change notification.

use crate::core::error::CatalogError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

static IDENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_.\-]*$").expect("identifier pattern compiles")
});

/// Validate a type/system/relation name.
pub fn validate_ident(kind: &str, value: &str) -> Result<(), CatalogError> {
    if !IDENT_RE.is_match(value) {
        return Err(CatalogError::ValidationError(format!(
            "Invalid {} '{}'. Must start with a letter and contain only letters, digits, '_', '.', '-'",
            kind, value
        )));
    }
    Ok(())
}

// --- Entity addressing ---

/// Globally unique entity identity: `(entity_type, source_system, source_entity_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub source_system: String,
    pub source_entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: &str, source_system: &str, source_entity_id: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            source_system: source_system.to_string(),
            source_entity_id: source_entity_id.to_string(),
        }
    }

    /// Canonical id used by the query API: `<source_system>:<source_entity_id>`.
    pub fn entity_id(&self) -> String {
        format!("{}:{}", self.source_system, self.source_entity_id)
    }

    pub fn to_ref(&self) -> EntityRef {
        EntityRef {
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id())
    }
}

/// Graph/query address of an entity: `(entity_type, entity_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: &str, entity_id: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
        }
    }

    /// Split the canonical id back into an [`EntityKey`].
    pub fn key(&self) -> Result<EntityKey, CatalogError> {
        let (system, id) = self.entity_id.split_once(':').ok_or_else(|| {
            CatalogError::ValidationError(format!(
                "Entity id '{}' must have the form <source_system>:<source_entity_id>",
                self.entity_id
            ))
        })?;
        if system.is_empty() || id.is_empty() {
            return Err(CatalogError::ValidationError(format!(
                "Entity id '{}' has an empty component",
                self.entity_id
            )));
        }
        Ok(EntityKey::new(&self.entity_type, system, id))
    }

    /// Resolve a reference value relative to the subject's source system:
    /// bare ids (`42`) stay in the subject's system, qualified ones (`crm:42`) are kept.
    pub fn qualify(entity_type: &str, raw: &str, default_system: &str) -> Self {
        if raw.contains(':') {
            Self::new(entity_type, raw)
        } else {
            Self::new(entity_type, &format!("{}:{}", default_system, raw))
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

// --- Attribute values ---

/// Typed attribute value. Producer JSON is converted into this at the
/// ingestion boundary, guided by the registered field types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    List(Vec<AttrValue>),
    Map(BTreeMap<String, AttrValue>),
}

pub type Attributes = BTreeMap<String, AttrValue>;

impl AttrValue {
    /// Structural conversion for untyped payloads.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => AttrValue::Null,
            JsonValue::Bool(b) => AttrValue::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => AttrValue::Int(i),
                None => AttrValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => AttrValue::Text(s.clone()),
            JsonValue::Array(items) => AttrValue::List(items.iter().map(Self::from_json).collect()),
            JsonValue::Object(map) => AttrValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Plain JSON rendering (no type tags), for display.
    pub fn to_json(&self) -> JsonValue {
        match self {
            AttrValue::Null => JsonValue::Null,
            AttrValue::Bool(b) => JsonValue::Bool(*b),
            AttrValue::Int(i) => JsonValue::from(*i),
            AttrValue::Float(f) => JsonValue::from(*f),
            AttrValue::Text(s) => JsonValue::String(s.clone()),
            AttrValue::Timestamp(t) => JsonValue::String(t.to_rfc3339()),
            AttrValue::List(items) => JsonValue::Array(items.iter().map(Self::to_json).collect()),
            AttrValue::Map(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttrValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

pub fn untyped_attributes(payload: &JsonMap<String, JsonValue>) -> Attributes {
    payload
        .iter()
        .map(|(k, v)| (k.clone(), AttrValue::from_json(v)))
        .collect()
}

// --- Change notifications ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "CREATED",
            EventType::Updated => "UPDATED",
            EventType::Deleted => "DELETED",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CatalogError> {
        match raw {
            "CREATED" => Ok(EventType::Created),
            "UPDATED" => Ok(EventType::Updated),
            "DELETED" => Ok(EventType::Deleted),
            other => Err(CatalogError::ValidationError(format!(
                "Invalid event_type '{}'. Must be one of: CREATED, UPDATED, DELETED",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipAction {
    #[default]
    Add,
    Remove,
}

/// Explicit relationship change carried by a notification; the subject is
/// the notification's entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipChange {
    pub relation_type: String,
    pub object_type: String,
    /// Canonical or bare id; bare ids resolve to the subject's source system.
    pub object_id: String,
    #[serde(default)]
    pub action: RelationshipAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

/// Inbound change notification as published by a producer adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub event_id: String,
    pub entity_type: String,
    pub source_system: String,
    #[serde(alias = "entity_id")]
    pub source_entity_id: String,
    pub event_type: EventType,
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<i64>,
    #[serde(default)]
    pub changed_fields: Vec<String>,
    #[serde(default)]
    pub payload: JsonMap<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<RelationshipChange>,
    #[serde(default)]
    pub contains_pii: bool,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<TraceContext>,
}

impl ChangeNotification {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(
            &self.entity_type,
            &self.source_system,
            &self.source_entity_id,
        )
    }

    /// Structural checks that do not need the schema registry.
    pub fn check_well_formed(&self) -> Result<(), CatalogError> {
        if self.event_id.trim().is_empty() {
            return Err(CatalogError::ValidationError(
                "event_id must not be empty".to_string(),
            ));
        }
        validate_ident("entity_type", &self.entity_type)?;
        validate_ident("source_system", &self.source_system)?;
        if self.source_entity_id.trim().is_empty() {
            return Err(CatalogError::ValidationError(
                "source_entity_id must not be empty".to_string(),
            ));
        }
        if self.version < 0 {
            return Err(CatalogError::ValidationError(format!(
                "version must be non-negative, got {}",
                self.version
            )));
        }
        for rel in &self.relationships {
            validate_ident("relation_type", &rel.relation_type)?;
            validate_ident("object_type", &rel.object_type)?;
            if rel.object_id.trim().is_empty() {
                return Err(CatalogError::ValidationError(
                    "relationship object_id must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}
