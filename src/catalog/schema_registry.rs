//! Schema Registry: versioned field definitions per entity type.
//!
//! A new version is accepted only if it is backward-compatible with the
//! immediately-prior version. Registered versions are immutable.

use crate::catalog::model::{
    AttrValue, Attributes, ChangeNotification, EventType, untyped_attributes, validate_ident,
};
use crate::core::error::CatalogError;
use crate::core::time;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    List,
    Map,
    Any,
}

impl FieldType {
    /// Widening-only evolution: identity, `int -> float`, anything -> `any`.
    pub fn widens_to(self, to: FieldType) -> bool {
        self == to || to == FieldType::Any || (self == FieldType::Int && to == FieldType::Float)
    }

    fn coerce(self, value: &JsonValue) -> Option<AttrValue> {
        match (self, value) {
            (FieldType::String, JsonValue::String(s)) => Some(AttrValue::Text(s.clone())),
            (FieldType::Int, JsonValue::Number(n)) => n.as_i64().map(AttrValue::Int),
            (FieldType::Float, JsonValue::Number(n)) => n.as_f64().map(AttrValue::Float),
            (FieldType::Bool, JsonValue::Bool(b)) => Some(AttrValue::Bool(*b)),
            (FieldType::Timestamp, JsonValue::String(s)) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|d| AttrValue::Timestamp(time::normalize(d.with_timezone(&Utc)))),
            (FieldType::List, JsonValue::Array(_)) | (FieldType::Map, JsonValue::Object(_)) => {
                Some(AttrValue::from_json(value))
            }
            (FieldType::Any, v) => Some(AttrValue::from_json(v)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub pii: bool,
    /// Target entity type for foreign-key-like fields; populated values
    /// become inferred relationship edges named after the field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
}

impl FieldDef {
    pub fn required(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            required: true,
            pii: false,
            references: None,
        }
    }

    pub fn optional(name: &str, field_type: FieldType) -> Self {
        Self {
            required: false,
            ..Self::required(name, field_type)
        }
    }

    pub fn with_pii(mut self) -> Self {
        self.pii = true;
        self
    }

    pub fn referencing(mut self, entity_type: &str) -> Self {
        self.references = Some(entity_type.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityClass {
    /// Required fields stay, types only widen, additions are optional.
    #[default]
    Backward,
    /// Backward plus: no field removed, no type changed at all.
    Full,
}

impl CompatibilityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompatibilityClass::Backward => "backward",
            CompatibilityClass::Full => "full",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CatalogError> {
        match raw {
            "backward" => Ok(CompatibilityClass::Backward),
            "full" => Ok(CompatibilityClass::Full),
            other => Err(CatalogError::ValidationError(format!(
                "Invalid compatibility class '{}'. Must be one of: backward, full",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub entity_type: String,
    pub version: i64,
    pub fields: Vec<FieldDef>,
    pub compatibility_class: CompatibilityClass,
    pub registered_at: DateTime<Utc>,
}

/// One incompatibility, naming the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub reason: String,
}

fn summarize(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.field, v.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl SchemaDefinition {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn reference_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.references.is_some())
    }

    /// Convert a producer payload into typed attributes, collecting every violation.
    pub fn coerce_payload(
        &self,
        payload: &JsonMap<String, JsonValue>,
        event_type: EventType,
    ) -> Result<Attributes, Vec<FieldViolation>> {
        let mut violations = Vec::new();
        let mut attrs = BTreeMap::new();

        for (name, value) in payload {
            let Some(def) = self.field(name) else {
                violations.push(FieldViolation {
                    field: name.clone(),
                    reason: "unknown field".to_string(),
                });
                continue;
            };
            if value.is_null() {
                if def.required && event_type != EventType::Deleted {
                    violations.push(FieldViolation {
                        field: name.clone(),
                        reason: "required field is null".to_string(),
                    });
                } else {
                    attrs.insert(name.clone(), AttrValue::Null);
                }
                continue;
            }
            match def.field_type.coerce(value) {
                Some(v) => {
                    attrs.insert(name.clone(), v);
                }
                None => violations.push(FieldViolation {
                    field: name.clone(),
                    reason: format!("expected {:?}, got {}", def.field_type, json_kind(value)),
                }),
            }
        }

        if event_type != EventType::Deleted {
            for def in self.fields.iter().filter(|f| f.required) {
                if !payload.contains_key(&def.name) {
                    violations.push(FieldViolation {
                        field: def.name.clone(),
                        reason: "required field missing".to_string(),
                    });
                }
            }
        }

        if violations.is_empty() {
            Ok(attrs)
        } else {
            Err(violations)
        }
    }

    /// Whether any populated attribute is declared as PII.
    pub fn pii_present(&self, attrs: &Attributes) -> bool {
        self.fields
            .iter()
            .filter(|f| f.pii)
            .any(|f| attrs.get(&f.name).is_some_and(|v| !v.is_null()))
    }

    fn fingerprint(fields: &[FieldDef], class: CompatibilityClass) -> String {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_string(fields).unwrap_or_default().as_bytes());
        hasher.update(b"|");
        hasher.update(class.as_str().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Check `fields` (the candidate version) against the prior version.
pub fn check_compatibility(
    prior: &SchemaDefinition,
    fields: &[FieldDef],
    class: CompatibilityClass,
) -> Vec<FieldViolation> {
    let mut violations = Vec::new();
    let candidate: BTreeMap<&str, &FieldDef> =
        fields.iter().map(|f| (f.name.as_str(), f)).collect();

    for old in &prior.fields {
        match candidate.get(old.name.as_str()) {
            None if old.required => violations.push(FieldViolation {
                field: old.name.clone(),
                reason: "required field removed".to_string(),
            }),
            None if class == CompatibilityClass::Full => violations.push(FieldViolation {
                field: old.name.clone(),
                reason: "field removed under full compatibility".to_string(),
            }),
            None => {}
            Some(new) => {
                if !old.field_type.widens_to(new.field_type) {
                    violations.push(FieldViolation {
                        field: old.name.clone(),
                        reason: format!(
                            "incompatible type change {:?} -> {:?}",
                            old.field_type, new.field_type
                        ),
                    });
                } else if class == CompatibilityClass::Full && old.field_type != new.field_type {
                    violations.push(FieldViolation {
                        field: old.name.clone(),
                        reason: format!(
                            "type change {:?} -> {:?} not allowed under full compatibility",
                            old.field_type, new.field_type
                        ),
                    });
                }
                if !old.required && new.required {
                    violations.push(FieldViolation {
                        field: old.name.clone(),
                        reason: "optional field became required".to_string(),
                    });
                }
            }
        }
    }

    let prior_names: BTreeSet<&str> = prior.fields.iter().map(|f| f.name.as_str()).collect();
    for new in fields {
        if !prior_names.contains(new.name.as_str()) && new.required {
            violations.push(FieldViolation {
                field: new.name.clone(),
                reason: "added field must be optional".to_string(),
            });
        }
    }

    violations
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RegisterOutcome {
    Accepted {
        entity_type: String,
        version: i64,
        /// The identical definition was already registered.
        idempotent: bool,
    },
    Rejected {
        entity_type: String,
        version: i64,
        reason: String,
        fields: Vec<String>,
    },
}

impl RegisterOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, RegisterOutcome::Accepted { .. })
    }

    /// Surface a rejection as a `SchemaConflict` error.
    pub fn into_result(self) -> Result<Self, CatalogError> {
        match self {
            RegisterOutcome::Rejected {
                entity_type,
                reason,
                fields,
                ..
            } => Err(CatalogError::SchemaConflict {
                entity_type,
                reason,
                fields,
            }),
            accepted => Ok(accepted),
        }
    }
}

fn rejected(entity_type: &str, version: i64, reason: String, fields: Vec<String>) -> RegisterOutcome {
    tracing::warn!(entity_type, version, %reason, "schema version rejected");
    RegisterOutcome::Rejected {
        entity_type: entity_type.to_string(),
        version,
        reason,
        fields,
    }
}

fn validate_fields(fields: &[FieldDef]) -> Result<(), CatalogError> {
    if fields.is_empty() {
        return Err(CatalogError::ValidationError(
            "A schema needs at least one field".to_string(),
        ));
    }
    let mut seen = BTreeSet::new();
    for f in fields {
        validate_ident("field name", &f.name)?;
        if !seen.insert(f.name.as_str()) {
            return Err(CatalogError::ValidationError(format!(
                "Duplicate field '{}'",
                f.name
            )));
        }
        if let Some(target) = &f.references {
            validate_ident("referenced entity type", target)?;
            if !matches!(f.field_type, FieldType::String | FieldType::List) {
                return Err(CatalogError::ValidationError(format!(
                    "Reference field '{}' must be of type string or list",
                    f.name
                )));
            }
        }
    }
    Ok(())
}

/// Register a schema version. Malformed requests are errors; incompatible
/// ones are `Rejected` outcomes.
pub fn register(
    conn: &Connection,
    entity_type: &str,
    version: i64,
    fields: &[FieldDef],
    class: CompatibilityClass,
) -> Result<RegisterOutcome, CatalogError> {
    validate_ident("entity_type", entity_type)?;
    if version < 1 {
        return Err(CatalogError::ValidationError(format!(
            "Schema version must be >= 1, got {}",
            version
        )));
    }
    validate_fields(fields)?;

    let fingerprint = SchemaDefinition::fingerprint(fields, class);

    let existing: Option<String> = conn
        .query_row(
            "SELECT fingerprint FROM schemas WHERE entity_type = ?1 AND version = ?2",
            params![entity_type, version],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(existing) = existing {
        if existing == fingerprint {
            return Ok(RegisterOutcome::Accepted {
                entity_type: entity_type.to_string(),
                version,
                idempotent: true,
            });
        }
        return Ok(rejected(
            entity_type,
            version,
            format!("version {} is already registered with a different definition", version),
            vec![],
        ));
    }

    if let Some(prior) = latest(conn, entity_type)? {
        if version <= prior.version {
            return Ok(rejected(
                entity_type,
                version,
                format!(
                    "version {} is not newer than the latest registered version {}",
                    version, prior.version
                ),
                vec![],
            ));
        }
        let violations = check_compatibility(&prior, fields, class);
        if !violations.is_empty() {
            return Ok(rejected(
                entity_type,
                version,
                format!(
                    "incompatible with version {}: {}",
                    prior.version,
                    summarize(&violations)
                ),
                violations.into_iter().map(|v| v.field).collect(),
            ));
        }
    }

    conn.execute(
        "INSERT INTO schemas(entity_type, version, fields, compatibility_class, fingerprint, registered_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entity_type,
            version,
            serde_json::to_string(fields)?,
            class.as_str(),
            fingerprint,
            time::to_db(&time::now()),
        ],
    )?;
    tracing::info!(entity_type, version, fields = fields.len(), "schema version registered");

    Ok(RegisterOutcome::Accepted {
        entity_type: entity_type.to_string(),
        version,
        idempotent: false,
    })
}

fn read_schema(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, i64, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode(raw: (String, i64, String, String, String)) -> Result<SchemaDefinition, CatalogError> {
    let (entity_type, version, fields, class, registered_at) = raw;
    Ok(SchemaDefinition {
        entity_type,
        version,
        fields: serde_json::from_str(&fields)?,
        compatibility_class: CompatibilityClass::parse(&class)?,
        registered_at: time::from_db(&registered_at)?,
    })
}

const SELECT_SCHEMA: &str =
    "SELECT entity_type, version, fields, compatibility_class, registered_at FROM schemas";

pub fn get_version(
    conn: &Connection,
    entity_type: &str,
    version: i64,
) -> Result<Option<SchemaDefinition>, CatalogError> {
    conn.query_row(
        &format!("{} WHERE entity_type = ?1 AND version = ?2", SELECT_SCHEMA),
        params![entity_type, version],
        read_schema,
    )
    .optional()?
    .map(decode)
    .transpose()
}

pub fn latest(conn: &Connection, entity_type: &str) -> Result<Option<SchemaDefinition>, CatalogError> {
    conn.query_row(
        &format!(
            "{} WHERE entity_type = ?1 ORDER BY version DESC LIMIT 1",
            SELECT_SCHEMA
        ),
        params![entity_type],
        read_schema,
    )
    .optional()?
    .map(decode)
    .transpose()
}

/// Fetch a specific version, or the latest when `version` is `None`.
pub fn get(
    conn: &Connection,
    entity_type: &str,
    version: Option<i64>,
) -> Result<SchemaDefinition, CatalogError> {
    let found = match version {
        Some(v) => get_version(conn, entity_type, v)?,
        None => latest(conn, entity_type)?,
    };
    found.ok_or_else(|| {
        CatalogError::NotFound(match version {
            Some(v) => format!("Schema '{}' version {} not found", entity_type, v),
            None => format!("No schema registered for '{}'", entity_type),
        })
    })
}

pub fn list(conn: &Connection, entity_type: &str) -> Result<Vec<SchemaDefinition>, CatalogError> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE entity_type = ?1 ORDER BY version",
        SELECT_SCHEMA
    ))?;
    let rows = stmt
        .query_map(params![entity_type], read_schema)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(decode).collect()
}

/// Ingestion-time validation: pick the schema the event is checked against
/// (explicit version, else latest) and make sure the payload conforms.
pub fn resolve_for_event(
    conn: &Connection,
    n: &ChangeNotification,
    require_schema: bool,
) -> Result<Option<SchemaDefinition>, CatalogError> {
    let conflict = |reason: String, fields: Vec<String>| CatalogError::SchemaConflict {
        entity_type: n.entity_type.clone(),
        reason,
        fields,
    };

    let schema = match n.schema_version {
        Some(v) => Some(get_version(conn, &n.entity_type, v)?.ok_or_else(|| {
            conflict(format!("schema version {} is not registered", v), vec![])
        })?),
        None => latest(conn, &n.entity_type)?,
    };

    match &schema {
        None if require_schema => {
            return Err(conflict("no schema registered for entity type".to_string(), vec![]));
        }
        None => {}
        Some(s) => {
            s.coerce_payload(&n.payload, n.event_type).map_err(|violations| {
                conflict(
                    format!(
                        "payload does not conform to version {}: {}",
                        s.version,
                        summarize(&violations)
                    ),
                    violations.into_iter().map(|v| v.field).collect(),
                )
            })?;
        }
    }
    Ok(schema)
}

/// Typed attributes for a logged event; untyped when it was accepted without a schema.
pub fn attributes_for(
    conn: &Connection,
    entity_type: &str,
    schema_version: Option<i64>,
    payload: &JsonMap<String, JsonValue>,
    event_type: EventType,
) -> Result<(Attributes, Option<SchemaDefinition>), CatalogError> {
    let Some(version) = schema_version else {
        return Ok((untyped_attributes(payload), None));
    };
    let schema = get(conn, entity_type, Some(version))?;
    let attrs = schema
        .coerce_payload(payload, event_type)
        .map_err(|violations| CatalogError::SchemaConflict {
            entity_type: entity_type.to_string(),
            reason: summarize(&violations),
            fields: violations.into_iter().map(|v| v.field).collect(),
        })?;
    Ok((attrs, Some(schema)))
}
