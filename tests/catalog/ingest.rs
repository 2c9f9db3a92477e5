use chrono::{DateTime, TimeZone, Utc};
use meshcat::catalog::Catalog;
use meshcat::catalog::dead_letter::DeadLetterKind;
use meshcat::catalog::ingest::ApplyOutcome;
use meshcat::catalog::invalidation::{ChannelSink, InvalidationSink, NullSink};
use meshcat::catalog::model::{AttrValue, ChangeNotification};
use meshcat::catalog::schema_registry::{FieldDef, FieldType};
use meshcat::core::config::CatalogConfig;
use meshcat::core::error::CatalogError;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::mpsc;
use tempfile::tempdir;

fn test_config() -> CatalogConfig {
    let mut config = CatalogConfig::default();
    config.ingest.base_delay_ms = 1;
    config.ingest.max_delay_ms = 5;
    config
}

fn test_catalog_with(
    config: CatalogConfig,
    sink: Arc<dyn InvalidationSink>,
) -> (tempfile::TempDir, Catalog) {
    let tmp = tempdir().expect("tempdir");
    let catalog = Catalog::open_with(tmp.path(), config, sink).expect("open catalog");
    (tmp, catalog)
}

fn test_catalog() -> (tempfile::TempDir, Catalog) {
    test_catalog_with(test_config(), Arc::new(NullSink))
}

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
}

fn event(
    event_id: &str,
    event_type: &str,
    version: i64,
    occurred_at: DateTime<Utc>,
    payload: Value,
) -> ChangeNotification {
    serde_json::from_value(json!({
        "event_id": event_id,
        "entity_type": "customer",
        "source_system": "crm",
        "source_entity_id": "42",
        "event_type": event_type,
        "version": version,
        "payload": payload,
        "occurred_at": occurred_at,
    }))
    .expect("valid notification")
}

fn text(v: &str) -> AttrValue {
    AttrValue::Text(v.to_string())
}

#[test]
fn test_duplicate_event_is_a_no_op() {
    let (_tmp, catalog) = test_catalog();
    let e = event("ev-1", "CREATED", 1, at(0), json!({"name": "Ada"}));

    let first = catalog.apply(&e).expect("first delivery");
    assert!(matches!(first, ApplyOutcome::Applied { version: 1, .. }));
    let hash = catalog.state_hash().expect("hash");

    let second = catalog.apply(&e).expect("redelivery");
    assert_eq!(
        second,
        ApplyOutcome::Duplicate {
            event_id: "ev-1".to_string()
        }
    );
    assert_eq!(catalog.state_hash().expect("hash"), hash);
    assert_eq!(
        catalog
            .entity_history("customer", "crm:42")
            .expect("history")
            .len(),
        1
    );
}

#[test]
fn test_out_of_order_versions_converge_to_highest() {
    let (_tmp, catalog) = test_catalog();
    let v3 = event("ev-3", "UPDATED", 3, at(3), json!({"name": "v3"}));
    let v1 = event("ev-1", "CREATED", 1, at(1), json!({"name": "v1"}));
    let v2 = event("ev-2", "UPDATED", 2, at(2), json!({"name": "v2"}));

    assert!(matches!(
        catalog.apply(&v3).expect("v3"),
        ApplyOutcome::Applied { version: 3, .. }
    ));
    assert!(matches!(
        catalog.apply(&v1).expect("v1"),
        ApplyOutcome::Stale {
            version: 1,
            current_version: 3,
            ..
        }
    ));
    assert!(matches!(
        catalog.apply(&v2).expect("v2"),
        ApplyOutcome::Stale { version: 2, .. }
    ));

    let entity = catalog
        .get_entity("customer", "crm:42", None)
        .expect("entity");
    assert_eq!(entity.version, 3);
    assert_eq!(entity.attributes.get("name"), Some(&text("v3")));
    assert_eq!(entity.last_event_id, "ev-3");
    assert_eq!(entity.updated_at, at(3));
    // Earliest occurrence wins even though it arrived late.
    assert_eq!(entity.created_at, at(1));

    // Stale events are still logged.
    let history = catalog.entity_history("customer", "crm:42").expect("history");
    assert_eq!(history.len(), 3);
}

#[test]
fn test_every_delivery_order_yields_the_same_state() {
    let events = vec![
        event("ev-1", "CREATED", 1, at(1), json!({"name": "a", "tier": 1})),
        event("ev-2", "UPDATED", 2, at(2), json!({"name": "b", "tier": 1})),
        event("ev-3", "UPDATED", 3, at(3), json!({"name": "c", "tier": 2})),
        event("ev-4", "UPDATED", 4, at(4), json!({"name": "d", "tier": 3})),
    ];
    let orders: [[usize; 4]; 5] = [
        [0, 1, 2, 3],
        [3, 2, 1, 0],
        [2, 0, 3, 1],
        [1, 3, 0, 2],
        [3, 0, 1, 2],
    ];

    let mut hashes = Vec::new();
    let mut states = Vec::new();
    for order in orders {
        let (_tmp, catalog) = test_catalog();
        for i in order {
            catalog.apply(&events[i]).expect("apply");
        }
        hashes.push(catalog.state_hash().expect("hash"));
        states.push(
            catalog
                .get_entity("customer", "crm:42", None)
                .expect("entity"),
        );
    }
    assert!(hashes.windows(2).all(|w| w[0] == w[1]));
    assert!(states.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(states[0].version, 4);
    assert_eq!(states[0].created_at, at(1));
}

#[test]
fn test_equal_versions_break_ties_on_time_then_event_id() {
    let (_tmp, catalog) = test_catalog();
    catalog
        .apply(&event("ev-b", "UPDATED", 5, at(10), json!({"name": "later"})))
        .expect("later");
    let outcome = catalog
        .apply(&event("ev-a", "UPDATED", 5, at(5), json!({"name": "earlier"})))
        .expect("earlier");
    assert!(matches!(outcome, ApplyOutcome::Stale { .. }));
    let entity = catalog.get_entity("customer", "crm:42", None).unwrap();
    assert_eq!(entity.attributes.get("name"), Some(&text("later")));

    // Same version and time: the larger event id wins.
    catalog
        .apply(&event("ev-z", "UPDATED", 5, at(10), json!({"name": "z"})))
        .expect("z");
    catalog
        .apply(&event("ev-c", "UPDATED", 5, at(10), json!({"name": "c"})))
        .expect("c");
    let entity = catalog.get_entity("customer", "crm:42", None).unwrap();
    assert_eq!(entity.last_event_id, "ev-z");
    assert_eq!(entity.attributes.get("name"), Some(&text("z")));
}

#[test]
fn test_delete_keeps_a_tombstone_and_a_newer_version_revives() {
    let (_tmp, catalog) = test_catalog();
    catalog
        .apply(&event("ev-1", "CREATED", 1, at(1), json!({"name": "Ada"})))
        .unwrap();
    catalog
        .apply(&event("ev-2", "DELETED", 2, at(2), json!({})))
        .unwrap();

    let tombstone = catalog.get_entity("customer", "crm:42", None).unwrap();
    assert!(tombstone.is_deleted());
    assert_eq!(tombstone.deleted_at, Some(at(2)));
    assert_eq!(tombstone.version, 2);

    assert!(
        catalog
            .list_entities("customer", None, false, 10)
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        catalog.list_entities("customer", None, true, 10).unwrap().len(),
        1
    );

    // An older update arriving after the delete does not resurrect it.
    let late = catalog
        .apply(&event("ev-0", "UPDATED", 1, at(0), json!({"name": "old"})))
        .unwrap();
    assert!(matches!(late, ApplyOutcome::Stale { .. }));
    assert!(catalog.get_entity("customer", "crm:42", None).unwrap().is_deleted());

    catalog
        .apply(&event("ev-3", "UPDATED", 3, at(3), json!({"name": "Back"})))
        .unwrap();
    let revived = catalog.get_entity("customer", "crm:42", None).unwrap();
    assert!(!revived.is_deleted());
    assert_eq!(revived.attributes.get("name"), Some(&text("Back")));
    assert_eq!(revived.created_at, at(0));
}

#[test]
fn test_schema_violation_is_dead_lettered_and_not_logged() {
    let (_tmp, catalog) = test_catalog();
    catalog
        .register_schema(
            "customer",
            1,
            &[
                FieldDef::required("email", FieldType::String),
                FieldDef::optional("name", FieldType::String),
            ],
            None,
        )
        .expect("register");

    let err = catalog
        .apply(&event(
            "ev-1",
            "CREATED",
            1,
            at(1),
            json!({"email": "a@b.c", "nickname": "x"}),
        ))
        .unwrap_err();
    match err {
        CatalogError::SchemaConflict { fields, .. } => {
            assert_eq!(fields, vec!["nickname".to_string()])
        }
        other => panic!("expected schema conflict, got {other:?}"),
    }

    let err = catalog
        .apply(&event("ev-2", "CREATED", 1, at(1), json!({"name": "no email"})))
        .unwrap_err();
    assert!(matches!(err, CatalogError::SchemaConflict { .. }));

    assert!(matches!(
        catalog.get_entity("customer", "crm:42", None),
        Err(CatalogError::NotFound(_))
    ));
    assert!(catalog.entity_history("customer", "crm:42").unwrap().is_empty());

    let letters = catalog
        .dead_letters(Some(DeadLetterKind::SchemaConflict), false)
        .unwrap();
    assert_eq!(letters.len(), 2);
    assert_eq!(letters[0].event_id, "ev-1");
    assert_eq!(letters[0].attempts, 1);
    assert_eq!(letters[0].payload["event_id"], "ev-1");
}

#[test]
fn test_typed_attributes_follow_the_schema() {
    let (_tmp, catalog) = test_catalog();
    catalog
        .register_schema(
            "customer",
            1,
            &[
                FieldDef::required("email", FieldType::String).with_pii(),
                FieldDef::optional("score", FieldType::Float),
                FieldDef::optional("since", FieldType::Timestamp),
            ],
            None,
        )
        .unwrap();
    catalog
        .apply(&event(
            "ev-1",
            "CREATED",
            1,
            at(1),
            json!({"email": "a@b.c", "score": 7, "since": "2023-01-01T00:00:00Z"}),
        ))
        .unwrap();

    let entity = catalog.get_entity("customer", "crm:42", None).unwrap();
    assert_eq!(entity.schema_version, Some(1));
    assert_eq!(entity.attributes.get("score"), Some(&AttrValue::Float(7.0)));
    assert!(matches!(
        entity.attributes.get("since"),
        Some(AttrValue::Timestamp(_))
    ));
    assert!(entity.contains_pii);
}

#[test]
fn test_require_schema_rejects_unregistered_types() {
    let mut config = test_config();
    config.ingest.require_schema = true;
    let (_tmp, catalog) = test_catalog_with(config, Arc::new(NullSink));

    let err = catalog
        .apply(&event("ev-1", "CREATED", 1, at(1), json!({"name": "x"})))
        .unwrap_err();
    assert!(matches!(err, CatalogError::SchemaConflict { .. }));
    assert_eq!(
        catalog
            .dead_letters(Some(DeadLetterKind::SchemaConflict), false)
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn test_malformed_input_is_dead_lettered() {
    let (_tmp, catalog) = test_catalog();
    let pipeline = catalog.pipeline();

    assert!(pipeline.apply_json("{not json").is_err());
    assert!(
        pipeline
            .apply_json(r#"{"event_id": "ev-x", "entity_type": "customer"}"#)
            .is_err()
    );

    let mut bad = event("ev-bad", "CREATED", 1, at(1), json!({}));
    bad.source_system = "crm:eu".to_string();
    assert!(matches!(
        catalog.apply(&bad),
        Err(CatalogError::ValidationError(_))
    ));

    let letters = catalog
        .dead_letters(Some(DeadLetterKind::Malformed), false)
        .unwrap();
    assert_eq!(letters.len(), 3);
    assert!(letters.iter().any(|l| l.event_id == "ev-x"));
    assert!(letters.iter().any(|l| l.event_id == "ev-bad"));
    assert!(
        catalog
            .dead_letters(Some(DeadLetterKind::SchemaConflict), false)
            .unwrap()
            .is_empty()
    );
}

#[test]
fn test_dead_letters_replay_once_the_schema_exists() {
    let (_tmp, catalog) = test_catalog();
    let fields_v1 = [FieldDef::required("email", FieldType::String)];
    let fields_v2 = [
        FieldDef::required("email", FieldType::String),
        FieldDef::optional("phone", FieldType::String),
    ];
    catalog.register_schema("customer", 1, &fields_v1, None).unwrap();

    let mut e = event(
        "ev-1",
        "CREATED",
        1,
        at(1),
        json!({"email": "a@b.c", "phone": "555"}),
    );
    e.schema_version = Some(2);
    assert!(catalog.apply(&e).is_err());

    let report = catalog.replay_dead_letters(None).unwrap();
    assert_eq!(report.replayed, 0);
    assert_eq!(report.still_failing, 1);
    assert_eq!(catalog.dead_letters(None, false).unwrap().len(), 1);

    assert!(
        catalog
            .register_schema("customer", 2, &fields_v2, None)
            .unwrap()
            .is_accepted()
    );
    let report = catalog
        .replay_dead_letters(Some(DeadLetterKind::SchemaConflict))
        .unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(report.still_failing, 0);

    let entity = catalog.get_entity("customer", "crm:42", None).unwrap();
    assert_eq!(entity.schema_version, Some(2));
    assert_eq!(entity.attributes.get("phone"), Some(&text("555")));
    assert!(catalog.dead_letters(None, false).unwrap().is_empty());
    let all = catalog.dead_letters(None, true).unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].replayed_at.is_some());
}

#[test]
fn test_invalidation_signals_follow_state_changes() {
    let (tx, rx) = mpsc::channel();
    let (_tmp, catalog) = test_catalog_with(test_config(), Arc::new(ChannelSink::new(tx)));

    let mut e = event("ev-2", "UPDATED", 2, at(2), json!({"name": "b"}));
    e.changed_fields = vec!["name".to_string()];
    catalog.apply(&e).unwrap();
    catalog.apply(&e).unwrap();
    catalog
        .apply(&event("ev-1", "CREATED", 1, at(1), json!({"name": "a"})))
        .unwrap();

    let signals: Vec<_> = rx.try_iter().collect();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].entity_type, "customer");
    assert_eq!(signals[0].entity_id, "crm:42");
    assert_eq!(signals[0].changed_at, at(2));
    assert_eq!(signals[0].changed_fields, vec!["name".to_string()]);
}

#[test]
fn test_dropped_receiver_does_not_fail_ingestion() {
    let (tx, rx) = mpsc::channel();
    drop(rx);
    let (_tmp, catalog) = test_catalog_with(test_config(), Arc::new(ChannelSink::new(tx)));
    let outcome = catalog
        .apply(&event("ev-1", "CREATED", 1, at(1), json!({"name": "a"})))
        .expect("ingestion succeeds without a listener");
    assert!(matches!(outcome, ApplyOutcome::Applied { .. }));
}

#[test]
fn test_batch_counts_every_outcome() {
    let (_tmp, catalog) = test_catalog();
    let mut bad = event("ev-bad", "CREATED", 1, at(1), json!({}));
    bad.version = -1;
    let batch = vec![
        event("ev-2", "UPDATED", 2, at(2), json!({"name": "b"})),
        event("ev-1", "CREATED", 1, at(1), json!({"name": "a"})),
        event("ev-2", "UPDATED", 2, at(2), json!({"name": "b"})),
        bad,
    ];
    let stats = catalog.apply_batch(&batch);
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.stale, 1);
    assert_eq!(stats.duplicate, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.total(), 4);
    assert_eq!(stats.failures[0].event_id, "ev-bad");
}

#[test]
fn test_producer_pii_flag_is_kept() {
    let (_tmp, catalog) = test_catalog();
    let mut e = event("ev-1", "CREATED", 1, at(1), json!({"ssn": "x"}));
    e.contains_pii = true;
    catalog.apply(&e).unwrap();
    assert!(catalog.get_entity("customer", "crm:42", None).unwrap().contains_pii);
}
