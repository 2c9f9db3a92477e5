use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use meshcat::catalog::invalidation::NullSink;
use meshcat::catalog::model::ChangeNotification;
use meshcat::catalog::retention;
use meshcat::catalog::schema_registry::{FieldDef, FieldType};
use meshcat::catalog::{Catalog, GraphQuery};
use meshcat::core::config::CatalogConfig;
use meshcat::core::db;
use meshcat::core::time;
use serde_json::{Value, json};
use std::sync::Arc;
use tempfile::tempdir;

fn test_catalog() -> (tempfile::TempDir, Catalog) {
    let tmp = tempdir().expect("tempdir");
    let catalog = Catalog::open_with(tmp.path(), CatalogConfig::default(), Arc::new(NullSink))
        .expect("open catalog");
    (tmp, catalog)
}

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, hour, 0, 0).unwrap()
}

fn event(
    event_id: &str,
    entity_type: &str,
    id: &str,
    event_type: &str,
    version: i64,
    hour: u32,
    payload: Value,
) -> ChangeNotification {
    let relationships = if entity_type == "customer" {
        json!([{"relation_type": "segment", "object_type": "segment", "object_id": "vip"}])
    } else {
        json!([])
    };
    serde_json::from_value(json!({
        "event_id": event_id,
        "entity_type": entity_type,
        "source_system": "shop",
        "source_entity_id": id,
        "event_type": event_type,
        "version": version,
        "payload": payload,
        "relationships": relationships,
        "occurred_at": at(hour),
    }))
    .expect("valid notification")
}

/// A small mixed history with out-of-order versions, a delete and inferred edges.
fn seed(catalog: &Catalog) {
    catalog
        .register_schema(
            "order",
            1,
            &[
                FieldDef::required("total", FieldType::Float),
                FieldDef::optional("customer_id", FieldType::String).referencing("customer"),
            ],
            None,
        )
        .unwrap();
    let events = [
        event("c1-v1", "customer", "c1", "CREATED", 1, 1, json!({"name": "Ada"})),
        event("c2-v2", "customer", "c2", "UPDATED", 2, 3, json!({"name": "Bob B"})),
        event("c2-v1", "customer", "c2", "CREATED", 1, 2, json!({"name": "Bob"})),
        event("o1-v1", "order", "o1", "CREATED", 1, 4, json!({"total": 9.5, "customer_id": "c1"})),
        event("o1-v2", "order", "o1", "UPDATED", 2, 5, json!({"total": 9.5, "customer_id": "c2"})),
        event("c1-v2", "customer", "c1", "DELETED", 2, 6, json!({})),
        event("o1-v2", "order", "o1", "UPDATED", 2, 5, json!({"total": 9.5, "customer_id": "c2"})),
    ];
    for e in &events {
        catalog.apply(e).expect("apply");
    }
}

#[test]
fn test_rebuild_reproduces_live_projections() {
    let (_tmp, catalog) = test_catalog();
    seed(&catalog);
    let live = catalog.state_hash().unwrap();
    let edges_before = catalog.edge_history("order", "shop:o1").unwrap();

    let report = catalog.rebuild().unwrap();
    assert_eq!(report.state_hash, live);
    assert_eq!(report.live_events, 6);
    assert_eq!(report.archived_events, 0);
    assert_eq!(report.dominant + report.stale, 6);
    assert_eq!(report.stale, 1);
    assert_eq!(report.entities, 3);
    assert_eq!(catalog.state_hash().unwrap(), live);
    assert_eq!(catalog.edge_history("order", "shop:o1").unwrap(), edges_before);

    // Rebuilding twice changes nothing.
    assert_eq!(catalog.rebuild().unwrap().state_hash, live);
}

#[test]
fn test_verify_detects_and_rebuild_repairs_drift() {
    let (tmp, catalog) = test_catalog();
    seed(&catalog);
    let verified = catalog.verify().unwrap();
    assert!(verified.matches);
    assert_eq!(verified.live_hash, verified.replayed_hash);
    let good = verified.live_hash;

    let db_path = db::catalog_db_path(tmp.path());
    let conn = db::db_connect(&db_path.to_string_lossy()).unwrap();
    conn.execute(
        "UPDATE entities SET attributes = '{}' WHERE source_entity_id = 'c2'",
        [],
    )
    .unwrap();
    conn.execute("DELETE FROM relationships", []).unwrap();
    drop(conn);

    let drifted = catalog.verify().unwrap();
    assert!(!drifted.matches);
    assert_eq!(drifted.replayed_hash, good);

    catalog.rebuild().unwrap();
    assert_eq!(catalog.state_hash().unwrap(), good);
    assert!(catalog.verify().unwrap().matches);
    // o1 -> c2 by reference, c2 -> vip explicitly.
    let sub = catalog
        .query_relationship_graph(&GraphQuery::new("order", "shop:o1"))
        .unwrap();
    assert_eq!(sub.edges.len(), 2);
    let mut relations: Vec<_> = sub.edges.iter().map(|e| e.relation_type.as_str()).collect();
    relations.sort();
    assert_eq!(relations, vec!["customer_id", "segment"]);
}

#[test]
fn test_pruned_months_still_rebuild() {
    let (_tmp, catalog) = test_catalog();
    seed(&catalog);
    let live = catalog.state_hash().unwrap();

    let later = time::now() + ChronoDuration::days(70);
    let report = catalog.prune(Some(1), later).unwrap();
    assert_eq!(report.keep_from, time::month_of(&later));
    assert_eq!(report.pruned.len(), 1);
    assert_eq!(report.pruned[0].events, 6);
    assert!(report.pruned[0].archive.exists());
    assert!(catalog.entity_history("customer", "shop:c2").unwrap().is_empty());

    // Projections are untouched by pruning.
    assert_eq!(catalog.state_hash().unwrap(), live);
    assert_eq!(
        retention::read_archives(catalog.store()).unwrap().len(),
        6
    );

    let rebuilt = catalog.rebuild().unwrap();
    assert_eq!(rebuilt.archived_events, 6);
    assert_eq!(rebuilt.live_events, 0);
    assert_eq!(rebuilt.state_hash, live);
    assert!(catalog.verify().unwrap().matches);

    // Nothing left to prune.
    assert!(catalog.prune(Some(1), later).unwrap().pruned.is_empty());
}

#[test]
fn test_late_event_edges_survive_rebuild() {
    let (_tmp, catalog) = test_catalog();
    catalog
        .apply(&event("x-v2", "customer", "x", "UPDATED", 2, 2, json!({})))
        .unwrap();
    // The newer version leaves the live table before the old one shows up.
    let later = time::now() + ChronoDuration::days(70);
    catalog.prune(Some(1), later).unwrap();
    catalog
        .apply(&event("x-v1", "customer", "x", "CREATED", 1, 1, json!({})))
        .unwrap();

    let edges = catalog.edge_history("customer", "shop:x").unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].event_id, "x-v1");
    assert_eq!(edges[0].valid_from, at(1));
    assert!(edges[0].is_active());
    assert_eq!(catalog.get_entity("customer", "shop:x", None).unwrap().version, 2);

    let live = catalog.state_hash().unwrap();
    let report = catalog.rebuild().unwrap();
    assert_eq!(report.archived_events, 1);
    assert_eq!(report.stale, 1);
    assert_eq!(report.state_hash, live);
    assert_eq!(catalog.edge_history("customer", "shop:x").unwrap(), edges);
}

#[test]
fn test_archives_merge_across_prunes() {
    let (_tmp, catalog) = test_catalog();
    catalog
        .apply(&event("a-v1", "customer", "a", "CREATED", 1, 1, json!({})))
        .unwrap();
    let later = time::now() + ChronoDuration::days(70);
    catalog.prune(Some(1), later).unwrap();

    catalog
        .apply(&event("a-v2", "customer", "a", "UPDATED", 2, 2, json!({"x": 1})))
        .unwrap();
    let live = catalog.state_hash().unwrap();
    let report = catalog.prune(Some(1), later).unwrap();
    assert_eq!(report.pruned.len(), 1);
    assert_eq!(report.pruned[0].events, 1);

    let archived = retention::read_archives(catalog.store()).unwrap();
    assert_eq!(archived.len(), 2);
    assert!(archived[0].seq < archived[1].seq);
    assert_eq!(catalog.rebuild().unwrap().state_hash, live);
}

#[test]
fn test_identical_logs_hash_identically() {
    let (_a_tmp, a) = test_catalog();
    let (_b_tmp, b) = test_catalog();
    seed(&a);
    seed(&b);
    assert_eq!(a.state_hash().unwrap(), b.state_hash().unwrap());

    let (_c_tmp, c) = test_catalog();
    assert_ne!(a.state_hash().unwrap(), c.state_hash().unwrap());
}
