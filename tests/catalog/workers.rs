use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use meshcat::catalog::Catalog;
use meshcat::catalog::invalidation::NullSink;
use meshcat::catalog::model::ChangeNotification;
use meshcat::catalog::workers::{WorkerPool, partition_for};
use meshcat::core::config::CatalogConfig;
use meshcat::core::error::CatalogError;
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;

const ENTITIES: usize = 12;
const VERSIONS: i64 = 6;

fn test_catalog(workers: usize) -> (tempfile::TempDir, Catalog) {
    let tmp = tempdir().expect("tempdir");
    let mut config = CatalogConfig::default();
    config.ingest.workers = workers;
    config.ingest.base_delay_ms = 1;
    config.ingest.max_delay_ms = 10;
    config.ingest.max_attempts = 10;
    let catalog = Catalog::open_with(tmp.path(), config, Arc::new(NullSink)).expect("open catalog");
    (tmp, catalog)
}

fn event(entity: usize, version: i64) -> ChangeNotification {
    let base = Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap();
    serde_json::from_value(json!({
        "event_id": format!("e{}-v{}", entity, version),
        "entity_type": "sensor",
        "source_system": if entity % 2 == 0 { "plant-a" } else { "plant-b" },
        "source_entity_id": entity.to_string(),
        "event_type": if version == 1 { "CREATED" } else { "UPDATED" },
        "version": version,
        "payload": {"reading": version * 10, "entity": entity},
        "occurred_at": base + ChronoDuration::minutes(version),
    }))
    .expect("valid notification")
}

/// Every version of every entity, newest versions interleaved first, plus redeliveries.
fn workload() -> Vec<ChangeNotification> {
    let mut events = Vec::new();
    for version in (1..=VERSIONS).rev() {
        for entity in 0..ENTITIES {
            events.push(event(entity, version));
        }
    }
    for entity in 0..ENTITIES {
        events.push(event(entity, VERSIONS));
    }
    events
}

#[test]
fn test_partitioning_is_stable_and_in_range() {
    for partitions in [1, 3, 8] {
        for id in ["1", "2", "abc", "x:y"] {
            let p = partition_for("crm", id, partitions);
            assert!(p < partitions);
            assert_eq!(p, partition_for("crm", id, partitions));
        }
    }
    assert_eq!(partition_for("crm", "1", 0), 0);
}

#[test]
fn test_parallel_ingest_converges_like_sequential() {
    let (_seq_tmp, sequential) = test_catalog(1);
    let stats = sequential.apply_batch(&workload());
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.applied, ENTITIES);
    assert_eq!(stats.duplicate, ENTITIES);

    let (_par_tmp, parallel) = test_catalog(4);
    let pool = parallel.start_workers().expect("start workers");
    assert_eq!(pool.workers(), 4);
    for n in workload() {
        pool.submit(n).expect("submit");
    }
    let stats = pool.shutdown().expect("shutdown");
    assert_eq!(stats.total(), workload().len());
    assert_eq!(stats.failed, 0, "failures: {:?}", stats.failures);
    assert_eq!(stats.applied, ENTITIES);
    assert_eq!(stats.stale, ENTITIES * (VERSIONS as usize - 1));
    assert_eq!(stats.duplicate, ENTITIES);

    for entity in 0..ENTITIES {
        let system = if entity % 2 == 0 { "plant-a" } else { "plant-b" };
        let e = parallel
            .get_entity("sensor", &format!("{}:{}", system, entity), None)
            .expect("entity");
        assert_eq!(e.version, VERSIONS);
    }
    assert_eq!(
        parallel.state_hash().unwrap(),
        sequential.state_hash().unwrap()
    );
}

#[test]
fn test_zero_workers_is_a_config_error() {
    let (_tmp, catalog) = test_catalog(1);
    assert!(matches!(
        WorkerPool::start(catalog.pipeline(), 0),
        Err(CatalogError::ConfigError(_))
    ));
}
