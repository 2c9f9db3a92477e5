use meshcat::core::config::{self, CONFIG_FILE_NAME, CatalogConfig};
use meshcat::core::db;
use meshcat::core::error::{CatalogError, ErrorClass};
use meshcat::core::pool::{self, RetryPolicy};
use meshcat::core::schemas;
use meshcat::core::store::Store;
use meshcat::core::time;
use rusqlite::params;
use std::cell::Cell;
use std::fs;
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn db_initialization_is_idempotent_and_hardened() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();

    db::initialize_catalog_db(root).expect("first init");
    db::initialize_catalog_db(root).expect("second init");
    let db_path = db::catalog_db_path(root);
    assert!(db_path.exists());
    assert_eq!(db_path.file_name().unwrap(), schemas::CATALOG_DB_NAME);

    let conn = db::db_connect(&db_path.to_string_lossy()).expect("db connect");
    let fk_on: i64 = conn
        .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
        .expect("pragma foreign_keys");
    assert_eq!(fk_on, 1);
    let journal: String = conn
        .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
        .expect("pragma journal_mode");
    assert_eq!(journal.to_lowercase(), "wal");

    let version: String = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .expect("schema version row");
    assert_eq!(version, schemas::CATALOG_SCHEMA_VERSION.to_string());

    for table in [
        "schemas",
        "event_log",
        "entities",
        "relationships",
        "lineage",
        "dead_letters",
    ] {
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .expect("sqlite_master");
        assert_eq!(n, 1, "missing table {}", table);
    }
}

#[test]
fn pool_reads_see_committed_writes() {
    let tmp = tempdir().expect("tempdir");
    db::initialize_catalog_db(tmp.path()).expect("init");
    let db_path = db::catalog_db_path(tmp.path());

    pool::global_pool()
        .with_write(&db_path, |conn| {
            conn.execute(
                "INSERT INTO meta(key, value) VALUES('probe', 'yes')",
                [],
            )?;
            Ok(())
        })
        .expect("write");

    let value: String = pool::global_pool()
        .with_read(&db_path, |conn| {
            Ok(conn.query_row("SELECT value FROM meta WHERE key = 'probe'", [], |r| {
                r.get(0)
            })?)
        })
        .expect("read");
    assert_eq!(value, "yes");
}

#[test]
fn pool_serializes_concurrent_writers() {
    let tmp = tempdir().expect("tempdir");
    db::initialize_catalog_db(tmp.path()).expect("init");
    let db_path = db::catalog_db_path(tmp.path());

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let barrier = Arc::clone(&barrier);
            let db_path = db_path.clone();
            std::thread::spawn(move || {
                barrier.wait();
                for i in 0..25 {
                    pool::global_pool()
                        .with_write(&db_path, |conn| {
                            conn.execute(
                                "INSERT INTO meta(key, value) VALUES(?1, 'x')",
                                params![format!("k-{}-{}", t, i)],
                            )?;
                            Ok(())
                        })
                        .expect("serialized write");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("writer thread");
    }

    let n: i64 = pool::global_pool()
        .with_read(&db_path, |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM meta WHERE key LIKE 'k-%'",
                [],
                |r| r.get(0),
            )?)
        })
        .expect("count");
    assert_eq!(n, 100);
}

#[test]
fn retry_policy_retries_transient_then_succeeds() {
    let policy = RetryPolicy {
        max_attempts: 4,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    };
    let calls = Cell::new(0u32);
    let result = policy.run(|| {
        calls.set(calls.get() + 1);
        if calls.get() < 3 {
            Err(CatalogError::IoError(std::io::Error::other("disk hiccup")))
        } else {
            Ok(calls.get())
        }
    });
    assert_eq!(result.expect("third attempt succeeds"), 3);

    let calls = Cell::new(0u32);
    let exhausted = policy
        .run(|| -> Result<(), CatalogError> {
            calls.set(calls.get() + 1);
            Err(CatalogError::ValidationError("bad input".into()))
        })
        .unwrap_err();
    assert_eq!(calls.get(), 1);
    assert_eq!(exhausted.attempts, 1);
    assert_eq!(exhausted.error.class(), ErrorClass::Malformed);
}

#[test]
fn config_file_and_defaults_load_from_store_root() {
    let tmp = tempdir().expect("tempdir");
    let defaults = config::load_config(tmp.path()).expect("defaults");
    assert_eq!(defaults.query.max_depth, CatalogConfig::default().query.max_depth);

    fs::write(
        tmp.path().join(CONFIG_FILE_NAME),
        "[query]\ndefault_depth = 2\nmax_depth = 4\n\n[retention]\nmonths = 3\n",
    )
    .expect("write config");
    let loaded = config::load_config(tmp.path()).expect("load");
    assert_eq!(loaded.query.default_depth, 2);
    assert_eq!(loaded.query.max_depth, 4);
    assert_eq!(loaded.retention.months, Some(3));
    assert_eq!(loaded.ingest, CatalogConfig::default().ingest);

    fs::write(
        tmp.path().join(CONFIG_FILE_NAME),
        "[query]\ndefault_depth = 9\nmax_depth = 4\n",
    )
    .expect("write config");
    assert!(matches!(
        config::load_config(tmp.path()),
        Err(CatalogError::ConfigError(_))
    ));

    fs::write(tmp.path().join(CONFIG_FILE_NAME), "[query\n").expect("write config");
    assert!(matches!(
        config::load_config(tmp.path()),
        Err(CatalogError::ConfigError(_))
    ));
}

#[test]
fn store_layout_is_rooted() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().join("nested").join("store");
    let store = Store::open(&root).expect("open");
    assert!(root.is_dir());
    assert!(store.archive_dir().starts_with(&root));
    assert!(store.invalidations_path().starts_with(&root));
    assert!(store.dead_letter_fallback_path().starts_with(&root));
}

#[test]
fn timestamps_are_fixed_width_and_month_labels_sort() {
    let ts = time::now();
    let raw = time::to_db(&ts);
    assert_eq!(raw.len(), "2024-01-02T03:04:05.000000Z".len());
    assert!(raw.ends_with('Z'));
    assert_eq!(time::from_db(&raw).expect("parse"), ts);
    assert!(time::from_db("yesterday").is_err());

    let month = time::month_of(&ts);
    assert!(time::month_minus(&ts, 1) < month);
    assert_eq!(time::month_minus(&ts, 0), month);
}

#[test]
fn error_classes_distinguish_failures() {
    assert_eq!(
        CatalogError::NotFound("x".into()).class(),
        ErrorClass::NotFound
    );
    assert_eq!(
        CatalogError::SchemaConflict {
            entity_type: "customer".into(),
            reason: "r".into(),
            fields: vec![],
        }
        .class(),
        ErrorClass::Conflict
    );
    assert_eq!(
        CatalogError::QueryTimeout { elapsed_ms: 3 }.class(),
        ErrorClass::Transient
    );
    assert!(
        CatalogError::StorageUnavailable {
            attempts: 5,
            reason: "busy".into()
        }
        .is_transient()
    );
    assert!(!CatalogError::ConfigError("bad".into()).is_transient());
}
