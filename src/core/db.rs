use crate::core::error;
use crate::core::pool;
use crate::core::schemas;
use rusqlite::{Connection, params};
use std::fs;
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &str) -> Result<Connection, error::CatalogError> {
    db_connect_pooled(db_path, 5)
}

pub fn db_connect_pooled(
    db_path: &str,
    busy_timeout_secs: u32,
) -> Result<Connection, error::CatalogError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(busy_timeout_secs as u64))
        .map_err(error::CatalogError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::CatalogError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::CatalogError::RusqliteError)?;
    Ok(conn)
}

pub fn catalog_db_path(root: &Path) -> PathBuf {
    root.join(schemas::CATALOG_DB_NAME)
}

/// Apply the catalog DDL to an open connection. Idempotent.
pub fn ensure_schema(conn: &Connection) -> Result<(), error::CatalogError> {
    for ddl in schemas::CATALOG_DB_DDL {
        conn.execute_batch(ddl)?;
    }
    conn.execute(
        "INSERT OR IGNORE INTO meta(key, value) VALUES('schema_version', ?1)",
        params![schemas::CATALOG_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

pub fn initialize_catalog_db(root: &Path) -> Result<(), error::CatalogError> {
    fs::create_dir_all(root).map_err(error::CatalogError::IoError)?;
    let db_path = catalog_db_path(root);
    pool::global_pool().with_write(&db_path, ensure_schema)?;
    tracing::debug!(path = %db_path.display(), "catalog database initialized");
    Ok(())
}
