//! Store abstraction for the catalog's on-disk state.
//!
//! A store is a directory holding the catalog database, the optional
//! `meshcat.toml` config, the invalidation feed and archived event-log
//! months. Every subsystem resolves its files relative to the store root.

use crate::core::error::CatalogError;
use std::fs;
use std::path::{Path, PathBuf};

/// Store handle representing a catalog workspace.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory
    pub root: PathBuf,
}

impl Store {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, CatalogError> {
        fs::create_dir_all(root).map_err(CatalogError::IoError)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn invalidations_path(&self) -> PathBuf {
        self.root.join("invalidations.jsonl")
    }

    /// Fallback location for dead letters when the database itself is unavailable.
    pub fn dead_letter_fallback_path(&self) -> PathBuf {
        self.root.join("dead_letters.jsonl")
    }
}
