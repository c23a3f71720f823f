use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

use crate::store::SqliteRunStore;

pub mod analyze;
pub mod delete;
pub mod results;
pub mod status;

const DB_FILE_NAME: &str = "bookdigest.sqlite";

pub(crate) fn resolve_db_path(cache_root: &Path, db_path: Option<&PathBuf>) -> PathBuf {
    db_path
        .cloned()
        .unwrap_or_else(|| cache_root.join(DB_FILE_NAME))
}

pub(crate) fn manifest_dir(cache_root: &Path) -> PathBuf {
    cache_root.join("manifests")
}

pub(crate) fn progress_dir(cache_root: &Path) -> PathBuf {
    manifest_dir(cache_root).join("progress")
}

/// Opens an existing database; read-side commands never create one.
pub(crate) fn open_existing_store(db_path: &Path) -> Result<SqliteRunStore> {
    if !db_path.exists() {
        bail!("database file missing: {}", db_path.display());
    }
    SqliteRunStore::open(db_path)
}
