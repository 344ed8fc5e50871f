use std::path::{Path, PathBuf};

use crate::store::CacheLayout;

pub mod corpus;
pub mod recommend;
pub mod space;
pub mod status;
pub mod train;

/// `--db-path` when given, otherwise the database under the cache root.
fn resolve_db_path(cache_root: &Path, db_path: Option<&PathBuf>) -> PathBuf {
    db_path
        .cloned()
        .unwrap_or_else(|| CacheLayout::new(cache_root).db_path())
}
