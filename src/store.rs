use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::util::ensure_directory;

mod batches;
mod feedback;
mod hints;
mod passages;
mod schema;

pub use batches::{
    FanoutBatchWriter, JsonBatchWriter, SqliteBatchStore, load_batch, recent_batches,
};
pub use feedback::{feedback_counts, insert_feedback, load_feedback};
pub use hints::{load_hints, save_hint};
pub use passages::{SqliteCitationRetriever, count_passages, upsert_passages};
pub use schema::get_metadata;

/// Paths derived from `--cache-root`.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("advisor.sqlite")
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn batch_dir(&self) -> PathBuf {
        self.root.join("batches")
    }
}

/// Opens (creating if needed) the advisor database with WAL and the current schema.
pub fn open_database(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        ensure_directory(parent)?;
    }
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open database: {}", db_path.display()))?;
    schema::configure_connection(&connection)?;
    schema::ensure_schema(&connection)?;
    Ok(connection)
}
