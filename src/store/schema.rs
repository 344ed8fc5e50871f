use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::util::now_utc_string;

pub const DB_SCHEMA_VERSION: &str = "1";

pub(super) fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys")?;
    Ok(())
}

pub fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS passages (
              passage_id TEXT PRIMARY KEY,
              source_id TEXT NOT NULL,
              page INTEGER NOT NULL,
              text TEXT NOT NULL,
              text_hash TEXT NOT NULL,
              loaded_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS passage_embeddings (
              passage_id TEXT NOT NULL,
              model_id TEXT NOT NULL,
              embedding BLOB NOT NULL,
              embedding_dim INTEGER NOT NULL,
              text_hash TEXT NOT NULL,
              generated_at TEXT NOT NULL,
              PRIMARY KEY (passage_id, model_id),
              FOREIGN KEY (passage_id) REFERENCES passages(passage_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS feedback (
              feedback_id INTEGER PRIMARY KEY AUTOINCREMENT,
              record_hash TEXT NOT NULL UNIQUE,
              system TEXT NOT NULL,
              recipe_json TEXT NOT NULL,
              measured_alpha REAL NOT NULL,
              measured_epsilon REAL NOT NULL,
              quality REAL,
              recorded_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS batches (
              batch_id TEXT PRIMARY KEY,
              created_at TEXT NOT NULL,
              system TEXT NOT NULL,
              seed INTEGER NOT NULL,
              snapshot_version INTEGER NOT NULL,
              target_alpha REAL NOT NULL,
              target_epsilon REAL NOT NULL,
              ranked INTEGER NOT NULL,
              failed INTEGER NOT NULL,
              dropped INTEGER NOT NULL,
              batch_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS batch_candidates (
              batch_id TEXT NOT NULL,
              candidate_id TEXT NOT NULL,
              rank INTEGER,
              status TEXT NOT NULL,
              score REAL,
              alpha REAL NOT NULL,
              epsilon REAL NOT NULL,
              confidence REAL NOT NULL,
              reward REAL NOT NULL,
              citation_count INTEGER NOT NULL,
              PRIMARY KEY (batch_id, candidate_id),
              FOREIGN KEY (batch_id) REFERENCES batches(batch_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_passage_embeddings_model ON passage_embeddings(model_id);
            CREATE INDEX IF NOT EXISTS idx_feedback_system ON feedback(system);
            CREATE INDEX IF NOT EXISTS idx_batches_system_created ON batches(system, created_at);
            ",
        )
        .context("failed to create advisor schema")?;

    set_metadata(connection, "db_schema_version", DB_SCHEMA_VERSION)?;
    set_metadata(connection, "db_updated_at", &now_utc_string())?;
    Ok(())
}

pub fn set_metadata(connection: &Connection, key: &str, value: &str) -> Result<()> {
    connection
        .execute(
            "INSERT INTO metadata(key, value) VALUES(?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
        .with_context(|| format!("failed to write metadata key {key}"))?;
    Ok(())
}

pub fn get_metadata(connection: &Connection, key: &str) -> Result<Option<String>> {
    connection
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [key],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .with_context(|| format!("failed to read metadata key {key}"))
}

/// Metadata rows whose key starts with `prefix`, ordered by key.
pub fn metadata_with_prefix(
    connection: &Connection,
    prefix: &str,
) -> Result<Vec<(String, String)>> {
    let mut statement = connection.prepare(
        "SELECT key, value FROM metadata WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key ASC",
    )?;
    let rows = statement
        .query_map([prefix], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<(String, String)>>>()
        .with_context(|| format!("failed to read metadata with prefix {prefix}"))?;
    Ok(rows)
}
