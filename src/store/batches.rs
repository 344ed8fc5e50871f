use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use rusqlite::{Connection, params};
use serde::Serialize;
use tracing::info;

use crate::external::BatchWriter;
use crate::model::{CandidateStatus, RankedBatch};
use crate::util::write_json_pretty;

fn status_label(status: CandidateStatus) -> &'static str {
    match status {
        CandidateStatus::Success => "success",
        CandidateStatus::PendingExpert => "pending_expert",
        CandidateStatus::Failed => "failed",
    }
}

pub fn insert_batch(connection: &mut Connection, batch: &RankedBatch) -> Result<()> {
    let batch_json = serde_json::to_string(batch)
        .with_context(|| format!("failed to serialize batch {}", batch.batch_id))?;
    let tx = connection
        .transaction()
        .context("failed to start batch transaction")?;

    let inserted = tx.execute(
        "
        INSERT INTO batches(batch_id, created_at, system, seed, snapshot_version, target_alpha, target_epsilon, ranked, failed, dropped, batch_json)
        VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(batch_id) DO NOTHING
        ",
        params![
            batch.batch_id,
            batch.created_at,
            batch.system,
            batch.seed as i64,
            batch.snapshot_version as i64,
            batch.target.alpha,
            batch.target.epsilon,
            batch.candidates.len() as i64,
            batch.failed.len() as i64,
            batch.diagnostics.dropped as i64,
            batch_json
        ],
    )
    .with_context(|| format!("failed to insert batch {}", batch.batch_id))?;
    if inserted != 1 {
        bail!(
            "batch {} already exists; stored batches are never overwritten",
            batch.batch_id
        );
    }

    {
        let mut statement = tx.prepare(
            "
            INSERT INTO batch_candidates(batch_id, candidate_id, rank, status, score, alpha, epsilon, confidence, reward, citation_count)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
        )?;
        for candidate in &batch.candidates {
            let scored = &candidate.scored;
            statement.execute(params![
                batch.batch_id,
                scored.candidate.candidate_id,
                candidate.rank as i64,
                status_label(candidate.status),
                candidate.score,
                scored.prediction.alpha,
                scored.prediction.epsilon,
                scored.prediction.confidence,
                scored.reward_score,
                candidate.citations.len() as i64
            ])?;
        }
        for failed in &batch.failed {
            let scored = &failed.scored;
            statement.execute(params![
                batch.batch_id,
                scored.candidate.candidate_id,
                Option::<i64>::None,
                status_label(failed.status),
                Option::<f64>::None,
                scored.prediction.alpha,
                scored.prediction.epsilon,
                scored.prediction.confidence,
                scored.reward_score,
                0_i64
            ])?;
        }
    }

    tx.commit()
        .with_context(|| format!("failed to commit batch {}", batch.batch_id))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchRow {
    pub batch_id: String,
    pub created_at: String,
    pub system: String,
    pub ranked: usize,
    pub failed: usize,
    pub dropped: usize,
}

/// Most recent batches first.
pub fn recent_batches(connection: &Connection, limit: usize) -> Result<Vec<BatchRow>> {
    let mut statement = connection.prepare(
        "
        SELECT batch_id, created_at, system, ranked, failed, dropped
        FROM batches
        ORDER BY created_at DESC, batch_id DESC
        LIMIT ?1
        ",
    )?;
    let rows = statement
        .query_map([limit as i64], |row| {
            Ok(BatchRow {
                batch_id: row.get(0)?,
                created_at: row.get(1)?,
                system: row.get(2)?,
                ranked: row.get::<_, i64>(3)?.max(0) as usize,
                failed: row.get::<_, i64>(4)?.max(0) as usize,
                dropped: row.get::<_, i64>(5)?.max(0) as usize,
            })
        })?
        .collect::<rusqlite::Result<Vec<BatchRow>>>()
        .context("failed to list batches")?;
    Ok(rows)
}

pub fn load_batch(connection: &Connection, batch_id: &str) -> Result<Option<RankedBatch>> {
    let mut statement = connection.prepare("SELECT batch_json FROM batches WHERE batch_id = ?1")?;
    let mut rows = statement.query([batch_id])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let raw: String = row.get(0)?;
    let batch = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse stored batch {batch_id}"))?;
    Ok(Some(batch))
}

/// Batch writer backed by one SQLite connection.
pub struct SqliteBatchStore {
    connection: Mutex<Connection>,
}

impl SqliteBatchStore {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection: Mutex::new(connection),
        }
    }

    pub fn with_connection<T>(
        &self,
        operation: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self
            .connection
            .lock()
            .map_err(|_| anyhow!("batch store connection lock poisoned"))?;
        operation(&mut guard)
    }
}

#[async_trait]
impl BatchWriter for SqliteBatchStore {
    async fn write(&self, batch: &RankedBatch) -> Result<()> {
        self.with_connection(|connection| insert_batch(connection, batch))?;
        info!(batch_id = %batch.batch_id, "stored batch in sqlite");
        Ok(())
    }
}

/// Writes `<dir>/<batch_id>.json`.
pub struct JsonBatchWriter {
    dir: PathBuf,
}

impl JsonBatchWriter {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path_for(&self, batch_id: &str) -> PathBuf {
        self.dir.join(format!("{batch_id}.json"))
    }
}

#[async_trait]
impl BatchWriter for JsonBatchWriter {
    async fn write(&self, batch: &RankedBatch) -> Result<()> {
        let path = self.path_for(&batch.batch_id);
        if path.exists() {
            bail!("batch file {} already exists", path.display());
        }
        write_json_pretty(&path, batch)?;
        info!(path = %path.display(), "wrote batch json");
        Ok(())
    }
}

/// Hands each batch to every writer in order and stops at the first failure.
pub struct FanoutBatchWriter {
    writers: Vec<Arc<dyn BatchWriter>>,
}

impl FanoutBatchWriter {
    pub fn new(writers: Vec<Arc<dyn BatchWriter>>) -> Self {
        Self { writers }
    }
}

#[async_trait]
impl BatchWriter for FanoutBatchWriter {
    async fn write(&self, batch: &RankedBatch) -> Result<()> {
        for writer in &self.writers {
            writer.write(batch).await?;
        }
        Ok(())
    }
}
