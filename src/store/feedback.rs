use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::model::{FeedbackRecord, Recipe};
use crate::util::{now_utc_string, sha256_hex};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedbackInsertStats {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Stores feedback rows. A row identical to one already stored is skipped,
/// so re-loading the same file is harmless.
pub fn insert_feedback(
    connection: &mut Connection,
    records: &[FeedbackRecord],
) -> Result<FeedbackInsertStats> {
    let tx = connection
        .transaction()
        .context("failed to start feedback transaction")?;
    let now = now_utc_string();
    let mut stats = FeedbackInsertStats::default();

    {
        let mut statement = tx.prepare(
            "
            INSERT INTO feedback(record_hash, system, recipe_json, measured_alpha, measured_epsilon, quality, recorded_at)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(record_hash) DO NOTHING
            ",
        )?;

        for record in records {
            let record_json =
                serde_json::to_string(record).context("failed to serialize feedback record")?;
            let recipe_json =
                serde_json::to_string(&record.recipe).context("failed to serialize recipe")?;
            let changed = statement
                .execute(params![
                    sha256_hex(record_json.as_bytes()),
                    record.system.trim().to_ascii_lowercase(),
                    recipe_json,
                    record.measured_alpha,
                    record.measured_epsilon,
                    record.quality,
                    now
                ])
                .with_context(|| format!("failed to insert feedback for {}", record.system))?;
            if changed == 0 {
                stats.duplicates += 1;
            } else {
                stats.inserted += 1;
            }
        }
    }

    tx.commit().context("failed to commit feedback")?;
    Ok(stats)
}

/// Every stored row in insertion order, so retraining is reproducible.
pub fn load_feedback(connection: &Connection) -> Result<Vec<FeedbackRecord>> {
    let mut statement = connection.prepare(
        "
        SELECT system, recipe_json, measured_alpha, measured_epsilon, quality
        FROM feedback
        ORDER BY feedback_id ASC
        ",
    )?;
    let mut rows = statement.query([])?;
    let mut out = Vec::<FeedbackRecord>::new();

    while let Some(row) = rows.next()? {
        let recipe_json: String = row.get(1)?;
        let recipe: Recipe = serde_json::from_str(&recipe_json)
            .with_context(|| format!("failed to parse stored recipe: {recipe_json}"))?;
        out.push(FeedbackRecord {
            system: row.get(0)?,
            recipe,
            measured_alpha: row.get(2)?,
            measured_epsilon: row.get(3)?,
            quality: row.get(4)?,
        });
    }

    Ok(out)
}

pub fn feedback_counts(connection: &Connection) -> Result<BTreeMap<String, usize>> {
    let mut statement = connection
        .prepare("SELECT system, COUNT(*) FROM feedback GROUP BY system ORDER BY system ASC")?;
    let counts = statement
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .map(|row| row.map(|(system, count)| (system, count.max(0) as usize)))
        .collect::<rusqlite::Result<BTreeMap<String, usize>>>()
        .context("failed to count feedback rows")?;
    Ok(counts)
}
