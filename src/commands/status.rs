use std::io::{BufWriter, Write};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OpenFlags};
use tracing::{info, warn};

use super::resolve_db_path;
use crate::cli::StatusArgs;
use crate::model::{CorpusManifest, SnapshotManifest};
use crate::store::{
    CacheLayout, count_passages, feedback_counts, get_metadata, load_batch, recent_batches,
};
use crate::util::read_json;

pub fn run(args: StatusArgs) -> Result<()> {
    let layout = CacheLayout::new(&args.cache_root);
    let manifest_dir = layout.manifest_dir();
    let corpus_path = manifest_dir.join("corpus.json");
    let snapshot_path = manifest_dir.join("snapshot.json");
    let db_path = resolve_db_path(&args.cache_root, args.db_path.as_ref());

    info!(cache_root = %args.cache_root.display(), "status requested");

    if corpus_path.exists() {
        let manifest: CorpusManifest = read_json(&corpus_path)?;
        info!(
            generated_at = %manifest.generated_at,
            source_path = %manifest.source_path,
            model_id = %manifest.model_id,
            passages_total = manifest.passages_total,
            "loaded corpus manifest"
        );
    } else {
        warn!(path = %corpus_path.display(), "corpus manifest missing");
    }

    if snapshot_path.exists() {
        let manifest: SnapshotManifest = read_json(&snapshot_path)?;
        info!(
            generated_at = %manifest.generated_at,
            snapshot_version = manifest.snapshot_version,
            feedback_rows = manifest.feedback_rows,
            reward_examples = manifest.reward_examples,
            "loaded snapshot manifest"
        );
    } else {
        warn!(path = %snapshot_path.display(), "snapshot manifest missing");
    }

    if !db_path.exists() {
        warn!(path = %db_path.display(), "database file missing");
        return Ok(());
    }

    let connection = Connection::open_with_flags(&db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("failed to open {}", db_path.display()))?;

    if let Some(batch_id) = args.batch_id.as_deref() {
        let Some(batch) = load_batch(&connection, batch_id)? else {
            bail!("batch {batch_id} not found in {}", db_path.display());
        };
        let stdout = std::io::stdout();
        let mut out = BufWriter::new(stdout.lock());
        serde_json::to_writer_pretty(&mut out, &batch).context("failed to write batch")?;
        writeln!(out).context("failed to write batch")?;
        out.flush().context("failed to flush stdout")?;
        return Ok(());
    }

    let schema_version = get_metadata(&connection, "db_schema_version")?.unwrap_or_default();
    let updated_at = get_metadata(&connection, "db_updated_at")?.unwrap_or_default();
    let passages = count_passages(&connection)?;
    info!(
        path = %db_path.display(),
        schema_version = %schema_version,
        updated_at = %updated_at,
        passages,
        "database status"
    );

    let feedback = feedback_counts(&connection)?;
    if feedback.is_empty() {
        info!("no experiment feedback stored");
    }
    for (system, rows) in &feedback {
        info!(system = %system, rows, "feedback rows");
    }

    for batch in recent_batches(&connection, args.recent)? {
        info!(
            batch_id = %batch.batch_id,
            created_at = %batch.created_at,
            system = %batch.system,
            ranked = batch.ranked,
            failed = batch.failed,
            dropped = batch.dropped,
            "stored batch"
        );
    }

    Ok(())
}
