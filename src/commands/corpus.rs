use anyhow::{Result, bail};
use tracing::info;

use super::resolve_db_path;
use crate::cli::CorpusArgs;
use crate::model::{CorpusManifest, PassageRecord};
use crate::store::{CacheLayout, count_passages, open_database, upsert_passages};
use crate::util::{now_utc_string, read_jsonl, write_json_pretty};

const CORPUS_MANIFEST_VERSION: u32 = 1;

pub fn run(args: CorpusArgs) -> Result<()> {
    if args.dimensions == 0 {
        bail!("--dimensions must be greater than zero");
    }

    let layout = CacheLayout::new(&args.cache_root);
    let db_path = resolve_db_path(&args.cache_root, args.db_path.as_ref());
    let records = read_jsonl::<PassageRecord>(&args.passages_path)?;
    info!(
        path = %args.passages_path.display(),
        records = records.len(),
        "read literature passages"
    );

    let mut connection = open_database(&db_path)?;
    let stats = upsert_passages(&mut connection, &records, &args.model_id, args.dimensions)?;
    let total = count_passages(&connection)?;
    info!(
        loaded = stats.loaded,
        skipped_empty = stats.skipped_empty,
        embeddings_written = stats.embeddings_written,
        total,
        model_id = %args.model_id,
        "corpus updated"
    );

    let manifest_path = layout.manifest_dir().join("corpus.json");
    let manifest = CorpusManifest {
        manifest_version: CORPUS_MANIFEST_VERSION,
        generated_at: now_utc_string(),
        source_path: args.passages_path.display().to_string(),
        model_id: args.model_id.clone(),
        passages_loaded: stats.loaded,
        passages_total: total,
    };
    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), "wrote corpus manifest");

    Ok(())
}
