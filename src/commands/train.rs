use anyhow::Result;
use tracing::{info, warn};

use super::resolve_db_path;
use crate::cli::TrainArgs;
use crate::model::{FeedbackRecord, SnapshotManifest};
use crate::registry::ModelRegistry;
use crate::space::ParameterSpace;
use crate::store::{CacheLayout, insert_feedback, load_feedback, open_database};
use crate::util::{now_utc_string, read_jsonl, write_json_pretty};

const SNAPSHOT_MANIFEST_VERSION: u32 = 1;

pub fn run(args: TrainArgs) -> Result<()> {
    let layout = CacheLayout::new(&args.cache_root);
    let db_path = resolve_db_path(&args.cache_root, args.db_path.as_ref());
    let mut connection = open_database(&db_path)?;

    if let Some(path) = args.feedback_path.as_deref() {
        let records = read_jsonl::<FeedbackRecord>(path)?;
        let stats = insert_feedback(&mut connection, &records)?;
        info!(
            path = %path.display(),
            inserted = stats.inserted,
            duplicates = stats.duplicates,
            "stored experiment feedback"
        );
    }

    let feedback = load_feedback(&connection)?;
    if feedback.is_empty() {
        warn!(path = %db_path.display(), "no feedback stored; snapshot stays at cold start");
    }

    let space = ParameterSpace::builtin();
    let registry = ModelRegistry::new();
    let summary = registry.retrain(&space, &feedback);

    let manifest_path = args
        .manifest_path
        .unwrap_or_else(|| layout.manifest_dir().join("snapshot.json"));
    let manifest = SnapshotManifest {
        manifest_version: SNAPSHOT_MANIFEST_VERSION,
        generated_at: now_utc_string(),
        snapshot_version: summary.version,
        feedback_rows: feedback.len(),
        examples_per_system: summary.examples_per_system.clone(),
        reward_examples: summary.reward_examples,
    };
    write_json_pretty(&manifest_path, &manifest)?;

    info!(
        path = %manifest_path.display(),
        feedback_rows = feedback.len(),
        skipped = summary.skipped,
        reward_examples = summary.reward_examples,
        "wrote snapshot manifest"
    );
    Ok(())
}
