use std::io::{BufWriter, Write};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use super::resolve_db_path;
use crate::clarify::RuleClassifier;
use crate::cli::{OutputMode, RecommendArgs};
use crate::error::AdvisorError;
use crate::external::{BatchWriter, CitationRetriever};
use crate::model::{BoundsOverride, TargetSpec};
use crate::orchestrator::{Orchestrator, OrchestratorConfig, RecommendOutcome};
use crate::predictor::BaselinePredictor;
use crate::ranker::RankerWeights;
use crate::registry::ModelRegistry;
use crate::space::ParameterSpace;
use crate::store::{
    CacheLayout, FanoutBatchWriter, JsonBatchWriter, SqliteBatchStore, SqliteCitationRetriever,
    load_feedback, load_hints, open_database, save_hint,
};
use crate::util::{load_json_config, read_json};

pub fn run(args: RecommendArgs) -> Result<()> {
    let request = build_request(&args)?;
    let config = build_config(&args)?;
    let layout = CacheLayout::new(&args.cache_root);
    let db_path = resolve_db_path(&args.cache_root, args.db_path.as_ref());
    let connection = open_database(&db_path)?;

    let space = Arc::new(ParameterSpace::builtin());
    let registry = Arc::new(ModelRegistry::new());
    let feedback = load_feedback(&connection)?;
    if !feedback.is_empty() {
        registry.retrain(&space, &feedback);
    }
    for hint in load_hints(&connection)? {
        registry.publish_hint(hint);
    }

    let index = SqliteCitationRetriever::load(&connection, &args.model_id, args.dimensions)?;
    if index.is_empty() {
        warn!(
            model_id = %args.model_id,
            "citation corpus is empty; run `corpus` first for supported recommendations"
        );
    }
    let retriever: Arc<dyn CitationRetriever> = Arc::new(index);
    let predictor = Arc::new(BaselinePredictor::new(Arc::clone(&retriever)));
    let classifier = Arc::new(RuleClassifier::new()?);
    let store = Arc::new(SqliteBatchStore::new(connection));

    let mut orchestrator = Orchestrator::new(
        Arc::clone(&space),
        Arc::clone(&registry),
        predictor,
        retriever,
        classifier,
    )
    .with_config(config);
    if !args.no_persist {
        let writers: Vec<Arc<dyn BatchWriter>> = vec![
            Arc::clone(&store) as Arc<dyn BatchWriter>,
            Arc::new(JsonBatchWriter::new(layout.batch_dir())),
        ];
        orchestrator = orchestrator.with_writer(Arc::new(FanoutBatchWriter::new(writers)));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let outcome = runtime
        .block_on(orchestrator.recommend_or_ask(&request))
        .map_err(|err| {
            if let AdvisorError::NoViableCandidates { diagnostics, .. } = &err {
                for dropped in &diagnostics.dropped_candidates {
                    warn!(
                        candidate_id = %dropped.candidate_id,
                        stage = ?dropped.stage,
                        attempts = dropped.attempts,
                        reason = %dropped.reason,
                        "candidate dropped"
                    );
                }
            }
            anyhow::Error::from(err)
        })?;

    match &outcome {
        RecommendOutcome::Ranked(batch) => {
            let hint = registry.snapshot().hint_for(&batch.system).cloned();
            if let (false, Some(hint)) = (args.no_persist, hint) {
                store.with_connection(|connection| save_hint(connection, &hint))?;
            }
            info!(
                batch_id = %batch.batch_id,
                ranked = batch.candidates.len(),
                failed = batch.failed.len(),
                unresolved = batch.unresolved.len(),
                "recommendation complete"
            );
        }
        RecommendOutcome::NeedsClarification(response) => {
            info!(
                status = ?response.status,
                questions = response.questions.len(),
                "clarification required"
            );
        }
    }

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    match args.output {
        OutputMode::Pretty => serde_json::to_writer_pretty(&mut out, &outcome),
        OutputMode::Compact => serde_json::to_writer(&mut out, &outcome),
    }
    .context("failed to write recommendation output")?;
    writeln!(out).context("failed to write recommendation output")?;
    out.flush().context("failed to flush stdout")?;
    Ok(())
}

/// Starts from `--request-path` (or an empty request) and layers the flags on top.
fn build_request(args: &RecommendArgs) -> Result<TargetSpec> {
    let mut request = match args.request_path.as_deref() {
        Some(path) => read_json::<TargetSpec>(path)?,
        None => TargetSpec::default(),
    };

    if let Some(system) = &args.system {
        request.system = Some(system.clone());
    }
    if let Some(alpha) = args.target_alpha {
        request.target_alpha = Some(alpha);
    }
    if let Some(epsilon) = args.target_epsilon {
        request.target_epsilon = Some(epsilon);
    }
    if let Some(n) = args.n {
        request.n = n;
    }
    if let Some(seed) = args.seed {
        request.seed = seed;
    }
    if let Some(notes) = &args.notes {
        request.notes = Some(notes.clone());
    }
    if args.best_effort {
        request.best_effort = true;
    }
    for raw in &args.answers {
        let (slot, answer) = parse_answer(raw)?;
        request.answers.entry(slot).or_default().push(answer);
    }
    if let Some(path) = args.bounds_path.as_deref() {
        request.bounds_override = Some(read_json::<BoundsOverride>(path)?);
    }

    Ok(request)
}

fn build_config(args: &RecommendArgs) -> Result<OrchestratorConfig> {
    let mut config = OrchestratorConfig {
        weights: load_json_config::<RankerWeights>(args.weights_path.as_deref())?,
        ..OrchestratorConfig::default()
    };
    if let Some(timeout_ms) = args.timeout_ms {
        config.policy.timeout_ms = timeout_ms;
    }
    if let Some(max_retries) = args.max_retries {
        config.policy.max_retries = max_retries;
    }
    if let Some(concurrency) = args.concurrency {
        if concurrency == 0 {
            bail!("--concurrency must be at least 1");
        }
        config.concurrency = concurrency;
    }
    if let Some(top_k) = args.top_k {
        config.citation_top_k = top_k;
    }
    Ok(config)
}

fn parse_answer(raw: &str) -> Result<(String, String)> {
    let Some((slot, answer)) = raw.split_once('=') else {
        bail!("--answer expects slot_id=answer, got '{raw}'");
    };
    let slot = slot.trim();
    if slot.is_empty() {
        bail!("--answer is missing a slot id: '{raw}'");
    }
    Ok((slot.to_string(), answer.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{build_config, build_request, parse_answer};
    use crate::cli::{Cli, Commands, RecommendArgs};

    fn recommend_args(flags: &[&str]) -> RecommendArgs {
        let argv = ["mao-advisor", "recommend"]
            .into_iter()
            .chain(flags.iter().copied());
        match Cli::try_parse_from(argv).expect("flags parse").command {
            Commands::Recommend(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parse_answer_splits_on_first_equals() {
        assert_eq!(
            parse_answer("thickness_limit_um = 10-30 um").expect("valid answer"),
            ("thickness_limit_um".to_string(), "10-30 um".to_string())
        );
        assert_eq!(
            parse_answer("performance_priority=a=b").expect("valid answer").1,
            "a=b"
        );
        assert!(parse_answer("no separator").is_err());
        assert!(parse_answer("=AZ91").is_err());
    }

    #[test]
    fn repeated_answers_become_follow_up_attempts() {
        let args = recommend_args(&[
            "--system",
            "silicate",
            "--target-alpha",
            "0.2",
            "--answer",
            "substrate_alloy=something",
            "--answer",
            "substrate_alloy=AZ91",
            "--best-effort",
        ]);
        let request = build_request(&args).expect("request builds");

        assert_eq!(request.system.as_deref(), Some("silicate"));
        assert_eq!(request.target_alpha, Some(0.2));
        assert_eq!(request.target_epsilon, None);
        assert_eq!(request.n, 6, "default candidate count applies");
        assert!(request.best_effort);
        assert_eq!(
            request.answers.get("substrate_alloy"),
            Some(&vec!["something".to_string(), "AZ91".to_string()])
        );
    }

    #[test]
    fn config_flags_override_call_policy() {
        let args = recommend_args(&["--timeout-ms", "250", "--max-retries", "3", "--top-k", "5"]);
        let config = build_config(&args).expect("config builds");
        assert_eq!(config.policy.timeout_ms, 250);
        assert_eq!(config.policy.max_retries, 3);
        assert_eq!(config.citation_top_k, 5);
        assert_eq!(config.concurrency, 4);

        let zero = recommend_args(&["--concurrency", "0"]);
        assert!(build_config(&zero).is_err());
    }
}
