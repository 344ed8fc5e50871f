use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::{Notify, watch};

use super::*;
use crate::clarify::RuleClassifier;
use crate::external::{ExternalError, RawPrediction};
use crate::model::{
    BoundsOverride, CandidateStatus, Citation, ClarificationStatus, DropStage, FeedbackRecord,
    NumericParam, Recipe,
};
use crate::predictor::heuristic_properties;

struct FakePredictor {
    calls: AtomicU32,
    failure: Option<ExternalError>,
}

impl FakePredictor {
    fn healthy() -> Self {
        Self {
            calls: AtomicU32::new(0),
            failure: None,
        }
    }

    fn failing(error: ExternalError) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failure: Some(error),
        }
    }
}

#[async_trait]
impl ForwardPredictor for FakePredictor {
    async fn predict(
        &self,
        _recipe_text: &str,
        recipe: &Recipe,
    ) -> Result<RawPrediction, ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let (alpha, epsilon) = heuristic_properties(recipe);
        Ok(RawPrediction {
            alpha,
            epsilon,
            confidence: 0.7,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum PredictorFault {
    Permanent,
    NotANumber,
}

/// Heuristic predictions, except on the listed call ordinals.
struct ScriptedPredictor {
    calls: AtomicU32,
    faults: BTreeMap<u32, PredictorFault>,
}

impl ScriptedPredictor {
    fn new(faults: impl IntoIterator<Item = (u32, PredictorFault)>) -> Self {
        Self {
            calls: AtomicU32::new(0),
            faults: faults.into_iter().collect(),
        }
    }
}

#[async_trait]
impl ForwardPredictor for ScriptedPredictor {
    async fn predict(
        &self,
        _recipe_text: &str,
        recipe: &Recipe,
    ) -> Result<RawPrediction, ExternalError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let (alpha, epsilon) = heuristic_properties(recipe);
        match self.faults.get(&call) {
            Some(PredictorFault::Permanent) => Err(ExternalError::Permanent(format!(
                "recipe rejected on call {call}"
            ))),
            Some(PredictorFault::NotANumber) => Ok(RawPrediction {
                alpha: f64::NAN,
                epsilon,
                confidence: 0.6,
            }),
            None => Ok(RawPrediction {
                alpha,
                epsilon,
                confidence: 0.7,
            }),
        }
    }
}

/// Blocks every prediction until the gate opens and signals when the first
/// call has started.
struct GatedPredictor {
    started: Notify,
    gate: watch::Receiver<bool>,
}

#[async_trait]
impl ForwardPredictor for GatedPredictor {
    async fn predict(
        &self,
        _recipe_text: &str,
        recipe: &Recipe,
    ) -> Result<RawPrediction, ExternalError> {
        self.started.notify_one();
        let mut gate = self.gate.clone();
        gate.wait_for(|open| *open)
            .await
            .map_err(|err| ExternalError::Permanent(err.to_string()))?;
        let (alpha, epsilon) = heuristic_properties(recipe);
        Ok(RawPrediction {
            alpha,
            epsilon,
            confidence: 0.5,
        })
    }
}

struct FakeRetriever {
    hits: Vec<Citation>,
}

impl FakeRetriever {
    fn with_corpus() -> Self {
        Self {
            hits: vec![
                Citation {
                    source_id: "mao-silicate-review".to_string(),
                    page: 4,
                    similarity_score: 0.62,
                    excerpt: "Silicate electrolytes yield low absorptance layers.".to_string(),
                },
                Citation {
                    source_id: "bipolar-pulse-study".to_string(),
                    page: 11,
                    similarity_score: 0.48,
                    excerpt: "Bipolar pulses improve layer uniformity.".to_string(),
                },
            ],
        }
    }

    fn empty() -> Self {
        Self { hits: Vec::new() }
    }
}

#[async_trait]
impl CitationRetriever for FakeRetriever {
    async fn search(&self, _query: &str, top_k: usize) -> Result<Vec<Citation>, ExternalError> {
        Ok(self.hits.iter().take(top_k).cloned().collect())
    }
}

/// Fails the very first search transiently, then behaves like `inner`.
struct FlakyRetriever {
    calls: AtomicU32,
    inner: FakeRetriever,
}

#[async_trait]
impl CitationRetriever for FlakyRetriever {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Citation>, ExternalError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ExternalError::Transient("index warming up".to_string()));
        }
        self.inner.search(query, top_k).await
    }
}

/// Always fails for the first query it sees; answers every other query.
struct StubbornRetriever {
    doomed: Mutex<Option<String>>,
    inner: FakeRetriever,
}

#[async_trait]
impl CitationRetriever for StubbornRetriever {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Citation>, ExternalError> {
        let doomed = {
            let mut doomed = self
                .doomed
                .lock()
                .map_err(|_| ExternalError::Permanent("lock poisoned".to_string()))?;
            doomed.get_or_insert_with(|| query.to_string()).as_str() == query
        };
        if doomed {
            return Err(ExternalError::Transient(format!("no shard for '{query}'")));
        }
        self.inner.search(query, top_k).await
    }
}

struct RejectingWriter;

#[async_trait]
impl BatchWriter for RejectingWriter {
    async fn write(&self, batch: &RankedBatch) -> anyhow::Result<()> {
        anyhow::bail!("batch {} already exists", batch.batch_id)
    }
}

#[derive(Default)]
struct RecordingWriter {
    batch_ids: Mutex<Vec<String>>,
}

#[async_trait]
impl BatchWriter for RecordingWriter {
    async fn write(&self, batch: &RankedBatch) -> anyhow::Result<()> {
        self.batch_ids
            .lock()
            .map_err(|_| anyhow::anyhow!("writer lock poisoned"))?
            .push(batch.batch_id.clone());
        Ok(())
    }
}

fn orchestrator(
    registry: Arc<ModelRegistry>,
    predictor: Arc<dyn ForwardPredictor>,
    retriever: Arc<dyn CitationRetriever>,
) -> Orchestrator {
    let classifier = RuleClassifier::new().expect("classifier regexes compile");
    Orchestrator::new(
        Arc::new(ParameterSpace::builtin()),
        registry,
        predictor,
        retriever,
        Arc::new(classifier),
    )
}

fn answered_request(system: &str, n: usize, seed: u64) -> TargetSpec {
    let answers = [
        ("substrate_alloy", "AZ91"),
        ("fluoride_additives", "yes"),
        ("thickness_limit_um", "1-60 um"),
        ("performance_priority", "balanced"),
    ]
    .into_iter()
    .map(|(slot, answer)| (slot.to_string(), vec![answer.to_string()]))
    .collect::<BTreeMap<String, Vec<String>>>();

    TargetSpec {
        system: Some(system.to_string()),
        target_alpha: Some(0.20),
        target_epsilon: Some(0.80),
        n,
        seed,
        answers,
        ..TargetSpec::default()
    }
}

fn expect_batch(outcome: RecommendOutcome) -> RankedBatch {
    match outcome {
        RecommendOutcome::Ranked(batch) => *batch,
        RecommendOutcome::NeedsClarification(response) => {
            panic!("expected a ranked batch, got questions: {response:?}")
        }
    }
}

fn expect_questions(outcome: RecommendOutcome) -> ClarificationResponse {
    match outcome {
        RecommendOutcome::NeedsClarification(response) => response,
        RecommendOutcome::Ranked(batch) => {
            panic!("expected clarification, got batch {}", batch.batch_id)
        }
    }
}

#[tokio::test]
async fn silicate_request_yields_full_batch() {
    let writer = Arc::new(RecordingWriter::default());
    let engine = orchestrator(
        Arc::new(ModelRegistry::new()),
        Arc::new(FakePredictor::healthy()),
        Arc::new(FakeRetriever::with_corpus()),
    )
    .with_writer(writer.clone());

    let batch = expect_batch(
        engine
            .recommend_or_ask(&answered_request("silicate", 6, 123))
            .await
            .expect("recommendation succeeds"),
    );

    assert_eq!(batch.system, "silicate");
    assert_eq!(batch.diagnostics.generated, 6);
    assert_eq!(batch.diagnostics.dropped, 0);
    assert_eq!(batch.candidates.len() + batch.failed.len(), 6);
    assert!(!batch.candidates.is_empty(), "templates always pass");
    assert!(batch.batch_id.starts_with("batch_"));
    batch.validate().expect("batch is internally consistent");

    let space = ParameterSpace::builtin();
    let silicate = space.lookup("silicate").expect("registered");
    let voltage = silicate.bounds(NumericParam::VoltageV);
    assert_eq!((voltage.min, voltage.max), (200.0, 520.0));
    for candidate in &batch.candidates {
        let recipe = &candidate.scored.candidate.recipe;
        silicate
            .contains(recipe)
            .expect("ranked candidate within silicate bounds");
        assert!(candidate.status != CandidateStatus::Failed);
        assert!((0.0..=1.0).contains(&candidate.scored.prediction.confidence));
        assert!((0.0..=1.0).contains(&candidate.scored.reward_score));
        assert!(candidate.scored.constraints_passed || candidate.scored.is_pending_expert());
    }
    for failed in &batch.failed {
        assert_eq!(failed.status, CandidateStatus::Failed);
        assert!(!failed.scored.violations.is_empty());
    }
    assert!(
        batch
            .candidates
            .iter()
            .any(|candidate| !candidate.citations.is_empty())
    );
    assert_eq!(batch.summary.total, 6);
    assert_eq!(
        writer.batch_ids.lock().expect("writer lock").as_slice(),
        &[batch.batch_id.clone()]
    );
}

#[tokio::test]
async fn missing_system_fails_before_generation() {
    let predictor = Arc::new(FakePredictor::healthy());
    let engine = orchestrator(
        Arc::new(ModelRegistry::new()),
        predictor.clone(),
        Arc::new(FakeRetriever::with_corpus()),
    );
    let mut request = answered_request("silicate", 6, 1);
    request.system = None;

    let err = engine
        .recommend_or_ask(&request)
        .await
        .expect_err("missing system is rejected");
    assert!(matches!(err, AdvisorError::InvalidRequest { .. }), "{err}");
    assert_eq!(predictor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unknown_system_is_reported_with_registered_ids() {
    let engine = orchestrator(
        Arc::new(ModelRegistry::new()),
        Arc::new(FakePredictor::healthy()),
        Arc::new(FakeRetriever::empty()),
    );
    let err = engine
        .recommend_or_ask(&answered_request("phosphate", 6, 1))
        .await
        .expect_err("unknown system");
    match err {
        AdvisorError::UnknownSystem { registered, .. } => {
            assert!(registered.contains("silicate"));
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn incomplete_request_returns_questions_without_scoring() {
    let predictor = Arc::new(FakePredictor::healthy());
    let engine = orchestrator(
        Arc::new(ModelRegistry::new()),
        predictor.clone(),
        Arc::new(FakeRetriever::with_corpus()),
    );
    let request = TargetSpec {
        system: Some("zirconate".to_string()),
        target_alpha: Some(0.15),
        target_epsilon: Some(0.85),
        ..TargetSpec::default()
    };

    let response = expect_questions(
        engine
            .recommend_or_ask(&request)
            .await
            .expect("clarification is not an error"),
    );
    assert_eq!(response.status, ClarificationStatus::NeedsMoreInfo);
    assert_eq!(response.system, "zirconate");
    assert_eq!(response.questions.len(), 4);
    assert_eq!(predictor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn repeated_ambiguity_escalates_unless_best_effort() {
    let engine = orchestrator(
        Arc::new(ModelRegistry::new()),
        Arc::new(FakePredictor::healthy()),
        Arc::new(FakeRetriever::with_corpus()),
    );
    let mut request = answered_request("silicate", 4, 9);
    request.answers.insert(
        "thickness_limit_um".to_string(),
        vec!["reasonable".to_string(), "depends on the part".to_string()],
    );

    let response = expect_questions(
        engine
            .recommend_or_ask(&request)
            .await
            .expect("escalation is not an error"),
    );
    assert_eq!(response.status, ClarificationStatus::PendingExpert);
    assert!(response.need_expert);
    assert_eq!(response.questions[0].slot_id, "thickness_limit_um");
    assert_eq!(response.unresolved.len(), 1);

    request.best_effort = true;
    let batch = expect_batch(
        engine
            .recommend_or_ask(&request)
            .await
            .expect("best effort proceeds"),
    );
    assert_eq!(batch.unresolved.len(), 1);
    assert_eq!(batch.unresolved[0].slot_id, "thickness_limit_um");
    assert!(
        batch
            .diagnostics
            .warnings
            .iter()
            .any(|warning| warning.contains("documented defaults"))
    );
}

#[tokio::test]
async fn all_dropped_candidates_raise_no_viable_candidates() {
    let predictor = Arc::new(FakePredictor::failing(ExternalError::Transient(
        "model server unavailable".to_string(),
    )));
    let engine = orchestrator(
        Arc::new(ModelRegistry::new()),
        predictor.clone(),
        Arc::new(FakeRetriever::with_corpus()),
    );

    let err = engine
        .recommend_or_ask(&answered_request("silicate", 5, 7))
        .await
        .expect_err("nothing survives scoring");
    match err {
        AdvisorError::NoViableCandidates {
            generated,
            diagnostics,
        } => {
            assert_eq!(generated, 5);
            assert_eq!(diagnostics.dropped, 5);
            assert_eq!(diagnostics.retries, 5, "one retry per candidate");
            assert!(
                diagnostics
                    .dropped_candidates
                    .iter()
                    .all(|dropped| dropped.stage == DropStage::Prediction && dropped.attempts == 2)
            );
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(predictor.calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn empty_citation_results_are_not_failures() {
    let engine = orchestrator(
        Arc::new(ModelRegistry::new()),
        Arc::new(FakePredictor::healthy()),
        Arc::new(FakeRetriever::empty()),
    );
    let batch = expect_batch(
        engine
            .recommend_or_ask(&answered_request("zirconate", 4, 2))
            .await
            .expect("recommendation succeeds"),
    );
    assert_eq!(batch.diagnostics.dropped, 0);
    assert!(batch.candidates.iter().all(|candidate| candidate.citations.is_empty()));
    assert!(batch.summary.top_sources.is_empty());
}

#[tokio::test]
async fn in_flight_run_keeps_its_snapshot_during_retrain() {
    let space = ParameterSpace::builtin();
    let registry = Arc::new(ModelRegistry::new());
    let (gate_tx, gate_rx) = watch::channel(false);
    let predictor = Arc::new(GatedPredictor {
        started: Notify::new(),
        gate: gate_rx,
    });
    let engine = orchestrator(
        registry.clone(),
        predictor.clone(),
        Arc::new(FakeRetriever::with_corpus()),
    );

    let silicate = space.lookup("silicate").expect("registered");
    let feedback = (0..5)
        .map(|index| {
            let mut recipe = silicate.defaults.clone();
            recipe.time_min = 10.0 + 4.0 * index as f64;
            FeedbackRecord {
                system: "silicate".to_string(),
                recipe,
                measured_alpha: 0.30,
                measured_epsilon: 0.70,
                quality: Some(0.8),
            }
        })
        .collect::<Vec<FeedbackRecord>>();

    let request = answered_request("silicate", 6, 123);
    let (outcome, retrained_version) = tokio::join!(engine.recommend_or_ask(&request), async {
        predictor.started.notified().await;
        let summary = registry.retrain(&space, &feedback);
        gate_tx.send_replace(true);
        summary.version
    });

    let batch = expect_batch(outcome.expect("run completes"));
    assert_eq!(retrained_version, 1);
    assert_eq!(batch.snapshot_version, 0);
    let provenance = batch
        .candidates
        .iter()
        .map(|candidate| candidate.scored.prediction.provenance)
        .chain(batch.failed.iter().map(|failed| failed.scored.prediction.provenance))
        .collect::<Vec<_>>();
    assert_eq!(provenance.len(), 6);
    assert!(
        provenance
            .iter()
            .all(|entry| entry.snapshot_version == 0 && !entry.corrected),
        "no candidate may see the retrained correctors: {provenance:?}"
    );

    let next = expect_batch(
        engine
            .recommend_or_ask(&request)
            .await
            .expect("second run completes"),
    );
    assert!(next.snapshot_version > 1, "hint publication also bumps the version");
    assert!(
        next.candidates
            .iter()
            .all(|candidate| candidate.scored.prediction.provenance.corrected)
    );
}

#[tokio::test]
async fn tampered_batch_fails_validation() {
    let engine = orchestrator(
        Arc::new(ModelRegistry::new()),
        Arc::new(FakePredictor::healthy()),
        Arc::new(FakeRetriever::with_corpus()),
    );
    let batch = expect_batch(
        engine
            .recommend_or_ask(&answered_request("silicate", 6, 123))
            .await
            .expect("recommendation succeeds"),
    );

    let mut duplicated = batch.clone();
    let copy = duplicated.candidates[0].clone();
    duplicated.candidates.push(copy);
    assert!(matches!(
        duplicated.validate(),
        Err(AdvisorError::InconsistentBatch { .. })
    ));

    let mut not_a_number = batch.clone();
    not_a_number.candidates[0].score = f64::NAN;
    assert!(matches!(
        not_a_number.validate(),
        Err(AdvisorError::InconsistentBatch { .. })
    ));

    let mut infinite = batch.clone();
    infinite.candidates[0].scored.prediction.epsilon = f64::INFINITY;
    assert!(infinite.validate().is_err());

    let mut renumbered = batch;
    renumbered.candidates[0].rank = 99;
    assert!(renumbered.validate().is_err());
}

#[test]
fn request_validation_rejects_bad_inputs() {
    let mut request = answered_request("silicate", 0, 1);
    assert!(validate_request(&request).is_err(), "n = 0");

    request.n = 6;
    request.target_alpha = Some(1.5);
    assert!(validate_request(&request).is_err(), "alpha above 1");

    request.target_alpha = Some(0.2);
    request
        .answers
        .insert("colour".to_string(), vec!["white".to_string()]);
    assert!(validate_request(&request).is_err(), "unknown slot");

    request.answers.remove("colour");
    request.system = Some("  Silicate ".to_string());
    assert_eq!(
        validate_request(&request).expect("valid request"),
        "Silicate"
    );
}

fn candidate_ids(batch: &RankedBatch) -> Vec<&str> {
    batch
        .candidates
        .iter()
        .map(|candidate| candidate.scored.candidate.candidate_id.as_str())
        .chain(
            batch
                .failed
                .iter()
                .map(|failed| failed.scored.candidate.candidate_id.as_str()),
        )
        .collect()
}

#[tokio::test]
async fn identical_requests_get_distinct_batch_ids() {
    let writer = Arc::new(RecordingWriter::default());
    let request = answered_request("silicate", 6, 123);
    let mut batches = Vec::<RankedBatch>::new();
    for _ in 0..2 {
        let engine = orchestrator(
            Arc::new(ModelRegistry::new()),
            Arc::new(FakePredictor::healthy()),
            Arc::new(FakeRetriever::with_corpus()),
        )
        .with_writer(writer.clone());
        batches.push(expect_batch(
            engine
                .recommend_or_ask(&request)
                .await
                .expect("recommendation succeeds"),
        ));
    }

    assert_eq!(candidate_ids(&batches[0]), candidate_ids(&batches[1]));
    assert_eq!(batches[0].snapshot_version, batches[1].snapshot_version);
    assert_ne!(batches[0].batch_id, batches[1].batch_id);
    let stored = writer.batch_ids.lock().expect("writer lock").clone();
    assert_eq!(stored.len(), 2);
    assert_ne!(stored[0], stored[1]);
}

#[tokio::test]
async fn writer_failure_is_a_persistence_error() {
    let engine = orchestrator(
        Arc::new(ModelRegistry::new()),
        Arc::new(FakePredictor::healthy()),
        Arc::new(FakeRetriever::with_corpus()),
    )
    .with_writer(Arc::new(RejectingWriter));

    let err = engine
        .recommend_or_ask(&answered_request("silicate", 4, 5))
        .await
        .expect_err("rejected write fails the run");
    match err {
        AdvisorError::Persistence { batch_id, reason } => {
            assert!(batch_id.starts_with("batch_"));
            assert!(reason.contains("already exists"), "{reason}");
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn non_finite_predictions_drop_every_candidate() {
    let predictor = Arc::new(ScriptedPredictor::new(
        (0..4).map(|call| (call, PredictorFault::NotANumber)),
    ));
    let engine = orchestrator(
        Arc::new(ModelRegistry::new()),
        predictor.clone(),
        Arc::new(FakeRetriever::with_corpus()),
    );

    let err = engine
        .recommend_or_ask(&answered_request("silicate", 4, 11))
        .await
        .expect_err("no finite prediction survives");
    match err {
        AdvisorError::NoViableCandidates { diagnostics, .. } => {
            assert_eq!(diagnostics.dropped, 4);
            assert_eq!(diagnostics.retries, 0);
            for dropped in &diagnostics.dropped_candidates {
                assert_eq!(dropped.stage, DropStage::Prediction);
                assert_eq!(dropped.attempts, 1);
                assert!(dropped.reason.contains("non-finite"), "{}", dropped.reason);
            }
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(predictor.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn some_prediction_failures_drop_only_those_candidates() {
    let engine = orchestrator(
        Arc::new(ModelRegistry::new()),
        Arc::new(ScriptedPredictor::new([
            (1, PredictorFault::Permanent),
            (3, PredictorFault::NotANumber),
            (4, PredictorFault::Permanent),
        ])),
        Arc::new(FakeRetriever::with_corpus()),
    );

    let batch = expect_batch(
        engine
            .recommend_or_ask(&answered_request("silicate", 6, 123))
            .await
            .expect("survivors are ranked"),
    );
    batch.validate().expect("batch is internally consistent");

    assert_eq!(batch.diagnostics.generated, 6);
    assert_eq!(batch.diagnostics.scored, 3);
    assert_eq!(batch.diagnostics.dropped, 3);
    assert_eq!(batch.diagnostics.retries, 0, "permanent failures are not retried");
    assert_eq!(batch.candidates.len() + batch.failed.len(), 3);
    let survivors = candidate_ids(&batch);
    for dropped in &batch.diagnostics.dropped_candidates {
        assert_eq!(dropped.stage, DropStage::Prediction);
        assert_eq!(dropped.attempts, 1);
        assert!(!survivors.contains(&dropped.candidate_id.as_str()));
    }
    for candidate in &batch.candidates {
        assert!(candidate.score.is_finite());
        assert!(candidate.scored.prediction.alpha.is_finite());
    }
}

#[tokio::test]
async fn transient_citation_failure_is_retried_and_counted() {
    let engine = orchestrator(
        Arc::new(ModelRegistry::new()),
        Arc::new(FakePredictor::healthy()),
        Arc::new(FlakyRetriever {
            calls: AtomicU32::new(0),
            inner: FakeRetriever::with_corpus(),
        }),
    );

    let batch = expect_batch(
        engine
            .recommend_or_ask(&answered_request("silicate", 6, 123))
            .await
            .expect("recommendation succeeds"),
    );
    assert_eq!(batch.diagnostics.dropped, 0);
    assert_eq!(batch.diagnostics.retries, 1);
    assert!(
        batch
            .candidates
            .iter()
            .all(|candidate| candidate.citations.len() == 2)
    );
}

#[tokio::test]
async fn exhausted_citation_lookup_drops_and_renumbers() {
    let request = answered_request("silicate", 6, 123);
    let baseline = expect_batch(
        orchestrator(
            Arc::new(ModelRegistry::new()),
            Arc::new(FakePredictor::healthy()),
            Arc::new(FakeRetriever::with_corpus()),
        )
        .recommend_or_ask(&request)
        .await
        .expect("baseline succeeds"),
    );
    assert!(baseline.candidates.len() >= 2, "templates always pass");

    let batch = expect_batch(
        orchestrator(
            Arc::new(ModelRegistry::new()),
            Arc::new(FakePredictor::healthy()),
            Arc::new(StubbornRetriever {
                doomed: Mutex::new(None),
                inner: FakeRetriever::with_corpus(),
            }),
        )
        .recommend_or_ask(&request)
        .await
        .expect("survivors are ranked"),
    );
    batch.validate().expect("batch is internally consistent");

    let dropped = &batch.diagnostics.dropped_candidates;
    assert!(!dropped.is_empty());
    assert!(
        dropped
            .iter()
            .all(|entry| entry.stage == DropStage::Citation && entry.attempts == 2)
    );
    assert_eq!(batch.diagnostics.retries, dropped.len());
    assert_eq!(
        batch.candidates.len() + dropped.len(),
        baseline.candidates.len()
    );
    assert_eq!(batch.failed.len(), baseline.failed.len());
    let ranks = batch
        .candidates
        .iter()
        .map(|candidate| candidate.rank)
        .collect::<Vec<usize>>();
    assert_eq!(ranks, (1..=batch.candidates.len()).collect::<Vec<usize>>());
}

#[tokio::test]
async fn defaulted_thickness_limit_keeps_candidates_pending_expert() {
    let engine = orchestrator(
        Arc::new(ModelRegistry::new()),
        Arc::new(FakePredictor::healthy()),
        Arc::new(FakeRetriever::with_corpus()),
    );
    let mut request = answered_request("silicate", 6, 17);
    request.answers.remove("thickness_limit_um");
    request
        .answers
        .insert("fluoride_additives".to_string(), vec!["no".to_string()]);
    request.best_effort = true;
    // Every recipe in this window estimates below the 5 um default floor.
    request.bounds_override = Some(BoundsOverride {
        numeric: [
            ("current_density_a_dm2", [5.0, 6.0]),
            ("frequency_hz", [500.0, 800.0]),
            ("duty_cycle_pct", [20.0, 22.0]),
            ("time_min", [5.0, 6.0]),
        ]
        .into_iter()
        .map(|(name, bounds)| (name.to_string(), bounds))
        .collect(),
        additives: None,
    });

    let batch = expect_batch(
        engine
            .recommend_or_ask(&request)
            .await
            .expect("best effort proceeds"),
    );
    assert!(batch.failed.is_empty());
    assert!(!batch.candidates.is_empty());
    assert_eq!(batch.unresolved.len(), 1);
    assert_eq!(batch.unresolved[0].slot_id, "thickness_limit_um");
    for candidate in &batch.candidates {
        assert_eq!(candidate.status, CandidateStatus::PendingExpert);
        assert!(
            candidate
                .scored
                .violations
                .iter()
                .any(|violation| violation.rule_id == "thickness_limit" && violation.pending_expert)
        );
        assert!(
            candidate
                .rationale
                .contains("awaiting expert review of thickness_limit"),
            "{}",
            candidate.rationale
        );
    }
    assert_eq!(batch.summary.pending_expert, batch.candidates.len());
}

#[tokio::test]
async fn ranked_candidates_explain_themselves() {
    let engine = orchestrator(
        Arc::new(ModelRegistry::new()),
        Arc::new(FakePredictor::healthy()),
        Arc::new(FakeRetriever::with_corpus()),
    );
    let batch = expect_batch(
        engine
            .recommend_or_ask(&answered_request("silicate", 6, 123))
            .await
            .expect("recommendation succeeds"),
    );

    for candidate in &batch.candidates {
        let prediction = &candidate.scored.prediction;
        assert!(
            candidate.rationale.starts_with(&format!(
                "predicted alpha {:.3} / epsilon {:.3} for target 0.200 / 0.800;",
                prediction.alpha, prediction.epsilon
            )),
            "{}",
            candidate.rationale
        );
        assert!(candidate.rationale.contains("score led by "));
        assert!(
            candidate
                .rationale
                .ends_with("supported by mao-silicate-review p.4 (similarity 0.62)"),
            "{}",
            candidate.rationale
        );
    }

    let mut uncited = batch.candidates[0].clone();
    uncited.citations.clear();
    let text = super::summary::rationale(&uncited, batch.target, ("coating mass", -0.05));
    assert!(text.contains("score led by coating mass (-0.050)"), "{text}");
    assert!(text.ends_with("no supporting citation found"), "{text}");
}
