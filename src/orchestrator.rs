use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clarify::{AnswerClassifier, ClarificationEngine, SlotId};
use crate::error::AdvisorError;
use crate::external::{BatchWriter, CitationRetriever, ForwardPredictor};
use crate::generator::{CandidateGenerator, GenerationMix, GradientHint, HintSample};
use crate::model::{
    BatchDiagnostics, ClarificationResponse, RankedBatch, ScoredCandidate, TargetSpec,
};
use crate::policy::CallPolicy;
use crate::ranker::{MultiObjectiveRanker, RankerWeights};
use crate::registry::ModelRegistry;
use crate::space::{ParameterSpace, SystemSpace};

mod citations;
mod scoring;
mod summary;
#[cfg(test)]
mod tests;

use citations::CitationStage;
use scoring::{CandidateScorer, ScoreOutcome};
use summary::{batch_id, rationale, summarize};

pub const MAX_CANDIDATES: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub weights: RankerWeights,
    pub mix: GenerationMix,
    pub policy: CallPolicy,
    pub concurrency: usize,
    pub citation_top_k: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            weights: RankerWeights::default(),
            mix: GenerationMix::default(),
            policy: CallPolicy::default(),
            concurrency: 4,
            citation_top_k: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RecommendOutcome {
    Ranked(Box<RankedBatch>),
    NeedsClarification(ClarificationResponse),
}

pub struct Orchestrator {
    space: Arc<ParameterSpace>,
    registry: Arc<ModelRegistry>,
    predictor: Arc<dyn ForwardPredictor>,
    retriever: Arc<dyn CitationRetriever>,
    classifier: Arc<dyn AnswerClassifier>,
    writer: Option<Arc<dyn BatchWriter>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        space: Arc<ParameterSpace>,
        registry: Arc<ModelRegistry>,
        predictor: Arc<dyn ForwardPredictor>,
        retriever: Arc<dyn CitationRetriever>,
        classifier: Arc<dyn AnswerClassifier>,
    ) -> Self {
        Self {
            space,
            registry,
            predictor,
            retriever,
            classifier,
            writer: None,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_writer(mut self, writer: Arc<dyn BatchWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Either asks for the missing information or returns a fully formed,
    /// validated batch. Only request-level and systemic failures are errors.
    pub async fn recommend_or_ask(
        &self,
        request: &TargetSpec,
    ) -> Result<RecommendOutcome, AdvisorError> {
        let system = validate_request(request)?;
        let space = self
            .space
            .resolve(&system, request.bounds_override.as_ref())?;

        let clarification = ClarificationEngine::new(self.classifier.as_ref()).run(request);
        if !clarification.ready_for_generation(request.best_effort) {
            info!(
                system = %space.system,
                state = ?clarification.state,
                "returning clarification questions"
            );
            return Ok(RecommendOutcome::NeedsClarification(
                clarification.into_response(&space.system),
            ));
        }

        let resolved = clarification.resolved_values();
        let unresolved = clarification.unresolved();
        for slot in &unresolved {
            warn!(slot = %slot.slot_id, default = %slot.default_value, "using documented default");
        }

        // Pinned for the whole run; a concurrent retrain publishes a new
        // snapshot without affecting this one.
        let snapshot = self.registry.snapshot();
        let candidates = CandidateGenerator::new(self.config.mix)
            .with_hint(snapshot.hint_for(&space.system).cloned())
            .with_preferences(resolved.recipe_preferences())
            .generate(&space, &resolved.target, request.n, request.seed)?;
        let generated = candidates.len();
        info!(
            system = %space.system,
            generated,
            seed = request.seed,
            snapshot_version = snapshot.version,
            "generated candidates"
        );

        let scorer = CandidateScorer {
            space: &space,
            snapshot: &snapshot,
            predictor: self.predictor.as_ref(),
            policy: &self.config.policy,
            constraints: resolved.constraint_context(),
        };
        let mut diagnostics = BatchDiagnostics {
            generated,
            ..BatchDiagnostics::default()
        };
        let mut scored = Vec::<ScoredCandidate>::new();
        for outcome in scorer.score_all(candidates, self.config.concurrency).await {
            match outcome {
                ScoreOutcome::Scored {
                    scored: candidate,
                    attempts,
                } => {
                    diagnostics.retries += attempts.saturating_sub(1) as usize;
                    scored.push(*candidate);
                }
                ScoreOutcome::Dropped(dropped) => {
                    diagnostics.retries += dropped.attempts.saturating_sub(1) as usize;
                    diagnostics.dropped_candidates.push(dropped);
                }
            }
        }
        diagnostics.scored = scored.len();
        let hint_samples = hint_samples(&space, &scored);

        let ranker = MultiObjectiveRanker::new(self.config.weights, resolved.target)
            .with_alpha_share(resolved.alpha_share);
        let ranking = ranker.rank(scored);

        let citations = CitationStage {
            retriever: self.retriever.as_ref(),
            policy: &self.config.policy,
            top_k: self.config.citation_top_k,
        }
        .attach(ranking.ranked, self.config.concurrency)
        .await;
        diagnostics.retries += citations.retries;
        diagnostics.dropped_candidates.extend(citations.dropped);
        if citations.uncited > 0 {
            diagnostics.warnings.push(format!(
                "{} ranked candidates have no supporting citations",
                citations.uncited
            ));
        }
        if !unresolved.is_empty() {
            diagnostics.warnings.push(format!(
                "{} clarification slots use documented defaults pending expert review",
                unresolved.len()
            ));
        }
        if snapshot.correctors_for(&space.system).is_none() {
            diagnostics
                .warnings
                .push("no trained residual corrector; predictions are uncorrected".to_string());
        }

        let mut ranked = citations.ranked;
        for candidate in &mut ranked {
            let text = rationale(
                candidate,
                resolved.target,
                ranker.dominant_objective(&candidate.scored),
            );
            candidate.rationale = text;
        }
        let failed = ranking.failed;
        diagnostics.ranked = ranked.len();
        diagnostics.failed = failed.len();
        diagnostics.dropped = diagnostics.dropped_candidates.len();

        if ranked.is_empty() && failed.is_empty() {
            warn!(
                generated,
                dropped = diagnostics.dropped,
                "every candidate was dropped"
            );
            return Err(AdvisorError::NoViableCandidates {
                generated,
                diagnostics: Box::new(diagnostics),
            });
        }

        let created_at = Utc::now();
        let mut candidate_ids = ranked
            .iter()
            .map(|candidate| candidate.scored.candidate.candidate_id.as_str())
            .chain(
                failed
                    .iter()
                    .map(|candidate| candidate.scored.candidate.candidate_id.as_str()),
            )
            .collect::<Vec<&str>>();
        candidate_ids.sort_unstable();
        let batch = RankedBatch {
            batch_id: batch_id(
                created_at,
                &space.system,
                request.seed,
                snapshot.version,
                &candidate_ids,
            ),
            created_at: created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            system: space.system.clone(),
            target: resolved.target,
            seed: request.seed,
            snapshot_version: snapshot.version,
            summary: summarize(&ranked, &failed),
            candidates: ranked,
            failed,
            unresolved,
            diagnostics,
        };
        batch.validate()?;

        if let Some(writer) = &self.writer {
            writer
                .write(&batch)
                .await
                .map_err(|err| AdvisorError::Persistence {
                    batch_id: batch.batch_id.clone(),
                    reason: format!("{err:#}"),
                })?;
        }

        if let Some(hint) = GradientHint::estimate(&space.system, &hint_samples) {
            let version = self.registry.publish_hint(hint);
            info!(system = %space.system, version, "published gradient hint");
        }

        info!(
            batch_id = %batch.batch_id,
            ranked = batch.diagnostics.ranked,
            failed = batch.diagnostics.failed,
            dropped = batch.diagnostics.dropped,
            retries = batch.diagnostics.retries,
            "recommendation batch ready"
        );
        Ok(RecommendOutcome::Ranked(Box::new(batch)))
    }
}

/// Rejects requests that cannot enter clarification and returns the system id.
pub fn validate_request(request: &TargetSpec) -> Result<String, AdvisorError> {
    let system = request
        .system
        .as_deref()
        .map(str::trim)
        .filter(|system| !system.is_empty())
        .ok_or_else(|| AdvisorError::invalid_request("request has no system identifier"))?;

    if request.n == 0 || request.n > MAX_CANDIDATES {
        return Err(AdvisorError::invalid_request(format!(
            "candidate count must be between 1 and {MAX_CANDIDATES}, got {}",
            request.n
        )));
    }
    for (name, value) in [
        ("target_alpha", request.target_alpha),
        ("target_epsilon", request.target_epsilon),
    ] {
        let Some(value) = value else {
            continue;
        };
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(AdvisorError::invalid_request(format!(
                "{name} must lie in [0, 1], got {value}"
            )));
        }
    }
    if let Some(unknown) = request
        .answers
        .keys()
        .find(|slot| SlotId::parse(slot).is_none())
    {
        return Err(AdvisorError::invalid_request(format!(
            "answer given for unknown clarification slot '{unknown}'"
        )));
    }

    Ok(system.to_string())
}

fn hint_samples(space: &SystemSpace, scored: &[ScoredCandidate]) -> Vec<HintSample> {
    scored
        .iter()
        .map(|candidate| HintSample {
            features: space.normalized_features(&candidate.candidate.recipe),
            alpha: candidate.prediction.alpha,
            epsilon: candidate.prediction.epsilon,
        })
        .collect()
}
