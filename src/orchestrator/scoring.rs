use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::constraints::{ConstraintContext, HardConstraintChecker};
use crate::external::ForwardPredictor;
use crate::model::{
    DropStage, DroppedCandidate, PredictionResult, Provenance, RecipeCandidate, ScoredCandidate,
};
use crate::objectives::evaluate;
use crate::policy::CallPolicy;
use crate::registry::ModelSnapshot;
use crate::reward::candidate_features;
use crate::space::SystemSpace;

pub(super) enum ScoreOutcome {
    Scored {
        scored: Box<ScoredCandidate>,
        attempts: u32,
    },
    Dropped(DroppedCandidate),
}

/// Everything one run needs to score a candidate. The snapshot is fixed for
/// the lifetime of the run.
pub(super) struct CandidateScorer<'a> {
    pub(super) space: &'a SystemSpace,
    pub(super) snapshot: &'a ModelSnapshot,
    pub(super) predictor: &'a dyn ForwardPredictor,
    pub(super) policy: &'a CallPolicy,
    pub(super) constraints: ConstraintContext,
}

impl CandidateScorer<'_> {
    /// Scores candidates with at most `concurrency` predictor calls in flight.
    /// Output order matches input order.
    pub(super) async fn score_all(
        &self,
        candidates: Vec<RecipeCandidate>,
        concurrency: usize,
    ) -> Vec<ScoreOutcome> {
        stream::iter(candidates.into_iter().map(|candidate| self.score_one(candidate)))
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    async fn score_one(&self, candidate: RecipeCandidate) -> ScoreOutcome {
        let predictor = self.predictor;
        let recipe = &candidate.recipe;
        let recipe_text = candidate.description.as_str();

        let outcome = self
            .policy
            .call("predictor", || predictor.predict(recipe_text, recipe))
            .await;
        let (raw, attempts) = match outcome {
            Ok(result) => result,
            Err(failure) => {
                warn!(
                    candidate_id = %candidate.candidate_id,
                    attempts = failure.attempts,
                    error = %failure.last_error,
                    "dropping candidate after predictor failure"
                );
                return ScoreOutcome::Dropped(DroppedCandidate {
                    candidate_id: candidate.candidate_id.clone(),
                    stage: DropStage::Prediction,
                    attempts: failure.attempts,
                    reason: failure.last_error.to_string(),
                });
            }
        };

        if !raw.alpha.is_finite() || !raw.epsilon.is_finite() {
            warn!(
                candidate_id = %candidate.candidate_id,
                alpha = raw.alpha,
                epsilon = raw.epsilon,
                "dropping candidate with non-finite prediction"
            );
            return ScoreOutcome::Dropped(DroppedCandidate {
                candidate_id: candidate.candidate_id.clone(),
                stage: DropStage::Prediction,
                attempts,
                reason: format!(
                    "predictor returned non-finite properties (alpha={}, epsilon={})",
                    raw.alpha, raw.epsilon
                ),
            });
        }
        let raw_alpha = raw.alpha.clamp(0.0, 1.0);
        let raw_epsilon = raw.epsilon.clamp(0.0, 1.0);

        let features = self.space.normalized_features(recipe);
        let (alpha, epsilon, corrected) = match self.snapshot.correctors_for(&self.space.system) {
            Some(correctors) => {
                let alpha = correctors.alpha.correct(raw_alpha, &features);
                let epsilon = correctors.epsilon.correct(raw_epsilon, &features);
                (
                    alpha.value,
                    epsilon.value,
                    alpha.corrected || epsilon.corrected,
                )
            }
            None => (raw_alpha, raw_epsilon, false),
        };
        let confidence = if raw.confidence.is_finite() {
            raw.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let prediction = PredictionResult {
            alpha,
            epsilon,
            confidence,
            provenance: Provenance {
                corrected,
                snapshot_version: self.snapshot.version,
            },
        };

        let report = HardConstraintChecker::new(self.space, self.constraints.clone()).check(recipe);
        let reward_score = self
            .snapshot
            .reward
            .score(&candidate_features(self.space, recipe, &prediction));
        let objectives = evaluate(self.space, recipe, report.rule_penalty);

        debug!(
            candidate_id = %candidate.candidate_id,
            alpha,
            epsilon,
            passed = report.passed,
            reward_score,
            "scored candidate"
        );

        ScoreOutcome::Scored {
            scored: Box::new(ScoredCandidate {
                candidate,
                prediction,
                constraints_passed: report.passed,
                violations: report.violations,
                reward_score,
                objectives,
            }),
            attempts,
        }
    }
}
