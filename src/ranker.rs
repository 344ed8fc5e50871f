use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::model::{
    CandidateStatus, FailedCandidate, PredictionResult, PropertyTarget, RankedCandidate,
    ScoredCandidate,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankerWeights {
    pub property_weight: f64,
    pub rule_penalty_weight: f64,
    pub reward_weight: f64,
    pub mass_weight: f64,
    pub uniformity_weight: f64,
}

impl Default for RankerWeights {
    fn default() -> Self {
        Self {
            property_weight: 1.0,
            rule_penalty_weight: 0.2,
            reward_weight: 0.3,
            mass_weight: 0.1,
            uniformity_weight: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ranking {
    pub ranked: Vec<RankedCandidate>,
    pub failed: Vec<FailedCandidate>,
}

#[derive(Debug, Clone)]
pub struct MultiObjectiveRanker {
    weights: RankerWeights,
    target: PropertyTarget,
    alpha_share: f64,
}

impl MultiObjectiveRanker {
    pub fn new(weights: RankerWeights, target: PropertyTarget) -> Self {
        Self {
            weights,
            target,
            alpha_share: 0.5,
        }
    }

    /// Share of the property distance attributed to absorptance; emissivity gets the rest.
    pub fn with_alpha_share(mut self, share: f64) -> Self {
        self.alpha_share = share.clamp(0.0, 1.0);
        self
    }

    pub fn property_fit(&self, prediction: &PredictionResult) -> f64 {
        -(self.alpha_share * (prediction.alpha - self.target.alpha).abs()
            + (1.0 - self.alpha_share) * (prediction.epsilon - self.target.epsilon).abs())
    }

    pub fn composite_score(&self, scored: &ScoredCandidate) -> f64 {
        let weights = &self.weights;
        weights.property_weight * self.property_fit(&scored.prediction)
            - weights.rule_penalty_weight * scored.objectives.rule_penalty
            + weights.reward_weight * scored.reward_score
            - weights.mass_weight * scored.objectives.mass_proxy
            - weights.uniformity_weight * scored.objectives.uniformity_penalty
    }

    /// The weighted term of `composite_score` with the largest magnitude.
    /// Earlier terms win ties.
    pub fn dominant_objective(&self, scored: &ScoredCandidate) -> (&'static str, f64) {
        let weights = &self.weights;
        [
            (
                "property fit",
                weights.property_weight * self.property_fit(&scored.prediction),
            ),
            (
                "rule penalty",
                -weights.rule_penalty_weight * scored.objectives.rule_penalty,
            ),
            ("learned reward", weights.reward_weight * scored.reward_score),
            (
                "coating mass",
                -weights.mass_weight * scored.objectives.mass_proxy,
            ),
            (
                "uniformity",
                -weights.uniformity_weight * scored.objectives.uniformity_penalty,
            ),
        ]
        .into_iter()
        .fold(("property fit", 0.0), |best, term| {
            if term.1.abs() > best.1.abs() {
                term
            } else {
                best
            }
        })
    }

    /// Orders passing candidates; anything with a blocking hard violation goes
    /// to the failed side list.
    pub fn rank(&self, scored: Vec<ScoredCandidate>) -> Ranking {
        let mut passing = Vec::<(f64, ScoredCandidate)>::new();
        let mut failed = Vec::<FailedCandidate>::new();

        for candidate in scored {
            if candidate.has_blocking_violation() {
                failed.push(FailedCandidate {
                    status: CandidateStatus::Failed,
                    scored: candidate,
                });
            } else {
                passing.push((self.composite_score(&candidate), candidate));
            }
        }

        passing.sort_by(|(left_score, left), (right_score, right)| {
            right_score
                .total_cmp(left_score)
                .then(
                    right
                        .prediction
                        .confidence
                        .total_cmp(&left.prediction.confidence),
                )
                .then(
                    left.objectives
                        .mass_proxy
                        .total_cmp(&right.objectives.mass_proxy),
                )
                .then_with(|| compare_ids(left, right))
        });
        failed.sort_by(|left, right| compare_ids(&left.scored, &right.scored));

        let ranked = passing
            .into_iter()
            .enumerate()
            .map(|(index, (score, candidate))| RankedCandidate {
                rank: index + 1,
                score,
                status: if candidate.is_pending_expert() {
                    CandidateStatus::PendingExpert
                } else {
                    CandidateStatus::Success
                },
                scored: candidate,
                citations: Vec::new(),
                rationale: String::new(),
            })
            .collect();

        Ranking { ranked, failed }
    }
}

fn compare_ids(left: &ScoredCandidate, right: &ScoredCandidate) -> Ordering {
    left.candidate
        .candidate_id
        .cmp(&right.candidate.candidate_id)
}
