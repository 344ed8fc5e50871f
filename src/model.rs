use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AdvisorError;

/// The numeric process parameters every system bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericParam {
    VoltageV,
    CurrentDensityADm2,
    FrequencyHz,
    DutyCyclePct,
    TimeMin,
}

impl NumericParam {
    pub const ALL: [NumericParam; 5] = [
        NumericParam::VoltageV,
        NumericParam::CurrentDensityADm2,
        NumericParam::FrequencyHz,
        NumericParam::DutyCyclePct,
        NumericParam::TimeMin,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::VoltageV => "voltage_v",
            Self::CurrentDensityADm2 => "current_density_a_dm2",
            Self::FrequencyHz => "frequency_hz",
            Self::DutyCyclePct => "duty_cycle_pct",
            Self::TimeMin => "time_min",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|param| param.as_str() == normalized)
    }
}

impl fmt::Display for NumericParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Waveform {
    Unipolar,
    Bipolar,
}

impl Waveform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unipolar => "unipolar",
            Self::Bipolar => "bipolar",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostTreatment {
    None,
    HydrothermalSealing,
    OrganicSealing,
}

impl PostTreatment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::HydrothermalSealing => "hydrothermal_sealing",
            Self::OrganicSealing => "organic_sealing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditiveDose {
    pub compound: String,
    pub concentration_g_l: f64,
}

/// One concrete assignment of process parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub system: String,
    pub voltage_v: f64,
    pub current_density_a_dm2: f64,
    pub frequency_hz: f64,
    pub duty_cycle_pct: f64,
    pub time_min: f64,
    pub waveform: Waveform,
    pub additives: Vec<AdditiveDose>,
    pub substrate_alloy: String,
    pub post_treatment: PostTreatment,
}

impl Recipe {
    pub fn value(&self, param: NumericParam) -> f64 {
        match param {
            NumericParam::VoltageV => self.voltage_v,
            NumericParam::CurrentDensityADm2 => self.current_density_a_dm2,
            NumericParam::FrequencyHz => self.frequency_hz,
            NumericParam::DutyCyclePct => self.duty_cycle_pct,
            NumericParam::TimeMin => self.time_min,
        }
    }

    pub fn set_value(&mut self, param: NumericParam, value: f64) {
        match param {
            NumericParam::VoltageV => self.voltage_v = value,
            NumericParam::CurrentDensityADm2 => self.current_density_a_dm2 = value,
            NumericParam::FrequencyHz => self.frequency_hz = value,
            NumericParam::DutyCyclePct => self.duty_cycle_pct = value,
            NumericParam::TimeMin => self.time_min = value,
        }
    }

    pub fn has_additive(&self, compound: &str) -> bool {
        self.additives
            .iter()
            .any(|dose| dose.compound.eq_ignore_ascii_case(compound))
    }

    /// Human-readable summary used as predictor input and citation query.
    pub fn describe(&self) -> String {
        let electrolyte = self
            .additives
            .iter()
            .map(|dose| format!("{} {:.1} g/L", dose.compound, dose.concentration_g_l))
            .collect::<Vec<String>>()
            .join(", ");

        format!(
            "micro-arc oxidation in {} electrolyte ({}) on {}: {:.0} V, {:.1} A/dm2, {:.0} Hz, {:.0}% duty, {:.0} min {} pulse, post-treatment {}",
            self.system,
            electrolyte,
            self.substrate_alloy,
            self.voltage_v,
            self.current_density_a_dm2,
            self.frequency_hz,
            self.duty_cycle_pct,
            self.time_min,
            self.waveform.as_str(),
            self.post_treatment.as_str()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStrategy {
    Template,
    Perturbation,
    Directed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeCandidate {
    pub candidate_id: String,
    pub strategy: GenerationStrategy,
    pub recipe: Recipe,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PropertyTarget {
    pub alpha: f64,
    pub epsilon: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub corrected: bool,
    pub snapshot_version: u64,
}

/// Predicted properties of a candidate. `confidence` is a retrieval-similarity
/// signal for display and tie-breaking, not an error bound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub alpha: f64,
    pub epsilon: f64,
    pub confidence: f64,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Hard,
    Soft,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintViolation {
    pub rule_id: String,
    pub description: String,
    pub severity: Severity,
    pub penalty: f64,
    pub pending_expert: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub source_id: String,
    pub page: u32,
    pub similarity_score: f64,
    pub excerpt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveScores {
    pub charge_density: f64,
    pub thickness_proxy_um: f64,
    pub mass_proxy: f64,
    pub uniformity_penalty: f64,
    pub rule_penalty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub candidate: RecipeCandidate,
    pub prediction: PredictionResult,
    pub constraints_passed: bool,
    pub violations: Vec<ConstraintViolation>,
    pub reward_score: f64,
    pub objectives: ObjectiveScores,
}

impl ScoredCandidate {
    /// True when the only hard violations present wait on an expert decision.
    pub fn is_pending_expert(&self) -> bool {
        let mut hard = self
            .violations
            .iter()
            .filter(|violation| violation.severity == Severity::Hard)
            .peekable();
        hard.peek().is_some() && hard.all(|violation| violation.pending_expert)
    }

    pub fn has_blocking_violation(&self) -> bool {
        self.violations
            .iter()
            .any(|violation| violation.severity == Severity::Hard && !violation.pending_expert)
    }

    pub fn is_finite(&self) -> bool {
        [
            self.prediction.alpha,
            self.prediction.epsilon,
            self.prediction.confidence,
            self.reward_score,
        ]
        .iter()
        .all(|value| value.is_finite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Success,
    PendingExpert,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub rank: usize,
    pub score: f64,
    pub status: CandidateStatus,
    #[serde(flatten)]
    pub scored: ScoredCandidate,
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedCandidate {
    pub status: CandidateStatus,
    #[serde(flatten)]
    pub scored: ScoredCandidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropStage {
    Prediction,
    Citation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedCandidate {
    pub candidate_id: String,
    pub stage: DropStage,
    pub attempts: u32,
    pub reason: String,
}

/// A clarification slot that was answered with a documented default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedSlot {
    pub slot_id: String,
    pub default_value: SlotValue,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchDiagnostics {
    pub generated: usize,
    pub scored: usize,
    pub ranked: usize,
    pub failed: usize,
    pub dropped: usize,
    pub retries: usize,
    pub dropped_candidates: Vec<DroppedCandidate>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub success: usize,
    pub pending_expert: usize,
    pub failed: usize,
    pub hard_pass_rate: f64,
    pub mean_alpha: Option<f64>,
    pub mean_epsilon: Option<f64>,
    pub mean_confidence: Option<f64>,
    pub mean_reward: Option<f64>,
    pub top_sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedBatch {
    pub batch_id: String,
    pub created_at: String,
    pub system: String,
    pub target: PropertyTarget,
    pub seed: u64,
    pub snapshot_version: u64,
    pub candidates: Vec<RankedCandidate>,
    pub failed: Vec<FailedCandidate>,
    pub unresolved: Vec<UnresolvedSlot>,
    pub diagnostics: BatchDiagnostics,
    pub summary: BatchSummary,
}

impl RankedBatch {
    /// Checks that every generated candidate is accounted for exactly once:
    /// ranked and passing, listed as failed, or recorded as dropped.
    pub fn validate(&self) -> Result<(), AdvisorError> {
        let inconsistent = |reason: String| AdvisorError::InconsistentBatch {
            batch_id: self.batch_id.clone(),
            reason,
        };

        let mut seen = BTreeSet::<&str>::new();
        let ids = self
            .candidates
            .iter()
            .map(|candidate| candidate.scored.candidate.candidate_id.as_str())
            .chain(
                self.failed
                    .iter()
                    .map(|candidate| candidate.scored.candidate.candidate_id.as_str()),
            )
            .chain(
                self.diagnostics
                    .dropped_candidates
                    .iter()
                    .map(|dropped| dropped.candidate_id.as_str()),
            );
        for id in ids {
            if !seen.insert(id) {
                return Err(inconsistent(format!("candidate {id} appears more than once")));
            }
        }
        if seen.len() != self.diagnostics.generated {
            return Err(inconsistent(format!(
                "{} candidates accounted for, {} generated",
                seen.len(),
                self.diagnostics.generated
            )));
        }

        for (index, candidate) in self.candidates.iter().enumerate() {
            if candidate.rank != index + 1 {
                return Err(inconsistent(format!(
                    "candidate {} has rank {} at position {}",
                    candidate.scored.candidate.candidate_id,
                    candidate.rank,
                    index + 1
                )));
            }
            if !candidate.score.is_finite() {
                return Err(inconsistent(format!(
                    "ranked candidate {} has non-finite score {}",
                    candidate.scored.candidate.candidate_id, candidate.score
                )));
            }
            if candidate.scored.has_blocking_violation()
                || candidate.status == CandidateStatus::Failed
            {
                return Err(inconsistent(format!(
                    "ranked candidate {} has a blocking hard violation",
                    candidate.scored.candidate.candidate_id
                )));
            }
        }
        if let Some(scored) = self
            .candidates
            .iter()
            .map(|candidate| &candidate.scored)
            .chain(self.failed.iter().map(|failed| &failed.scored))
            .find(|scored| !scored.is_finite())
        {
            return Err(inconsistent(format!(
                "candidate {} has a non-finite prediction or reward",
                scored.candidate.candidate_id
            )));
        }
        if let Some(failed) = self
            .failed
            .iter()
            .find(|failed| !failed.scored.has_blocking_violation())
        {
            return Err(inconsistent(format!(
                "failed candidate {} has no blocking violation",
                failed.scored.candidate.candidate_id
            )));
        }

        let counts = (
            self.diagnostics.ranked,
            self.diagnostics.failed,
            self.diagnostics.dropped,
        );
        if counts
            != (
                self.candidates.len(),
                self.failed.len(),
                self.diagnostics.dropped_candidates.len(),
            )
        {
            return Err(inconsistent(
                "diagnostic counts disagree with candidate lists".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlotValue {
    Number { value: f64 },
    Range { min: f64, max: f64 },
    Choice { value: String },
    Flag { value: bool },
}

impl fmt::Display for SlotValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number { value } => write!(f, "{value}"),
            Self::Range { min, max } => write!(f, "{min}-{max}"),
            Self::Choice { value } => f.write_str(value),
            Self::Flag { value } => write!(f, "{}", if *value { "yes" } else { "no" }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationQuestion {
    pub question_id: String,
    pub slot_id: String,
    pub text: String,
    pub is_mandatory: bool,
    pub expected_answer_type: String,
    pub is_followup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClarificationStatus {
    NeedsMoreInfo,
    PendingExpert,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationResponse {
    pub status: ClarificationStatus,
    pub need_expert: bool,
    pub system: String,
    pub questions: Vec<ClarificationQuestion>,
    pub unresolved: Vec<UnresolvedSlot>,
    pub resolved_slots: BTreeMap<String, SlotValue>,
}

/// Closed-interval narrowing requested by the caller, keyed by parameter name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundsOverride {
    #[serde(default)]
    pub numeric: BTreeMap<String, [f64; 2]>,
    #[serde(default)]
    pub additives: Option<Vec<String>>,
}

fn default_candidate_count() -> usize {
    6
}

fn default_seed() -> u64 {
    42
}

/// Incoming recommendation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub target_alpha: Option<f64>,
    #[serde(default)]
    pub target_epsilon: Option<f64>,
    #[serde(default = "default_candidate_count")]
    pub n: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub best_effort: bool,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub answers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub bounds_override: Option<BoundsOverride>,
}

impl Default for TargetSpec {
    fn default() -> Self {
        Self {
            system: None,
            target_alpha: None,
            target_epsilon: None,
            n: default_candidate_count(),
            seed: default_seed(),
            best_effort: false,
            notes: None,
            answers: BTreeMap::new(),
            bounds_override: None,
        }
    }
}

/// One measured experiment used to retrain correctors and the reward model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub system: String,
    pub recipe: Recipe,
    pub measured_alpha: f64,
    pub measured_epsilon: f64,
    #[serde(default)]
    pub quality: Option<f64>,
}

/// One literature passage for the citation corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassageRecord {
    pub source_id: String,
    pub page: u32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub snapshot_version: u64,
    pub feedback_rows: usize,
    pub examples_per_system: BTreeMap<String, usize>,
    pub reward_examples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusManifest {
    pub manifest_version: u32,
    pub generated_at: String,
    pub source_path: String,
    pub model_id: String,
    pub passages_loaded: usize,
    pub passages_total: usize,
}
