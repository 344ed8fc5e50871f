use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use tracing::{info, warn};

use crate::corrector::{ResidualCorrector, TrainingExample};
use crate::generator::GradientHint;
use crate::model::FeedbackRecord;
use crate::reward::{PreferenceExample, RewardModel, reward_features};
use crate::space::ParameterSpace;
use crate::util::now_utc_string;

/// Physical clip ranges applied to corrected predictions.
pub const ALPHA_RANGE: (f64, f64) = (0.05, 0.95);
pub const EPSILON_RANGE: (f64, f64) = (0.10, 0.98);

#[derive(Debug, Clone, Default)]
pub struct PropertyCorrectors {
    pub alpha: ResidualCorrector,
    pub epsilon: ResidualCorrector,
}

/// Immutable view of every learned model. Runs hold an `Arc` to one snapshot
/// for their whole duration.
#[derive(Debug, Clone)]
pub struct ModelSnapshot {
    pub version: u64,
    pub published_at: String,
    pub correctors: BTreeMap<String, PropertyCorrectors>,
    pub reward: RewardModel,
    pub hints: BTreeMap<String, GradientHint>,
}

impl ModelSnapshot {
    pub fn cold_start() -> Self {
        Self {
            version: 0,
            published_at: now_utc_string(),
            correctors: BTreeMap::new(),
            reward: RewardModel::untrained(),
            hints: BTreeMap::new(),
        }
    }

    pub fn correctors_for(&self, system: &str) -> Option<&PropertyCorrectors> {
        self.correctors.get(system)
    }

    pub fn hint_for(&self, system: &str) -> Option<&GradientHint> {
        self.hints.get(system)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrainSummary {
    pub version: u64,
    pub examples_per_system: BTreeMap<String, usize>,
    pub reward_examples: usize,
    pub skipped: usize,
}

#[derive(Debug)]
pub struct ModelRegistry {
    current: RwLock<Arc<ModelSnapshot>>,
    publish_lock: Mutex<()>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(ModelSnapshot::cold_start())),
            publish_lock: Mutex::new(()),
        }
    }

    /// Current snapshot. The read lock is held only for the pointer clone.
    pub fn snapshot(&self) -> Arc<ModelSnapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    /// Rebuilds correctors and the reward model from all feedback and publishes them.
    pub fn retrain(&self, space: &ParameterSpace, feedback: &[FeedbackRecord]) -> RetrainSummary {
        let mut corrector_examples =
            BTreeMap::<String, (Vec<TrainingExample>, Vec<TrainingExample>)>::new();
        let mut preference_examples = Vec::<PreferenceExample>::new();
        let mut skipped = 0_usize;

        for record in feedback {
            let system = match space.lookup(&record.system) {
                Ok(system) => system,
                Err(err) => {
                    warn!(system = %record.system, error = %err, "skipping feedback row");
                    skipped += 1;
                    continue;
                }
            };

            let features = system.normalized_features(&record.recipe);
            let entry = corrector_examples.entry(system.system.clone()).or_default();
            entry.0.push(TrainingExample {
                features: features.clone(),
                measured: record.measured_alpha,
            });
            entry.1.push(TrainingExample {
                features,
                measured: record.measured_epsilon,
            });

            if let Some(quality) = record.quality {
                preference_examples.push(PreferenceExample {
                    features: reward_features(
                        system,
                        &record.recipe,
                        record.measured_alpha,
                        record.measured_epsilon,
                    ),
                    quality: quality.clamp(0.0, 1.0),
                });
            }
        }

        let examples_per_system = corrector_examples
            .iter()
            .map(|(system, (alpha, _))| (system.clone(), alpha.len()))
            .collect::<BTreeMap<String, usize>>();
        let reward_examples = preference_examples.len();

        let snapshot = self.publish(|previous, version| {
            let correctors = corrector_examples
                .iter()
                .map(|(system, (alpha, epsilon))| {
                    let correctors = PropertyCorrectors {
                        alpha: ResidualCorrector::fit(alpha)
                            .with_output_range(ALPHA_RANGE.0, ALPHA_RANGE.1),
                        epsilon: ResidualCorrector::fit(epsilon)
                            .with_output_range(EPSILON_RANGE.0, EPSILON_RANGE.1),
                    };
                    (system.clone(), correctors)
                })
                .collect();

            ModelSnapshot {
                version,
                published_at: now_utc_string(),
                correctors,
                reward: RewardModel::train(&preference_examples),
                hints: previous.hints.clone(),
            }
        });

        info!(
            version = snapshot.version,
            systems = examples_per_system.len(),
            reward_examples,
            skipped,
            "published retrained model snapshot"
        );

        RetrainSummary {
            version: snapshot.version,
            examples_per_system,
            reward_examples,
            skipped,
        }
    }

    /// Publishes a new snapshot carrying `hint` for its system.
    pub fn publish_hint(&self, hint: GradientHint) -> u64 {
        let snapshot = self.publish(|previous, version| {
            let mut next = previous.clone();
            next.version = version;
            next.published_at = now_utc_string();
            next.hints.insert(hint.system.clone(), hint);
            next
        });
        snapshot.version
    }

    /// Builds the next snapshot outside the read/write lock and swaps it in.
    /// Writers serialize on `publish_lock`; readers never wait on a build.
    fn publish(
        &self,
        build: impl FnOnce(&ModelSnapshot, u64) -> ModelSnapshot,
    ) -> Arc<ModelSnapshot> {
        let _writer = self
            .publish_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let previous = self.snapshot();
        let next = Arc::new(build(&previous, previous.version + 1));

        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::clone(&next);
        next
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::ModelRegistry;
    use crate::generator::GradientHint;
    use crate::model::FeedbackRecord;
    use crate::space::ParameterSpace;

    fn feedback(space: &ParameterSpace, count: usize) -> Vec<FeedbackRecord> {
        let silicate = space.lookup("silicate").expect("registered");
        (0..count)
            .map(|index| {
                let mut recipe = silicate.defaults.clone();
                recipe.voltage_v = 300.0 + 20.0 * index as f64;
                FeedbackRecord {
                    system: "silicate".to_string(),
                    recipe,
                    measured_alpha: 0.15 + 0.01 * index as f64,
                    measured_epsilon: 0.85,
                    quality: Some(0.5 + 0.05 * index as f64),
                }
            })
            .collect()
    }

    #[test]
    fn snapshots_are_immutable_once_taken() {
        let space = ParameterSpace::builtin();
        let registry = ModelRegistry::new();
        let before = registry.snapshot();
        assert_eq!(before.version, 0);
        assert!(before.correctors_for("silicate").is_none());

        let summary = registry.retrain(&space, &feedback(&space, 5));
        assert_eq!(summary.version, 1);
        assert_eq!(summary.examples_per_system.get("silicate"), Some(&5));
        assert_eq!(summary.reward_examples, 5);

        assert_eq!(before.version, 0);
        assert!(before.correctors_for("silicate").is_none());
        assert!(!before.reward.is_trained());

        let after = registry.snapshot();
        assert!(!Arc::ptr_eq(&before, &after));
        let correctors = after.correctors_for("silicate").expect("trained correctors");
        assert!(correctors.alpha.is_trained());
        assert!(after.reward.is_trained());
    }

    #[test]
    fn unknown_systems_are_skipped() {
        let space = ParameterSpace::builtin();
        let mut rows = feedback(&space, 3);
        rows[0].system = "phosphate".to_string();
        let summary = ModelRegistry::new().retrain(&space, &rows);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.examples_per_system.get("silicate"), Some(&2));
    }

    #[test]
    fn publishing_a_hint_keeps_trained_models() {
        let space = ParameterSpace::builtin();
        let registry = ModelRegistry::new();
        registry.retrain(&space, &feedback(&space, 4));

        let version = registry.publish_hint(GradientHint {
            system: "silicate".to_string(),
            reference_features: vec![0.5; 5],
            reference_alpha: 0.2,
            reference_epsilon: 0.8,
            alpha_slope: vec![0.1; 5],
            epsilon_slope: vec![-0.1; 5],
            samples: 6,
        });

        let snapshot = registry.snapshot();
        assert_eq!(version, 2);
        assert!(snapshot.hint_for("silicate").is_some());
        assert!(snapshot.correctors_for("silicate").is_some());
    }
}
