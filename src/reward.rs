use nalgebra::{DMatrix, DVector};
use tracing::warn;

use crate::model::{PredictionResult, Recipe};
use crate::space::SystemSpace;

/// Score returned before any preference data has been seen.
pub const NEUTRAL_REWARD: f64 = 0.5;

const RIDGE_LAMBDA: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceExample {
    pub features: Vec<f64>,
    pub quality: f64,
}

/// Recipe features followed by the predicted properties.
pub fn reward_features(space: &SystemSpace, recipe: &Recipe, alpha: f64, epsilon: f64) -> Vec<f64> {
    let mut features = space.normalized_features(recipe);
    features.push(alpha);
    features.push(epsilon);
    features
}

pub fn candidate_features(
    space: &SystemSpace,
    recipe: &Recipe,
    prediction: &PredictionResult,
) -> Vec<f64> {
    reward_features(space, recipe, prediction.alpha, prediction.epsilon)
}

/// Ridge regression from recipe+outcome features to a quality score in [0, 1].
#[derive(Debug, Clone, Default)]
pub struct RewardModel {
    trained: Option<RidgeState>,
}

#[derive(Debug, Clone)]
struct RidgeState {
    feature_means: DVector<f64>,
    coefficients: DVector<f64>,
    intercept: f64,
    examples: usize,
}

impl RewardModel {
    pub fn untrained() -> Self {
        Self { trained: None }
    }

    pub fn train(examples: &[PreferenceExample]) -> Self {
        let Some(dimension) = examples.first().map(|example| example.features.len()) else {
            return Self::untrained();
        };
        let usable = examples
            .iter()
            .filter(|example| {
                example.features.len() == dimension
                    && example.quality.is_finite()
                    && example.features.iter().all(|value| value.is_finite())
            })
            .collect::<Vec<&PreferenceExample>>();
        if usable.is_empty() || dimension == 0 {
            return Self::untrained();
        }

        let n = usable.len();
        let design = DMatrix::from_fn(n, dimension, |row, col| usable[row].features[col]);
        let targets = DVector::from_iterator(n, usable.iter().map(|example| example.quality));

        let feature_means = DVector::from_fn(dimension, |col, _| design.column(col).mean());
        let intercept = targets.mean();

        let centered = DMatrix::from_fn(n, dimension, |row, col| {
            design[(row, col)] - feature_means[col]
        });
        let centered_targets = targets.add_scalar(-intercept);

        let gram = centered.transpose() * &centered
            + DMatrix::<f64>::identity(dimension, dimension) * RIDGE_LAMBDA;
        let rhs = centered.transpose() * centered_targets;

        let Some(cholesky) = gram.cholesky() else {
            warn!(examples = n, "reward gram matrix not positive definite, staying neutral");
            return Self::untrained();
        };

        Self {
            trained: Some(RidgeState {
                feature_means,
                coefficients: cholesky.solve(&rhs),
                intercept,
                examples: n,
            }),
        }
    }

    pub fn is_trained(&self) -> bool {
        self.trained.is_some()
    }

    pub fn training_size(&self) -> usize {
        self.trained.as_ref().map_or(0, |state| state.examples)
    }

    pub fn score(&self, features: &[f64]) -> f64 {
        let Some(state) = &self.trained else {
            return NEUTRAL_REWARD;
        };
        if features.len() != state.coefficients.len() {
            return NEUTRAL_REWARD;
        }

        let raw = state.intercept
            + features
                .iter()
                .zip(state.feature_means.iter())
                .zip(state.coefficients.iter())
                .map(|((value, mean), weight)| (value - mean) * weight)
                .sum::<f64>();

        raw.clamp(0.0, 1.0)
    }
}
