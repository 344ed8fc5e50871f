use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::model::{NumericParam, PropertyTarget};

pub const MIN_HINT_SAMPLES: usize = 3;
const HINT_RIDGE_LAMBDA: f64 = 1e-3;

#[derive(Debug, Clone, PartialEq)]
pub struct HintSample {
    pub features: Vec<f64>,
    pub alpha: f64,
    pub epsilon: f64,
}

/// Local linear model of how predicted properties move with the numeric
/// features, estimated from a previous run's scored candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientHint {
    pub system: String,
    pub reference_features: Vec<f64>,
    pub reference_alpha: f64,
    pub reference_epsilon: f64,
    pub alpha_slope: Vec<f64>,
    pub epsilon_slope: Vec<f64>,
    pub samples: usize,
}

impl GradientHint {
    pub fn estimate(system: &str, samples: &[HintSample]) -> Option<Self> {
        let dimension = NumericParam::ALL.len();
        let usable = samples
            .iter()
            .filter(|sample| {
                sample.features.len() >= dimension
                    && sample.alpha.is_finite()
                    && sample.epsilon.is_finite()
            })
            .collect::<Vec<&HintSample>>();
        let n = usable.len();
        if n < MIN_HINT_SAMPLES {
            return None;
        }

        let means = (0..dimension)
            .map(|col| usable.iter().map(|sample| sample.features[col]).sum::<f64>() / n as f64)
            .collect::<Vec<f64>>();
        let reference_alpha = usable.iter().map(|sample| sample.alpha).sum::<f64>() / n as f64;
        let reference_epsilon = usable.iter().map(|sample| sample.epsilon).sum::<f64>() / n as f64;

        let centered = DMatrix::from_fn(n, dimension, |row, col| {
            usable[row].features[col] - means[col]
        });
        let gram = centered.transpose() * &centered
            + DMatrix::<f64>::identity(dimension, dimension) * HINT_RIDGE_LAMBDA;
        let cholesky = gram.cholesky()?;

        let alpha_targets =
            DVector::from_iterator(n, usable.iter().map(|sample| sample.alpha - reference_alpha));
        let epsilon_targets = DVector::from_iterator(
            n,
            usable.iter().map(|sample| sample.epsilon - reference_epsilon),
        );

        let alpha_slope = cholesky.solve(&(centered.transpose() * alpha_targets));
        let epsilon_slope = cholesky.solve(&(centered.transpose() * epsilon_targets));

        Some(Self {
            system: system.to_string(),
            reference_features: means,
            reference_alpha,
            reference_epsilon,
            alpha_slope: alpha_slope.iter().copied().collect(),
            epsilon_slope: epsilon_slope.iter().copied().collect(),
            samples: n,
        })
    }

    /// Normalised numeric features one bounded step from the reference toward `target`.
    pub fn step_toward(&self, target: &PropertyTarget, max_step: f64) -> Vec<f64> {
        let dimension = self.reference_features.len();
        let mut step = vec![0.0_f64; dimension];

        for (slope, delta) in [
            (&self.alpha_slope, target.alpha - self.reference_alpha),
            (&self.epsilon_slope, target.epsilon - self.reference_epsilon),
        ] {
            let squared_norm = slope.iter().map(|value| value * value).sum::<f64>();
            if squared_norm <= 1e-9 || slope.len() != dimension {
                continue;
            }
            for (index, value) in slope.iter().enumerate() {
                step[index] += delta / squared_norm * value;
            }
        }

        let length = step.iter().map(|value| value * value).sum::<f64>().sqrt();
        let scale = if length > max_step && length > 0.0 {
            max_step / length
        } else {
            1.0
        };

        self.reference_features
            .iter()
            .zip(step)
            .map(|(reference, delta)| (reference + delta * scale).clamp(0.0, 1.0))
            .collect()
    }
}
