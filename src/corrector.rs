use nalgebra::{DMatrix, DVector};
use tracing::warn;

/// Below this many examples the corrector passes raw predictions through.
pub const MIN_TRAINING_EXAMPLES: usize = 3;

const LENGTH_SCALE: f64 = 0.35;
const NOISE_FRACTION: f64 = 0.05;
const VARIANCE_FLOOR: f64 = 1e-4;
const MAX_JITTER_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingExample {
    pub features: Vec<f64>,
    pub measured: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    pub value: f64,
    pub corrected: bool,
}

/// Gaussian-process residual corrector over normalised recipe features.
///
/// The posterior mean is blended with the raw prediction using the fraction of
/// prior variance the training data explains at the query point, so far from
/// any measurement the raw prediction wins.
#[derive(Debug, Clone)]
pub struct ResidualCorrector {
    state: CorrectorState,
    output_range: (f64, f64),
}

#[derive(Debug, Clone)]
enum CorrectorState {
    Passthrough,
    Trained(GaussianProcess),
}

#[derive(Debug, Clone)]
struct GaussianProcess {
    inputs: Vec<Vec<f64>>,
    prior_mean: f64,
    signal_variance: f64,
    lower: DMatrix<f64>,
    weights: DVector<f64>,
}

impl Default for ResidualCorrector {
    fn default() -> Self {
        Self::passthrough()
    }
}

impl ResidualCorrector {
    pub fn passthrough() -> Self {
        Self {
            state: CorrectorState::Passthrough,
            output_range: (f64::NEG_INFINITY, f64::INFINITY),
        }
    }

    pub fn fit(examples: &[TrainingExample]) -> Self {
        let Some(dimension) = examples.first().map(|example| example.features.len()) else {
            return Self::passthrough();
        };
        let usable = examples
            .iter()
            .filter(|example| {
                example.features.len() == dimension
                    && example.measured.is_finite()
                    && example.features.iter().all(|value| value.is_finite())
            })
            .collect::<Vec<&TrainingExample>>();

        if usable.len() < MIN_TRAINING_EXAMPLES {
            return Self::passthrough();
        }

        let n = usable.len();
        let prior_mean = usable.iter().map(|example| example.measured).sum::<f64>() / n as f64;
        let variance = usable
            .iter()
            .map(|example| (example.measured - prior_mean).powi(2))
            .sum::<f64>()
            / n as f64;
        let signal_variance = variance.max(VARIANCE_FLOOR);
        let inputs = usable
            .iter()
            .map(|example| example.features.clone())
            .collect::<Vec<Vec<f64>>>();
        let centered = DVector::from_iterator(
            n,
            usable.iter().map(|example| example.measured - prior_mean),
        );

        let mut noise = NOISE_FRACTION * signal_variance;
        for attempt in 0..MAX_JITTER_ATTEMPTS {
            let gram = DMatrix::from_fn(n, n, |row, col| {
                let value = rbf(&inputs[row], &inputs[col], signal_variance);
                if row == col { value + noise } else { value }
            });

            if let Some(cholesky) = gram.cholesky() {
                let weights = cholesky.solve(&centered);
                return Self {
                    state: CorrectorState::Trained(GaussianProcess {
                        inputs,
                        prior_mean,
                        signal_variance,
                        lower: cholesky.l(),
                        weights,
                    }),
                    output_range: (f64::NEG_INFINITY, f64::INFINITY),
                };
            }

            warn!(attempt, noise, "gram matrix not positive definite, adding jitter");
            noise *= 10.0;
        }

        warn!(examples = n, "residual corrector fit failed, using passthrough");
        Self::passthrough()
    }

    /// Clips corrected (never passthrough) outputs to a physical range.
    pub fn with_output_range(mut self, min: f64, max: f64) -> Self {
        self.output_range = (min, max);
        self
    }

    pub fn is_trained(&self) -> bool {
        matches!(self.state, CorrectorState::Trained(_))
    }

    pub fn training_size(&self) -> usize {
        match &self.state {
            CorrectorState::Passthrough => 0,
            CorrectorState::Trained(process) => process.inputs.len(),
        }
    }

    pub fn predict(&self, raw_prediction: f64, features: &[f64]) -> f64 {
        self.correct(raw_prediction, features).value
    }

    pub fn correct(&self, raw_prediction: f64, features: &[f64]) -> Correction {
        let passthrough = Correction {
            value: raw_prediction,
            corrected: false,
        };

        let CorrectorState::Trained(process) = &self.state else {
            return passthrough;
        };
        let Some((mean, variance)) = process.posterior(features) else {
            return passthrough;
        };

        let weight = (1.0 - variance / process.signal_variance).clamp(0.0, 1.0);
        let blended = weight * mean + (1.0 - weight) * raw_prediction;
        let (min, max) = self.output_range;

        Correction {
            value: blended.clamp(min, max),
            corrected: true,
        }
    }
}

impl GaussianProcess {
    fn posterior(&self, features: &[f64]) -> Option<(f64, f64)> {
        if self.inputs.first().map(Vec::len) != Some(features.len()) {
            return None;
        }

        let cross = DVector::from_iterator(
            self.inputs.len(),
            self.inputs
                .iter()
                .map(|input| rbf(input, features, self.signal_variance)),
        );
        let mean = self.prior_mean + cross.dot(&self.weights);
        let projected = self.lower.solve_lower_triangular(&cross)?;
        let variance = (self.signal_variance - projected.dot(&projected)).max(0.0);

        Some((mean, variance))
    }
}

fn rbf(left: &[f64], right: &[f64], signal_variance: f64) -> f64 {
    let squared = left
        .iter()
        .zip(right.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum::<f64>();
    signal_variance * (-squared / (2.0 * LENGTH_SCALE * LENGTH_SCALE)).exp()
}
