use std::sync::Arc;

use async_trait::async_trait;

use crate::external::{CitationRetriever, ExternalError, ForwardPredictor, RawPrediction};
use crate::model::{Recipe, Waveform};
use crate::registry::{ALPHA_RANGE, EPSILON_RANGE};

/// Passages averaged into the similarity-derived confidence.
const CONFIDENCE_TOP_K: usize = 3;

/// Heuristic forward model: per-system baselines nudged by process trends.
/// Confidence is the mean similarity of the closest literature passages.
pub struct BaselinePredictor {
    retriever: Arc<dyn CitationRetriever>,
}

impl BaselinePredictor {
    pub fn new(retriever: Arc<dyn CitationRetriever>) -> Self {
        Self { retriever }
    }
}

fn baseline(system: &str) -> (f64, f64) {
    match system {
        "silicate" => (0.15, 0.82),
        "zirconate" => (0.12, 0.88),
        _ => (0.14, 0.85),
    }
}

pub fn heuristic_properties(recipe: &Recipe) -> (f64, f64) {
    let (mut alpha, mut epsilon) = baseline(&recipe.system);

    if recipe.voltage_v > 400.0 {
        alpha += 0.02;
        epsilon -= 0.02;
    } else if recipe.voltage_v < 300.0 {
        alpha -= 0.01;
        epsilon += 0.01;
    }

    // Longer treatment grows a thicker, darker layer; higher duty densifies it.
    alpha += 0.03 * (recipe.time_min / 40.0 - 0.5);
    epsilon += 0.02 * (recipe.duty_cycle_pct / 45.0 - 0.5);

    if recipe.waveform == Waveform::Bipolar {
        epsilon += 0.01;
    }
    if recipe.has_additive("KF") || recipe.has_additive("NaF") {
        alpha -= 0.01;
        epsilon += 0.01;
    }

    (
        alpha.clamp(ALPHA_RANGE.0, ALPHA_RANGE.1),
        epsilon.clamp(EPSILON_RANGE.0, EPSILON_RANGE.1),
    )
}

#[async_trait]
impl ForwardPredictor for BaselinePredictor {
    async fn predict(
        &self,
        recipe_text: &str,
        recipe: &Recipe,
    ) -> Result<RawPrediction, ExternalError> {
        let (alpha, epsilon) = heuristic_properties(recipe);
        let hits = self.retriever.search(recipe_text, CONFIDENCE_TOP_K).await?;

        let confidence = if hits.is_empty() {
            0.0
        } else {
            hits.iter().map(|hit| hit.similarity_score).sum::<f64>() / hits.len() as f64
        };

        Ok(RawPrediction {
            alpha,
            epsilon,
            confidence: confidence.clamp(0.0, 1.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::{BaselinePredictor, heuristic_properties};
    use crate::external::{CitationRetriever, ExternalError, ForwardPredictor};
    use crate::model::Citation;
    use crate::space::ParameterSpace;

    struct FixedRetriever {
        scores: Vec<f64>,
    }

    #[async_trait]
    impl CitationRetriever for FixedRetriever {
        async fn search(&self, _query: &str, top_k: usize) -> Result<Vec<Citation>, ExternalError> {
            Ok(self
                .scores
                .iter()
                .take(top_k)
                .enumerate()
                .map(|(index, score)| Citation {
                    source_id: format!("doc-{index}"),
                    page: 1,
                    similarity_score: *score,
                    excerpt: String::new(),
                })
                .collect())
        }
    }

    #[test]
    fn high_voltage_raises_absorptance_and_lowers_emissivity() {
        let space = ParameterSpace::builtin();
        let mut recipe = space.lookup("silicate").expect("registered").defaults.clone();
        recipe.voltage_v = 350.0;
        let (alpha_mid, epsilon_mid) = heuristic_properties(&recipe);
        recipe.voltage_v = 480.0;
        let (alpha_high, epsilon_high) = heuristic_properties(&recipe);

        assert!(alpha_high > alpha_mid);
        assert!(epsilon_high < epsilon_mid);
    }

    #[tokio::test]
    async fn confidence_is_mean_of_top_similarities() {
        let space = ParameterSpace::builtin();
        let recipe = space.lookup("zirconate").expect("registered").defaults.clone();
        let predictor = BaselinePredictor::new(Arc::new(FixedRetriever {
            scores: vec![0.9, 0.6, 0.3, 0.1],
        }));

        let prediction = predictor
            .predict(&recipe.describe(), &recipe)
            .await
            .expect("prediction succeeds");
        assert!((prediction.confidence - 0.6).abs() < 1e-9);

        let empty = BaselinePredictor::new(Arc::new(FixedRetriever { scores: Vec::new() }));
        let prediction = empty
            .predict(&recipe.describe(), &recipe)
            .await
            .expect("prediction succeeds");
        assert_eq!(prediction.confidence, 0.0);
    }
}
