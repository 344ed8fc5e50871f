use serde::{Deserialize, Serialize};

use crate::error::AdvisorError;
use crate::model::GenerationStrategy;

/// Relative shares of the candidate strategies; perturbation takes the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationMix {
    pub template_share: f64,
    pub directed_share: f64,
}

impl Default for GenerationMix {
    fn default() -> Self {
        Self {
            template_share: 0.25,
            directed_share: 0.25,
        }
    }
}

impl GenerationMix {
    pub fn validate(&self) -> Result<(), AdvisorError> {
        let shares = [self.template_share, self.directed_share];
        if shares
            .iter()
            .any(|share| !share.is_finite() || *share < 0.0 || *share > 1.0)
            || self.template_share + self.directed_share > 1.0
        {
            return Err(AdvisorError::invalid_request(format!(
                "generation mix shares must lie in [0, 1] and sum to at most 1 (template={}, directed={})",
                self.template_share, self.directed_share
            )));
        }
        Ok(())
    }
}

/// Deterministic interleaving of strategies for `n` slots. Each slot goes to the
/// strategy furthest behind its quota; ties resolve in declaration order.
pub(super) fn strategy_schedule(
    n: usize,
    mix: &GenerationMix,
    directed_available: bool,
) -> Vec<GenerationStrategy> {
    if n == 0 {
        return Vec::new();
    }

    let template = ((n as f64) * mix.template_share).round() as usize;
    let template = template.min(n);
    let directed = if directed_available {
        (((n as f64) * mix.directed_share).round() as usize).min(n - template)
    } else {
        0
    };
    let perturbation = n - template - directed;

    let quotas = [
        (GenerationStrategy::Template, template),
        (GenerationStrategy::Perturbation, perturbation),
        (GenerationStrategy::Directed, directed),
    ];
    let mut used = [0_usize; 3];
    let mut schedule = Vec::<GenerationStrategy>::with_capacity(n);

    for slot in 0..n {
        let progress = (slot + 1) as f64 / n as f64;
        let mut best: Option<(usize, f64)> = None;
        for (index, (_, quota)) in quotas.iter().enumerate() {
            if used[index] >= *quota {
                continue;
            }
            let deficit = *quota as f64 * progress - used[index] as f64;
            if best.is_none_or(|(_, current)| deficit > current) {
                best = Some((index, deficit));
            }
        }

        let Some((index, _)) = best else {
            break;
        };
        used[index] += 1;
        schedule.push(quotas[index].0);
    }

    schedule
}
