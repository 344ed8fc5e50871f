use rand::prelude::*;
use rand::rngs::StdRng;
use tracing::debug;

use crate::error::AdvisorError;
use crate::model::{
    AdditiveDose, GenerationStrategy, NumericParam, PropertyTarget, Recipe, RecipeCandidate,
    Waveform,
};
use crate::space::SystemSpace;

mod hint;
mod strategy;
#[cfg(test)]
mod tests;

pub use hint::{GradientHint, HintSample, MIN_HINT_SAMPLES};
pub use strategy::GenerationMix;

use strategy::strategy_schedule;

/// Perturbation half-width as a fraction of each parameter range.
const PERTURBATION_SPREAD: f64 = 0.15;
const CONCENTRATION_JITTER: f64 = 0.2;
const BIPOLAR_PROBABILITY: f64 = 0.7;
const OPTIONAL_FLUORIDE_PROBABILITY: f64 = 0.3;
const DIRECTED_MAX_STEP: f64 = 0.25;
const DIRECTED_JITTER: f64 = 0.03;

/// Clarified choices every generated recipe must respect.
#[derive(Debug, Clone, PartialEq)]
pub struct RecipePreferences {
    pub substrate_alloy: Option<String>,
    pub allow_fluoride: bool,
}

impl Default for RecipePreferences {
    fn default() -> Self {
        Self {
            substrate_alloy: None,
            allow_fluoride: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CandidateGenerator {
    mix: GenerationMix,
    hint: Option<GradientHint>,
    preferences: RecipePreferences,
}

impl CandidateGenerator {
    pub fn new(mix: GenerationMix) -> Self {
        Self {
            mix,
            hint: None,
            preferences: RecipePreferences::default(),
        }
    }

    pub fn with_hint(mut self, hint: Option<GradientHint>) -> Self {
        self.hint = hint;
        self
    }

    pub fn with_preferences(mut self, preferences: RecipePreferences) -> Self {
        self.preferences = preferences;
        self
    }

    /// Produces `n` candidates. The same arguments always yield the same list.
    pub fn generate(
        &self,
        space: &SystemSpace,
        target: &PropertyTarget,
        n: usize,
        seed: u64,
    ) -> Result<Vec<RecipeCandidate>, AdvisorError> {
        self.mix.validate()?;
        if space.templates.is_empty() {
            return Err(AdvisorError::invalid_request(format!(
                "system {} has no recipe templates",
                space.system
            )));
        }

        let hint = self
            .hint
            .as_ref()
            .filter(|hint| hint.system.eq_ignore_ascii_case(&space.system));
        let schedule = strategy_schedule(n, &self.mix, hint.is_some());
        let mut rng = StdRng::seed_from_u64(seed);
        let mut template_cursor = 0_usize;
        let mut candidates = Vec::<RecipeCandidate>::with_capacity(n);

        for (index, strategy) in schedule.into_iter().enumerate() {
            let recipe = match (strategy, hint) {
                (GenerationStrategy::Template, _) => {
                    let template = &space.templates[template_cursor % space.templates.len()];
                    template_cursor += 1;
                    template.recipe.clone()
                }
                (GenerationStrategy::Directed, Some(hint)) => {
                    self.directed_recipe(space, hint, target, &mut rng)
                }
                _ => self.perturbed_recipe(space, &mut rng),
            };

            let recipe = self.finish_recipe(space, recipe);
            let candidate_id = format!("cand-{seed}-{index:03}");
            space
                .contains(&recipe)
                .map_err(|reason| AdvisorError::GeneratedOutOfBounds {
                    candidate_id: candidate_id.clone(),
                    reason,
                })?;

            debug!(candidate_id = %candidate_id, strategy = ?strategy, "generated candidate");
            candidates.push(RecipeCandidate {
                candidate_id,
                strategy,
                description: recipe.describe(),
                recipe,
            });
        }

        Ok(candidates)
    }

    fn perturbed_recipe(&self, space: &SystemSpace, rng: &mut StdRng) -> Recipe {
        let base = &space.templates[rng.gen_range(0..space.templates.len())].recipe;
        let mut recipe = base.clone();

        for param in NumericParam::ALL {
            let bounds = space.bounds(param);
            let spread = PERTURBATION_SPREAD * bounds.width();
            let offset = if spread > 0.0 {
                rng.gen_range(-spread..=spread)
            } else {
                0.0
            };
            recipe.set_value(param, bounds.clamp(base.value(param) + offset));
        }

        recipe.waveform = if rng.gen_bool(BIPOLAR_PROBABILITY) {
            Waveform::Bipolar
        } else {
            Waveform::Unipolar
        };

        for dose in &mut recipe.additives {
            let factor = rng.gen_range((1.0 - CONCENTRATION_JITTER)..=(1.0 + CONCENTRATION_JITTER));
            dose.concentration_g_l *= factor;
        }

        let add_fluoride = rng.gen_bool(OPTIONAL_FLUORIDE_PROBABILITY);
        let has_fluoride = recipe
            .additives
            .iter()
            .any(|dose| space.is_fluoride(&dose.compound));
        if add_fluoride && !has_fluoride {
            if let Some(spec) = space.additives.iter().find(|spec| spec.fluoride) {
                recipe.additives.push(AdditiveDose {
                    compound: spec.compound.clone(),
                    concentration_g_l: spec.concentration_g_l.denormalize(0.5),
                });
            }
        }

        recipe
    }

    fn directed_recipe(
        &self,
        space: &SystemSpace,
        hint: &GradientHint,
        target: &PropertyTarget,
        rng: &mut StdRng,
    ) -> Recipe {
        let mut recipe = space.defaults.clone();
        let stepped = hint.step_toward(target, DIRECTED_MAX_STEP);

        for (param, fraction) in NumericParam::ALL.into_iter().zip(stepped) {
            let jitter = rng.gen_range(-DIRECTED_JITTER..=DIRECTED_JITTER);
            recipe.set_value(param, space.bounds(param).denormalize(fraction + jitter));
        }

        recipe
    }

    /// Applies clarified preferences, rounds to instrument resolution and clamps.
    fn finish_recipe(&self, space: &SystemSpace, mut recipe: Recipe) -> Recipe {
        if let Some(alloy) = &self.preferences.substrate_alloy {
            recipe.substrate_alloy = alloy.clone();
        }
        if !self.preferences.allow_fluoride {
            recipe
                .additives
                .retain(|dose| !space.is_fluoride(&dose.compound));
        }

        for param in NumericParam::ALL {
            let rounded = round_to(recipe.value(param), resolution(param));
            recipe.set_value(param, rounded);
        }
        for dose in &mut recipe.additives {
            dose.concentration_g_l = round_to(dose.concentration_g_l, 0.1);
        }

        space.conform(&recipe)
    }
}

fn resolution(param: NumericParam) -> f64 {
    match param {
        NumericParam::VoltageV => 1.0,
        NumericParam::CurrentDensityADm2 => 0.1,
        NumericParam::FrequencyHz => 10.0,
        NumericParam::DutyCyclePct => 0.5,
        NumericParam::TimeMin => 0.5,
    }
}

fn round_to(value: f64, step: f64) -> f64 {
    (value / step).round() * step
}
