use crate::model::{NumericParam, ObjectiveScores, Recipe, Waveform};
use crate::space::{Interval, SystemSpace};

/// Thickness at which the mass proxy reaches 1 - 1/e, in µm.
const MASS_SCALE_UM: f64 = 25.0;
const UNIFORMITY_SOFT_MARGIN: f64 = 0.08;
const BIPOLAR_UNIFORMITY_BONUS: f64 = 0.1;

/// Delivered charge per unit area in A·min/dm².
pub fn charge_density(recipe: &Recipe) -> f64 {
    recipe.current_density_a_dm2 * recipe.duty_cycle_pct / 100.0 * recipe.time_min
}

pub fn thickness_proxy_um(space: &SystemSpace, recipe: &Recipe) -> f64 {
    space.thickness_coefficient * charge_density(recipe)
}

pub fn mass_proxy(thickness_um: f64) -> f64 {
    1.0 - (-thickness_um.max(0.0) / MASS_SCALE_UM).exp()
}

pub fn uniformity_penalty(space: &SystemSpace, recipe: &Recipe) -> f64 {
    let window = &space.uniformity;
    let frequency = window_term(
        &window.frequency_hz,
        &space.bounds(NumericParam::FrequencyHz),
        recipe.frequency_hz,
    );
    let duty = window_term(
        &window.duty_cycle_pct,
        &space.bounds(NumericParam::DutyCyclePct),
        recipe.duty_cycle_pct,
    );

    let bonus = if recipe.waveform == Waveform::Bipolar {
        BIPOLAR_UNIFORMITY_BONUS
    } else {
        0.0
    };

    (0.5 * frequency + 0.5 * duty - bonus).clamp(0.0, 1.0)
}

fn window_term(window: &Interval, range: &Interval, value: f64) -> f64 {
    if range.width() <= 0.0 {
        return 0.0;
    }
    let distance = window.distance(value) / range.width();
    distance / (distance + UNIFORMITY_SOFT_MARGIN)
}

/// Auxiliary objectives; `rule_penalty` is filled in from the constraint report.
pub fn evaluate(space: &SystemSpace, recipe: &Recipe, rule_penalty: f64) -> ObjectiveScores {
    let thickness = thickness_proxy_um(space, recipe);
    ObjectiveScores {
        charge_density: charge_density(recipe),
        thickness_proxy_um: thickness,
        mass_proxy: mass_proxy(thickness),
        uniformity_penalty: uniformity_penalty(space, recipe),
        rule_penalty,
    }
}
