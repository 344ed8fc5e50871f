use crate::model::{ConstraintViolation, NumericParam, Recipe, Severity};
use crate::objectives::{charge_density, thickness_proxy_um};
use crate::space::{CHARGE_DENSITY_CEILING, Interval, SystemSpace};

/// Device range for a single pulse on-time, in microseconds.
pub const PULSE_ON_TIME_RANGE_US: Interval = Interval::new(150.0, 2000.0);

/// Fraction of a parameter range, measured from either edge, that counts as near-bound.
const NEAR_BOUND_FRACTION: f64 = 0.05;
const NEAR_BOUND_MAX_PENALTY: f64 = 0.1;

/// Clarified facts the rules depend on. The `*_pending` flags mark values that
/// came from a documented default rather than an accepted answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintContext {
    pub fluoride_allowed: bool,
    pub fluoride_pending: bool,
    pub thickness_limit_um: Interval,
    pub thickness_pending: bool,
}

impl Default for ConstraintContext {
    fn default() -> Self {
        Self {
            fluoride_allowed: true,
            fluoride_pending: false,
            thickness_limit_um: Interval::new(0.0, f64::INFINITY),
            thickness_pending: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintReport {
    pub passed: bool,
    pub violations: Vec<ConstraintViolation>,
    pub rule_penalty: f64,
}

struct RuleInput<'a> {
    space: &'a SystemSpace,
    context: &'a ConstraintContext,
    recipe: &'a Recipe,
}

type Rule = fn(&RuleInput<'_>, &mut Vec<ConstraintViolation>);

/// Evaluated in this order, every rule on every candidate.
const RULES: &[(&str, Rule)] = &[
    ("param_bounds", check_param_bounds),
    ("additive_allowed", check_additive_allowed),
    ("additive_concentration", check_additive_concentration),
    ("exclusive_additives", check_exclusive_additives),
    ("pulse_window", check_pulse_window),
    ("charge_density_ceiling", check_charge_density),
    ("substrate_allowed", check_substrate),
    ("thickness_limit", check_thickness_limit),
    ("near_bound", check_near_bound),
];

pub fn rule_ids() -> Vec<&'static str> {
    RULES.iter().map(|(id, _)| *id).collect()
}

#[derive(Debug, Clone)]
pub struct HardConstraintChecker<'a> {
    space: &'a SystemSpace,
    context: ConstraintContext,
}

impl<'a> HardConstraintChecker<'a> {
    pub fn new(space: &'a SystemSpace, context: ConstraintContext) -> Self {
        Self { space, context }
    }

    pub fn check(&self, recipe: &Recipe) -> ConstraintReport {
        let input = RuleInput {
            space: self.space,
            context: &self.context,
            recipe,
        };

        let mut violations = Vec::<ConstraintViolation>::new();
        for (_, rule) in RULES {
            rule(&input, &mut violations);
        }

        let passed = !violations
            .iter()
            .any(|violation| violation.severity == Severity::Hard);
        let rule_penalty = violations
            .iter()
            .filter(|violation| violation.severity == Severity::Soft)
            .map(|violation| violation.penalty)
            .sum::<f64>();

        ConstraintReport {
            passed,
            violations,
            rule_penalty,
        }
    }
}

fn hard(rule_id: &str, description: String) -> ConstraintViolation {
    ConstraintViolation {
        rule_id: rule_id.to_string(),
        description,
        severity: Severity::Hard,
        penalty: 0.0,
        pending_expert: false,
    }
}

fn check_param_bounds(input: &RuleInput<'_>, out: &mut Vec<ConstraintViolation>) {
    for param in NumericParam::ALL {
        let bounds = input.space.bounds(param);
        let value = input.recipe.value(param);
        if !value.is_finite() || !bounds.contains(value) {
            out.push(hard(
                "param_bounds",
                format!("{param}={value} outside [{}, {}]", bounds.min, bounds.max),
            ));
        }
    }
}

fn check_additive_allowed(input: &RuleInput<'_>, out: &mut Vec<ConstraintViolation>) {
    for dose in &input.recipe.additives {
        if input.space.is_forbidden(&dose.compound) {
            out.push(hard(
                "additive_allowed",
                format!("{} is a forbidden compound", dose.compound),
            ));
        } else if input.space.additive(&dose.compound).is_none() {
            out.push(hard(
                "additive_allowed",
                format!(
                    "{} is not an allowed additive for {}",
                    dose.compound, input.space.system
                ),
            ));
        } else if input.space.is_fluoride(&dose.compound) && !input.context.fluoride_allowed {
            // Generated candidates never carry excluded fluoride; only recipes
            // handed to `check` directly reach this branch.
            let mut violation = hard(
                "additive_allowed",
                format!("{} adds free fluoride, which is excluded", dose.compound),
            );
            violation.pending_expert = input.context.fluoride_pending;
            out.push(violation);
        }
    }
}

fn check_additive_concentration(input: &RuleInput<'_>, out: &mut Vec<ConstraintViolation>) {
    for dose in &input.recipe.additives {
        let Some(spec) = input.space.additive(&dose.compound) else {
            continue;
        };
        if !spec.concentration_g_l.contains(dose.concentration_g_l) {
            out.push(hard(
                "additive_concentration",
                format!(
                    "{} at {:.2} g/L outside [{}, {}]",
                    dose.compound,
                    dose.concentration_g_l,
                    spec.concentration_g_l.min,
                    spec.concentration_g_l.max
                ),
            ));
        }
    }
}

fn check_exclusive_additives(input: &RuleInput<'_>, out: &mut Vec<ConstraintViolation>) {
    for (left, right) in &input.space.exclusive_pairs {
        if input.recipe.has_additive(left) && input.recipe.has_additive(right) {
            out.push(hard(
                "exclusive_additives",
                format!("{left} and {right} must not be combined"),
            ));
        }
    }
}

/// On-time of one pulse in microseconds.
pub fn pulse_on_time_us(recipe: &Recipe) -> f64 {
    if recipe.frequency_hz <= 0.0 {
        return f64::INFINITY;
    }
    recipe.duty_cycle_pct / 100.0 / recipe.frequency_hz * 1e6
}

fn check_pulse_window(input: &RuleInput<'_>, out: &mut Vec<ConstraintViolation>) {
    let on_time = pulse_on_time_us(input.recipe);
    if !PULSE_ON_TIME_RANGE_US.contains(on_time) {
        out.push(hard(
            "pulse_window",
            format!(
                "pulse on-time {on_time:.0} us ({:.0}% at {:.0} Hz, {}) outside device range [{}, {}] us",
                input.recipe.duty_cycle_pct,
                input.recipe.frequency_hz,
                input.recipe.waveform.as_str(),
                PULSE_ON_TIME_RANGE_US.min,
                PULSE_ON_TIME_RANGE_US.max
            ),
        ));
    }
}

fn check_charge_density(input: &RuleInput<'_>, out: &mut Vec<ConstraintViolation>) {
    let charge = charge_density(input.recipe);
    if charge > CHARGE_DENSITY_CEILING {
        out.push(hard(
            "charge_density_ceiling",
            format!("charge density {charge:.1} A·min/dm² exceeds {CHARGE_DENSITY_CEILING}"),
        ));
    }
}

fn check_substrate(input: &RuleInput<'_>, out: &mut Vec<ConstraintViolation>) {
    if !input.space.supports_substrate(&input.recipe.substrate_alloy) {
        out.push(hard(
            "substrate_allowed",
            format!(
                "substrate {} is not qualified for {}",
                input.recipe.substrate_alloy, input.space.system
            ),
        ));
    }
}

fn check_thickness_limit(input: &RuleInput<'_>, out: &mut Vec<ConstraintViolation>) {
    let thickness = thickness_proxy_um(input.space, input.recipe);
    let limit = input.context.thickness_limit_um;
    if !limit.contains(thickness) {
        let mut violation = hard(
            "thickness_limit",
            format!(
                "estimated thickness {thickness:.1} um outside [{}, {}] um",
                limit.min, limit.max
            ),
        );
        violation.pending_expert = input.context.thickness_pending;
        out.push(violation);
    }
}

fn check_near_bound(input: &RuleInput<'_>, out: &mut Vec<ConstraintViolation>) {
    for param in NumericParam::ALL {
        let bounds = input.space.bounds(param);
        let value = input.recipe.value(param);
        if !bounds.contains(value) || bounds.width() <= 0.0 {
            continue;
        }

        let margin = NEAR_BOUND_FRACTION * bounds.width();
        let edge_distance = (value - bounds.min).min(bounds.max - value);
        if edge_distance < margin {
            let proximity = 1.0 - edge_distance / margin;
            out.push(ConstraintViolation {
                rule_id: "near_bound".to_string(),
                description: format!(
                    "{param}={value:.2} within {:.0}% of [{}, {}]",
                    NEAR_BOUND_FRACTION * 100.0,
                    bounds.min,
                    bounds.max
                ),
                severity: Severity::Soft,
                penalty: NEAR_BOUND_MAX_PENALTY * proximity,
                pending_expert: false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConstraintContext, HardConstraintChecker, rule_ids};
    use crate::model::{AdditiveDose, Severity};
    use crate::space::{Interval, ParameterSpace};

    fn rule_hits(report: &super::ConstraintReport, rule_id: &str) -> usize {
        report
            .violations
            .iter()
            .filter(|violation| violation.rule_id == rule_id)
            .count()
    }

    #[test]
    fn template_recipes_pass_cleanly() {
        let space = ParameterSpace::builtin();
        let silicate = space.lookup("silicate").expect("registered");
        let checker = HardConstraintChecker::new(silicate, ConstraintContext::default());
        for template in &silicate.templates {
            let report = checker.check(&template.recipe);
            assert!(report.passed, "{}: {:?}", template.name, report.violations);
        }
    }

    #[test]
    fn every_rule_runs_without_short_circuit() {
        let space = ParameterSpace::builtin();
        let silicate = space.lookup("silicate").expect("registered");
        let mut recipe = silicate.defaults.clone();
        recipe.voltage_v = 700.0;
        recipe.frequency_hz = 200.0;
        recipe.duty_cycle_pct = 45.0;
        recipe.current_density_a_dm2 = 15.0;
        recipe.time_min = 40.0;
        recipe.substrate_alloy = "WE43".to_string();
        recipe.additives.push(AdditiveDose {
            compound: "Cr6+".to_string(),
            concentration_g_l: 1.0,
        });
        recipe.additives.push(AdditiveDose {
            compound: "KF".to_string(),
            concentration_g_l: 9.0,
        });
        recipe.additives.push(AdditiveDose {
            compound: "NaF".to_string(),
            concentration_g_l: 1.0,
        });

        let checker = HardConstraintChecker::new(silicate, ConstraintContext::default());
        let report = checker.check(&recipe);

        assert!(!report.passed);
        for rule in [
            "param_bounds",
            "additive_allowed",
            "additive_concentration",
            "exclusive_additives",
            "pulse_window",
            "charge_density_ceiling",
            "substrate_allowed",
        ] {
            assert!(rule_hits(&report, rule) > 0, "rule {rule} should have fired");
        }
        assert_eq!(rule_ids().len(), 9);
    }

    #[test]
    fn excluded_fluoride_is_pending_expert_only_when_defaulted() {
        let space = ParameterSpace::builtin();
        let silicate = space.lookup("silicate").expect("registered");
        let recipe = silicate.templates[1].recipe.clone();
        assert!(recipe.has_additive("KF"));

        let answered = ConstraintContext {
            fluoride_allowed: false,
            ..ConstraintContext::default()
        };
        let report = HardConstraintChecker::new(silicate, answered).check(&recipe);
        assert!(!report.passed);
        assert!(report.violations.iter().all(|v| !v.pending_expert));

        let defaulted = ConstraintContext {
            fluoride_allowed: false,
            fluoride_pending: true,
            ..ConstraintContext::default()
        };
        let report = HardConstraintChecker::new(silicate, defaulted).check(&recipe);
        assert!(!report.passed);
        assert!(
            report
                .violations
                .iter()
                .filter(|v| v.severity == Severity::Hard)
                .all(|v| v.pending_expert)
        );
    }

    #[test]
    fn near_bound_values_are_soft_penalties() {
        let space = ParameterSpace::builtin();
        let silicate = space.lookup("silicate").expect("registered");
        let mut recipe = silicate.defaults.clone();
        recipe.voltage_v = 518.0;

        let report =
            HardConstraintChecker::new(silicate, ConstraintContext::default()).check(&recipe);
        assert!(report.passed);
        assert_eq!(rule_hits(&report, "near_bound"), 1);
        assert!(report.rule_penalty > 0.0 && report.rule_penalty <= 0.1);
    }

    #[test]
    fn thickness_outside_clarified_limit_is_hard() {
        let space = ParameterSpace::builtin();
        let silicate = space.lookup("silicate").expect("registered");
        let context = ConstraintContext {
            thickness_limit_um: Interval::new(0.0, 10.0),
            ..ConstraintContext::default()
        };
        let report = HardConstraintChecker::new(silicate, context).check(&silicate.defaults);
        assert!(!report.passed);
        assert_eq!(rule_hits(&report, "thickness_limit"), 1);
    }
}
