use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::AdvisorError;
use crate::model::{AdditiveDose, BoundsOverride, NumericParam, PostTreatment, Recipe, Waveform};

/// Upper limit on delivered charge per unit area, in A·min/dm².
pub const CHARGE_DENSITY_CEILING: f64 = 80.0;

/// Numeric features plus the bipolar-waveform indicator.
pub const FEATURE_COUNT: usize = NumericParam::ALL.len() + 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Interval {
    pub min: f64,
    pub max: f64,
}

impl Interval {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }

    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    pub fn normalize(&self, value: f64) -> f64 {
        if self.width() <= 0.0 {
            return 0.5;
        }
        ((value - self.min) / self.width()).clamp(0.0, 1.0)
    }

    pub fn denormalize(&self, fraction: f64) -> f64 {
        self.min + fraction.clamp(0.0, 1.0) * self.width()
    }

    /// Distance to the interval, zero inside.
    pub fn distance(&self, value: f64) -> f64 {
        if value < self.min {
            self.min - value
        } else if value > self.max {
            value - self.max
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdditiveSpec {
    pub compound: String,
    pub concentration_g_l: Interval,
    pub fluoride: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UniformityWindow {
    pub frequency_hz: Interval,
    pub duty_cycle_pct: Interval,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipeTemplate {
    pub name: String,
    pub recipe: Recipe,
}

/// Searchable schema for one electrolyte system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSpace {
    pub system: String,
    pub numeric: BTreeMap<NumericParam, Interval>,
    pub additives: Vec<AdditiveSpec>,
    pub forbidden: Vec<String>,
    pub exclusive_pairs: Vec<(String, String)>,
    pub substrates: Vec<String>,
    pub uniformity: UniformityWindow,
    /// Coating growth per unit charge, µm per A·min/dm².
    pub thickness_coefficient: f64,
    pub defaults: Recipe,
    pub templates: Vec<RecipeTemplate>,
}

#[derive(Debug, Clone)]
pub struct ParameterSpace {
    systems: BTreeMap<String, SystemSpace>,
}

impl Default for ParameterSpace {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ParameterSpace {
    pub fn builtin() -> Self {
        let systems = [silicate_space(), zirconate_space()]
            .into_iter()
            .map(|space| (space.system.clone(), space))
            .collect();
        Self { systems }
    }

    pub fn system_ids(&self) -> Vec<&str> {
        self.systems.keys().map(String::as_str).collect()
    }

    pub fn lookup(&self, system: &str) -> Result<&SystemSpace, AdvisorError> {
        let key = system.trim().to_ascii_lowercase();
        self.systems
            .get(&key)
            .ok_or_else(|| AdvisorError::UnknownSystem {
                system: system.trim().to_string(),
                registered: self.system_ids().join(", "),
            })
    }

    /// Looks up a system and applies an optional narrowing override.
    pub fn resolve(
        &self,
        system: &str,
        bounds_override: Option<&BoundsOverride>,
    ) -> Result<SystemSpace, AdvisorError> {
        let space = self.lookup(system)?;
        match bounds_override {
            Some(value) => space.narrowed(value),
            None => Ok(space.clone()),
        }
    }
}

impl SystemSpace {
    pub fn bounds(&self, param: NumericParam) -> Interval {
        self.numeric
            .get(&param)
            .copied()
            .unwrap_or(Interval::new(0.0, 0.0))
    }

    pub fn additive(&self, compound: &str) -> Option<&AdditiveSpec> {
        self.additives
            .iter()
            .find(|spec| spec.compound.eq_ignore_ascii_case(compound))
    }

    pub fn is_forbidden(&self, compound: &str) -> bool {
        self.forbidden
            .iter()
            .any(|value| value.eq_ignore_ascii_case(compound))
    }

    pub fn is_fluoride(&self, compound: &str) -> bool {
        self.additive(compound).is_some_and(|spec| spec.fluoride)
    }

    pub fn supports_substrate(&self, alloy: &str) -> bool {
        self.substrates
            .iter()
            .any(|value| value.eq_ignore_ascii_case(alloy))
    }

    /// Returns a copy narrowed by `bounds_override`. Widening, inverted intervals
    /// and unknown names are rejected.
    pub fn narrowed(&self, bounds_override: &BoundsOverride) -> Result<SystemSpace, AdvisorError> {
        let mut out = self.clone();

        for (name, [min, max]) in &bounds_override.numeric {
            let param = NumericParam::parse(name)
                .ok_or_else(|| AdvisorError::invalid_override(name, "unknown parameter"))?;
            if !min.is_finite() || !max.is_finite() || min > max {
                return Err(AdvisorError::invalid_override(
                    name,
                    format!("interval [{min}, {max}] is not a closed interval"),
                ));
            }

            let current = self.bounds(param);
            if *min < current.min || *max > current.max {
                return Err(AdvisorError::invalid_override(
                    name,
                    format!(
                        "[{min}, {max}] widens the registered bounds [{}, {}]",
                        current.min, current.max
                    ),
                ));
            }
            out.numeric.insert(param, Interval::new(*min, *max));
        }

        if let Some(allowed) = &bounds_override.additives {
            let mut kept = Vec::<AdditiveSpec>::new();
            for compound in allowed {
                let spec = self.additive(compound).ok_or_else(|| {
                    AdvisorError::invalid_override(
                        compound,
                        "compound is not in the registered allowed set",
                    )
                })?;
                if !kept.iter().any(|value| value.compound == spec.compound) {
                    kept.push(spec.clone());
                }
            }
            out.additives = kept;
        }

        out.defaults = out.conform(&self.defaults);
        out.templates = self
            .templates
            .iter()
            .map(|template| RecipeTemplate {
                name: template.name.clone(),
                recipe: out.conform(&template.recipe),
            })
            .collect();

        Ok(out)
    }

    /// Clamps numerics and concentrations and drops additives this space does not allow.
    pub fn conform(&self, recipe: &Recipe) -> Recipe {
        let mut out = recipe.clone();
        out.system = self.system.clone();
        for param in NumericParam::ALL {
            out.set_value(param, self.bounds(param).clamp(recipe.value(param)));
        }
        out.additives = recipe
            .additives
            .iter()
            .filter_map(|dose| {
                self.additive(&dose.compound).map(|spec| AdditiveDose {
                    compound: spec.compound.clone(),
                    concentration_g_l: spec.concentration_g_l.clamp(dose.concentration_g_l),
                })
            })
            .collect();
        out
    }

    /// Checks every numeric parameter and additive concentration against this space.
    pub fn contains(&self, recipe: &Recipe) -> Result<(), String> {
        if !recipe.system.eq_ignore_ascii_case(&self.system) {
            return Err(format!(
                "recipe belongs to system '{}', expected '{}'",
                recipe.system, self.system
            ));
        }

        for param in NumericParam::ALL {
            let bounds = self.bounds(param);
            let value = recipe.value(param);
            if !value.is_finite() || !bounds.contains(value) {
                return Err(format!(
                    "{param}={value} outside [{}, {}]",
                    bounds.min, bounds.max
                ));
            }
        }

        for dose in &recipe.additives {
            let Some(spec) = self.additive(&dose.compound) else {
                return Err(format!("additive {} is not allowed", dose.compound));
            };
            if !spec.concentration_g_l.contains(dose.concentration_g_l) {
                return Err(format!(
                    "additive {} at {} g/L outside [{}, {}]",
                    dose.compound,
                    dose.concentration_g_l,
                    spec.concentration_g_l.min,
                    spec.concentration_g_l.max
                ));
            }
        }

        Ok(())
    }

    pub fn normalized_features(&self, recipe: &Recipe) -> Vec<f64> {
        let mut features = NumericParam::ALL
            .iter()
            .map(|param| self.bounds(*param).normalize(recipe.value(*param)))
            .collect::<Vec<f64>>();
        features.push(if recipe.waveform == Waveform::Bipolar {
            1.0
        } else {
            0.0
        });
        features
    }
}

fn numeric_bounds(values: [(f64, f64); 5]) -> BTreeMap<NumericParam, Interval> {
    NumericParam::ALL
        .into_iter()
        .zip(values)
        .map(|(param, (min, max))| (param, Interval::new(min, max)))
        .collect()
}

fn additive(compound: &str, min: f64, max: f64, fluoride: bool) -> AdditiveSpec {
    AdditiveSpec {
        compound: compound.to_string(),
        concentration_g_l: Interval::new(min, max),
        fluoride,
    }
}

fn dose(compound: &str, concentration_g_l: f64) -> AdditiveDose {
    AdditiveDose {
        compound: compound.to_string(),
        concentration_g_l,
    }
}

fn template(
    system: &str,
    name: &str,
    numerics: [f64; 5],
    waveform: Waveform,
    additives: Vec<AdditiveDose>,
    post_treatment: PostTreatment,
) -> RecipeTemplate {
    let [voltage_v, current_density_a_dm2, frequency_hz, duty_cycle_pct, time_min] = numerics;
    RecipeTemplate {
        name: name.to_string(),
        recipe: Recipe {
            system: system.to_string(),
            voltage_v,
            current_density_a_dm2,
            frequency_hz,
            duty_cycle_pct,
            time_min,
            waveform,
            additives,
            substrate_alloy: "AZ91".to_string(),
            post_treatment,
        },
    }
}

fn common_substrates() -> Vec<String> {
    ["AZ91", "AM60", "ZK60"].map(str::to_string).to_vec()
}

fn common_forbidden() -> Vec<String> {
    ["Cr6+", "HF"].map(str::to_string).to_vec()
}

fn silicate_space() -> SystemSpace {
    let templates = vec![
        template(
            "silicate",
            "silicate-baseline",
            [400.0, 10.0, 800.0, 25.0, 20.0],
            Waveform::Bipolar,
            vec![dose("Na2SiO3", 10.0), dose("KOH", 2.0)],
            PostTreatment::None,
        ),
        template(
            "silicate",
            "silicate-high-emissivity",
            [450.0, 8.0, 1000.0, 30.0, 25.0],
            Waveform::Bipolar,
            vec![dose("Na2SiO3", 12.0), dose("KOH", 2.0), dose("KF", 1.0)],
            PostTreatment::None,
        ),
        template(
            "silicate",
            "silicate-low-absorptance",
            [320.0, 7.0, 700.0, 22.0, 15.0],
            Waveform::Unipolar,
            vec![dose("Na2SiO3", 8.0), dose("KOH", 1.5)],
            PostTreatment::HydrothermalSealing,
        ),
    ];

    SystemSpace {
        system: "silicate".to_string(),
        numeric: numeric_bounds([
            (200.0, 520.0),
            (5.0, 15.0),
            (200.0, 1500.0),
            (20.0, 45.0),
            (5.0, 40.0),
        ]),
        additives: vec![
            additive("Na2SiO3", 5.0, 20.0, false),
            additive("KOH", 0.5, 5.0, false),
            additive("KF", 0.5, 4.0, true),
            additive("NaF", 0.5, 4.0, true),
        ],
        forbidden: common_forbidden(),
        exclusive_pairs: vec![("KF".to_string(), "NaF".to_string())],
        substrates: common_substrates(),
        uniformity: UniformityWindow {
            frequency_hz: Interval::new(700.0, 1100.0),
            duty_cycle_pct: Interval::new(20.0, 35.0),
        },
        thickness_coefficient: 0.60,
        defaults: templates[0].recipe.clone(),
        templates,
    }
}

fn zirconate_space() -> SystemSpace {
    let templates = vec![
        template(
            "zirconate",
            "zirconate-baseline",
            [380.0, 8.0, 800.0, 25.0, 15.0],
            Waveform::Bipolar,
            vec![dose("K2ZrF6", 5.0), dose("Na2SiO3", 4.0), dose("KOH", 1.5)],
            PostTreatment::None,
        ),
        template(
            "zirconate",
            "zirconate-high-emissivity",
            [440.0, 9.0, 900.0, 28.0, 20.0],
            Waveform::Bipolar,
            vec![
                dose("K2ZrF6", 6.0),
                dose("Na2SiO3", 5.0),
                dose("KOH", 2.0),
                dose("NaF", 1.0),
            ],
            PostTreatment::None,
        ),
        template(
            "zirconate",
            "zirconate-low-absorptance",
            [300.0, 6.0, 600.0, 22.0, 12.0],
            Waveform::Unipolar,
            vec![dose("K2ZrF6", 4.0), dose("KOH", 1.0)],
            PostTreatment::OrganicSealing,
        ),
    ];

    SystemSpace {
        system: "zirconate".to_string(),
        numeric: numeric_bounds([
            (180.0, 500.0),
            (4.0, 12.0),
            (200.0, 1200.0),
            (20.0, 40.0),
            (4.0, 30.0),
        ]),
        additives: vec![
            additive("K2ZrF6", 2.0, 10.0, false),
            additive("Na2SiO3", 2.0, 12.0, false),
            additive("KOH", 0.5, 5.0, false),
            additive("NaF", 0.5, 3.0, true),
        ],
        forbidden: common_forbidden(),
        exclusive_pairs: vec![("KF".to_string(), "NaF".to_string())],
        substrates: common_substrates(),
        uniformity: UniformityWindow {
            frequency_hz: Interval::new(600.0, 1000.0),
            duty_cycle_pct: Interval::new(18.0, 32.0),
        },
        thickness_coefficient: 0.70,
        defaults: templates[0].recipe.clone(),
        templates,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{Interval, ParameterSpace};
    use crate::error::AdvisorError;
    use crate::model::{BoundsOverride, NumericParam};

    fn numeric_override(name: &str, min: f64, max: f64) -> BoundsOverride {
        BoundsOverride {
            numeric: BTreeMap::from([(name.to_string(), [min, max])]),
            additives: None,
        }
    }

    #[test]
    fn lookup_is_case_insensitive_and_rejects_unknown_systems() {
        let space = ParameterSpace::builtin();
        let silicate = space.lookup(" Silicate ").expect("silicate is registered");
        assert_eq!(
            silicate.bounds(NumericParam::VoltageV),
            Interval::new(200.0, 520.0)
        );

        let err = space.lookup("phosphate").expect_err("phosphate is not registered");
        assert!(matches!(err, AdvisorError::UnknownSystem { .. }));
    }

    #[test]
    fn templates_and_defaults_lie_inside_their_space() {
        let space = ParameterSpace::builtin();
        for id in space.system_ids() {
            let system = space.lookup(id).expect("registered system");
            system
                .contains(&system.defaults)
                .expect("defaults should be in bounds");
            for template in &system.templates {
                system
                    .contains(&template.recipe)
                    .unwrap_or_else(|reason| panic!("{} out of bounds: {reason}", template.name));
            }
        }
    }

    #[test]
    fn override_narrows_bounds_and_conforms_templates() {
        let space = ParameterSpace::builtin();
        let narrowed = space
            .resolve("silicate", Some(&numeric_override("voltage_v", 300.0, 350.0)))
            .expect("narrowing is allowed");

        assert_eq!(
            narrowed.bounds(NumericParam::VoltageV),
            Interval::new(300.0, 350.0)
        );
        for template in &narrowed.templates {
            assert!(narrowed.contains(&template.recipe).is_ok());
        }
    }

    #[test]
    fn override_that_widens_is_rejected() {
        let space = ParameterSpace::builtin();
        let err = space
            .resolve("silicate", Some(&numeric_override("voltage_v", 150.0, 400.0)))
            .expect_err("widening must fail");
        assert!(matches!(err, AdvisorError::InvalidOverride { .. }));

        let err = space
            .resolve("silicate", Some(&numeric_override("voltage_v", 400.0, 300.0)))
            .expect_err("inverted interval must fail");
        assert!(matches!(err, AdvisorError::InvalidOverride { .. }));

        let err = space
            .resolve("silicate", Some(&numeric_override("pressure", 1.0, 2.0)))
            .expect_err("unknown parameter must fail");
        assert!(matches!(err, AdvisorError::InvalidOverride { .. }));
    }

    #[test]
    fn additive_override_may_only_drop_compounds() {
        let space = ParameterSpace::builtin();
        let narrowed = space
            .resolve(
                "silicate",
                Some(&BoundsOverride {
                    numeric: BTreeMap::new(),
                    additives: Some(vec!["Na2SiO3".to_string(), "KOH".to_string()]),
                }),
            )
            .expect("dropping KF is narrowing");
        assert!(narrowed.additive("KF").is_none());
        assert!(narrowed.templates.iter().all(|t| !t.recipe.has_additive("KF")));

        let err = space
            .resolve(
                "silicate",
                Some(&BoundsOverride {
                    numeric: BTreeMap::new(),
                    additives: Some(vec!["K2ZrF6".to_string()]),
                }),
            )
            .expect_err("adding a compound widens the set");
        assert!(matches!(err, AdvisorError::InvalidOverride { .. }));
    }

    #[test]
    fn normalized_features_are_unit_scaled() {
        let space = ParameterSpace::builtin();
        let silicate = space.lookup("silicate").expect("registered");
        let features = silicate.normalized_features(&silicate.defaults);
        assert_eq!(features.len(), super::FEATURE_COUNT);
        assert!(features.iter().all(|value| (0.0..=1.0).contains(value)));
        assert_eq!(features[5], 1.0, "baseline template is bipolar");
    }
}
