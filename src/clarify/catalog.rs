use std::fmt;

use crate::model::SlotValue;

pub const SUBSTRATE_CHOICES: &[&str] = &["AZ91", "AM60", "ZK60"];
pub const PRIORITY_CHOICES: &[&str] = &["absorptance", "emissivity", "balanced"];

/// Upper sanity limit for a thickness answer, in µm.
pub const MAX_THICKNESS_UM: f64 = 500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SlotId {
    TargetAlpha,
    TargetEpsilon,
    SubstrateAlloy,
    FluorideAdditives,
    ThicknessLimit,
    PerformancePriority,
}

impl SlotId {
    pub const ALL: [SlotId; 6] = [
        SlotId::TargetAlpha,
        SlotId::TargetEpsilon,
        SlotId::SubstrateAlloy,
        SlotId::FluorideAdditives,
        SlotId::ThicknessLimit,
        SlotId::PerformancePriority,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TargetAlpha => "target_alpha",
            Self::TargetEpsilon => "target_epsilon",
            Self::SubstrateAlloy => "substrate_alloy",
            Self::FluorideAdditives => "fluoride_additives",
            Self::ThicknessLimit => "thickness_limit_um",
            Self::PerformancePriority => "performance_priority",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|slot| slot.as_str() == normalized)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpectedAnswer {
    Fraction,
    RangeWithUnit { unit: &'static str, max: f64 },
    Choice(&'static [&'static str]),
    YesNo,
}

impl ExpectedAnswer {
    pub fn describe(&self) -> String {
        match self {
            Self::Fraction => "number in [0, 1]".to_string(),
            Self::RangeWithUnit { unit, .. } => format!("numeric range in {unit}"),
            Self::Choice(options) => format!("one of: {}", options.join(", ")),
            Self::YesNo => "yes/no".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotSpec {
    pub id: SlotId,
    pub text: &'static str,
    pub followup_text: &'static str,
    pub expected: ExpectedAnswer,
    pub mandatory: bool,
    pub default: SlotValue,
    pub default_note: &'static str,
}

impl SlotSpec {
    pub fn question_id(&self, followup: bool) -> String {
        if followup {
            format!("{}_followup_1", self.id)
        } else {
            self.id.to_string()
        }
    }
}

/// Mandatory slots, in the order they are asked.
pub fn catalog() -> Vec<SlotSpec> {
    SlotId::ALL.into_iter().map(slot_spec).collect()
}

pub fn slot_spec(id: SlotId) -> SlotSpec {
    match id {
        SlotId::TargetAlpha => SlotSpec {
            id,
            text: "What solar absorptance (alpha, 0-1) should the coating reach?",
            followup_text: "Please give alpha as a single number between 0 and 1, for example 0.2.",
            expected: ExpectedAnswer::Fraction,
            mandatory: true,
            default: SlotValue::Number { value: 0.20 },
            default_note: "typical thermal-control target alpha 0.20",
        },
        SlotId::TargetEpsilon => SlotSpec {
            id,
            text: "What infrared emissivity (epsilon, 0-1) should the coating reach?",
            followup_text: "Please give epsilon as a single number between 0 and 1, for example 0.85.",
            expected: ExpectedAnswer::Fraction,
            mandatory: true,
            default: SlotValue::Number { value: 0.80 },
            default_note: "typical thermal-control target epsilon 0.80",
        },
        SlotId::SubstrateAlloy => SlotSpec {
            id,
            text: "Which magnesium alloy is the substrate (AZ91, AM60 or ZK60)?",
            followup_text: "Please name exactly one alloy: AZ91, AM60 or ZK60.",
            expected: ExpectedAnswer::Choice(SUBSTRATE_CHOICES),
            mandatory: true,
            default: SlotValue::Choice {
                value: "AZ91".to_string(),
            },
            default_note: "AZ91, the most widely reported substrate",
        },
        SlotId::FluorideAdditives => SlotSpec {
            id,
            text: "May the electrolyte contain free fluoride additives such as KF or NaF?",
            followup_text: "Please answer yes or no: are KF or NaF acceptable in the electrolyte?",
            expected: ExpectedAnswer::YesNo,
            mandatory: true,
            default: SlotValue::Flag { value: false },
            default_note: "fluoride additives excluded until an expert confirms",
        },
        SlotId::ThicknessLimit => SlotSpec {
            id,
            text: "What coating thickness range is acceptable (for example 10-30 um)?",
            followup_text: "Please give a numeric thickness range or limit with a unit, for example '15-25 um' or 'max 30 um'.",
            expected: ExpectedAnswer::RangeWithUnit {
                unit: "um",
                max: MAX_THICKNESS_UM,
            },
            mandatory: true,
            default: SlotValue::Range {
                min: 5.0,
                max: 60.0,
            },
            default_note: "5-60 um covers typical micro-arc oxidation layers",
        },
        SlotId::PerformancePriority => SlotSpec {
            id,
            text: "Which matters more: low absorptance (alpha), high emissivity (epsilon), or both equally?",
            followup_text: "Please answer 'alpha', 'epsilon' or 'balanced'.",
            expected: ExpectedAnswer::Choice(PRIORITY_CHOICES),
            mandatory: true,
            default: SlotValue::Choice {
                value: "balanced".to_string(),
            },
            default_note: "equal weight on alpha and epsilon",
        },
    }
}

/// Share of the property distance attributed to alpha for a priority choice.
pub fn alpha_share_for(priority: &str) -> f64 {
    match priority {
        "absorptance" => 0.75,
        "emissivity" => 0.25,
        _ => 0.5,
    }
}
