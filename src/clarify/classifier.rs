use anyhow::{Context, Result};
use regex::Regex;

use super::catalog::{ExpectedAnswer, SlotId, SlotSpec};
use crate::model::SlotValue;

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Clear(SlotValue),
    Ambiguous(String),
    Refusal,
}

/// Maps a free-text answer onto a slot's expected type. Implementations must
/// be deterministic for a given (slot, answer) pair.
pub trait AnswerClassifier: Send + Sync {
    fn classify(&self, slot: &SlotSpec, answer: &str) -> Classification;

    /// Strict extraction from request notes. Returns `None` unless the notes
    /// state the slot value unambiguously.
    fn extract_from_notes(&self, _slot: &SlotSpec, _notes: &str) -> Option<SlotValue> {
        None
    }
}

const REFUSAL_PHRASES: &[&str] = &[
    "don't know",
    "dont know",
    "do not know",
    "no idea",
    "cannot say",
    "can't say",
    "prefer not",
    "rather not",
    "no comment",
    "decline",
    "skip",
    "n/a",
];

const VAGUE_PHRASES: &[&str] = &[
    "maybe",
    "probably",
    "not sure",
    "whatever",
    "doesn't matter",
    "does not matter",
    "depends",
    "a bit",
    "as good as possible",
    "reasonable",
    "typical",
    "normal",
    "standard",
    "appropriate",
    "suitable",
    "high",
    "low",
    "thin",
    "thick",
];

const PRIORITY_ALIASES: &[(&str, &str)] = &[
    ("absorptance", "absorptance"),
    ("absorption", "absorptance"),
    ("alpha", "absorptance"),
    ("emissivity", "emissivity"),
    ("emittance", "emissivity"),
    ("epsilon", "emissivity"),
    ("balanced", "balanced"),
    ("both", "balanced"),
    ("equal", "balanced"),
    ("equally", "balanced"),
];

/// Keyword and regex classifier over normalised answers.
pub struct RuleClassifier {
    number: Regex,
    range: Regex,
    upper_limit: Regex,
    lower_limit: Regex,
    micron_unit: Regex,
    other_unit: Regex,
    alloy: Regex,
    yes: Regex,
    no: Regex,
    word: Regex,
    notes_fluoride_free: Regex,
    notes_fluoride_ok: Regex,
    notes_thickness_range: Regex,
    notes_thickness_max: Regex,
    notes_priority: Regex,
}

impl RuleClassifier {
    pub fn new() -> Result<Self> {
        Ok(Self {
            number: compile(r"-?\d+(?:\.\d+)?")?,
            range: compile(r"(\d+(?:\.\d+)?)\s*(?:-|–|to|\.\.)\s*(\d+(?:\.\d+)?)")?,
            upper_limit: compile(
                r"(?i)(?:max(?:imum)?|up to|below|under|less than|at most|no more than|<=?|≤)\s*(\d+(?:\.\d+)?)",
            )?,
            lower_limit: compile(
                r"(?i)(?:min(?:imum)?|at least|above|over|more than|no less than|>=?|≥)\s*(\d+(?:\.\d+)?)",
            )?,
            micron_unit: compile(r"(?i)(?:µm|um|micron|microns|micrometers?)\b")?,
            other_unit: compile(r"(?i)\b(?:mm|nm|g/m2|g/m²|mg)\b")?,
            alloy: compile(r"(?i)\b(az91|am60|zk60)[a-z]?\b")?,
            yes: compile(
                r"(?i)\b(?:yes|y|allowed|acceptable|ok|okay|fine|permitted|sure)\b",
            )?,
            no: compile(
                r"(?i)\b(?:no|n|not allowed|not acceptable|forbidden|prohibited|avoid|must not|without|fluoride[- ]free)\b",
            )?,
            word: compile(r"[a-z]+")?,
            notes_fluoride_free: compile(
                r"(?i)\b(?:fluoride[- ]free|no fluorides?|without (?:fluorides?|kf|naf)|avoid (?:fluorides?|kf|naf))\b",
            )?,
            notes_fluoride_ok: compile(
                r"(?i)\bfluorides? (?:is |are )?(?:ok|okay|allowed|acceptable|permitted)\b",
            )?,
            notes_thickness_range: compile(
                r"(?i)(\d+(?:\.\d+)?)\s*(?:-|–|to)\s*(\d+(?:\.\d+)?)\s*(?:µm|um|microns?)\b",
            )?,
            notes_thickness_max: compile(
                r"(?i)(?:max(?:imum)?|up to|below|under|at most|<=?|≤)\s*(\d+(?:\.\d+)?)\s*(?:µm|um|microns?)\b",
            )?,
            notes_priority: compile(
                r"(?i)\bprioriti[sz]e\s+(?:low\s+|high\s+)?(emissivity|epsilon|absorptance|alpha)\b",
            )?,
        })
    }

    fn is_refusal(&self, normalized: &str) -> bool {
        REFUSAL_PHRASES
            .iter()
            .any(|phrase| normalized.contains(phrase))
    }

    fn is_vague(&self, normalized: &str) -> bool {
        if self.number.is_match(normalized) {
            return false;
        }
        let words = self
            .word
            .find_iter(normalized)
            .map(|found| found.as_str())
            .collect::<Vec<&str>>();
        VAGUE_PHRASES.iter().any(|phrase| {
            if phrase.contains(' ') || phrase.contains('\'') {
                normalized.contains(phrase)
            } else {
                words.contains(phrase)
            }
        })
    }

    fn numbers(&self, text: &str) -> Vec<f64> {
        self.number
            .find_iter(text)
            .filter_map(|found| found.as_str().parse::<f64>().ok())
            .collect()
    }

    fn classify_fraction(&self, normalized: &str) -> Classification {
        let numbers = self.numbers(normalized);
        match numbers.as_slice() {
            [value] if (0.0..=1.0).contains(value) => {
                Classification::Clear(SlotValue::Number { value: *value })
            }
            [value] if normalized.contains('%') && (0.0..=100.0).contains(value) => {
                Classification::Clear(SlotValue::Number {
                    value: value / 100.0,
                })
            }
            [] => Classification::Ambiguous("no numeric value found".to_string()),
            [_] => Classification::Ambiguous("value outside [0, 1]".to_string()),
            _ => Classification::Ambiguous("more than one number given".to_string()),
        }
    }

    fn classify_range(&self, normalized: &str, max_allowed: f64) -> Classification {
        if self.other_unit.is_match(normalized) && !self.micron_unit.is_match(normalized) {
            return Classification::Ambiguous("thickness must be given in um".to_string());
        }

        let range = if let Some(captures) = self.range.captures(normalized) {
            let low = captures[1].parse::<f64>().ok();
            let high = captures[2].parse::<f64>().ok();
            match (low, high) {
                (Some(low), Some(high)) => Some((low.min(high), low.max(high))),
                _ => None,
            }
        } else if let Some(captures) = self.upper_limit.captures(normalized) {
            captures[1].parse::<f64>().ok().map(|value| (0.0, value))
        } else if let Some(captures) = self.lower_limit.captures(normalized) {
            captures[1]
                .parse::<f64>()
                .ok()
                .map(|value| (value, max_allowed))
        } else {
            None
        };

        match range {
            Some((min, max)) if min >= 0.0 && max > 0.0 && max <= max_allowed && min < max => {
                Classification::Clear(SlotValue::Range { min, max })
            }
            Some(_) => Classification::Ambiguous(format!(
                "range must lie within 0-{max_allowed} and have min < max"
            )),
            None if self.numbers(normalized).is_empty() => {
                Classification::Ambiguous("no numeric range found".to_string())
            }
            None => Classification::Ambiguous(
                "a single number is neither a range nor a limit".to_string(),
            ),
        }
    }

    fn classify_choice(&self, slot: &SlotSpec, normalized: &str) -> Classification {
        let mut matches = match slot.id {
            SlotId::SubstrateAlloy => self
                .alloy
                .captures_iter(normalized)
                .map(|captures| captures[1].to_ascii_uppercase())
                .collect::<Vec<String>>(),
            SlotId::PerformancePriority => {
                let words = self
                    .word
                    .find_iter(normalized)
                    .map(|found| found.as_str())
                    .collect::<Vec<&str>>();
                PRIORITY_ALIASES
                    .iter()
                    .filter(|(alias, _)| words.contains(alias))
                    .map(|(_, choice)| (*choice).to_string())
                    .collect()
            }
            _ => Vec::new(),
        };
        matches.sort();
        matches.dedup();

        match matches.as_slice() {
            [choice] => Classification::Clear(SlotValue::Choice {
                value: choice.clone(),
            }),
            [] => Classification::Ambiguous(format!(
                "expected {}",
                slot.expected.describe()
            )),
            _ => Classification::Ambiguous("more than one option given".to_string()),
        }
    }

    fn classify_yes_no(&self, normalized: &str) -> Classification {
        let negative = self.no.is_match(normalized);
        // "not allowed" also contains "allowed"; a negative phrase wins when both match.
        let positive = self.yes.is_match(&self.no.replace_all(normalized, " "));
        match (positive, negative) {
            (true, false) => Classification::Clear(SlotValue::Flag { value: true }),
            (false, true) => Classification::Clear(SlotValue::Flag { value: false }),
            (true, true) => Classification::Ambiguous("answer is both yes and no".to_string()),
            (false, false) => Classification::Ambiguous("expected yes or no".to_string()),
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("failed to compile classifier regex {pattern}"))
}

fn normalize_answer(answer: &str) -> String {
    answer
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
        .to_lowercase()
}

impl AnswerClassifier for RuleClassifier {
    fn classify(&self, slot: &SlotSpec, answer: &str) -> Classification {
        let normalized = normalize_answer(answer);
        if normalized.is_empty() {
            return Classification::Ambiguous("empty answer".to_string());
        }
        if self.is_refusal(&normalized) {
            return Classification::Refusal;
        }
        // Choice answers such as "low alpha" legitimately use qualitative words.
        let qualitative = matches!(slot.expected, ExpectedAnswer::Choice(_));
        if !qualitative && self.is_vague(&normalized) {
            return Classification::Ambiguous("vague answer without specific values".to_string());
        }

        match &slot.expected {
            ExpectedAnswer::Fraction => self.classify_fraction(&normalized),
            ExpectedAnswer::RangeWithUnit { max, .. } => self.classify_range(&normalized, *max),
            ExpectedAnswer::Choice(_) => self.classify_choice(slot, &normalized),
            ExpectedAnswer::YesNo => self.classify_yes_no(&normalized),
        }
    }

    fn extract_from_notes(&self, slot: &SlotSpec, notes: &str) -> Option<SlotValue> {
        match slot.id {
            SlotId::SubstrateAlloy => match self.classify_choice(slot, &notes.to_lowercase()) {
                Classification::Clear(value) => Some(value),
                _ => None,
            },
            SlotId::FluorideAdditives => {
                let banned = self.notes_fluoride_free.is_match(notes);
                let allowed = self.notes_fluoride_ok.is_match(notes);
                match (allowed, banned) {
                    (true, false) => Some(SlotValue::Flag { value: true }),
                    (false, true) => Some(SlotValue::Flag { value: false }),
                    _ => None,
                }
            }
            SlotId::ThicknessLimit => {
                if let Some(captures) = self.notes_thickness_range.captures(notes) {
                    let low = captures[1].parse::<f64>().ok()?;
                    let high = captures[2].parse::<f64>().ok()?;
                    (low.min(high) < low.max(high)).then(|| SlotValue::Range {
                        min: low.min(high),
                        max: low.max(high),
                    })
                } else {
                    let captures = self.notes_thickness_max.captures(notes)?;
                    let max = captures[1].parse::<f64>().ok()?;
                    (max > 0.0).then_some(SlotValue::Range { min: 0.0, max })
                }
            }
            SlotId::PerformancePriority => {
                let captures = self.notes_priority.captures(notes)?;
                let value = match captures[1].to_ascii_lowercase().as_str() {
                    "emissivity" | "epsilon" => "emissivity",
                    _ => "absorptance",
                };
                Some(SlotValue::Choice {
                    value: value.to_string(),
                })
            }
            SlotId::TargetAlpha | SlotId::TargetEpsilon => None,
        }
    }
}
