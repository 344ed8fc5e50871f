use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use super::catalog::{SlotId, SlotSpec, alpha_share_for, catalog};
use super::classifier::{AnswerClassifier, Classification};
use crate::constraints::ConstraintContext;
use crate::generator::RecipePreferences;
use crate::model::{
    ClarificationQuestion, ClarificationResponse, ClarificationStatus, PropertyTarget, SlotValue,
    TargetSpec, UnresolvedSlot,
};
use crate::space::Interval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClarifyState {
    Collecting,
    AwaitingAnswer,
    Followup,
    Resolved,
    PendingExpert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FillSource {
    Request,
    Notes,
    Answer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlotResolution {
    /// Question emitted, no answer supplied yet.
    Waiting { question: ClarificationQuestion },
    Filled { value: SlotValue, source: FillSource },
    /// Escalated after a refusal or two unusable answers; carries the default.
    Escalated {
        question: ClarificationQuestion,
        reason: String,
    },
    /// Open slot closed with its default because the caller asked for best effort.
    Defaulted { question: ClarificationQuestion },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub slot: SlotId,
    pub from: ClarifyState,
    pub to: ClarifyState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClarificationOutcome {
    pub state: ClarifyState,
    pub slots: BTreeMap<SlotId, SlotResolution>,
    /// Question ids in the order they were asked.
    pub asked: Vec<String>,
    pub transitions: Vec<Transition>,
}

/// Values the rest of the pipeline consumes once clarification has finished.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSlots {
    pub target: PropertyTarget,
    pub substrate_alloy: String,
    pub fluoride_allowed: bool,
    pub fluoride_pending: bool,
    pub thickness_limit_um: Interval,
    pub thickness_pending: bool,
    pub alpha_share: f64,
}

impl ResolvedSlots {
    pub fn constraint_context(&self) -> ConstraintContext {
        ConstraintContext {
            fluoride_allowed: self.fluoride_allowed,
            fluoride_pending: self.fluoride_pending,
            thickness_limit_um: self.thickness_limit_um,
            thickness_pending: self.thickness_pending,
        }
    }

    pub fn recipe_preferences(&self) -> RecipePreferences {
        RecipePreferences {
            substrate_alloy: Some(self.substrate_alloy.clone()),
            allow_fluoride: self.fluoride_allowed,
        }
    }
}

/// Replays a request and its answer history through the clarification state
/// machine. Each mandatory slot is asked at most once plus one follow-up.
pub struct ClarificationEngine<'a> {
    classifier: &'a dyn AnswerClassifier,
}

impl<'a> ClarificationEngine<'a> {
    pub fn new(classifier: &'a dyn AnswerClassifier) -> Self {
        Self { classifier }
    }

    pub fn run(&self, request: &TargetSpec) -> ClarificationOutcome {
        let mut session = Session::default();
        let specs = catalog();

        for spec in &specs {
            if let Some(value) = self.prefill(spec, request) {
                session.fill(spec.id, value.0, value.1);
            }
        }

        for spec in &specs {
            if session.is_settled(spec.id) {
                continue;
            }
            let attempts = request
                .answers
                .get(spec.id.as_str())
                .map(Vec::as_slice)
                .unwrap_or_default();
            self.collect_slot(&mut session, spec, attempts);
        }

        let state = session.final_state(request.best_effort);
        info!(
            state = ?state,
            asked = session.asked.len(),
            best_effort = request.best_effort,
            "clarification finished"
        );
        ClarificationOutcome {
            state,
            slots: session.slots,
            asked: session.asked,
            transitions: session.transitions,
        }
    }

    fn prefill(&self, spec: &SlotSpec, request: &TargetSpec) -> Option<(SlotValue, FillSource)> {
        let from_request = match spec.id {
            SlotId::TargetAlpha => request.target_alpha,
            SlotId::TargetEpsilon => request.target_epsilon,
            _ => None,
        };
        if let Some(value) = from_request {
            return Some((SlotValue::Number { value }, FillSource::Request));
        }

        let notes = request.notes.as_deref()?;
        let value = self.classifier.extract_from_notes(spec, notes)?;
        debug!(slot = %spec.id, value = %value, "slot prefilled from notes");
        Some((value, FillSource::Notes))
    }

    fn collect_slot(&self, session: &mut Session, spec: &SlotSpec, attempts: &[String]) {
        let first = question(spec, false);
        session.ask(spec.id, &first, ClarifyState::Collecting, ClarifyState::AwaitingAnswer);

        let Some(answer) = attempts.first() else {
            session.slots.insert(spec.id, SlotResolution::Waiting { question: first });
            return;
        };

        let reason = match self.classifier.classify(spec, answer) {
            Classification::Clear(value) => {
                session.transition(spec.id, ClarifyState::AwaitingAnswer, ClarifyState::Collecting);
                session.fill(spec.id, value, FillSource::Answer);
                return;
            }
            Classification::Refusal => {
                session.escalate(spec.id, first, ClarifyState::AwaitingAnswer, "refused");
                return;
            }
            Classification::Ambiguous(reason) => reason,
        };

        let followup = question(spec, true);
        debug!(slot = %spec.id, reason = %reason, "answer ambiguous, asking follow-up");
        session.ask(spec.id, &followup, ClarifyState::AwaitingAnswer, ClarifyState::Followup);

        let Some(answer) = attempts.get(1) else {
            session
                .slots
                .insert(spec.id, SlotResolution::Waiting { question: followup });
            return;
        };

        match self.classifier.classify(spec, answer) {
            Classification::Clear(value) => {
                session.transition(spec.id, ClarifyState::Followup, ClarifyState::Collecting);
                session.fill(spec.id, value, FillSource::Answer);
            }
            Classification::Refusal => {
                session.escalate(spec.id, followup, ClarifyState::Followup, "refused on follow-up");
            }
            Classification::Ambiguous(reason) => {
                let reason = format!("ambiguous after follow-up: {reason}");
                session.escalate(spec.id, followup, ClarifyState::Followup, &reason);
            }
        }
    }
}

fn question(spec: &SlotSpec, followup: bool) -> ClarificationQuestion {
    ClarificationQuestion {
        question_id: spec.question_id(followup),
        slot_id: spec.id.to_string(),
        text: if followup {
            spec.followup_text.to_string()
        } else {
            spec.text.to_string()
        },
        is_mandatory: spec.mandatory,
        expected_answer_type: spec.expected.describe(),
        is_followup: followup,
    }
}

#[derive(Debug, Default)]
struct Session {
    slots: BTreeMap<SlotId, SlotResolution>,
    asked: Vec<String>,
    transitions: Vec<Transition>,
}

impl Session {
    fn is_settled(&self, slot: SlotId) -> bool {
        self.slots.contains_key(&slot)
    }

    fn transition(&mut self, slot: SlotId, from: ClarifyState, to: ClarifyState) {
        self.transitions.push(Transition { slot, from, to });
    }

    fn ask(
        &mut self,
        slot: SlotId,
        question: &ClarificationQuestion,
        from: ClarifyState,
        to: ClarifyState,
    ) {
        self.asked.push(question.question_id.clone());
        self.transition(slot, from, to);
    }

    fn fill(&mut self, slot: SlotId, value: SlotValue, source: FillSource) {
        self.slots
            .insert(slot, SlotResolution::Filled { value, source });
    }

    fn escalate(
        &mut self,
        slot: SlotId,
        question: ClarificationQuestion,
        from: ClarifyState,
        reason: &str,
    ) {
        info!(slot = %slot, reason, "slot escalated to expert review");
        self.transition(slot, from, ClarifyState::PendingExpert);
        self.slots.insert(
            slot,
            SlotResolution::Escalated {
                question,
                reason: reason.to_string(),
            },
        );
    }

    fn final_state(&mut self, best_effort: bool) -> ClarifyState {
        let waiting = self
            .slots
            .values()
            .any(|resolution| matches!(resolution, SlotResolution::Waiting { .. }));
        let escalated = self
            .slots
            .values()
            .any(|resolution| matches!(resolution, SlotResolution::Escalated { .. }));

        if best_effort {
            for (slot, resolution) in self.slots.iter_mut() {
                if let SlotResolution::Waiting { question } = resolution {
                    info!(slot = %slot, "best effort: defaulting unanswered slot");
                    *resolution = SlotResolution::Defaulted {
                        question: question.clone(),
                    };
                }
            }
        }

        if escalated {
            ClarifyState::PendingExpert
        } else if waiting && !best_effort {
            ClarifyState::AwaitingAnswer
        } else {
            ClarifyState::Resolved
        }
    }
}

impl ClarificationOutcome {
    /// Generation may start: everything resolved, or the caller accepted defaults.
    pub fn ready_for_generation(&self, best_effort: bool) -> bool {
        self.state == ClarifyState::Resolved || best_effort
    }

    fn filled_value(&self, slot: SlotId) -> Option<&SlotValue> {
        match self.slots.get(&slot) {
            Some(SlotResolution::Filled { value, .. }) => Some(value),
            _ => None,
        }
    }

    /// Filled value, or the documented default for any slot that is not filled.
    pub fn value_or_default(&self, slot: SlotId) -> SlotValue {
        self.filled_value(slot)
            .cloned()
            .unwrap_or_else(|| super::catalog::slot_spec(slot).default)
    }

    pub fn is_filled(&self, slot: SlotId) -> bool {
        self.filled_value(slot).is_some()
    }

    /// Questions the caller still has to answer, follow-ups included.
    pub fn outstanding_questions(&self) -> Vec<ClarificationQuestion> {
        self.slots
            .values()
            .filter_map(|resolution| match resolution {
                SlotResolution::Waiting { question }
                | SlotResolution::Escalated { question, .. } => Some(question.clone()),
                _ => None,
            })
            .collect()
    }

    /// Slots answered with a documented default instead of an accepted value.
    pub fn unresolved(&self) -> Vec<UnresolvedSlot> {
        self.slots
            .iter()
            .filter_map(|(slot, resolution)| {
                let reason = match resolution {
                    SlotResolution::Escalated { reason, .. } => reason.clone(),
                    SlotResolution::Defaulted { .. } => {
                        "no answer; best-effort default".to_string()
                    }
                    SlotResolution::Waiting { .. } => "awaiting answer".to_string(),
                    SlotResolution::Filled { .. } => return None,
                };
                let spec = super::catalog::slot_spec(*slot);
                Some(UnresolvedSlot {
                    slot_id: slot.to_string(),
                    default_value: spec.default,
                    reason: format!("{reason}; default: {}", spec.default_note),
                })
            })
            .collect()
    }

    pub fn resolved_slot_map(&self) -> BTreeMap<String, SlotValue> {
        self.slots
            .iter()
            .filter_map(|(slot, resolution)| match resolution {
                SlotResolution::Filled { value, .. } => Some((slot.to_string(), value.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn resolved_values(&self) -> ResolvedSlots {
        let default_number = |slot: SlotId| match super::catalog::slot_spec(slot).default {
            SlotValue::Number { value } => value,
            _ => 0.0,
        };
        let number = |slot: SlotId| match self.value_or_default(slot) {
            SlotValue::Number { value } => value,
            _ => default_number(slot),
        };

        let substrate_alloy = match self.value_or_default(SlotId::SubstrateAlloy) {
            SlotValue::Choice { value } => value,
            other => other.to_string(),
        };
        let fluoride_allowed = matches!(
            self.value_or_default(SlotId::FluorideAdditives),
            SlotValue::Flag { value: true }
        );
        let thickness_limit_um = match self.value_or_default(SlotId::ThicknessLimit) {
            SlotValue::Range { min, max } => Interval::new(min, max),
            _ => Interval::new(0.0, f64::INFINITY),
        };
        let alpha_share = match self.value_or_default(SlotId::PerformancePriority) {
            SlotValue::Choice { value } => alpha_share_for(&value),
            _ => 0.5,
        };

        ResolvedSlots {
            target: PropertyTarget {
                alpha: number(SlotId::TargetAlpha),
                epsilon: number(SlotId::TargetEpsilon),
            },
            substrate_alloy,
            fluoride_allowed,
            fluoride_pending: !self.is_filled(SlotId::FluorideAdditives),
            thickness_limit_um,
            thickness_pending: !self.is_filled(SlotId::ThicknessLimit),
            alpha_share,
        }
    }

    pub fn into_response(self, system: &str) -> ClarificationResponse {
        let need_expert = self.state == ClarifyState::PendingExpert;
        ClarificationResponse {
            status: if need_expert {
                ClarificationStatus::PendingExpert
            } else {
                ClarificationStatus::NeedsMoreInfo
            },
            need_expert,
            system: system.to_string(),
            questions: self.outstanding_questions(),
            unresolved: self.unresolved(),
            resolved_slots: self.resolved_slot_map(),
        }
    }
}
