use thiserror::Error;

use crate::model::BatchDiagnostics;

/// Failures that cross the recommendation boundary. Everything scoped to a
/// single candidate is absorbed into [`BatchDiagnostics`] instead.
#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("unknown system '{system}', registered systems: {registered}")]
    UnknownSystem { system: String, registered: String },

    #[error("invalid bounds override for '{parameter}': {reason}")]
    InvalidOverride { parameter: String, reason: String },

    #[error("generated candidate {candidate_id} left the parameter space: {reason}")]
    GeneratedOutOfBounds {
        candidate_id: String,
        reason: String,
    },

    #[error("no viable candidates: all {generated} generated candidates were dropped")]
    NoViableCandidates {
        generated: usize,
        diagnostics: Box<BatchDiagnostics>,
    },

    #[error("batch {batch_id} is inconsistent: {reason}")]
    InconsistentBatch { batch_id: String, reason: String },

    #[error("batch {batch_id} could not be persisted: {reason}")]
    Persistence { batch_id: String, reason: String },
}

impl AdvisorError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn invalid_override(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOverride {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }
}
