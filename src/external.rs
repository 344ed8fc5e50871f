use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Citation, RankedBatch, Recipe};

/// Failure reported by an external collaborator. Only transient failures are retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExternalError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ExternalError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPrediction {
    pub alpha: f64,
    pub epsilon: f64,
    pub confidence: f64,
}

#[async_trait]
pub trait ForwardPredictor: Send + Sync {
    async fn predict(&self, recipe_text: &str, recipe: &Recipe)
    -> Result<RawPrediction, ExternalError>;
}

/// Nearest-neighbour search over the literature corpus. Returns an empty list,
/// not an error, when nothing clears the relevance floor.
#[async_trait]
pub trait CitationRetriever: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Citation>, ExternalError>;
}

#[async_trait]
pub trait BatchWriter: Send + Sync {
    async fn write(&self, batch: &RankedBatch) -> anyhow::Result<()>;
}
