use futures::stream::{self, StreamExt};
use tracing::warn;

use crate::external::CitationRetriever;
use crate::model::{Citation, DropStage, DroppedCandidate, RankedCandidate};
use crate::policy::CallPolicy;

pub(super) struct CitationOutcome {
    pub(super) ranked: Vec<RankedCandidate>,
    pub(super) dropped: Vec<DroppedCandidate>,
    pub(super) retries: usize,
    pub(super) uncited: usize,
}

pub(super) struct CitationStage<'a> {
    pub(super) retriever: &'a dyn CitationRetriever,
    pub(super) policy: &'a CallPolicy,
    pub(super) top_k: usize,
}

impl CitationStage<'_> {
    /// Attaches up to `top_k` citations to every ranked candidate. A candidate
    /// whose lookup exhausts the call policy is dropped and the survivors are
    /// renumbered.
    pub(super) async fn attach(
        &self,
        ranked: Vec<RankedCandidate>,
        concurrency: usize,
    ) -> CitationOutcome {
        let lookups = stream::iter(ranked.into_iter().map(|candidate| self.lookup(candidate)))
            .buffered(concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut outcome = CitationOutcome {
            ranked: Vec::new(),
            dropped: Vec::new(),
            retries: 0,
            uncited: 0,
        };
        for lookup in lookups {
            match lookup {
                Ok((candidate, attempts)) => {
                    outcome.retries += attempts.saturating_sub(1) as usize;
                    if candidate.citations.is_empty() {
                        outcome.uncited += 1;
                    }
                    outcome.ranked.push(candidate);
                }
                Err(dropped) => {
                    outcome.retries += dropped.attempts.saturating_sub(1) as usize;
                    outcome.dropped.push(dropped);
                }
            }
        }
        for (index, candidate) in outcome.ranked.iter_mut().enumerate() {
            candidate.rank = index + 1;
        }
        outcome
    }

    async fn lookup(
        &self,
        mut candidate: RankedCandidate,
    ) -> Result<(RankedCandidate, u32), DroppedCandidate> {
        let retriever = self.retriever;
        let top_k = self.top_k;
        let query = candidate.scored.candidate.description.clone();

        let result = self
            .policy
            .call("retriever", || retriever.search(&query, top_k))
            .await;
        match result {
            Ok((hits, attempts)) => {
                candidate.citations = normalize_citations(hits, top_k);
                Ok((candidate, attempts))
            }
            Err(failure) => {
                let candidate_id = candidate.scored.candidate.candidate_id;
                warn!(
                    candidate_id = %candidate_id,
                    attempts = failure.attempts,
                    error = %failure.last_error,
                    "dropping candidate after citation lookup failure"
                );
                Err(DroppedCandidate {
                    candidate_id,
                    stage: DropStage::Citation,
                    attempts: failure.attempts,
                    reason: failure.last_error.to_string(),
                })
            }
        }
    }
}

fn normalize_citations(mut hits: Vec<Citation>, top_k: usize) -> Vec<Citation> {
    for hit in &mut hits {
        hit.similarity_score = if hit.similarity_score.is_finite() {
            hit.similarity_score.clamp(0.0, 1.0)
        } else {
            0.0
        };
    }
    hits.sort_by(|left, right| {
        right
            .similarity_score
            .total_cmp(&left.similarity_score)
            .then(left.source_id.cmp(&right.source_id))
            .then(left.page.cmp(&right.page))
    });
    hits.truncate(top_k);
    hits
}
