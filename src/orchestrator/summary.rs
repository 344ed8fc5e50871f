use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::model::{
    BatchSummary, CandidateStatus, FailedCandidate, PropertyTarget, RankedCandidate,
};
use crate::util::{sha256_hex, utc_compact_string};

const TOP_SOURCE_LIMIT: usize = 5;

static BATCH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// `batch_<utc timestamp>_<first 12 hex chars of the content hash>`.
///
/// The hash covers the sub-second clock, the snapshot version and a
/// process-wide sequence number, so identical requests never share an id.
pub(super) fn batch_id(
    created_at: DateTime<Utc>,
    system: &str,
    seed: u64,
    snapshot_version: u64,
    candidate_ids: &[&str],
) -> String {
    let sequence = BATCH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let payload = format!(
        "{system}|{seed}|{snapshot_version}|{}|{}|{sequence}|{}",
        created_at.timestamp(),
        created_at.timestamp_subsec_nanos(),
        candidate_ids.join(",")
    );
    let digest = sha256_hex(payload.as_bytes());
    format!(
        "batch_{}_{}",
        utc_compact_string(created_at),
        &digest[..12]
    )
}

/// One-line explanation of a ranked candidate: predicted fit, the objective
/// that moved its score most, constraint status and the strongest citation.
pub(super) fn rationale(
    candidate: &RankedCandidate,
    target: PropertyTarget,
    (objective, contribution): (&str, f64),
) -> String {
    let prediction = &candidate.scored.prediction;
    let rule_ids = |pending: bool| {
        candidate
            .scored
            .violations
            .iter()
            .filter(|violation| violation.pending_expert == pending)
            .map(|violation| violation.rule_id.as_str())
            .collect::<Vec<&str>>()
    };

    let pending = rule_ids(true);
    let soft = rule_ids(false);
    let constraints = if !pending.is_empty() {
        format!("awaiting expert review of {}", pending.join(", "))
    } else if !soft.is_empty() {
        format!("passes hard constraints with soft findings {}", soft.join(", "))
    } else {
        "passes all hard constraints".to_string()
    };
    let evidence = match candidate.citations.first() {
        Some(citation) => format!(
            "supported by {} p.{} (similarity {:.2})",
            citation.source_id, citation.page, citation.similarity_score
        ),
        None => "no supporting citation found".to_string(),
    };

    format!(
        "predicted alpha {:.3} / epsilon {:.3} for target {:.3} / {:.3}; \
         score led by {objective} ({contribution:+.3}); {constraints}; {evidence}",
        prediction.alpha, prediction.epsilon, target.alpha, target.epsilon
    )
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0_usize), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

pub(super) fn summarize(ranked: &[RankedCandidate], failed: &[FailedCandidate]) -> BatchSummary {
    let total = ranked.len() + failed.len();
    let count_status = |status: CandidateStatus| {
        ranked
            .iter()
            .filter(|candidate| candidate.status == status)
            .count()
    };

    let mut source_counts = BTreeMap::<&str, usize>::new();
    for citation in ranked.iter().flat_map(|candidate| &candidate.citations) {
        *source_counts.entry(citation.source_id.as_str()).or_default() += 1;
    }
    let mut top_sources = source_counts.into_iter().collect::<Vec<(&str, usize)>>();
    top_sources.sort_by(|left, right| right.1.cmp(&left.1).then(left.0.cmp(right.0)));

    BatchSummary {
        total,
        success: count_status(CandidateStatus::Success),
        pending_expert: count_status(CandidateStatus::PendingExpert),
        failed: failed.len(),
        hard_pass_rate: if total == 0 {
            0.0
        } else {
            ranked.len() as f64 / total as f64
        },
        mean_alpha: mean(ranked.iter().map(|candidate| candidate.scored.prediction.alpha)),
        mean_epsilon: mean(ranked.iter().map(|candidate| candidate.scored.prediction.epsilon)),
        mean_confidence: mean(
            ranked
                .iter()
                .map(|candidate| candidate.scored.prediction.confidence),
        ),
        mean_reward: mean(ranked.iter().map(|candidate| candidate.scored.reward_score)),
        top_sources: top_sources
            .into_iter()
            .take(TOP_SOURCE_LIMIT)
            .map(|(source, _)| source.to_string())
            .collect(),
    }
}
