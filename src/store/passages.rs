use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, params};
use tracing::{debug, warn};

use crate::external::{CitationRetriever, ExternalError};
use crate::model::{Citation, PassageRecord};
use crate::semantic::{
    MAX_EXCERPT_CHARS, cosine_similarity, decode_embedding_blob, embed_text_local,
    embedding_text_hash, encode_embedding_blob, excerpt, normalize_whitespace,
};
use crate::util::{now_utc_string, sha256_hex};

/// Passages scoring below this cosine similarity are never cited.
pub const RELEVANCE_FLOOR: f64 = 0.05;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassageLoadStats {
    pub loaded: usize,
    pub skipped_empty: usize,
    pub embeddings_written: usize,
}

fn passage_id(record: &PassageRecord) -> String {
    let payload = format!(
        "{}|{}|{}",
        record.source_id.trim(),
        record.page,
        normalize_whitespace(&record.text)
    );
    sha256_hex(payload.as_bytes())[..16].to_string()
}

/// Upserts passages and their local embeddings in one transaction. Embeddings
/// whose text hash is unchanged are left alone.
pub fn upsert_passages(
    connection: &mut Connection,
    records: &[PassageRecord],
    model_id: &str,
    dimensions: usize,
) -> Result<PassageLoadStats> {
    let tx = connection
        .transaction()
        .context("failed to start passage transaction")?;
    let now = now_utc_string();
    let mut stats = PassageLoadStats::default();

    {
        let mut passage_statement = tx.prepare(
            "
            INSERT INTO passages(passage_id, source_id, page, text, text_hash, loaded_at)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(passage_id) DO UPDATE SET
              source_id=excluded.source_id,
              page=excluded.page,
              text=excluded.text,
              text_hash=excluded.text_hash
            ",
        )?;
        let mut hash_statement = tx.prepare(
            "SELECT text_hash FROM passage_embeddings WHERE passage_id = ?1 AND model_id = ?2",
        )?;
        let mut embedding_statement = tx.prepare(
            "
            INSERT INTO passage_embeddings(passage_id, model_id, embedding, embedding_dim, text_hash, generated_at)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(passage_id, model_id) DO UPDATE SET
              embedding=excluded.embedding,
              embedding_dim=excluded.embedding_dim,
              text_hash=excluded.text_hash,
              generated_at=excluded.generated_at
            ",
        )?;

        for record in records {
            let text = normalize_whitespace(&record.text);
            if text.is_empty() || record.source_id.trim().is_empty() {
                stats.skipped_empty += 1;
                continue;
            }

            let id = passage_id(record);
            let text_hash = embedding_text_hash(&text);
            passage_statement
                .execute(params![
                    id,
                    record.source_id.trim(),
                    i64::from(record.page),
                    text,
                    text_hash,
                    now
                ])
                .with_context(|| format!("failed to upsert passage {id}"))?;
            stats.loaded += 1;

            let existing = hash_statement
                .query_map(params![id, model_id], |row| row.get::<_, String>(0))?
                .next()
                .transpose()?;
            if existing.as_deref() == Some(text_hash.as_str()) {
                continue;
            }

            let embedding = embed_text_local(&text, dimensions);
            embedding_statement
                .execute(params![
                    id,
                    model_id,
                    encode_embedding_blob(&embedding),
                    embedding.len() as i64,
                    text_hash,
                    now
                ])
                .with_context(|| format!("failed to write embedding for passage {id}"))?;
            stats.embeddings_written += 1;
        }
    }

    tx.commit().context("failed to commit passages")?;
    Ok(stats)
}

pub fn count_passages(connection: &Connection) -> Result<usize> {
    let count = connection
        .query_row("SELECT COUNT(*) FROM passages", [], |row| row.get::<_, i64>(0))
        .context("failed to count passages")?;
    Ok(count.max(0) as usize)
}

#[derive(Debug, Clone)]
struct IndexedPassage {
    source_id: String,
    page: u32,
    text: String,
    embedding: Vec<f32>,
}

/// Cosine search over passage embeddings held in memory. The index is read
/// once when the retriever is built.
#[derive(Debug, Clone)]
pub struct SqliteCitationRetriever {
    passages: Vec<IndexedPassage>,
    dimensions: usize,
    relevance_floor: f64,
}

impl SqliteCitationRetriever {
    pub fn load(connection: &Connection, model_id: &str, dimensions: usize) -> Result<Self> {
        let mut statement = connection.prepare(
            "
            SELECT p.source_id, p.page, p.text, e.embedding, e.embedding_dim
            FROM passages p
            JOIN passage_embeddings e ON e.passage_id = p.passage_id
            WHERE e.model_id = ?1
            ORDER BY p.source_id ASC, p.page ASC, p.passage_id ASC
            ",
        )?;
        let mut rows = statement.query([model_id])?;
        let mut passages = Vec::<IndexedPassage>::new();
        let mut skipped = 0_usize;

        while let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(3)?;
            let stored_dim: i64 = row.get(4)?;
            let expected = usize::try_from(stored_dim).unwrap_or(0);
            let Some(embedding) = decode_embedding_blob(&blob, expected)
                .filter(|embedding| embedding.len() == dimensions)
            else {
                skipped += 1;
                continue;
            };
            passages.push(IndexedPassage {
                source_id: row.get(0)?,
                page: u32::try_from(row.get::<_, i64>(1)?).unwrap_or(0),
                text: row.get(2)?,
                embedding,
            });
        }

        if skipped > 0 {
            warn!(skipped, model_id, "ignored passage embeddings with unexpected dimensions");
        }
        debug!(passages = passages.len(), model_id, "loaded citation index");
        Ok(Self {
            passages,
            dimensions,
            relevance_floor: RELEVANCE_FLOOR,
        })
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub fn search_sync(&self, query: &str, top_k: usize) -> Vec<Citation> {
        let query_embedding = embed_text_local(&normalize_whitespace(query), self.dimensions);
        let mut hits = self
            .passages
            .iter()
            .map(|passage| (cosine_similarity(&query_embedding, &passage.embedding), passage))
            .filter(|(score, _)| score.is_finite() && *score >= self.relevance_floor)
            .collect::<Vec<(f64, &IndexedPassage)>>();

        hits.sort_by(|(left_score, left), (right_score, right)| {
            right_score
                .total_cmp(left_score)
                .then(left.source_id.cmp(&right.source_id))
                .then(left.page.cmp(&right.page))
        });

        hits.into_iter()
            .take(top_k)
            .map(|(score, passage)| Citation {
                source_id: passage.source_id.clone(),
                page: passage.page,
                similarity_score: score.clamp(0.0, 1.0),
                excerpt: excerpt(&passage.text, MAX_EXCERPT_CHARS),
            })
            .collect()
    }
}

#[async_trait]
impl CitationRetriever for SqliteCitationRetriever {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Citation>, ExternalError> {
        Ok(self.search_sync(query, top_k))
    }
}
