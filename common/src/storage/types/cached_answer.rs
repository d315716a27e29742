use sha2::{Digest, Sha256};

use super::party::Party;
use crate::{
    error::AppError, storage::db::SurrealDbClient, stored_object,
    utils::question::NormalizedQuestion,
};

/// The popular-questions list is padded up to this size.
pub const MIN_POPULAR_QUESTIONS: usize = 5;

/// Shown while the cache has not accumulated enough real questions.
pub const FALLBACK_QUESTIONS: [&str; 5] = [
    "Jakie będą korzyści dla młodych?",
    "Czy zadbają o środowisko?",
    "Czy będzie podwyżka płacy minimalnej?",
    "Co zyskają seniorzy?",
    "Czy będzie podwyżka pensji dla nauczycieli?",
];

stored_object!(CachedAnswer, "answer_cache", {
    question: String,
    party: Party,
    answer: String,
    source_document_ids: Vec<String>,
    search_count: i64
});

impl CachedAnswer {
    /// Record id derived from the cache identity. Using a deterministic id
    /// makes "at most one entry per (question, party)" structural and lets
    /// concurrent writers collapse onto the same record.
    pub fn cache_key(question: &NormalizedQuestion, party: Party) -> String {
        let mut hasher = Sha256::new();
        hasher.update(question.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(party.slug().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Exact-match lookup on the normalized key.
    pub async fn find(
        db: &SurrealDbClient,
        question: &NormalizedQuestion,
        party: Party,
    ) -> Result<Option<Self>, AppError> {
        Ok(db.get_item(&Self::cache_key(question, party)).await?)
    }

    /// Bumps the hit counter in a single statement. Never read-then-write:
    /// two concurrent hits on the same question must both land.
    pub async fn record_hit(
        db: &SurrealDbClient,
        question: &NormalizedQuestion,
        party: Party,
    ) -> Result<Self, AppError> {
        let updated: Option<Self> = db
            .client
            .query(
                "UPDATE type::thing('answer_cache', $id) \
                 SET search_count += 1, updated_at = time::now() RETURN AFTER",
            )
            .bind(("id", Self::cache_key(question, party)))
            .await?
            .take(0)?;

        updated.ok_or(AppError::NotFound("Cache entry not found".into()))
    }

    /// Writes a freshly generated answer. A first write creates the entry
    /// with `search_count = 1`; a concurrent duplicate write for the same
    /// key degrades to an update that keeps the existing counter and
    /// creation time, so two simultaneous generations of the same question
    /// leave one consistent entry.
    pub async fn upsert(
        db: &SurrealDbClient,
        question: &NormalizedQuestion,
        party: Party,
        answer: &str,
        source_document_ids: Vec<String>,
    ) -> Result<Self, AppError> {
        let written: Option<Self> = db
            .client
            .query(
                "UPSERT type::thing('answer_cache', $id) SET \
                 question = $question, \
                 party = $party, \
                 answer = $answer, \
                 source_document_ids = $source_document_ids, \
                 search_count = search_count ?? 1, \
                 created_at = created_at ?? time::now(), \
                 updated_at = time::now() \
                 RETURN AFTER",
            )
            .bind(("id", Self::cache_key(question, party)))
            .bind(("question", question.as_str().to_string()))
            .bind(("party", party))
            .bind(("answer", answer.to_string()))
            .bind(("source_document_ids", source_document_ids))
            .await?
            .take(0)?;

        written.ok_or(AppError::InternalError(
            "Cache upsert returned no record".into(),
        ))
    }

    /// Most-asked question texts, summed across parties, padded from the
    /// static pool when fewer than [`MIN_POPULAR_QUESTIONS`] exist.
    pub async fn top_questions(
        db: &SurrealDbClient,
        limit: usize,
    ) -> Result<Vec<String>, AppError> {
        #[derive(Debug, Deserialize)]
        struct PopularRow {
            question: String,
            total: i64,
        }

        let mut rows: Vec<PopularRow> = db
            .client
            .query(
                "SELECT question, math::sum(search_count) AS total \
                 FROM answer_cache GROUP BY question",
            )
            .await?
            .take(0)?;

        rows.sort_by(|a, b| b.total.cmp(&a.total));

        let mut questions: Vec<String> =
            rows.into_iter().map(|row| row.question).take(limit).collect();

        for fallback in FALLBACK_QUESTIONS {
            if questions.len() >= MIN_POPULAR_QUESTIONS {
                break;
            }
            if !questions.iter().any(|question| question == fallback) {
                questions.push(fallback.to_string());
            }
        }

        Ok(questions)
    }
}
