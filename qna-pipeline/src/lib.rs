pub mod generation;
pub mod rate_limit;
pub mod retrieval;

use std::sync::Arc;

use async_openai::{config::OpenAIConfig, Client};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            cached_answer::CachedAnswer, party::Party, source_document::SourceDocument,
            system_settings::SystemSettings,
        },
    },
    utils::{embedding::EmbeddingProvider, question::NormalizedQuestion},
};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

pub use generation::AnswerStream;
pub use rate_limit::{RateLimitDecision, RateLimiter, SlidingWindowRateLimiter};

/// Terminal result of one pipeline invocation. Fatal failures travel as
/// `Err(AppError)` instead of a variant.
pub enum QnaOutcome {
    /// A previously generated answer, served without touching the quota.
    Cached {
        answer: String,
        source_documents: Vec<SourceDocument>,
    },
    /// The caller is over quota; the message is ready for display.
    RateLimited { message: String },
    /// A live generation. Consuming the token channel is the caller's job.
    Streaming(AnswerStream),
}

/// The request-resolution state machine: cache lookup, quota check,
/// grounding retrieval, streamed generation, cache write-back.
pub struct QnaPipeline {
    db: Arc<SurrealDbClient>,
    openai_client: Arc<Client<OpenAIConfig>>,
    embedding_provider: Arc<EmbeddingProvider>,
    rate_limiter: Arc<dyn RateLimiter>,
}

impl QnaPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        openai_client: Arc<Client<OpenAIConfig>>,
        embedding_provider: Arc<EmbeddingProvider>,
        rate_limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            db,
            openai_client,
            embedding_provider,
            rate_limiter,
        }
    }

    /// Resolves one (question, party) request for the given caller.
    ///
    /// The ordering is load-bearing: the cache is consulted first so hits
    /// never consume quota, and the quota is checked before retrieval so an
    /// over-quota caller costs neither an embedding nor a generation.
    #[instrument(skip_all, fields(party = %party))]
    pub async fn resolve(
        &self,
        raw_question: &str,
        party: Party,
        fingerprint: &str,
        cancel: CancellationToken,
    ) -> Result<QnaOutcome, AppError> {
        let question = NormalizedQuestion::parse(raw_question)?;

        if let Some(cached) = self.lookup_cached(&question, party).await {
            return Ok(cached);
        }

        if let RateLimitDecision::Limited { message } =
            self.rate_limiter.check(fingerprint).await
        {
            return Ok(QnaOutcome::RateLimited { message });
        }

        let settings = SystemSettings::get_current(&self.db).await?;

        let documents = retrieval::retrieve_source_documents(
            &self.db,
            &self.embedding_provider,
            &question,
            party,
            settings.retrieval_top_k,
        )
        .await?;

        let stream = generation::stream_answer(
            &self.openai_client,
            Arc::clone(&self.db),
            Arc::clone(&self.rate_limiter),
            &settings,
            question,
            party,
            documents,
            fingerprint.to_string(),
            cancel,
        )
        .await?;

        Ok(QnaOutcome::Streaming(stream))
    }

    /// Cache read path. Any backing-store failure and any entry whose
    /// referenced documents no longer all resolve degrade to a miss; a valid
    /// hit bumps the counter (best effort) and is served even when the bump
    /// fails.
    async fn lookup_cached(
        &self,
        question: &NormalizedQuestion,
        party: Party,
    ) -> Option<QnaOutcome> {
        let entry = match CachedAnswer::find(&self.db, question, party).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                warn!("Cache lookup failed, treating as miss: {e}");
                return None;
            }
        };

        let documents =
            match SourceDocument::find_by_ids(&self.db, &entry.source_document_ids).await {
                Ok(documents) => documents,
                Err(e) => {
                    warn!("Failed to resolve cached source documents, treating as miss: {e}");
                    return None;
                }
            };

        if documents.len() != entry.source_document_ids.len() {
            warn!("Cached entry references missing source documents, treating as miss");
            return None;
        }

        if let Err(e) = CachedAnswer::record_hit(&self.db, question, party).await {
            warn!("Failed to record cache hit: {e}");
        }

        Some(QnaOutcome::Cached {
            answer: entry.answer,
            source_documents: documents,
        })
    }
}
