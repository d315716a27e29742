use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{party::Party, source_document::SourceDocument},
    },
    utils::{embedding::EmbeddingProvider, question::NormalizedQuestion},
};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, instrument};

/// Embeds the question and runs the party-scoped similarity search.
///
/// Every failure mode is fatal for the current request: an answer is never
/// generated without grounding, so embedding errors, search errors and an
/// empty result set all abort with a retrieval error.
#[instrument(skip_all, fields(party = %party))]
pub async fn retrieve_source_documents(
    db: &SurrealDbClient,
    embeddings: &EmbeddingProvider,
    question: &NormalizedQuestion,
    party: Party,
    top_k: usize,
) -> Result<Vec<SourceDocument>, AppError> {
    let retry_strategy = ExponentialBackoff::from_millis(100).map(jitter).take(2);
    let query_embedding = Retry::spawn(retry_strategy, || embeddings.embed(question.as_str()))
        .await
        .map_err(|e| AppError::Retrieval(format!("embedding the question failed: {e}")))?;

    let documents = SourceDocument::vector_search(db, query_embedding, party, top_k)
        .await
        .map_err(|e| AppError::Retrieval(format!("similarity search failed: {e}")))?;

    if documents.is_empty() {
        return Err(AppError::Retrieval(format!(
            "no source documents matched the question for party {party}"
        )));
    }

    debug!(count = documents.len(), "retrieved grounding documents");

    Ok(documents)
}
