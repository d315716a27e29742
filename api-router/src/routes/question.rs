use std::{pin::Pin, time::Duration};

use async_stream::stream;
use axum::{
    extract::{Query, State},
    response::{
        sse::{Event, KeepAlive, KeepAliveStream},
        Sse,
    },
};
use common::{
    error::AppError,
    storage::types::{party::Party, source_document::SourceDocument},
};
use futures::{stream, Stream, StreamExt};
use qna_pipeline::QnaOutcome;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::{api_state::ApiState, fingerprint::ClientFingerprint};

/// Fixed message shown for fatal retrieval/generation failures. The caller
/// is free to resubmit; every resubmission re-enters at the cache lookup.
pub const APOLOGY_MESSAGE: &str =
    "Przepraszamy, coś poszło nie tak. Spróbuj zadać pytanie ponownie za chwilę.";

#[derive(Deserialize)]
pub struct AskParams {
    question: String,
    party: Party,
}

/// What the UI gets to render as a source; the stored embedding stays
/// server-side.
#[derive(Serialize)]
struct SourceRef<'a> {
    id: &'a str,
    party: Party,
    chapter_name: &'a str,
    page_number: i64,
    content: &'a str,
}

impl<'a> From<&'a SourceDocument> for SourceRef<'a> {
    fn from(doc: &'a SourceDocument) -> Self {
        Self {
            id: &doc.id,
            party: doc.party,
            chapter_name: &doc.chapter_name,
            page_number: doc.page_number,
            content: &doc.content,
        }
    }
}

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, axum::Error>> + Send>>;

fn create_error_stream(message: impl Into<String>) -> EventStream {
    let message = message.into();
    stream::iter([
        Ok(Event::default().event("error").data(message)),
        close_event(),
    ])
    .boxed()
}

fn close_event() -> Result<Event, axum::Error> {
    Ok(Event::default().event("close_stream").data("Stream complete"))
}

fn sources_event(documents: &[SourceDocument]) -> Result<Event, axum::Error> {
    let refs: Vec<SourceRef<'_>> = documents.iter().map(SourceRef::from).collect();
    match serde_json::to_string(&refs) {
        Ok(json) => Ok(Event::default().event("sources").data(json)),
        Err(e) => {
            error!("Failed to serialize source documents: {e}");
            Ok(Event::default().event("error").data(APOLOGY_MESSAGE))
        }
    }
}

/// Resolves a question against a party program and streams the result.
///
/// Event vocabulary: `sources` (JSON list in retrieval order), `answer`
/// (full cached text), `chat_message` (one generated token), `rate_limit`,
/// `error`, and a final `close_stream`. Dropping the connection cancels an
/// in-flight generation via the token's drop guard.
pub async fn ask(
    State(state): State<ApiState>,
    ClientFingerprint(fingerprint): ClientFingerprint,
    Query(params): Query<AskParams>,
) -> Sse<KeepAliveStream<EventStream>> {
    let cancel = CancellationToken::new();

    let outcome = state
        .pipeline
        .resolve(&params.question, params.party, &fingerprint, cancel.clone())
        .await;

    let events: EventStream = match outcome {
        Err(AppError::Validation(message)) => create_error_stream(message),
        Err(e) => {
            error!("Pipeline failed: {e}");
            create_error_stream(APOLOGY_MESSAGE)
        }
        Ok(QnaOutcome::RateLimited { message }) => stream::iter([
            Ok(Event::default().event("rate_limit").data(message)),
            close_event(),
        ])
        .boxed(),
        Ok(QnaOutcome::Cached {
            answer,
            source_documents,
        }) => stream::iter([
            sources_event(&source_documents),
            Ok(Event::default().event("answer").data(answer)),
            close_event(),
        ])
        .boxed(),
        Ok(QnaOutcome::Streaming(answer_stream)) => {
            let sources = sources_event(&answer_stream.source_documents);
            let mut tokens = answer_stream.tokens;
            // Dropping the SSE body (client gone, or a new question from the
            // same session) releases the guard and cancels the generation.
            let guard = cancel.drop_guard();

            stream! {
                let _guard = guard;
                yield sources;
                while let Some(item) = tokens.recv().await {
                    match item {
                        Ok(token) => {
                            yield Ok(Event::default().event("chat_message").data(token));
                        }
                        Err(e) => {
                            error!("Generation stream failed: {e}");
                            yield Ok(Event::default().event("error").data(APOLOGY_MESSAGE));
                        }
                    }
                }
                yield close_event();
            }
            .boxed()
        }
    };

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
