use axum::{extract::State, Json};
use common::storage::types::cached_answer::{CachedAnswer, MIN_POPULAR_QUESTIONS};

use crate::{api_state::ApiState, error::ApiError};

/// Most-asked questions across all parties, padded from the static pool
/// while the cache is still warming up.
pub async fn popular_questions(
    State(state): State<ApiState>,
) -> Result<Json<Vec<String>>, ApiError> {
    let questions = CachedAnswer::top_questions(&state.db, MIN_POPULAR_QUESTIONS).await?;
    Ok(Json(questions))
}
