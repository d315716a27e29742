use api_state::ApiState;
use axum::{extract::FromRef, routing::get, Router};
use routes::{
    liveness::live, popular::popular_questions, question::ask, readiness::ready,
};

pub mod api_state;
pub mod error;
pub mod fingerprint;
mod routes;

/// Router for API functionality, version 1
pub fn api_routes_v1<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    // Probe endpoints (for k8s/systemd) next to the public QnA surface;
    // nothing here requires authentication.
    Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live))
        .route("/qna/ask", get(ask))
        .route("/qna/popular", get(popular_questions))
}
