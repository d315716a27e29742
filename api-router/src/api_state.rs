use std::sync::Arc;

use common::{storage::db::SurrealDbClient, utils::config::AppConfig};
use qna_pipeline::QnaPipeline;

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub pipeline: Arc<QnaPipeline>,
}

impl ApiState {
    pub fn new(config: &AppConfig, db: Arc<SurrealDbClient>, pipeline: Arc<QnaPipeline>) -> Self {
        Self {
            db,
            config: config.clone(),
            pipeline,
        }
    }
}
