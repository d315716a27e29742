use crate::storage::types::cached_answer::deserialize_flexible_id;
use serde::{Deserialize, Serialize};

use crate::{error::AppError, storage::db::SurrealDbClient};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SystemSettings {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub id: String,
    pub query_model: String,
    pub temperature: f32,
    pub max_answer_tokens: u32,
    pub retrieval_top_k: usize,
}

impl SystemSettings {
    pub async fn ensure_initialized(db: &SurrealDbClient) -> Result<Self, AppError> {
        let settings = db.select(("system_settings", "current")).await?;

        if settings.is_none() {
            let created: Option<SystemSettings> = db
                .create(("system_settings", "current"))
                .content(SystemSettings::default())
                .await?;

            return created.ok_or(AppError::Validation("Failed to initialize settings".into()));
        };

        settings.ok_or(AppError::Validation("Failed to initialize settings".into()))
    }

    pub async fn get_current(db: &SurrealDbClient) -> Result<Self, AppError> {
        let settings: Option<Self> = db
            .client
            .query("SELECT * FROM type::thing('system_settings', 'current')")
            .await?
            .take(0)?;

        settings.ok_or(AppError::NotFound("System settings not found".into()))
    }
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            id: "current".to_string(),
            query_model: "gpt-3.5-turbo-16k".to_string(),
            temperature: 0.3,
            max_answer_tokens: 1000,
            retrieval_top_k: 5,
        }
    }
}
