use std::collections::HashMap;

use uuid::Uuid;

use super::party::Party;
use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// HNSW search width; matches what the index bootstrap defines.
const KNN_EF: usize = 40;

stored_object!(SourceDocument, "source_document", {
    party: Party,
    chapter_name: String,
    page_number: i64,
    content: String,
    embedding: Vec<f32>
});

impl SourceDocument {
    pub fn new(
        party: Party,
        chapter_name: String,
        page_number: i64,
        content: String,
        embedding: Vec<f32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            party,
            chapter_name,
            page_number,
            content,
            embedding,
        }
    }

    /// KNN search over the party's program, relevance descending.
    pub async fn vector_search(
        db: &SurrealDbClient,
        query_embedding: Vec<f32>,
        party: Party,
        top_k: usize,
    ) -> Result<Vec<Self>, AppError> {
        let query = format!(
            "SELECT *, vector::distance::knn() AS distance FROM {} \
             WHERE party = $party AND embedding <|{top_k},{KNN_EF}|> $embedding \
             ORDER BY distance",
            Self::table_name()
        );

        let documents: Vec<Self> = db
            .query(query)
            .bind(("party", party))
            .bind(("embedding", query_embedding))
            .await?
            .take(0)?;

        Ok(documents)
    }

    /// Resolves documents for a cached answer, preserving the order the ids
    /// were stored in (the original retrieval rank). Ids that no longer
    /// resolve are silently dropped; callers decide whether that invalidates
    /// the cached entry.
    pub async fn find_by_ids(
        db: &SurrealDbClient,
        ids: &[String],
    ) -> Result<Vec<Self>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let documents: Vec<Self> = db
            .query(format!(
                "SELECT * FROM {} WHERE record::id(id) IN $ids",
                Self::table_name()
            ))
            .bind(("ids", ids.to_vec()))
            .await?
            .take(0)?;

        let mut by_id: HashMap<String, Self> = documents
            .into_iter()
            .map(|doc| (doc.id.clone(), doc))
            .collect();

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_db() -> SurrealDbClient {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        db.ensure_initialized(3)
            .await
            .expect("Failed to initialize schema");

        db
    }

    fn doc(party: Party, chapter: &str, embedding: Vec<f32>) -> SourceDocument {
        SourceDocument::new(
            party,
            chapter.to_string(),
            7,
            format!("Treść rozdziału {chapter}"),
            embedding,
        )
    }

    #[tokio::test]
    async fn vector_search_filters_by_party_and_ranks_by_distance() {
        let db = setup_db().await;

        let close = doc(Party::Lewica, "Praca", vec![0.9, 0.1, 0.0]);
        let far = doc(Party::Lewica, "Zdrowie", vec![0.1, 0.9, 0.0]);
        let other_party = doc(Party::Psl, "Rolnictwo", vec![0.9, 0.1, 0.0]);

        for document in [close.clone(), far.clone(), other_party] {
            db.store_item(document).await.expect("Failed to store doc");
        }

        let results =
            SourceDocument::vector_search(&db, vec![1.0, 0.0, 0.0], Party::Lewica, 5)
                .await
                .expect("Search failed");

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, close.id);
        assert_eq!(results[1].id, far.id);
        assert!(results.iter().all(|d| d.party == Party::Lewica));
    }

    #[tokio::test]
    async fn vector_search_respects_top_k() {
        let db = setup_db().await;

        for i in 0..4 {
            let embedding = vec![1.0, i as f32 * 0.1, 0.0];
            db.store_item(doc(Party::Konfederacja, &format!("Rozdział {i}"), embedding))
                .await
                .expect("Failed to store doc");
        }

        let results =
            SourceDocument::vector_search(&db, vec![1.0, 0.0, 0.0], Party::Konfederacja, 2)
                .await
                .expect("Search failed");

        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn find_by_ids_preserves_requested_order() {
        let db = setup_db().await;

        let first = doc(Party::Lewica, "A", vec![1.0, 0.0, 0.0]);
        let second = doc(Party::Lewica, "B", vec![0.0, 1.0, 0.0]);
        for document in [first.clone(), second.clone()] {
            db.store_item(document).await.expect("Failed to store doc");
        }

        // Request in reverse storage order, with one id that does not resolve.
        let ids = vec![
            second.id.clone(),
            "missing".to_string(),
            first.id.clone(),
        ];
        let resolved = SourceDocument::find_by_ids(&db, &ids)
            .await
            .expect("Lookup failed");

        let resolved_ids: Vec<&str> = resolved.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(resolved_ids, vec![second.id.as_str(), first.id.as_str()]);
    }

    #[tokio::test]
    async fn find_by_ids_with_no_ids_is_empty() {
        let db = setup_db().await;
        let resolved = SourceDocument::find_by_ids(&db, &[])
            .await
            .expect("Lookup failed");
        assert!(resolved.is_empty());
    }
}
