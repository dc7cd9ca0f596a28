//! Hybrid retriever (C3): the six-step algorithm that fuses the entity
//! vector channel, the direct text-unit vector channel, and graph context
//! into one `RetrievedContext`.
//!
//! Grounded on `rag_service.rs`'s context-assembly shape (gather → merge →
//! budget → format) and `utils::similarity::cosine_similarity` for the
//! re-rank step; the two recall channels and the deterministic tie-break are
//! new surface this spec requires that the teacher's single-channel search
//! never needed.

use crate::config::RetrievalConfig;
use crate::database::repository::StorePort;
use crate::database::{CommunityReport, Entity, Relationship, Scored, TextUnit};
use crate::scope::RequestScope;
use crate::services::embedding_client::EmbeddingPort;
use crate::utils::cosine_similarity;
use crate::utils::error::ApiError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// The fused retrieval result handed to the context formatter (C4).
#[derive(Debug, Default, Clone)]
pub struct RetrievedContext {
    pub entities: Vec<Scored<Entity>>,
    pub text_units: Vec<Scored<TextUnit>>,
    pub relationships: Vec<Relationship>,
    pub community_reports: Vec<CommunityReport>,
}

/// Lets the chat orchestrator (C5) be tested against a `mockall` fake
/// instead of a real `HybridRetriever` backed by a live store and embedding
/// service.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait]
pub trait RetrieverPort: Send + Sync {
    async fn retrieve(
        &self,
        scope: &RequestScope,
        query_text: &str,
        collection_id: i32,
        cfg: &RetrievalConfig,
    ) -> Result<RetrievedContext, ApiError>;
}

pub struct HybridRetriever {
    repository: Arc<dyn StorePort>,
    embedding: Arc<dyn EmbeddingPort>,
}

impl HybridRetriever {
    pub fn new(repository: Arc<dyn StorePort>, embedding: Arc<dyn EmbeddingPort>) -> Self {
        Self { repository, embedding }
    }

    pub async fn retrieve(
        &self,
        scope: &RequestScope,
        query_text: &str,
        collection_id: i32,
        cfg: &RetrievalConfig,
    ) -> Result<RetrievedContext, ApiError> {
        // Step 1: embed query. No fallback content on failure — the caller
        // surfaces `embedding_unavailable` directly.
        let query_vector = self.embedding.embed(scope, query_text).await?;

        // Steps 2 and 4 run concurrently: both only depend on `query_vector`.
        let entities_fut = self
            .repository
            .nearest_entities(scope, collection_id, &query_vector, cfg.top_k_entities);
        let direct_text_units_fut = self
            .repository
            .nearest_text_units(scope, collection_id, &query_vector, cfg.direct_text_unit_k);

        let (entities_result, direct_text_units_result) = tokio::join!(entities_fut, direct_text_units_fut);

        let entities = match (entities_result, direct_text_units_result.as_ref()) {
            (Ok(entities), _) => entities,
            (Err(e), Ok(_)) => {
                warn!(error = %e, "entity channel failed, continuing with direct text-unit channel only");
                Vec::new()
            }
            (Err(e1), Err(e2)) => {
                return Err(ApiError::RetrievalUnavailable(format!(
                    "both retrieval channels failed: entities={e1}, text_units={e2}"
                )));
            }
        };

        let direct_text_units = match direct_text_units_result {
            Ok(units) => units,
            Err(e) => {
                warn!(error = %e, "direct text-unit channel failed, continuing with entity channel only");
                Vec::new()
            }
        };

        // Both channels returning zero hits is not itself an error (a
        // legitimately sparse collection) — only a hard failure on both is.

        // Step 6 (graph context) overlaps step 5 (re-rank/budget) below; both
        // only need `entities`, which is already resolved at this point.
        let names: HashSet<String> = entities.iter().map(|e| e.item.name.clone()).collect();
        let entity_ids: Vec<String> = entities.iter().map(|e| e.item.id.clone()).collect();

        let graph_fut = self.graph_context(scope, collection_id, &names, &entity_ids, cfg);
        let budget_fut = self.select_text_units(scope, collection_id, &entities, direct_text_units, &query_vector, cfg);

        let (graph_result, text_units_result) = tokio::join!(graph_fut, budget_fut);
        let (relationships, community_reports) = graph_result;
        let text_units = text_units_result?;

        Ok(RetrievedContext {
            entities,
            text_units,
            relationships,
            community_reports,
        })
    }

    /// Step 6: relationships and community reports. Failures here degrade to
    /// empty lists rather than failing the whole request (§4.3 failure policy).
    async fn graph_context(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        names: &HashSet<String>,
        entity_ids: &[String],
        cfg: &RetrievalConfig,
    ) -> (Vec<Relationship>, Vec<CommunityReport>) {
        let relationships = match self
            .repository
            .relationships_for(scope, collection_id, names, cfg.top_k_relationships)
            .await
        {
            Ok(rels) => rels,
            Err(e) => {
                warn!(error = %e, "relationship fetch failed, continuing with empty list");
                Vec::new()
            }
        };

        let communities = match self.repository.communities_for(scope, collection_id, entity_ids).await {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "community lookup failed, continuing with empty list");
                HashMap::new()
            }
        };

        let mut distinct_communities: Vec<i32> = communities.values().copied().collect();
        distinct_communities.sort_unstable();
        distinct_communities.dedup();

        let reports = if distinct_communities.is_empty() {
            Vec::new()
        } else {
            match self
                .repository
                .reports_for(scope, collection_id, &distinct_communities, cfg.top_k_community_reports)
                .await
            {
                Ok(reports) => reports,
                Err(e) => {
                    warn!(error = %e, "community report fetch failed, continuing with empty list");
                    Vec::new()
                }
            }
        };

        (relationships, reports)
    }

    /// Steps 3 + 4 merge + step 5 re-rank/budget.
    async fn select_text_units(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        entities: &[Scored<Entity>],
        direct_text_units: Vec<Scored<TextUnit>>,
        query_vector: &[f32],
        cfg: &RetrievalConfig,
    ) -> Result<Vec<Scored<TextUnit>>, ApiError> {
        // Step 3: union of text_unit_ids reachable from the entity channel.
        let mut linked_ids: Vec<String> = Vec::new();
        let mut seen_ids: HashSet<String> = HashSet::new();
        for entity in entities {
            for id in &entity.item.text_unit_ids {
                if seen_ids.insert(id.clone()) {
                    linked_ids.push(id.clone());
                }
            }
        }

        let linked_units = if linked_ids.is_empty() {
            Vec::new()
        } else {
            self.repository
                .text_units_by_ids(scope, collection_id, &linked_ids)
                .await?
        };

        // Merge: entity-linked units start with no similarity; the direct
        // channel's units already carry one. Keep the higher similarity on
        // overlap (§4.3 step 4).
        let mut merged: HashMap<String, Scored<TextUnit>> = HashMap::new();
        for unit in linked_units {
            merged.insert(
                unit.id.clone(),
                Scored {
                    item: unit,
                    similarity: f32::NAN, // resolved below
                },
            );
        }
        for scored in direct_text_units {
            merged
                .entry(scored.item.id.clone())
                .and_modify(|existing| {
                    if existing.similarity.is_nan() || scored.similarity > existing.similarity {
                        existing.similarity = scored.similarity;
                    }
                })
                .or_insert(scored);
        }

        // Step 5: resolve missing similarities via stored embedding, falling
        // back to a fresh query-time embedding only for chunks with no
        // stored vector at all.
        let mut candidates: Vec<Scored<TextUnit>> = Vec::with_capacity(merged.len());
        for (_, mut scored) in merged {
            if scored.similarity.is_nan() {
                scored.similarity = match &scored.item.embedding {
                    Some(embedding) => cosine_similarity(query_vector, embedding.as_slice()).unwrap_or(0.0),
                    None => {
                        let fresh = self.embedding.embed(scope, &scored.item.text).await?;
                        cosine_similarity(query_vector, &fresh).unwrap_or(0.0)
                    }
                };
            }
            candidates.push(scored);
        }

        // Deterministic order: similarity desc, then id lexicographic asc.
        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.item.id.cmp(&b.item.id))
        });

        // Greedy budget selection: accumulate n_tokens until the next
        // candidate would exceed text_unit_token_budget, capped at top_k.
        // Stops at the first overflow rather than scanning past it, so a
        // lower-similarity chunk never displaces a higher-similarity one
        // that didn't fit.
        let mut selected = Vec::new();
        let mut tokens_used: i64 = 0;
        for candidate in candidates {
            if selected.len() >= cfg.top_k_text_units {
                break;
            }
            let n_tokens = candidate.item.n_tokens as i64;
            if tokens_used + n_tokens > cfg.text_unit_token_budget as i64 {
                break;
            }
            tokens_used += n_tokens;
            selected.push(candidate);
        }

        Ok(selected)
    }
}

#[async_trait]
impl RetrieverPort for HybridRetriever {
    async fn retrieve(
        &self,
        scope: &RequestScope,
        query_text: &str,
        collection_id: i32,
        cfg: &RetrievalConfig,
    ) -> Result<RetrievedContext, ApiError> {
        HybridRetriever::retrieve(self, scope, query_text, collection_id, cfg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repository::MockStorePort;
    use crate::database::TextUnit as TextUnitModel;
    use crate::services::embedding_client::MockEmbeddingPort;

    fn unit(id: &str, similarity: f32, n_tokens: i32) -> Scored<TextUnitModel> {
        Scored {
            item: TextUnitModel {
                id: id.to_string(),
                collection_id: 1,
                document_ids: vec!["doc-1".into()],
                text: "content".into(),
                n_tokens,
                page_start: Some(1),
                page_end: Some(1),
                source_file: Some("file.pdf".into()),
                embedding: None,
            },
            similarity,
        }
    }

    fn greedy_select(mut candidates: Vec<Scored<TextUnitModel>>, budget: i64, top_k: usize) -> Vec<String> {
        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.item.id.cmp(&b.item.id))
        });

        let mut selected = Vec::new();
        let mut tokens_used = 0i64;
        for candidate in candidates {
            if selected.len() >= top_k {
                break;
            }
            let n_tokens = candidate.item.n_tokens as i64;
            if tokens_used + n_tokens > budget {
                break;
            }
            tokens_used += n_tokens;
            selected.push(candidate.item.id);
        }
        selected
    }

    #[test]
    fn greedy_selection_respects_token_budget() {
        let candidates = vec![unit("a", 0.9, 400), unit("b", 0.8, 400), unit("c", 0.7, 400)];
        let selected = greedy_select(candidates, 700, 10);
        assert_eq!(selected, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn tie_break_falls_back_to_lexicographic_id() {
        let candidates = vec![unit("z", 0.5, 10), unit("a", 0.5, 10)];
        let selected = greedy_select(candidates, 1000, 10);
        assert_eq!(selected, vec!["a".to_string(), "z".to_string()]);
    }

    #[test]
    fn top_k_cap_is_enforced_even_under_budget() {
        let candidates = vec![unit("a", 0.9, 1), unit("b", 0.8, 1), unit("c", 0.7, 1)];
        let selected = greedy_select(candidates, 1000, 2);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn stops_at_first_overflow_instead_of_scanning_past_it() {
        // "b" doesn't fit after "a"; a smaller, lower-similarity "c" must not
        // displace it into the selection.
        let candidates = vec![unit("a", 0.9, 400), unit("b", 0.8, 400), unit("c", 0.1, 50)];
        let selected = greedy_select(candidates, 450, 10);
        assert_eq!(selected, vec!["a".to_string()]);
    }

    fn test_cfg() -> RetrievalConfig {
        RetrievalConfig {
            top_k_entities: 10,
            top_k_text_units: 10,
            top_k_relationships: 10,
            top_k_community_reports: 10,
            text_unit_token_budget: 10_000,
            direct_text_unit_k: 10,
            prompt_char_budget: 10_000,
        }
    }

    fn entity(id: &str, similarity: f32) -> Scored<Entity> {
        Scored {
            item: Entity {
                id: id.to_string(),
                collection_id: 1,
                name: format!("entity-{id}"),
                entity_type: "person".into(),
                description: "desc".into(),
                text_unit_ids: vec![],
                embedding: None,
            },
            similarity,
        }
    }

    fn scope() -> RequestScope {
        RequestScope::new(std::time::Duration::from_secs(5))
    }

    #[tokio::test]
    async fn both_channels_failing_returns_retrieval_unavailable() {
        let mut store = MockStorePort::new();
        store
            .expect_nearest_entities()
            .returning(|_, _, _, _| Err(ApiError::Database("down".into())));
        store
            .expect_nearest_text_units()
            .returning(|_, _, _, _| Err(ApiError::Database("down".into())));

        let mut embedding = MockEmbeddingPort::new();
        embedding.expect_embed().returning(|_, _| Ok(vec![0.1, 0.2, 0.3]));

        let retriever = HybridRetriever::new(Arc::new(store), Arc::new(embedding));
        let result = retriever.retrieve(&scope(), "query", 1, &test_cfg()).await;

        assert!(matches!(result, Err(ApiError::RetrievalUnavailable(_))));
    }

    #[tokio::test]
    async fn entity_channel_failure_degrades_to_direct_text_units_only() {
        let mut store = MockStorePort::new();
        store
            .expect_nearest_entities()
            .returning(|_, _, _, _| Err(ApiError::Database("down".into())));
        store
            .expect_nearest_text_units()
            .returning(|_, _, _, _| Ok(vec![unit("t1", 0.9, 10)]));
        store.expect_relationships_for().returning(|_, _, _, _| Ok(vec![]));
        store.expect_communities_for().returning(|_, _, _| Ok(HashMap::new()));

        let mut embedding = MockEmbeddingPort::new();
        embedding.expect_embed().returning(|_, _| Ok(vec![0.1, 0.2, 0.3]));

        let retriever = HybridRetriever::new(Arc::new(store), Arc::new(embedding));
        let context = retriever.retrieve(&scope(), "query", 1, &test_cfg()).await.unwrap();

        assert!(context.entities.is_empty());
        assert_eq!(context.text_units.len(), 1);
        assert_eq!(context.text_units[0].item.id, "t1");
    }

    #[tokio::test]
    async fn graph_context_failures_degrade_to_empty_lists() {
        let mut store = MockStorePort::new();
        store
            .expect_nearest_entities()
            .returning(|_, _, _, _| Ok(vec![entity("e1", 0.9)]));
        store.expect_nearest_text_units().returning(|_, _, _, _| Ok(vec![]));
        store
            .expect_relationships_for()
            .returning(|_, _, _, _| Err(ApiError::Database("down".into())));
        store
            .expect_communities_for()
            .returning(|_, _, _| Err(ApiError::Database("down".into())));

        let mut embedding = MockEmbeddingPort::new();
        embedding.expect_embed().returning(|_, _| Ok(vec![0.1, 0.2, 0.3]));

        let retriever = HybridRetriever::new(Arc::new(store), Arc::new(embedding));
        let context = retriever.retrieve(&scope(), "query", 1, &test_cfg()).await.unwrap();

        assert!(context.relationships.is_empty());
        assert!(context.community_reports.is_empty());
        assert_eq!(context.entities.len(), 1);
    }
}
