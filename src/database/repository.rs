use super::models::{
    CollectionSummary, CommunityReport, Conversation, Document, Entity, Message, Relationship,
    Scored, TextUnit,
};
use super::DbPool;
use crate::scope::RequestScope;
use crate::utils::error::ApiError;
use async_trait::async_trait;
use chrono::Utc;
use pgvector::Vector;
use std::collections::{HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

/// The subset of the store gateway that the retriever (C3) and the chat
/// orchestrator (C5) depend on, split out as a trait so both can be tested
/// against a `mockall`-generated fake instead of a live Postgres connection.
/// `Repository` itself still exposes every method as an inherent impl too —
/// handlers call those directly, since they have no need for test doubles.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait]
pub trait StorePort: Send + Sync {
    async fn nearest_entities(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<Scored<Entity>>, ApiError>;

    async fn nearest_text_units(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<Scored<TextUnit>>, ApiError>;

    async fn text_units_by_ids(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        ids: &[String],
    ) -> Result<Vec<TextUnit>, ApiError>;

    async fn relationships_for(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        names: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<Relationship>, ApiError>;

    async fn communities_for(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        entity_ids: &[String],
    ) -> Result<HashMap<String, i32>, ApiError>;

    async fn reports_for(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        communities: &[i32],
        k: usize,
    ) -> Result<Vec<CommunityReport>, ApiError>;

    async fn save_message(
        &self,
        scope: &RequestScope,
        conversation_id: Uuid,
        role: &str,
        content: &str,
        sources: Option<serde_json::Value>,
    ) -> Result<Message, ApiError>;
}

#[async_trait]
impl StorePort for Repository {
    async fn nearest_entities(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<Scored<Entity>>, ApiError> {
        Repository::nearest_entities(self, scope, collection_id, query, k).await
    }

    async fn nearest_text_units(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<Scored<TextUnit>>, ApiError> {
        Repository::nearest_text_units(self, scope, collection_id, query, k).await
    }

    async fn text_units_by_ids(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        ids: &[String],
    ) -> Result<Vec<TextUnit>, ApiError> {
        Repository::text_units_by_ids(self, scope, collection_id, ids).await
    }

    async fn relationships_for(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        names: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<Relationship>, ApiError> {
        Repository::relationships_for(self, scope, collection_id, names, limit).await
    }

    async fn communities_for(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        entity_ids: &[String],
    ) -> Result<HashMap<String, i32>, ApiError> {
        Repository::communities_for(self, scope, collection_id, entity_ids).await
    }

    async fn reports_for(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        communities: &[i32],
        k: usize,
    ) -> Result<Vec<CommunityReport>, ApiError> {
        Repository::reports_for(self, scope, collection_id, communities, k).await
    }

    async fn save_message(
        &self,
        scope: &RequestScope,
        conversation_id: Uuid,
        role: &str,
        content: &str,
        sources: Option<serde_json::Value>,
    ) -> Result<Message, ApiError> {
        Repository::save_message(self, scope, conversation_id, role, content, sources).await
    }
}

/// Typed read/write layer over the relational + vector store (C2). Every
/// operation is scoped by `collection_id` (except `list_collections`) and
/// every operation races the caller's `RequestScope` so a cancelled request
/// aborts its in-flight DB work instead of leaking a connection-pool slot.
pub struct Repository {
    pool: DbPool,
}

fn db_err(e: sqlx::Error) -> ApiError {
    ApiError::Database(e.to_string())
}

/// Row shape for the entity vector-search query — `sqlx::FromRow` derives
/// per-column, so the extra `similarity` column rides alongside the entity
/// fields on one struct rather than as a second element of a query_as tuple.
#[derive(sqlx::FromRow)]
struct ScoredEntityRow {
    id: String,
    collection_id: i32,
    name: String,
    #[sqlx(rename = "type")]
    entity_type: String,
    description: String,
    text_unit_ids: Vec<String>,
    embedding: Option<Vector>,
    similarity: f32,
}

impl From<ScoredEntityRow> for Scored<Entity> {
    fn from(row: ScoredEntityRow) -> Self {
        Scored {
            item: Entity {
                id: row.id,
                collection_id: row.collection_id,
                name: row.name,
                entity_type: row.entity_type,
                description: row.description,
                text_unit_ids: row.text_unit_ids,
                embedding: row.embedding,
            },
            similarity: row.similarity,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ScoredTextUnitRow {
    id: String,
    collection_id: i32,
    document_ids: Vec<String>,
    text: String,
    n_tokens: i32,
    page_start: Option<i32>,
    page_end: Option<i32>,
    source_file: Option<String>,
    embedding: Option<Vector>,
    similarity: f32,
}

impl From<ScoredTextUnitRow> for Scored<TextUnit> {
    fn from(row: ScoredTextUnitRow) -> Self {
        Scored {
            item: TextUnit {
                id: row.id,
                collection_id: row.collection_id,
                document_ids: row.document_ids,
                text: row.text,
                n_tokens: row.n_tokens,
                page_start: row.page_start,
                page_end: row.page_end,
                source_file: row.source_file,
                embedding: row.embedding,
            },
            similarity: row.similarity,
        }
    }
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn list_collections(&self, scope: &RequestScope) -> Result<Vec<CollectionSummary>, ApiError> {
        let pool = self.pool.get_pool().clone();
        scope
            .run(async move {
                sqlx::query_as::<_, CollectionSummary>(
                    r#"SELECT c.id, c.name, COUNT(DISTINCT d.id) AS file_count
                       FROM collections c
                       LEFT JOIN documents d ON d.collection_id = c.id
                       GROUP BY c.id, c.name
                       ORDER BY c.name"#,
                )
                .fetch_all(&pool)
                .await
                .map_err(db_err)
            })
            .await
    }

    pub async fn collection_exists(
        &self,
        scope: &RequestScope,
        collection_id: i32,
    ) -> Result<bool, ApiError> {
        let pool = self.pool.get_pool().clone();
        scope
            .run(async move {
                sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM collections WHERE id = $1)")
                    .bind(collection_id)
                    .fetch_one(&pool)
                    .await
                    .map_err(db_err)
            })
            .await
    }

    /// Looked up by `id` alone (§6 exposes a single-segment
    /// `/api/documents/{id}/pdf`, with no collection scoping in the external
    /// contract) — `Document.id` is assigned at ingestion time and assumed
    /// globally unique, the same assumption `text_units_by_ids` makes for
    /// chunk ids.
    pub async fn get_document(
        &self,
        scope: &RequestScope,
        document_id: &str,
    ) -> Result<Option<Document>, ApiError> {
        let pool = self.pool.get_pool().clone();
        let document_id = document_id.to_string();
        scope
            .run(async move {
                sqlx::query_as::<_, Document>(
                    r#"SELECT id, collection_id, title, source_path, original_filename, pdf_path, raw_content
                       FROM documents WHERE id = $1"#,
                )
                .bind(document_id)
                .fetch_optional(&pool)
                .await
                .map_err(db_err)
            })
            .await
    }

    /// Step 2 of §4.3: dense-vector fan-out over entities, skipping rows
    /// whose `embedding` is NULL (invariant 1 of spec.md §3).
    pub async fn nearest_entities(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<Scored<Entity>>, ApiError> {
        let pool = self.pool.get_pool().clone();
        let vector = Vector::from(query.to_vec());
        let k = k as i64;
        let rows = scope
            .run(async move {
                sqlx::query_as::<_, ScoredEntityRow>(
                    r#"SELECT id, collection_id, name, type, description, text_unit_ids, embedding,
                              1 - (embedding <=> $2) AS similarity
                       FROM entities
                       WHERE collection_id = $1 AND embedding IS NOT NULL
                       ORDER BY embedding <=> $2
                       LIMIT $3"#,
                )
                .bind(collection_id)
                .bind(&vector)
                .bind(k)
                .fetch_all(&pool)
                .await
                .map_err(db_err)
            })
            .await?;

        debug!(collection_id, hits = rows.len(), "nearest_entities");
        Ok(rows.into_iter().map(Scored::from).collect())
    }

    /// Step 4 of §4.3: the direct text-unit recall channel, recovering
    /// chunks whose entity linkage is sparse or incorrect.
    pub async fn nearest_text_units(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<Scored<TextUnit>>, ApiError> {
        let pool = self.pool.get_pool().clone();
        let vector = Vector::from(query.to_vec());
        let k = k as i64;
        let rows = scope
            .run(async move {
                sqlx::query_as::<_, ScoredTextUnitRow>(
                    r#"SELECT id, collection_id, document_ids, text, n_tokens, page_start, page_end,
                              source_file, embedding,
                              1 - (embedding <=> $2) AS similarity
                       FROM text_units
                       WHERE collection_id = $1 AND embedding IS NOT NULL
                       ORDER BY embedding <=> $2
                       LIMIT $3"#,
                )
                .bind(collection_id)
                .bind(&vector)
                .bind(k)
                .fetch_all(&pool)
                .await
                .map_err(db_err)
            })
            .await?;

        Ok(rows.into_iter().map(Scored::from).collect())
    }

    /// Loads text units by id, preserving the order of `ids` (required by §4.2).
    pub async fn text_units_by_ids(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        ids: &[String],
    ) -> Result<Vec<TextUnit>, ApiError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let pool = self.pool.get_pool().clone();
        let id_list = ids.to_vec();
        let rows = scope
            .run(async move {
                sqlx::query_as::<_, TextUnit>(
                    r#"SELECT id, collection_id, document_ids, text, n_tokens, page_start, page_end,
                              source_file, embedding
                       FROM text_units
                       WHERE collection_id = $1 AND id = ANY($2)"#,
                )
                .bind(collection_id)
                .bind(&id_list)
                .fetch_all(&pool)
                .await
                .map_err(db_err)
            })
            .await?;

        let mut by_id: HashMap<String, TextUnit> =
            rows.into_iter().map(|t| (t.id.clone(), t)).collect();

        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// `source ∈ names OR target ∈ names`, ordered by weight desc then id,
    /// deduplicated on `(source_name, target_name, description)` per the
    /// spec's open-question resolution (names are best-effort unique).
    pub async fn relationships_for(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        names: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<Relationship>, ApiError> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let pool = self.pool.get_pool().clone();
        let name_list: Vec<String> = names.iter().cloned().collect();
        let limit = limit as i64;
        let rows = scope
            .run(async move {
                sqlx::query_as::<_, Relationship>(
                    r#"SELECT id, collection_id, source_name, target_name, description, weight, text_unit_ids
                       FROM relationships
                       WHERE collection_id = $1 AND (source_name = ANY($2) OR target_name = ANY($2))
                       ORDER BY weight DESC, id
                       LIMIT $3"#,
                )
                .bind(collection_id)
                .bind(&name_list)
                .bind(limit)
                .fetch_all(&pool)
                .await
                .map_err(db_err)
            })
            .await?;

        let mut seen = HashSet::new();
        Ok(rows
            .into_iter()
            .filter(|r| seen.insert((r.source_name.clone(), r.target_name.clone(), r.description.clone())))
            .collect())
    }

    /// Maps entity id -> community via `Node`; entities with no community
    /// row are simply absent from the returned map (spec.md §4.2).
    pub async fn communities_for(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        entity_ids: &[String],
    ) -> Result<HashMap<String, i32>, ApiError> {
        if entity_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let pool = self.pool.get_pool().clone();
        let ids = entity_ids.to_vec();
        let rows = scope
            .run(async move {
                sqlx::query_as::<_, (String, i32)>(
                    r#"SELECT id, community FROM nodes
                       WHERE collection_id = $1 AND id = ANY($2) AND community IS NOT NULL"#,
                )
                .bind(collection_id)
                .bind(&ids)
                .fetch_all(&pool)
                .await
                .map_err(db_err)
            })
            .await?;

        Ok(rows.into_iter().collect())
    }

    pub async fn reports_for(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        communities: &[i32],
        k: usize,
    ) -> Result<Vec<CommunityReport>, ApiError> {
        if communities.is_empty() {
            return Ok(Vec::new());
        }

        let pool = self.pool.get_pool().clone();
        let communities = communities.to_vec();
        let k = k as i64;
        scope
            .run(async move {
                sqlx::query_as::<_, CommunityReport>(
                    r#"SELECT id, collection_id, community, level, title, summary, full_content, rank
                       FROM community_reports
                       WHERE collection_id = $1 AND community = ANY($2)
                       ORDER BY rank DESC, community
                       LIMIT $3"#,
                )
                .bind(collection_id)
                .bind(&communities)
                .bind(k)
                .fetch_all(&pool)
                .await
                .map_err(db_err)
            })
            .await
    }

    // ----- Conversations & messages (§3 lifecycle: mutable at query time) -----

    pub async fn list_conversations(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        user_id: &str,
    ) -> Result<Vec<Conversation>, ApiError> {
        let pool = self.pool.get_pool().clone();
        let user_id = user_id.to_string();
        scope
            .run(async move {
                sqlx::query_as::<_, Conversation>(
                    r#"SELECT id, collection_id, user_id, title, created_at, updated_at
                       FROM conversations
                       WHERE collection_id = $1 AND user_id = $2
                       ORDER BY updated_at DESC"#,
                )
                .bind(collection_id)
                .bind(user_id)
                .fetch_all(&pool)
                .await
                .map_err(db_err)
            })
            .await
    }

    pub async fn create_conversation(
        &self,
        scope: &RequestScope,
        collection_id: i32,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<Conversation, ApiError> {
        let pool = self.pool.get_pool().clone();
        let user_id = user_id.to_string();
        let title = title.map(str::to_string);
        scope
            .run(async move {
                sqlx::query_as::<_, Conversation>(
                    r#"INSERT INTO conversations (id, collection_id, user_id, title, created_at, updated_at)
                       VALUES ($1, $2, $3, $4, $5, $5)
                       RETURNING id, collection_id, user_id, title, created_at, updated_at"#,
                )
                .bind(Uuid::new_v4())
                .bind(collection_id)
                .bind(user_id)
                .bind(title)
                .bind(Utc::now())
                .fetch_one(&pool)
                .await
                .map_err(db_err)
            })
            .await
    }

    pub async fn get_conversation(
        &self,
        scope: &RequestScope,
        id: Uuid,
    ) -> Result<Option<Conversation>, ApiError> {
        let pool = self.pool.get_pool().clone();
        scope
            .run(async move {
                sqlx::query_as::<_, Conversation>(
                    r#"SELECT id, collection_id, user_id, title, created_at, updated_at
                       FROM conversations WHERE id = $1"#,
                )
                .bind(id)
                .fetch_optional(&pool)
                .await
                .map_err(db_err)
            })
            .await
    }

    pub async fn update_conversation_title(
        &self,
        scope: &RequestScope,
        id: Uuid,
        title: &str,
    ) -> Result<Option<Conversation>, ApiError> {
        let pool = self.pool.get_pool().clone();
        let title = title.to_string();
        scope
            .run(async move {
                sqlx::query_as::<_, Conversation>(
                    r#"UPDATE conversations SET title = $2, updated_at = $3
                       WHERE id = $1
                       RETURNING id, collection_id, user_id, title, created_at, updated_at"#,
                )
                .bind(id)
                .bind(title)
                .bind(Utc::now())
                .fetch_optional(&pool)
                .await
                .map_err(db_err)
            })
            .await
    }

    pub async fn delete_conversation(&self, scope: &RequestScope, id: Uuid) -> Result<bool, ApiError> {
        let pool = self.pool.get_pool().clone();
        let result = scope
            .run(async move {
                sqlx::query("DELETE FROM conversations WHERE id = $1")
                    .bind(id)
                    .execute(&pool)
                    .await
                    .map_err(db_err)
            })
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Saves a message and touches the parent conversation's `updated_at`
    /// in the same transaction — the only per-conversation write, so the
    /// gateway serializes it via row locking (`UPDATE ... WHERE id = $1`)
    /// rather than an in-process lock (§5 shared state).
    pub async fn save_message(
        &self,
        scope: &RequestScope,
        conversation_id: Uuid,
        role: &str,
        content: &str,
        sources: Option<serde_json::Value>,
    ) -> Result<Message, ApiError> {
        let pool = self.pool.get_pool().clone();
        let role = role.to_string();
        let content = content.to_string();
        scope
            .run(async move {
                let mut tx = pool.begin().await.map_err(db_err)?;

                let message = sqlx::query_as::<_, Message>(
                    r#"INSERT INTO messages (id, conversation_id, role, content, sources, created_at)
                       VALUES ($1, $2, $3, $4, $5, $6)
                       RETURNING id, conversation_id, role, content, sources, created_at"#,
                )
                .bind(Uuid::new_v4())
                .bind(conversation_id)
                .bind(role)
                .bind(content)
                .bind(sources)
                .bind(Utc::now())
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;

                sqlx::query("UPDATE conversations SET updated_at = $2 WHERE id = $1")
                    .bind(conversation_id)
                    .bind(Utc::now())
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;

                tx.commit().await.map_err(db_err)?;
                Ok(message)
            })
            .await
    }
}
