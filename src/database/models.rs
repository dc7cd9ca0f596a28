use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Root aggregate; deletion cascades to every row below (spec.md §3, invariant 6).
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Collection {
    pub id: i32,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lightweight summary used by `GET /api/collections` — not part of the core
/// retrieval path, grounded on the reference crate's view-backed `UserDocument`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CollectionSummary {
    pub id: i32,
    pub name: String,
    pub file_count: i64,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Document {
    pub id: String,
    pub collection_id: i32,
    pub title: String,
    pub source_path: String,
    pub original_filename: String,
    pub pdf_path: String,
    pub raw_content: Option<String>,
}

/// A token-bounded chunk extracted from a document. `embedding` may be NULL
/// for legacy rows (spec.md §3) — ineligible for vector search but still
/// reachable through the entity-to-chunk graph link.
#[derive(Debug, Clone, FromRow)]
pub struct TextUnit {
    pub id: String,
    pub collection_id: i32,
    pub document_ids: Vec<String>,
    pub text: String,
    pub n_tokens: i32,
    pub page_start: Option<i32>,
    pub page_end: Option<i32>,
    pub source_file: Option<String>,
    pub embedding: Option<Vector>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Entity {
    pub id: String,
    pub collection_id: i32,
    pub name: String,
    #[sqlx(rename = "type")]
    pub entity_type: String,
    pub description: String,
    pub text_unit_ids: Vec<String>,
    pub embedding: Option<Vector>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Relationship {
    pub id: String,
    pub collection_id: i32,
    pub source_name: String,
    pub target_name: String,
    pub description: String,
    pub weight: f32,
    pub text_unit_ids: Vec<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct CommunityReport {
    pub id: String,
    pub collection_id: i32,
    pub community: i32,
    pub level: i32,
    pub title: String,
    pub summary: String,
    pub full_content: String,
    pub rank: f32,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub collection_id: i32,
    pub user_id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: String,
    pub content: String,
    pub sources: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A vector-search hit paired with its cosine similarity (1 - cosine distance).
#[derive(Debug, Clone)]
pub struct Scored<T> {
    pub item: T,
    pub similarity: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scored_preserves_item_and_similarity() {
        let scored = Scored {
            item: "entity-1".to_string(),
            similarity: 0.87,
        };
        assert_eq!(scored.item, "entity-1");
        assert!((scored.similarity - 0.87).abs() < f32::EPSILON);
    }
}
