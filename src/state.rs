use std::sync::Arc;

use crate::config::Settings;
use crate::database::{DbPool, Repository};
use crate::scope::RequestScope;
use crate::services::{ChatOrchestrator, HybridRetriever};
use crate::utils::limiters::Limiters;
use dashmap::DashMap;
use uuid::Uuid;

/// Shared application state. Holds no per-request data — everything
/// request-scoped lives in `RequestScope` / the orchestrator's stream state
/// (§5: "all in-memory structures are per-request and not shared").
#[derive(Clone)]
pub struct AppState {
    pub db_pool: DbPool,
    pub repository: Arc<Repository>,
    pub retriever: Arc<HybridRetriever>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub settings: Settings,
    pub limiters: Arc<Limiters>,
    /// Keyed by `conversation_id`, so `DELETE /api/chat/abort` can cancel
    /// only the caller's own in-flight stream (§4.6).
    pub active_scopes: Arc<DashMap<Uuid, RequestScope>>,
}

/// RAII guard removing a request's scope from the abort registry once its
/// stream ends, however it ends (completion, error, or client disconnect
/// dropping the stream early).
pub struct ScopeGuard {
    registry: Arc<DashMap<Uuid, RequestScope>>,
    conversation_id: Uuid,
}

impl ScopeGuard {
    pub fn register(registry: Arc<DashMap<Uuid, RequestScope>>, conversation_id: Uuid, scope: RequestScope) -> Self {
        registry.insert(conversation_id, scope);
        Self { registry, conversation_id }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.conversation_id);
    }
}
