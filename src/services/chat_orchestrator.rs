//! Chat orchestrator (C5): the `CREATED -> RETRIEVING -> STREAMING ->
//! PERSISTING -> DONE` state machine, including the `ABORTED`/`ERRORED`
//! side-exits.
//!
//! Grounded on `llm_service.rs::chat_stream`'s response-to-stream shape and
//! the SSE event construction pattern from `handlers::chat`'s
//! `stream::unfold` usage, generalized from a single `message`/`done` pair
//! into the full `info chat* (done|error)` grammar this spec requires.

use crate::config::RetrievalConfig;
use crate::database::repository::StorePort;
use crate::models::chat::{SseChatEvent, SseDoneEvent, SseErrorEvent, SseInfoEvent};
use crate::scope::RequestScope;
use crate::services::context_formatter;
use crate::services::llm_client::{ChatClientPort, ChatMessage};
use crate::services::retriever::RetrieverPort;
use crate::utils::error::ApiError;
use axum::response::sse::Event;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const SYSTEM_PROMPT: &str = "You are a helpful assistant answering questions about an indexed document \
collection. Use only the provided context; if the context does not contain the answer, say so plainly.";

/// Tracks which state this request's stream is in. Not read externally, but
/// keeps the transition order explicit and is asserted on directly in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Retrieving,
    Streaming,
    Persisting,
    Done,
    Aborted,
    Errored,
}

pub struct ChatOrchestrator {
    repository: Arc<dyn StorePort>,
    retriever: Arc<dyn RetrieverPort>,
    llm: Arc<dyn ChatClientPort>,
}

impl ChatOrchestrator {
    pub fn new(
        repository: Arc<dyn StorePort>,
        retriever: Arc<dyn RetrieverPort>,
        llm: Arc<dyn ChatClientPort>,
    ) -> Self {
        Self { repository, retriever, llm }
    }

    /// Builds the full event stream for one chat request: retrieval, the
    /// `info` event, the forwarded generation deltas, and persistence.
    pub fn run(
        self: Arc<Self>,
        scope: RequestScope,
        conversation_id: Uuid,
        collection_id: i32,
        user_message: String,
        retrieval_cfg: RetrievalConfig,
    ) -> impl Stream<Item = Event> {
        let prompt_char_budget = retrieval_cfg.prompt_char_budget;
        async_stream::stream! {
            // RETRIEVING
            let context = match self
                .retriever
                .retrieve(&scope, &user_message, collection_id, &retrieval_cfg)
                .await
            {
                Ok(context) => context,
                Err(_) if scope.is_cancelled() => {
                    // Embedding/DB calls are all wrapped in `scope.run`, so a
                    // cancellation mid-retrieval surfaces here as a generic
                    // `Err` (Cancelled/DeadlineExceeded), not a real failure.
                    // -> ABORTED: stop silently, no error event, no persistence.
                    info!(%conversation_id, "stream aborted during retrieval, discarding without persisting");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "retrieval failed, emitting in-stream error");
                    yield sse_event("error", &error_payload(&e));
                    return;
                }
            };

            let formatted = context_formatter::format(&context, prompt_char_budget);
            let message_id = Uuid::new_v4();
            let sources_for_persistence = serde_json::to_value(&formatted.sources).ok();

            yield sse_event("info", &SseInfoEvent { sources: formatted.sources });

            // STREAMING
            let messages = vec![
                ChatMessage { role: "system".into(), content: SYSTEM_PROMPT.into() },
                ChatMessage {
                    role: "user".into(),
                    content: format!("{}\n\n{}", formatted.context_block, user_message),
                },
            ];

            // Raced against cancellation so an abort landing while the
            // connection is still being established (headers not yet back)
            // takes effect within the scope's cancellation budget rather
            // than waiting out the full generation timeout (§4.7).
            let established = tokio::select! {
                biased;
                _ = scope.cancelled() => None,
                r = self.llm.chat_stream(messages) => Some(r),
            };

            let mut content_stream = match established {
                None => {
                    info!(%conversation_id, "stream aborted while establishing generation connection");
                    return;
                }
                Some(Ok(stream)) => stream,
                Some(Err(e)) => {
                    warn!(error = %e, "generation unavailable before first delta");
                    yield sse_event("error", &error_payload(&e));
                    return;
                }
            };

            let mut accumulated = String::new();
            let mut interrupted: Option<ApiError> = None;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = scope.cancelled() => None,
                    item = content_stream.next() => item,
                };

                match next {
                    Some(Ok(delta)) => {
                        accumulated.push_str(&delta);
                        yield sse_event("chat", &SseChatEvent { content: delta, message_id });
                    }
                    Some(Err(e)) => {
                        interrupted = Some(e);
                        break;
                    }
                    None => break,
                }
            }

            if scope.is_cancelled() {
                info!(%conversation_id, "stream aborted, discarding answer without persisting");
                return;
            }

            if let Some(e) = interrupted {
                warn!(error = %e, "generation interrupted mid-stream");
                yield sse_event("error", &error_payload(&e));
                return;
            }

            // PERSISTING: saved only after the last delta has already been
            // forwarded to the client (§5 ordering guarantee 3). `save_message`
            // already returns `ApiError::Database` on failure; propagate it
            // as-is rather than relabeling it under a kind documented for a
            // different (RETRIEVING-phase) cause.
            if let Err(e) = self
                .repository
                .save_message(&scope, conversation_id, "user", &user_message, None)
                .await
            {
                warn!(error = %e, "failed to persist user message");
                yield sse_event("error", &error_payload(&e));
                return;
            }
            if let Err(e) = self
                .repository
                .save_message(&scope, conversation_id, "assistant", &accumulated, sources_for_persistence)
                .await
            {
                warn!(error = %e, "failed to persist assistant message");
                yield sse_event("error", &error_payload(&e));
                return;
            }

            // DONE
            yield sse_event("done", &SseDoneEvent { message_id, tokens_used: None });
        }
    }
}

fn error_payload(err: &ApiError) -> SseErrorEvent {
    SseErrorEvent {
        error: err.user_message().unwrap_or("internal error").to_string(),
        kind: err.kind(),
    }
}

fn sse_event<T: serde::Serialize>(name: &'static str, payload: &T) -> Event {
    Event::default()
        .event(name)
        .data(serde_json::to_string(payload).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_payload_carries_the_closed_kind_taxonomy() {
        let err = ApiError::EmbeddingUnavailable("endpoint down".into());
        let payload = error_payload(&err);
        assert_eq!(payload.kind, "embedding_unavailable");
    }

    #[test]
    fn error_payload_prefers_user_facing_message_over_internal_detail() {
        let err = ApiError::RetrievalUnavailable("connection refused to 10.0.0.5:5432".into());
        let payload = error_payload(&err);
        assert_ne!(payload.error, "connection refused to 10.0.0.5:5432");
    }

    #[test]
    fn sse_event_round_trips_through_json() {
        let event = sse_event("done", &SseDoneEvent { message_id: Uuid::nil(), tokens_used: None });
        // `Event` doesn't expose its fields for inspection; constructing it
        // without panicking on serialization is the behavior under test.
        let _ = format!("{event:?}");
    }

    use crate::database::repository::MockStorePort;
    use crate::database::Message;
    use crate::services::llm_client::{ContentStream, MockChatClientPort};
    use crate::services::retriever::{MockRetrieverPort, RetrievedContext};
    use chrono::Utc;

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

    fn saved_message(role: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::nil(),
            role: role.to_string(),
            content: String::new(),
            sources: None,
            created_at: Utc::now(),
        }
    }

    async fn drive(orchestrator: ChatOrchestrator, scope: RequestScope) -> Vec<String> {
        Arc::new(orchestrator)
            .run(scope, Uuid::nil(), 1, "hello".to_string(), test_cfg())
            .map(|event| format!("{event:?}"))
            .collect()
            .await
    }

    #[tokio::test]
    async fn full_success_yields_info_chat_and_done() {
        let mut retriever = MockRetrieverPort::new();
        retriever
            .expect_retrieve()
            .returning(|_, _, _, _| Ok(RetrievedContext::default()));

        let mut llm = MockChatClientPort::new();
        llm.expect_chat_stream().returning(|_| {
            let stream: ContentStream =
                Box::pin(futures::stream::iter(vec![Ok("Hi".to_string()), Ok(" there".to_string())]));
            Ok(stream)
        });

        let mut store = MockStorePort::new();
        store
            .expect_save_message()
            .times(2)
            .returning(|_, _, role, _, _| Ok(saved_message(role)));

        let orchestrator =
            ChatOrchestrator::new(Arc::new(store), Arc::new(retriever), Arc::new(llm));
        let events = drive(orchestrator, RequestScope::new(std::time::Duration::from_secs(5))).await;

        assert_eq!(events.len(), 4, "info + 2 chat deltas + done: {events:?}");
        assert!(events.last().unwrap().contains("done"));
    }

    #[tokio::test]
    async fn retrieval_failure_emits_error_event() {
        let mut retriever = MockRetrieverPort::new();
        retriever
            .expect_retrieve()
            .returning(|_, _, _, _| Err(ApiError::EmbeddingUnavailable("endpoint down".into())));

        let llm = MockChatClientPort::new();
        let store = MockStorePort::new();

        let orchestrator =
            ChatOrchestrator::new(Arc::new(store), Arc::new(retriever), Arc::new(llm));
        let events = drive(orchestrator, RequestScope::new(std::time::Duration::from_secs(5))).await;

        assert_eq!(events.len(), 1);
        assert!(events[0].contains("embedding_unavailable"));
    }

    #[tokio::test]
    async fn cancelled_retrieval_ends_silently_without_an_error_event() {
        let scope = RequestScope::new(std::time::Duration::from_secs(5));
        scope.cancel();

        let mut retriever = MockRetrieverPort::new();
        retriever
            .expect_retrieve()
            .returning(|_, _, _, _| Err(ApiError::Cancelled));

        let llm = MockChatClientPort::new();
        let store = MockStorePort::new();

        let orchestrator =
            ChatOrchestrator::new(Arc::new(store), Arc::new(retriever), Arc::new(llm));
        let events = drive(orchestrator, scope).await;

        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn generation_interrupted_mid_stream_emits_error_event() {
        let mut retriever = MockRetrieverPort::new();
        retriever
            .expect_retrieve()
            .returning(|_, _, _, _| Ok(RetrievedContext::default()));

        let mut llm = MockChatClientPort::new();
        llm.expect_chat_stream().returning(|_| {
            let stream: ContentStream = Box::pin(futures::stream::iter(vec![
                Ok("partial".to_string()),
                Err(ApiError::GenerationInterrupted("connection reset".into())),
            ]));
            Ok(stream)
        });

        let store = MockStorePort::new();

        let orchestrator =
            ChatOrchestrator::new(Arc::new(store), Arc::new(retriever), Arc::new(llm));
        let events = drive(orchestrator, RequestScope::new(std::time::Duration::from_secs(5))).await;

        assert_eq!(events.len(), 2, "info + error: {events:?}");
        assert!(events.last().unwrap().contains("generation_interrupted"));
    }

    #[tokio::test]
    async fn persistence_failure_emits_error_event_without_relabeling_kind() {
        let mut retriever = MockRetrieverPort::new();
        retriever
            .expect_retrieve()
            .returning(|_, _, _, _| Ok(RetrievedContext::default()));

        let mut llm = MockChatClientPort::new();
        llm.expect_chat_stream().returning(|_| {
            let stream: ContentStream = Box::pin(futures::stream::iter(vec![Ok("Hi".to_string())]));
            Ok(stream)
        });

        let mut store = MockStorePort::new();
        store
            .expect_save_message()
            .returning(|_, _, _, _, _| Err(ApiError::Database("disk full".into())));

        let orchestrator =
            ChatOrchestrator::new(Arc::new(store), Arc::new(retriever), Arc::new(llm));
        let events = drive(orchestrator, RequestScope::new(std::time::Duration::from_secs(5))).await;

        assert_eq!(events.len(), 3, "info + chat + error: {events:?}");
        assert!(events.last().unwrap().contains("retrieval_unavailable"));
    }
}
