//! Drives the full `info chat* (done|error)` grammar end-to-end through an
//! in-process `axum` router, with the `StorePort`/`RetrieverPort`/
//! `ChatClientPort` collaborators replaced by `mockall` fakes (`test-util`
//! feature) instead of a live Postgres connection and generation endpoint.
//! `chat_handler` itself is not exercised here since its pre-stream checks
//! (`collection_exists`, `create_conversation`) need a real database; this
//! builds a standalone route directly on top of `ChatOrchestrator`.

use axum::{
    body::to_bytes,
    http::{Request, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::post,
    Router,
};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use graphrag_query_server::config::RetrievalConfig;
use graphrag_query_server::database::repository::MockStorePort;
use graphrag_query_server::database::Message;
use graphrag_query_server::scope::RequestScope;
use graphrag_query_server::services::chat_orchestrator::ChatOrchestrator;
use graphrag_query_server::services::llm_client::{ContentStream, MockChatClientPort};
use graphrag_query_server::services::retriever::{MockRetrieverPort, RetrievedContext};

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
        created_at: chrono::Utc::now(),
    }
}

async fn chat_stream_route(
    axum::extract::State(orchestrator): axum::extract::State<Arc<ChatOrchestrator>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let scope = RequestScope::new(Duration::from_secs(5));
    let stream = orchestrator
        .run(scope, Uuid::nil(), 1, "hello".to_string(), test_cfg())
        .map(Ok);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn router(orchestrator: ChatOrchestrator) -> Router {
    Router::new()
        .route("/chat", post(chat_stream_route))
        .with_state(Arc::new(orchestrator))
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn successful_request_streams_info_then_chat_then_done() {
    let mut retriever = MockRetrieverPort::new();
    retriever
        .expect_retrieve()
        .returning(|_, _, _, _| Ok(RetrievedContext::default()));

    let mut llm = MockChatClientPort::new();
    llm.expect_chat_stream().returning(|_| {
        let stream: ContentStream =
            Box::pin(futures::stream::iter(vec![Ok("Hello".to_string()), Ok(", world".to_string())]));
        Ok(stream)
    });

    let mut store = MockStorePort::new();
    store
        .expect_save_message()
        .times(2)
        .returning(|_, _, role, _, _| Ok(saved_message(role)));

    let orchestrator = ChatOrchestrator::new(Arc::new(store), Arc::new(retriever), Arc::new(llm));
    let app = router(orchestrator);

    let response = app
        .oneshot(Request::builder().method("POST").uri("/chat").body(axum::body::Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_text(response).await;

    let info_pos = body.find("event:info").or_else(|| body.find("event: info")).expect("info event");
    let chat_positions: Vec<_> = body.match_indices("event:chat").collect();
    let chat_positions = if chat_positions.is_empty() {
        body.match_indices("event: chat").collect::<Vec<_>>()
    } else {
        chat_positions
    };
    let done_pos = body.find("event:done").or_else(|| body.find("event: done")).expect("done event");

    assert_eq!(chat_positions.len(), 2, "expected two chat deltas in body: {body}");
    assert!(info_pos < chat_positions[0].0, "info must precede chat: {body}");
    assert!(chat_positions.last().unwrap().0 < done_pos, "chat must precede done: {body}");
    assert!(!body.contains("event:error") && !body.contains("event: error"));
}

#[tokio::test]
async fn retrieval_failure_streams_a_terminal_error_event_and_nothing_after() {
    let mut retriever = MockRetrieverPort::new();
    retriever.expect_retrieve().returning(|_, _, _, _| {
        Err(graphrag_query_server::utils::error::ApiError::RetrievalUnavailable(
            "both channels down".into(),
        ))
    });

    let llm = MockChatClientPort::new();
    let store = MockStorePort::new();

    let orchestrator = ChatOrchestrator::new(Arc::new(store), Arc::new(retriever), Arc::new(llm));
    let app = router(orchestrator);

    let response = app
        .oneshot(Request::builder().method("POST").uri("/chat").body(axum::body::Body::empty()).unwrap())
        .await
        .unwrap();

    let body = body_text(response).await;

    assert!(body.contains("event:error") || body.contains("event: error"), "{body}");
    assert!(body.contains("retrieval_unavailable"), "{body}");
    assert!(!body.contains("event:done") && !body.contains("event: done"));
}
