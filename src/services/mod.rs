pub mod chat_orchestrator;
pub mod context_formatter;
pub mod embedding_client;
pub mod llm_client;
pub mod retriever;

pub use chat_orchestrator::ChatOrchestrator;
pub use embedding_client::{EmbeddingClient, EmbeddingPort};
pub use llm_client::{ChatClientPort, LlmClient};
pub use retriever::{HybridRetriever, RetrieverPort};
