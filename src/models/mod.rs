pub mod chat;
pub mod conversation;

pub use chat::{ChatRequest, SseChatEvent, SseDoneEvent, SseErrorEvent, SseInfoEvent};
pub use conversation::{ConversationResponse, CreateConversationRequest, UpdateConversationRequest};
