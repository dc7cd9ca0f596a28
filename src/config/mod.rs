pub mod settings;

pub use settings::{
    ChatConfig, DatabaseConfig, EmbeddingConfig, RetrievalConfig, ServerConfig, Settings,
};
