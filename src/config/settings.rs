use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub embedding: EmbeddingConfig,
    pub chat: ChatConfig,
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Parent deadline for a request scope (§4.7 of the spec); also bounds the SSE stream lifetime.
    pub request_deadline_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    /// Ordered list of OpenAI-compatible `/embeddings` endpoints; first success wins.
    pub endpoints: Vec<String>,
    pub model: String,
    pub dimension: usize,
    pub timeout_seconds: u64,
    pub max_input_chars: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChatConfig {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: usize,
    pub temperature: f32,
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    pub top_k_entities: usize,
    pub top_k_text_units: usize,
    pub top_k_relationships: usize,
    pub top_k_community_reports: usize,
    pub text_unit_token_budget: usize,
    pub direct_text_unit_k: usize,
    pub prompt_char_budget: usize,
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.request_deadline_secs", 120)?
            .set_default("database.pool_max_size", 10)?
            .set_default("database.pool_timeout_seconds", 30)?
            .set_default("embedding.endpoints", Vec::<String>::new())?
            .set_default("embedding.model", "text-embedding-3-small")?
            .set_default("embedding.dimension", 1024)?
            .set_default("embedding.timeout_seconds", 15)?
            .set_default("embedding.max_input_chars", 8000)?
            .set_default("chat.endpoint", "http://localhost:8081")?
            .set_default("chat.model", "gpt-4o-mini")?
            .set_default("chat.max_tokens", 1024)?
            .set_default("chat.temperature", 0.2)?
            .set_default("chat.timeout_seconds", 60)?
            .set_default("retrieval.top_k_entities", 10)?
            .set_default("retrieval.top_k_text_units", 10)?
            .set_default("retrieval.top_k_relationships", 20)?
            .set_default("retrieval.top_k_community_reports", 3)?
            .set_default("retrieval.text_unit_token_budget", 4000)?
            .set_default("retrieval.direct_text_unit_k", 10)?
            .set_default("retrieval.prompt_char_budget", 24_000)?
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_budgets() {
        std::env::remove_var("APP__DATABASE__URL");
        let settings = Settings::load();
        // Without config/settings.toml present this may fail on required fields
        // (database.url has no default, matching the spec's "must be configured").
        if let Ok(settings) = settings {
            assert_eq!(settings.retrieval.top_k_entities, 10);
            assert_eq!(settings.retrieval.text_unit_token_budget, 4000);
            assert_eq!(settings.retrieval.prompt_char_budget, 24_000);
        }
    }
}
