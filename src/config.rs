//! Process configuration (SPEC_FULL §2.O).
//!
//! JSON-file load plus environment overrides, mirroring the teacher's
//! `RAGConfig::from_file`/`validate()` shape but restructured to cover this
//! crate's components instead of the teacher's local-model/chunking setup.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{RagError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub redis_url: Option<String>,
    pub namespace: String,
    pub schema_version: String,
    pub failure_threshold: u64,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VectorMetric {
    Cosine,
    L2,
    InnerProduct,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SearchBackend {
    Relational,
    Secondary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub backend: SearchBackend,
    pub vector_metric: VectorMetric,
    pub default_k: usize,
    pub rrf_k: usize,
    pub score_aware_fusion: bool,
    pub score_weight: f32,
    pub min_score_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryEngineConfig {
    pub base_url: String,
    pub chunk_index: String,
    pub image_index: String,
    pub knn_engine: String,
    pub distance: String,
    pub shards: u32,
    pub replicas: u32,
    pub recency_boost: f32,
    pub recency_half_life_days: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepResearchConfig {
    pub timeout_seconds: u64,
    pub local_top_k: usize,
    pub retry_loops: u32,
    pub missing_loops: u32,
    pub missing_top_k: usize,
    pub confidence_floor: f32,
    pub followup_relevance_min: f32,
    pub reference_half_life_days: f32,
    pub reference_recency_boost: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebAgentConfig {
    pub deadline_seconds: u64,
    pub top_k: usize,
    pub search_engine_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestorConfig {
    pub max_depth: u32,
    pub max_pages: u32,
    pub max_html_bytes: usize,
}

/// Provider dispatch shape only (spec §6/§9): the wire protocol beyond a
/// minimal OpenAI-compatible chat completion is out of scope, so this holds
/// just enough to pick a provider and point `HttpChatProvider` at it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: String,
    pub endpoint: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub search: SearchConfig,
    pub secondary_engine: SecondaryEngineConfig,
    pub chunking: ChunkingConfig,
    pub deep_research: DeepResearchConfig,
    pub web_agent: WebAgentConfig,
    pub ingestor: IngestorConfig,
    pub llm: LlmConfig,
    pub answer_cache_ttl_secs: u64,
    pub result_cache_ttl_secs: u64,
}

impl RagConfig {
    pub fn validate(&self) -> Result<()> {
        if self.database.min_connections > self.database.max_connections {
            return Err(RagError::InvalidArgument(
                "database.min_connections must be <= max_connections".to_string(),
            ));
        }
        if self.search.default_k == 0 {
            return Err(RagError::InvalidArgument(
                "search.default_k must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.search.min_score_threshold) {
            return Err(RagError::InvalidArgument(
                "search.min_score_threshold must be in [0.0, 1.0]".to_string(),
            ));
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err(RagError::InvalidArgument(
                "chunking.chunk_overlap must be < chunk_size".to_string(),
            ));
        }
        if self.deep_research.timeout_seconds < 15 {
            return Err(RagError::InvalidArgument(
                "deep_research.timeout_seconds must be >= 15".to_string(),
            ));
        }
        if !(5..=180).contains(&self.web_agent.deadline_seconds) {
            return Err(RagError::InvalidArgument(
                "web_agent.deadline_seconds must be in 5..=180".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RagError::Internal(anyhow::anyhow!("failed to read config file: {e}")))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| RagError::Internal(anyhow::anyhow!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgres://localhost/shodh_rag".to_string()),
                min_connections: 2,
                max_connections: 10,
            },
            cache: CacheConfig {
                redis_url: std::env::var("REDIS_URL").ok(),
                namespace: "shodhrag".to_string(),
                schema_version: "v1".to_string(),
                failure_threshold: 3,
                cooldown_secs: 30,
            },
            search: SearchConfig {
                backend: SearchBackend::Secondary,
                vector_metric: VectorMetric::Cosine,
                default_k: 10,
                rrf_k: 60,
                score_aware_fusion: false,
                score_weight: 0.3,
                min_score_threshold: 0.1,
            },
            secondary_engine: SecondaryEngineConfig {
                base_url: std::env::var("SEARCH_ENGINE_URL")
                    .unwrap_or_else(|_| "http://localhost:9200".to_string()),
                chunk_index: "shodhrag_chunks".to_string(),
                image_index: "shodhrag_images".to_string(),
                knn_engine: "lucene".to_string(),
                distance: "cosinesimil".to_string(),
                shards: 3,
                replicas: 1,
                recency_boost: 0.0,
                recency_half_life_days: 30.0,
            },
            chunking: ChunkingConfig {
                chunk_size: 1750,
                chunk_overlap: 200,
                min_chunk_size: 100,
            },
            deep_research: DeepResearchConfig {
                timeout_seconds: 60,
                local_top_k: 8,
                retry_loops: 2,
                missing_loops: 2,
                missing_top_k: 3,
                confidence_floor: 0.55,
                followup_relevance_min: 0.15,
                reference_half_life_days: 30.0,
                reference_recency_boost: 0.1,
            },
            web_agent: WebAgentConfig {
                deadline_seconds: 20,
                top_k: 5,
                search_engine_url: "https://html.duckduckgo.com/html/".to_string(),
            },
            ingestor: IngestorConfig {
                max_depth: 2,
                max_pages: 20,
                max_html_bytes: 200 * 1024,
            },
            llm: LlmConfig {
                provider: std::env::var("LLM_PROVIDER").unwrap_or_else(|_| "none".to_string()),
                endpoint: std::env::var("LLM_ENDPOINT")
                    .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string()),
                api_key_env: Some("LLM_API_KEY".to_string()),
                model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                timeout_secs: 30,
                max_tokens: 1024,
                temperature: 0.2,
            },
            answer_cache_ttl_secs: 3600,
            result_cache_ttl_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RagConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_connection_bounds() {
        let mut cfg = RagConfig::default();
        cfg.database.min_connections = 20;
        cfg.database.max_connections = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_short_deep_research_timeout() {
        let mut cfg = RagConfig::default();
        cfg.deep_research.timeout_seconds = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_web_agent_deadline_out_of_range() {
        let mut cfg = RagConfig::default();
        cfg.web_agent.deadline_seconds = 3;
        assert!(cfg.validate().is_err());
        cfg.web_agent.deadline_seconds = 200;
        assert!(cfg.validate().is_err());
    }
}
