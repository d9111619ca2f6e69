//! Process entrypoint (SPEC_FULL §2.P) — a thin library-level `AppContext`
//! that owns the explicit handles the rest of the crate needs: the
//! connection pool, cache client, secondary-engine client, embedder,
//! runtime tuning, and server-start timestamp. Deliberately not a
//! process-wide singleton: callers build one per process (or per test) and
//! pass `Arc`s down, the same shape the teacher's own `AppState` wires up
//! its LanceDB connection and model manager.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::postgres::PgPoolOptions;

use crate::cache::TenantCache;
use crate::chunk_store::ChunkStore;
use crate::config::RagConfig;
use crate::conversation_store::ConversationStore;
use crate::deep_research::DeepResearchOrchestrator;
use crate::embeddings::EmbeddingModel;
use crate::error::{RagError, Result};
use crate::llm::{HttpChatProvider, LlmProvider, NoLlm, Provider};
use crate::processing::chunker::TextChunker;
use crate::rag_engine::RagAnswerer;
use crate::retrieval::RetrievalEngine;
use crate::runtime_tuning::RuntimeTuning;
use crate::search_index::SearchIndex;
use crate::url_ingestor::UrlIngestor;
use crate::web_agent::WebAgent;

fn provider_from_str(s: &str) -> Provider {
    match s.to_lowercase().as_str() {
        "oci" => Provider::Oci,
        "openai" => Provider::OpenAi,
        "bedrock" => Provider::Bedrock,
        "ollama" => Provider::Ollama,
        _ => Provider::None,
    }
}

fn llm_provider_from_config(cfg: &RagConfig) -> Arc<dyn LlmProvider> {
    let provider = provider_from_str(&cfg.llm.provider);
    if provider == Provider::None {
        return Arc::new(NoLlm);
    }
    let api_key = cfg
        .llm
        .api_key_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok());
    Arc::new(HttpChatProvider::new(
        provider,
        cfg.llm.endpoint.clone(),
        api_key,
        cfg.llm.model.clone(),
    ))
}

/// Owns every long-lived handle this service needs and assembles the
/// higher-level components (F, G, H, I, J, K, L) from them. Construction is
/// fallible only where it has to reach the network (the database pool);
/// everything else is pure wiring.
pub struct AppContext {
    pub config: RagConfig,
    pub chunk_store: Arc<ChunkStore>,
    pub conversation_store: Arc<ConversationStore>,
    pub cache: Arc<TenantCache>,
    pub search_index: Arc<SearchIndex>,
    pub runtime_tuning: Arc<RuntimeTuning>,
    pub embedder: Arc<dyn EmbeddingModel>,
    pub llm: Arc<dyn LlmProvider>,
    pub retrieval: Arc<RetrievalEngine>,
    pub answerer: Arc<RagAnswerer>,
    pub web_agent: Arc<WebAgent>,
    pub url_ingestor: Arc<UrlIngestor>,
    pub deep_research: Arc<DeepResearchOrchestrator>,
    pub started_at: Instant,
}

impl AppContext {
    /// Open the database pool and wire up every component from `config` and
    /// the caller-supplied embedder (embedding internals are out of scope;
    /// every deploy brings its own).
    pub async fn new(config: RagConfig, embedder: Arc<dyn EmbeddingModel>) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(config.database.min_connections)
            .max_connections(config.database.max_connections)
            .connect(&config.database.url)
            .await
            .map_err(RagError::from)?;

        let chunk_store = Arc::new(ChunkStore::from_pool(pool.clone(), config.search.vector_metric));
        let conversation_store = Arc::new(ConversationStore::from_pool(pool.clone()));

        let cache = Arc::new(TenantCache::new(
            config.cache.redis_url.as_deref(),
            config.cache.namespace.clone(),
            config.cache.schema_version.clone(),
            config.cache.failure_threshold,
            Duration::from_secs(config.cache.cooldown_secs),
        ));

        let search_index = Arc::new(SearchIndex::new(config.secondary_engine.clone()));
        let runtime_tuning = Arc::new(RuntimeTuning::new());
        let llm = llm_provider_from_config(&config);

        let retrieval = Arc::new(RetrievalEngine {
            chunk_store: chunk_store.clone(),
            search_index: search_index.clone(),
            cache: cache.clone(),
            tuning: runtime_tuning.clone(),
            embedder: embedder.clone(),
            backend: config.search.backend,
            rrf_k: config.search.rrf_k,
            result_cache_ttl_secs: config.result_cache_ttl_secs,
            score_aware_fusion: config.search.score_aware_fusion,
            score_weight: config.search.score_weight,
            vector_weight: 0.5,
            text_weight: 0.5,
        });

        let answerer = Arc::new(RagAnswerer {
            retrieval: retrieval.clone(),
            cache: cache.clone(),
            llm: llm.clone(),
            provider_name: config.llm.provider.clone(),
            answer_cache_ttl_secs: config.answer_cache_ttl_secs,
            llm_timeout: Duration::from_secs(config.llm.timeout_secs),
            max_tokens: config.llm.max_tokens,
            temperature: config.llm.temperature,
        });

        let web_agent = Arc::new(WebAgent::new(config.web_agent.clone()));
        let url_ingestor = Arc::new(UrlIngestor::new(pool, embedder.clone(), config.ingestor.clone()));

        let chunker = TextChunker::new(
            config.chunking.chunk_size,
            config.chunking.chunk_overlap,
            config.chunking.min_chunk_size,
        );

        let deep_research = Arc::new(DeepResearchOrchestrator {
            retrieval: retrieval.clone(),
            web_agent: web_agent.clone(),
            url_ingestor: url_ingestor.clone(),
            conversation_store: conversation_store.clone(),
            chunker,
            llm: llm.clone(),
            config: config.deep_research.clone(),
            max_tokens: config.llm.max_tokens,
            temperature: config.llm.temperature,
        });

        Ok(Self {
            config,
            chunk_store,
            conversation_store,
            cache,
            search_index,
            runtime_tuning,
            embedder,
            llm,
            retrieval,
            answerer,
            web_agent,
            url_ingestor,
            deep_research,
            started_at: Instant::now(),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
