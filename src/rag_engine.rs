//! RAG Answerer (spec §4.H) — the five-step pipeline wrapping F for a single
//! non-conversational question: retrieve, compose context, check the answer
//! cache, call the LLM, cache on success, degrade to raw context on failure.
//!
//! Grounded on the teacher's `chat/engine.rs` timeout-guarded LLM call
//! (`tokio::time::timeout` around the provider call) and on `retrieval.rs`'s
//! own cache-key conventions for the answer-cache key built by `query_cache`.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::Result;
use crate::llm::LlmProvider;
use crate::query_cache::{answer_cache_key, AnswerCache, CachedAnswer};
use crate::retrieval::RetrievalEngine;
use crate::types::{Hit, MetadataFilter};

/// Retrieval mode for a single-turn answer (spec §4.H step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerMode {
    Semantic,
    Fulltext,
    Hybrid,
}

impl AnswerMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Fulltext => "fulltext",
            Self::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub answer: String,
    pub hits: Vec<Hit>,
    pub used_llm: bool,
}

pub struct RagAnswerer {
    pub retrieval: Arc<RetrievalEngine>,
    pub cache: Arc<crate::cache::TenantCache>,
    pub llm: Arc<dyn LlmProvider>,
    pub provider_name: String,
    pub answer_cache_ttl_secs: u64,
    pub llm_timeout: Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl RagAnswerer {
    /// The backend used only decides how F fetches hits; it never changes
    /// this pipeline's shape.
    pub async fn answer(
        &self,
        question: &str,
        mode: AnswerMode,
        top_k: usize,
        user_id: Uuid,
        space_id: Option<Uuid>,
        filter: &MetadataFilter,
    ) -> Result<Answer> {
        let hits = match mode {
            AnswerMode::Semantic => self.retrieval.semantic(question, top_k, user_id, space_id, filter).await?,
            AnswerMode::Fulltext => self.retrieval.fulltext(question, top_k, user_id, space_id, filter).await?,
            AnswerMode::Hybrid => self.retrieval.hybrid(question, top_k, user_id, space_id, filter).await?,
        };

        let context = hits.iter().map(|h| h.content.as_str()).collect::<Vec<_>>().join("\n\n");

        let cache_key = answer_cache_key(
            question,
            &hits,
            &context,
            &self.provider_name,
            mode.as_str(),
            user_id,
            space_id,
            top_k,
        );
        let answer_cache = AnswerCache::new(&self.cache, self.answer_cache_ttl_secs);

        if let Some(cached) = answer_cache.get(&cache_key).await {
            return Ok(Answer {
                answer: cached.answer,
                hits,
                used_llm: cached.used_llm,
            });
        }

        let llm_result = tokio::time::timeout(
            self.llm_timeout,
            self.llm.chat(question, &context, self.max_tokens, self.temperature),
        )
        .await
        .ok()
        .flatten();

        match llm_result {
            Some(answer) => {
                answer_cache
                    .put(
                        &cache_key,
                        &CachedAnswer {
                            answer: answer.clone(),
                            used_llm: true,
                        },
                    )
                    .await;
                Ok(Answer { answer, hits, used_llm: true })
            }
            None => Ok(Answer {
                answer: context,
                hits,
                used_llm: false,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_mode_as_str_is_lowercase() {
        assert_eq!(AnswerMode::Semantic.as_str(), "semantic");
        assert_eq!(AnswerMode::Fulltext.as_str(), "fulltext");
        assert_eq!(AnswerMode::Hybrid.as_str(), "hybrid");
    }
}
