//! Retrieval Engine (spec §4.F) — semantic, fulltext, hybrid-RRF, and image
//! search. Dispatches to D (relational) or E (secondary) per the deploy-time
//! `backend` setting, consults B for per-tenant result caching keyed by
//! revision, and C for ANN probe/candidate tuning.

use std::sync::Arc;

use uuid::Uuid;

use crate::cache::TenantCache;
use crate::chunk_store::ChunkStore;
use crate::config::SearchBackend;
use crate::embeddings::EmbeddingModel;
use crate::error::Result;
use crate::runtime_tuning::RuntimeTuning;
use crate::search::hybrid::{reciprocal_rank_fusion, score_aware_rrf};
use crate::search_index::SearchIndex;
use crate::types::{Hit, ImageHit, MetadataFilter};

pub struct RetrievalEngine {
    pub chunk_store: Arc<ChunkStore>,
    pub search_index: Arc<SearchIndex>,
    pub cache: Arc<TenantCache>,
    pub tuning: Arc<RuntimeTuning>,
    pub embedder: Arc<dyn EmbeddingModel>,
    pub backend: SearchBackend,
    pub rrf_k: usize,
    pub result_cache_ttl_secs: u64,
    pub score_aware_fusion: bool,
    pub score_weight: f32,
    pub vector_weight: f32,
    pub text_weight: f32,
}

fn sid_key(space_id: Option<Uuid>) -> String {
    space_id.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string())
}

fn normalize_query(query: &str) -> String {
    query.trim().to_lowercase()
}

impl RetrievalEngine {
    /// Semantic search (§4.F step 1-5): cache lookup keyed by the tenant's
    /// text revision, embed, dispatch to the configured backend, cache the
    /// result. On a secondary-backend KNN failure, falls back to BM25 (§7);
    /// if that also fails, surfaces `Unavailable`.
    pub async fn semantic(
        &self,
        query: &str,
        top_k: usize,
        user_id: Uuid,
        space_id: Option<Uuid>,
        filter: &MetadataFilter,
    ) -> Result<Vec<Hit>> {
        let rev = self.cache.get_revision("text", &user_id.to_string(), space_id.map(|s| s.to_string()).as_deref()).await;
        let key = format!("sem:{rev}:{user_id}:{}:{top_k}:{}", sid_key(space_id), normalize_query(query));
        if let Some(hits) = self.cache.get::<Vec<Hit>>(&key).await {
            return Ok(hits);
        }

        let query_vector = self.embedder.embed_query(query).await?;
        let hits = match self.backend {
            SearchBackend::Secondary => {
                let candidates = self.tuning.ann_num_candidates();
                match self.search_index.knn_search(&query_vector, top_k, candidates, user_id, filter).await {
                    Ok(hits) => hits,
                    Err(e) => {
                        tracing::warn!(error = %e, "secondary knn search failed, falling back to bm25");
                        self.search_index.bm25_search(query, top_k, user_id, filter).await?
                    }
                }
            }
            SearchBackend::Relational => {
                let probes = self.tuning.ann_probes();
                self.chunk_store.semantic(&query_vector, top_k, probes, user_id, filter).await?
            }
        };

        self.cache.set(&key, &hits, self.result_cache_ttl_secs).await;
        Ok(hits)
    }

    /// Full-text search. Same caching shape as `semantic`, prefix `fts:`.
    pub async fn fulltext(
        &self,
        query: &str,
        top_k: usize,
        user_id: Uuid,
        space_id: Option<Uuid>,
        filter: &MetadataFilter,
    ) -> Result<Vec<Hit>> {
        let rev = self.cache.get_revision("text", &user_id.to_string(), space_id.map(|s| s.to_string()).as_deref()).await;
        let key = format!("fts:{rev}:{user_id}:{}:{top_k}:{}", sid_key(space_id), normalize_query(query));
        if let Some(hits) = self.cache.get::<Vec<Hit>>(&key).await {
            return Ok(hits);
        }

        let hits = match self.backend {
            SearchBackend::Secondary => self.search_index.bm25_search(query, top_k, user_id, filter).await?,
            SearchBackend::Relational => self.chunk_store.fulltext(query, top_k, user_id, filter).await?,
        };

        self.cache.set(&key, &hits, self.result_cache_ttl_secs).await;
        Ok(hits)
    }

    /// Hybrid search: independent semantic + fulltext lists (each at
    /// `top_k`), merged by Reciprocal Rank Fusion (`k_rrf = 60` by default,
    /// configurable). Tie-break `(score desc, chunk_id asc)`; prefers the
    /// semantic payload when both lists contain the same chunk.
    pub async fn hybrid(
        &self,
        query: &str,
        top_k: usize,
        user_id: Uuid,
        space_id: Option<Uuid>,
        filter: &MetadataFilter,
    ) -> Result<Vec<Hit>> {
        let (semantic_hits, fulltext_hits) = tokio::try_join!(
            self.semantic(query, top_k, user_id, space_id, filter),
            self.fulltext(query, top_k, user_id, space_id, filter),
        )?;

        let by_id = |h: &Hit| format!("{}-{}", h.document_id, h.chunk_index);
        let semantic_ranked: Vec<(String, f32)> = semantic_hits
            .iter()
            .map(|h| (by_id(h), h.distance.map(|d| 1.0 - d).unwrap_or(0.0)))
            .collect();
        let fulltext_ranked: Vec<(String, f32)> = fulltext_hits
            .iter()
            .map(|h| (by_id(h), h.rank.unwrap_or(0.0)))
            .collect();

        let fused = if self.score_aware_fusion {
            score_aware_rrf(semantic_ranked, fulltext_ranked, self.rrf_k, top_k, self.score_weight)
        } else {
            reciprocal_rank_fusion(semantic_ranked, fulltext_ranked, self.rrf_k, top_k)
        };

        let mut semantic_by_id = std::collections::HashMap::new();
        for h in semantic_hits {
            semantic_by_id.insert(by_id(&h), h);
        }
        let mut fulltext_by_id = std::collections::HashMap::new();
        for h in fulltext_hits {
            fulltext_by_id.insert(by_id(&h), h);
        }

        let mut merged: Vec<(Hit, f32)> = Vec::with_capacity(fused.len());
        for (id, score, _source) in fused {
            let hit = semantic_by_id.remove(&id).or_else(|| fulltext_by_id.remove(&id));
            if let Some(hit) = hit {
                merged.push((hit, score));
            }
        }

        // Deterministic tie-break: (score desc, chunk_id asc). RRF already
        // sorts by score desc; this only re-stabilizes exact ties.
        merged.sort_by(|(ha, sa), (hb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| by_id(ha).cmp(&by_id(hb)))
        });
        merged.truncate(top_k);

        Ok(merged.into_iter().map(|(hit, _)| hit).collect())
    }

    /// Image search (§4.F): any of `{query_text, query_vector, tags}`. Per
    /// the pinned Open Question in §9, when both a reference vector and a
    /// text query are supplied the reference vector wins and the text query
    /// is dropped — intentional, not an oversight.
    pub async fn image_search(
        &self,
        query_text: Option<&str>,
        query_vector: Option<&[f32]>,
        tags: &[String],
        top_k: usize,
        user_id: Uuid,
        space_id: Option<Uuid>,
    ) -> Result<Vec<ImageHit>> {
        let rev = self.cache.get_revision("image", &user_id.to_string(), space_id.map(|s| s.to_string()).as_deref()).await;
        let vec_marker = if query_vector.is_some() || query_text.is_some() { "vec" } else { "novec" };
        let query_desc = query_text.map(normalize_query).unwrap_or_default();
        let key = format!(
            "img:{rev}:{user_id}:{}:{top_k}:{vec_marker}:{query_desc}:{}",
            sid_key(space_id),
            tags.join(",")
        );
        if let Some(hits) = self.cache.get::<Vec<ImageHit>>(&key).await {
            return Ok(hits);
        }

        // Reference vector present: it wins, text query is dropped (§9).
        let resolved_vector: Option<Vec<f32>> = if let Some(v) = query_vector {
            Some(v.to_vec())
        } else if let Some(text) = query_text {
            Some(self.embedder.embed_image_texts(&[text.to_string()]).await?.into_iter().next().unwrap_or_default())
        } else {
            None
        };
        let effective_text = if query_vector.is_some() { None } else { query_text };

        let hits = match self.backend {
            SearchBackend::Secondary => {
                self.search_index
                    .image_search(
                        resolved_vector.as_deref(),
                        effective_text,
                        top_k,
                        user_id,
                        space_id,
                        tags,
                        self.vector_weight,
                        self.text_weight,
                    )
                    .await?
            }
            SearchBackend::Relational => {
                self.chunk_store
                    .image_search(resolved_vector.as_deref(), effective_text, tags, top_k, user_id, space_id)
                    .await?
            }
        };

        self.cache.set(&key, &hits, self.result_cache_ttl_secs).await;
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sid_key_uses_none_sentinel_for_missing_space() {
        assert_eq!(sid_key(None), "none");
    }

    #[test]
    fn normalize_query_lowercases_and_trims() {
        assert_eq!(normalize_query("  Hello World  "), "hello world");
    }
}
