//! Secondary search engine client (spec §4.E).
//!
//! No crate in this ecosystem's dependency graph speaks OpenSearch directly,
//! so this is a thin REST client over `reqwest`/`serde_json` rather than a
//! vendored wire-protocol crate. The mapping shape (`knn_vector` field, HNSW
//! method, shard/replica settings) and the index-vs-image-index split are
//! recovered from the original system's `opensearch_adapter.py`; the
//! four-variant KNN query dialect fallback exists because different engine
//! versions accept the k-NN clause in different places and this client has
//! no way to probe which one a given deployment speaks.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::SecondaryEngineConfig;
use crate::error::{RagError, Result};
use crate::types::{Hit, ImageAsset, ImageHit, MetadataFilter, SourceType};
use crate::vector_lit::normalize_vector;

pub struct SearchIndex {
    client: reqwest::Client,
    cfg: SecondaryEngineConfig,
}

/// One chunk ready to be bulk-indexed. Built by the retrieval engine /
/// ingestion path from a `Chunk` + its owning `Document`'s metadata.
#[derive(Debug, Clone)]
pub struct ChunkIndexEntry {
    pub chunk_index: i32,
    pub content: String,
    pub file_name: String,
    pub file_type: SourceType,
    pub title: String,
    pub user_id: Uuid,
    pub space_id: Option<Uuid>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub embedding: Vec<f32>,
}

impl SearchIndex {
    pub fn new(cfg: SecondaryEngineConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            cfg,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.cfg.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    /// Creates the chunk and image indices if absent. `force_recreate` drops
    /// and rebuilds both, losing every indexed document — callers must only
    /// pass `true` from an explicit administrative reindex path.
    pub async fn ensure_index(&self, dimension: usize, image_dimension: usize, force_recreate: bool) -> Result<()> {
        self.ensure_one_index(&self.cfg.chunk_index, chunk_mapping(dimension, &self.cfg), force_recreate)
            .await?;
        self.ensure_one_index(
            &self.cfg.image_index,
            image_mapping(image_dimension, &self.cfg),
            force_recreate,
        )
        .await
    }

    async fn ensure_one_index(&self, index: &str, mapping: Value, force_recreate: bool) -> Result<()> {
        let exists = self
            .client
            .head(self.url(index))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false);

        if exists && force_recreate {
            self.client.delete(self.url(index)).send().await.map_err(RagError::from)?;
        } else if exists {
            return Ok(());
        }

        let resp = self
            .client
            .put(self.url(index))
            .json(&mapping)
            .send()
            .await
            .map_err(RagError::from)?;
        if !resp.status().is_success() {
            return Err(RagError::Unavailable(format!(
                "failed to create index {index}: {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Deterministic IDs `"{doc_id}#{chunk_index}"` so replaying the same
    /// bulk write twice is idempotent — the second write overwrites rather
    /// than duplicating.
    pub async fn index_chunks(&self, document_id: Uuid, entries: &[ChunkIndexEntry]) -> Result<()> {
        let mut body = String::new();
        for entry in entries {
            let doc_id = format!("{document_id}#{}", entry.chunk_index);
            body.push_str(&json!({"index": {"_index": self.cfg.chunk_index, "_id": doc_id}}).to_string());
            body.push('\n');
            let doc = json!({
                "doc_id": document_id.to_string(),
                "chunk_index": entry.chunk_index,
                "text": entry.content,
                "file_name": entry.file_name,
                "file_type": format!("{:?}", entry.file_type).to_lowercase(),
                "title": entry.title,
                "user_id": entry.user_id.to_string(),
                "space_id": entry.space_id.map(|s| s.to_string()),
                "created_at": entry.created_at.to_rfc3339(),
                "vector": normalize_vector(&entry.embedding),
            });
            body.push_str(&doc.to_string());
            body.push('\n');
        }
        if body.is_empty() {
            return Ok(());
        }
        let resp = self
            .client
            .post(self.url("_bulk"))
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(RagError::from)?;
        if !resp.status().is_success() {
            return Err(RagError::Unavailable(format!("bulk index failed: {}", resp.status())));
        }
        Ok(())
    }

    /// Deterministic ID `"{doc_id}:{image_id}"`.
    pub async fn index_image_asset(&self, asset: &ImageAsset) -> Result<()> {
        let embedding = asset
            .embedding
            .as_ref()
            .map(|e| normalize_vector(e))
            .unwrap_or_default();
        let doc_id = format!("{}:{}", asset.document_id, asset.id);
        let doc = json!({
            "doc_id": asset.document_id.to_string(),
            "image_id": asset.id.to_string(),
            "user_id": asset.user_id.to_string(),
            "space_id": asset.space_id.map(|s| s.to_string()),
            "file_path": asset.file_path,
            "thumbnail_path": asset.thumbnail_path,
            "tags": asset.tags,
            "caption": asset.caption,
            "created_at": asset.created_at.to_rfc3339(),
            "vector": embedding,
        });
        let resp = self
            .client
            .put(self.url(&format!("{}/_doc/{}", self.cfg.image_index, doc_id)))
            .json(&doc)
            .send()
            .await
            .map_err(RagError::from)?;
        if !resp.status().is_success() {
            return Err(RagError::Unavailable(format!("image index failed: {}", resp.status())));
        }
        Ok(())
    }

    /// Best-effort delete-by-query (`conflicts=proceed, refresh=true`) for
    /// every chunk/image document belonging to `document_id`, optionally
    /// narrowed to `user_id`. Never surfaces an error — cascade cleanup on D
    /// is authoritative; this is only a mirror and failures are logged.
    pub async fn delete_document(&self, document_id: Uuid, user_id: Option<Uuid>) {
        let mut must = vec![json!({"term": {"doc_id": document_id.to_string()}})];
        if let Some(uid) = user_id {
            must.push(json!({"term": {"user_id": uid.to_string()}}));
        }
        let query = json!({"query": {"bool": {"must": must}}});
        for index in [&self.cfg.chunk_index, &self.cfg.image_index] {
            let resp = self
                .client
                .post(self.url(&format!("{index}/_delete_by_query?conflicts=proceed&refresh=true")))
                .json(&query)
                .send()
                .await;
            if let Err(e) = resp {
                tracing::warn!(index = index.as_str(), error = %e, "delete-by-query failed, continuing best-effort");
            }
        }
    }

    /// KNN search with recency-decay wrapping when configured. Tries the
    /// vector-query dialects in order (§4.E); on total failure across all
    /// dialects the caller must fall back to BM25 — this method surfaces
    /// that as `Unavailable` rather than silently returning empty so the
    /// retrieval engine can make that decision explicitly.
    pub async fn knn_search(
        &self,
        query_vector: &[f32],
        k: usize,
        num_candidates: Option<u32>,
        user_id: Uuid,
        filter: &MetadataFilter,
    ) -> Result<Vec<Hit>> {
        let vector = normalize_vector(query_vector);
        let candidates = num_candidates.unwrap_or((k as u32) * 10).max(k as u32);
        let filter_terms = tenant_filter_terms(user_id, filter);

        for dialect in knn_dialects(&vector, k, candidates) {
            let body = wrap_with_recency(
                apply_filter(dialect, filter_terms.clone()),
                k,
                &self.cfg,
            );
            match self.search_chunk_index(&body).await {
                Ok(hits) => return Ok(hits),
                Err(e) => {
                    tracing::debug!(error = %e, "knn dialect failed, trying next");
                    continue;
                }
            }
        }
        Err(RagError::Unavailable("all knn query dialects failed".to_string()))
    }

    /// BM25 full-text search over the secondary index, with the same
    /// recency-decay wrapping as `knn_search`. Used both as the primary
    /// fulltext backend and as the fallback when every KNN dialect fails.
    pub async fn bm25_search(
        &self,
        query: &str,
        k: usize,
        user_id: Uuid,
        filter: &MetadataFilter,
    ) -> Result<Vec<Hit>> {
        let filter_terms = tenant_filter_terms(user_id, filter);
        let bm25 = json!({
            "bool": {
                "filter": filter_terms,
                "must": [{"match": {"text": query}}],
            }
        });
        let body = wrap_with_recency(json!({"size": k, "query": bm25}), k, &self.cfg);
        self.search_chunk_index(&body).await
    }

    async fn search_chunk_index(&self, body: &Value) -> Result<Vec<Hit>> {
        let resp = self
            .client
            .post(self.url(&format!("{}/_search", self.cfg.chunk_index)))
            .json(body)
            .send()
            .await
            .map_err(RagError::from)?;
        if !resp.status().is_success() {
            return Err(RagError::Unavailable(format!("search failed: {}", resp.status())));
        }
        let parsed: Value = resp.json().await.map_err(RagError::from)?;
        Ok(parse_chunk_hits(&parsed))
    }

    /// Cross-modal / lexical image search (§4.F). `query_vector` drives a
    /// weighted KNN clause, `query_text` drives a weighted match against
    /// `caption`; either, both, or neither may be present (lexical-only with
    /// only `tags` is also valid). Combined via `function_score`/`bool`
    /// additive weighting (`vector_weight` / `text_weight`).
    pub async fn image_search(
        &self,
        query_vector: Option<&[f32]>,
        query_text: Option<&str>,
        k: usize,
        user_id: Uuid,
        space_id: Option<Uuid>,
        tags: &[String],
        vector_weight: f32,
        text_weight: f32,
    ) -> Result<Vec<ImageHit>> {
        let mut filter_terms = vec![json!({"term": {"user_id": user_id.to_string()}})];
        if let Some(sid) = space_id {
            filter_terms.push(json!({"term": {"space_id": sid.to_string()}}));
        }
        for tag in tags {
            filter_terms.push(json!({"term": {"tags": tag}}));
        }

        let mut should = Vec::new();
        if let Some(vec) = query_vector {
            let vector = normalize_vector(vec);
            should.push(json!({
                "knn": {"vector": {"vector": vector, "k": k}},
                "boost": vector_weight,
            }));
        }
        if let Some(text) = query_text {
            should.push(json!({
                "match": {"caption": {"query": text, "boost": text_weight}}
            }));
        }

        let query = if should.is_empty() {
            json!({"bool": {"filter": filter_terms}})
        } else {
            json!({"bool": {"filter": filter_terms, "should": should, "minimum_should_match": 1}})
        };

        let body = json!({"size": k, "query": query});
        let resp = self
            .client
            .post(self.url(&format!("{}/_search", self.cfg.image_index)))
            .json(&body)
            .send()
            .await
            .map_err(RagError::from)?;
        if !resp.status().is_success() {
            return Err(RagError::Unavailable(format!("image search failed: {}", resp.status())));
        }
        let parsed: Value = resp.json().await.map_err(RagError::from)?;
        Ok(parse_image_hits(&parsed))
    }
}

fn tenant_filter_terms(user_id: Uuid, filter: &MetadataFilter) -> Vec<Value> {
    let mut filter_terms = vec![json!({"term": {"user_id": user_id.to_string()}})];
    if let Some(space_id) = filter.space_id {
        filter_terms.push(json!({"term": {"space_id": space_id.to_string()}}));
    }
    if let Some(source_path) = &filter.source_path {
        filter_terms.push(json!({"term": {"file_name": source_path}}));
    }
    for tag in &filter.tags {
        filter_terms.push(json!({"term": {"tags": tag}}));
    }
    filter_terms
}

/// The four KNN dialects named in §4.E, tried in order until one succeeds:
/// (a) top-level `knn` object, (b) top-level `knn` as array, (c) a boolean
/// query with `knn` in `must`, (d) a query-level `knn`. Each entry here is
/// the full request body for that dialect (pre-filter, pre-recency-wrap);
/// `apply_filter` attaches the tenant filter afterward in the shape that
/// dialect supports.
fn knn_dialects(vector: &[f32], k: usize, num_candidates: u32) -> Vec<Value> {
    vec![
        json!({
            "size": k,
            "knn": {"field": "vector", "query_vector": vector, "k": k, "num_candidates": num_candidates}
        }),
        json!({
            "size": k,
            "knn": [{"field": "vector", "query_vector": vector, "k": k, "num_candidates": num_candidates}]
        }),
        json!({
            "size": k,
            "query": {"bool": {"must": [{"knn": {"vector": {"vector": vector, "k": k, "num_candidates": num_candidates}}}]}}
        }),
        json!({
            "size": k,
            "query": {"knn": {"vector": vector, "k": k, "num_candidates": num_candidates}}
        }),
    ]
}

/// Attaches the tenant filter to whichever dialect shape `body` is. The
/// top-level-`knn` dialects (a, b) get a sibling `post_filter`; the
/// `query`-based dialects (c, d) get the filter merged into their `bool`.
fn apply_filter(mut body: Value, filter_terms: Vec<Value>) -> Value {
    if let Some(knn) = body.get("knn") {
        let knn = knn.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.remove("knn");
            obj.insert(
                "query".to_string(),
                json!({"bool": {"filter": filter_terms, "must": [{"knn": knn}]}}),
            );
        }
        return body;
    }
    if let Some(query) = body.get_mut("query") {
        if let Some(bool_clause) = query.get_mut("bool") {
            if let Some(obj) = bool_clause.as_object_mut() {
                obj.insert("filter".to_string(), json!(filter_terms));
            }
        } else {
            let existing = query.clone();
            *query = json!({"bool": {"filter": filter_terms, "must": [existing]}});
        }
    }
    body
}

/// Wraps `query` in a `function_score` Gaussian decay over `created_at`
/// (scale = half-life in days, weight = recency boost), additive
/// (`boost_mode=sum`), only when a recency boost > 0 and a half-life is
/// configured. Otherwise returns `body` unchanged.
fn wrap_with_recency(mut body: Value, k: usize, cfg: &SecondaryEngineConfig) -> Value {
    if cfg.recency_boost <= 0.0 || cfg.recency_half_life_days <= 0.0 {
        return body;
    }
    let Some(query) = body.get("query").cloned() else {
        return body;
    };
    let wrapped = json!({
        "size": k,
        "query": {
            "function_score": {
                "query": query,
                "functions": [{
                    "gauss": {
                        "created_at": {
                            "origin": "now",
                            "scale": format!("{}d", cfg.recency_half_life_days),
                        }
                    },
                    "weight": cfg.recency_boost,
                }],
                "boost_mode": "sum",
                "score_mode": "sum",
            }
        }
    });
    if let Some(obj) = body.as_object_mut() {
        obj.insert("query".to_string(), wrapped["query"].clone());
    }
    body
}

fn chunk_mapping(dimension: usize, cfg: &SecondaryEngineConfig) -> Value {
    json!({
        "settings": {
            "index": {
                "knn": true,
                "number_of_shards": cfg.shards,
                "number_of_replicas": cfg.replicas,
            }
        },
        "mappings": {
            "properties": {
                "doc_id": {"type": "keyword"},
                "chunk_index": {"type": "integer"},
                "text": {"type": "text"},
                "file_name": {"type": "keyword"},
                "file_type": {"type": "keyword"},
                "title": {"type": "text"},
                "user_id": {"type": "keyword"},
                "space_id": {"type": "keyword"},
                "created_at": {"type": "date"},
                "vector": {
                    "type": "knn_vector",
                    "dimension": dimension,
                    "method": {
                        "name": "hnsw",
                        "engine": cfg.knn_engine,
                        "space_type": cfg.distance,
                    }
                }
            }
        }
    })
}

fn image_mapping(dimension: usize, cfg: &SecondaryEngineConfig) -> Value {
    json!({
        "settings": {
            "index": {
                "knn": true,
                "number_of_shards": cfg.shards,
                "number_of_replicas": cfg.replicas,
            }
        },
        "mappings": {
            "properties": {
                "doc_id": {"type": "keyword"},
                "image_id": {"type": "keyword"},
                "user_id": {"type": "keyword"},
                "space_id": {"type": "keyword"},
                "file_path": {"type": "keyword"},
                "thumbnail_path": {"type": "keyword"},
                "tags": {"type": "keyword"},
                "caption": {"type": "text"},
                "created_at": {"type": "date"},
                "vector": {
                    "type": "knn_vector",
                    "dimension": dimension,
                    "method": {
                        "name": "hnsw",
                        "engine": cfg.knn_engine,
                        "space_type": cfg.distance,
                    }
                }
            }
        }
    })
}

fn parse_chunk_hits(response: &Value) -> Vec<Hit> {
    response["hits"]["hits"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|hit| {
            let source = &hit["_source"];
            let doc_id: Uuid = source["doc_id"].as_str()?.parse().ok()?;
            let score = hit["_score"].as_f64().unwrap_or(0.0) as f32;
            Some(Hit {
                chunk_id: None,
                document_id: doc_id,
                chunk_index: source["chunk_index"].as_i64().unwrap_or(0) as i32,
                content: source["text"].as_str().unwrap_or_default().to_string(),
                file_name: source["file_name"].as_str().unwrap_or_default().to_string(),
                file_type: SourceType::from_extension(source["file_type"].as_str().unwrap_or_default()),
                title: source["title"].as_str().unwrap_or_default().to_string(),
                distance: Some(1.0 - score.clamp(0.0, 1.0)),
                rank: Some(score),
            })
        })
        .collect()
}

fn parse_image_hits(response: &Value) -> Vec<ImageHit> {
    response["hits"]["hits"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .filter_map(|(i, hit)| {
            let source = &hit["_source"];
            let doc_id: Uuid = source["doc_id"].as_str()?.parse().ok()?;
            let image_id: Uuid = source["image_id"].as_str()?.parse().ok()?;
            Some(ImageHit {
                rank: i,
                doc_id,
                image_id,
                file_path: source["file_path"].as_str().unwrap_or_default().to_string(),
                thumbnail_path: source["thumbnail_path"].as_str().map(|s| s.to_string()),
                caption: source["caption"].as_str().map(|s| s.to_string()),
                tags: source["tags"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                    .unwrap_or_default(),
                score: hit["_score"].as_f64().unwrap_or(0.0) as f32,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_chunk_hits_empty_response_is_empty() {
        let response = json!({"hits": {"hits": []}});
        assert!(parse_chunk_hits(&response).is_empty());
    }

    #[test]
    fn parse_chunk_hits_maps_score_to_distance() {
        let doc_id = Uuid::new_v4();
        let response = json!({"hits": {"hits": [{
            "_score": 0.8,
            "_source": {
                "doc_id": doc_id.to_string(),
                "chunk_index": 2,
                "text": "hello",
                "file_name": "a.txt",
                "file_type": "txt",
                "title": "A",
            }
        }]}});
        let hits = parse_chunk_hits(&response);
        assert_eq!(hits.len(), 1);
        assert!((hits[0].distance.unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn parse_chunk_hits_skips_malformed_doc_id() {
        let response = json!({"hits": {"hits": [{
            "_score": 0.5,
            "_source": {"doc_id": "not-a-uuid", "chunk_index": 0, "text": "x", "file_name": "f", "file_type": "txt", "title": "t"}
        }]}});
        assert!(parse_chunk_hits(&response).is_empty());
    }

    #[test]
    fn knn_dialects_produces_four_variants() {
        let dialects = knn_dialects(&[0.1, 0.2], 5, 50);
        assert_eq!(dialects.len(), 4);
    }

    #[test]
    fn apply_filter_wraps_top_level_knn_dialect() {
        let filter_terms = vec![json!({"term": {"user_id": "u1"}})];
        let body = apply_filter(json!({"size": 5, "knn": {"field": "vector"}}), filter_terms);
        assert!(body.get("knn").is_none());
        assert!(body["query"]["bool"]["filter"].is_array());
    }

    #[test]
    fn wrap_with_recency_is_noop_when_disabled() {
        let cfg = SecondaryEngineConfig {
            base_url: "http://x".to_string(),
            chunk_index: "c".to_string(),
            image_index: "i".to_string(),
            knn_engine: "lucene".to_string(),
            distance: "cosinesimil".to_string(),
            shards: 1,
            replicas: 0,
            recency_boost: 0.0,
            recency_half_life_days: 30.0,
        };
        let body = json!({"size": 5, "query": {"match_all": {}}});
        let wrapped = wrap_with_recency(body.clone(), 5, &cfg);
        assert_eq!(wrapped, body);
    }

    #[test]
    fn wrap_with_recency_adds_function_score_when_enabled() {
        let cfg = SecondaryEngineConfig {
            base_url: "http://x".to_string(),
            chunk_index: "c".to_string(),
            image_index: "i".to_string(),
            knn_engine: "lucene".to_string(),
            distance: "cosinesimil".to_string(),
            shards: 1,
            replicas: 0,
            recency_boost: 0.2,
            recency_half_life_days: 30.0,
        };
        let body = json!({"size": 5, "query": {"match_all": {}}});
        let wrapped = wrap_with_recency(body, 5, &cfg);
        assert!(wrapped["query"]["function_score"].is_object());
        assert_eq!(wrapped["query"]["function_score"]["boost_mode"], "sum");
    }
}
