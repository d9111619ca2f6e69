//! Query Cache (spec §4.G) — the RAG-answer cache layered on top of B's
//! result caches. Result caching itself lives in `retrieval::RetrievalEngine`
//! (keyed by revision); this module only adds the answer-level cache keyed
//! by a fingerprint of the retrieved hits plus the prompt.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::cache::TenantCache;
use crate::types::Hit;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CachedAnswer {
    pub answer: String,
    pub used_llm: bool,
}

/// `sha256(lower(query) | "|" | fingerprint(hits) | "|" | context)` plus
/// `{provider, mode, uid, sid, top_k}` — every component that could change
/// the answer given the same cache hit is folded into the key.
pub fn answer_cache_key(
    query: &str,
    hits: &[Hit],
    context: &str,
    provider: &str,
    mode: &str,
    user_id: Uuid,
    space_id: Option<Uuid>,
    top_k: usize,
) -> String {
    let fingerprint = Hit::fingerprint(hits);
    let mut hasher = Sha256::new();
    hasher.update(query.trim().to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(fingerprint.as_bytes());
    hasher.update(b"|");
    hasher.update(context.as_bytes());
    let digest = hasher.finalize();
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();

    format!(
        "rag:{hex}:{provider}:{mode}:{user_id}:{}:{top_k}",
        space_id.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string())
    )
}

pub struct AnswerCache<'a> {
    cache: &'a TenantCache,
    ttl_secs: u64,
}

impl<'a> AnswerCache<'a> {
    pub fn new(cache: &'a TenantCache, ttl_secs: u64) -> Self {
        Self { cache, ttl_secs }
    }

    /// `ttl_secs == 0` disables the answer cache entirely — every call
    /// misses and nothing is written, matching `TenantCache::set`'s own
    /// zero-TTL no-op.
    pub async fn get(&self, key: &str) -> Option<CachedAnswer> {
        if self.ttl_secs == 0 {
            return None;
        }
        self.cache.get(key).await
    }

    pub async fn put(&self, key: &str, answer: &CachedAnswer) {
        self.cache.set(key, answer, self.ttl_secs).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hit(doc: Uuid, idx: i32) -> Hit {
        Hit {
            chunk_id: None,
            document_id: doc,
            chunk_index: idx,
            content: "x".to_string(),
            file_name: "f".to_string(),
            file_type: crate::types::SourceType::Txt,
            title: "t".to_string(),
            distance: Some(0.1),
            rank: None,
        }
    }

    #[test]
    fn key_is_deterministic_for_same_inputs() {
        let doc = Uuid::new_v4();
        let hits = vec![sample_hit(doc, 0)];
        let uid = Uuid::new_v4();
        let a = answer_cache_key("Q", &hits, "ctx", "oci", "hybrid", uid, None, 5);
        let b = answer_cache_key("Q", &hits, "ctx", "oci", "hybrid", uid, None, 5);
        assert_eq!(a, b);
    }

    #[test]
    fn key_changes_with_query_case_insensitively_but_not_whitespace_only() {
        let doc = Uuid::new_v4();
        let hits = vec![sample_hit(doc, 0)];
        let uid = Uuid::new_v4();
        let a = answer_cache_key("Q", &hits, "ctx", "oci", "hybrid", uid, None, 5);
        let b = answer_cache_key("q", &hits, "ctx", "oci", "hybrid", uid, None, 5);
        assert_eq!(a, b);
    }

    #[test]
    fn key_changes_when_hits_differ() {
        let doc = Uuid::new_v4();
        let uid = Uuid::new_v4();
        let a = answer_cache_key("Q", &[sample_hit(doc, 0)], "ctx", "oci", "hybrid", uid, None, 5);
        let b = answer_cache_key("Q", &[sample_hit(doc, 1)], "ctx", "oci", "hybrid", uid, None, 5);
        assert_ne!(a, b);
    }
}
