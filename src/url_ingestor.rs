//! External URL Ingestor (spec §4.J) — fetch, clean, chunk, embed, and
//! persist user-supplied URLs into a conversation-scoped corpus, separate
//! from the tenant's primary document corpus (D/E).
//!
//! The BFS crawl and cleaning pass share their shape with B's web agent
//! (`web_agent::clean_html`'s approach, grounded the same way on the
//! DevsHero-search-scrape pack example); same-registered-domain link
//! following uses the `url` crate the way that pack's scraper uses it for
//! host comparisons.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use url::Url;
use uuid::Uuid;

use crate::config::IngestorConfig;
use crate::embeddings::EmbeddingModel;
use crate::error::{RagError, Result};
use crate::processing::chunker::TextChunker;
use crate::types::ConversationExternalDoc;

const MAX_HTML_BYTES_DEFAULT: usize = 200 * 1024;

pub struct UrlIngestor {
    pool: PgPool,
    client: reqwest::Client,
    embedder: std::sync::Arc<dyn EmbeddingModel>,
    config: IngestorConfig,
}

/// A retrieval envelope: title + url + a short snippet + bounded content.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExternalContextEnvelope {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub content: String,
}

impl UrlIngestor {
    pub fn new(pool: PgPool, embedder: std::sync::Arc<dyn EmbeddingModel>, config: IngestorConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_default();
        Self { pool, client, embedder, config }
    }

    /// BFS crawl starting from `seed_urls`, bounded by `max_depth`/`max_pages`.
    /// Every fetched page is chunked, embedded, and upserted. Returns the
    /// number of chunks persisted.
    pub async fn ingest_external_urls(
        &self,
        seed_urls: &[String],
        user_id: Uuid,
        space_id: Option<Uuid>,
        conversation_id: &str,
        chunker: &TextChunker,
    ) -> Result<usize> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, Option<String>, u32)> = seed_urls
            .iter()
            .map(|u| (u.clone(), None, 0u32))
            .collect();
        let mut persisted = 0usize;
        let mut pages_fetched = 0u32;

        while let Some((url, parent, depth)) = queue.pop_front() {
            if pages_fetched >= self.config.max_pages {
                break;
            }
            if visited.contains(&url) {
                continue;
            }
            visited.insert(url.clone());

            let parsed = match Url::parse(&url) {
                Ok(u) => u,
                Err(_) => continue,
            };

            let page = match self.fetch_page(&url).await {
                Ok(Some(p)) => p,
                Ok(None) | Err(_) => continue,
            };
            pages_fetched += 1;

            let chunks = chunker.chunk(&page.text);
            for (idx, chunk) in chunks.iter().enumerate() {
                let embedding = self.embedder.embed_document(&chunk.text).await?;
                let content_hash = sha256_hex(&chunk.text);
                let snippet: String = chunk.text.chars().take(240).collect();
                let content: String = chunk.text.chars().take(2000).collect();
                self.upsert_external_doc(&ConversationExternalDoc {
                    user_id,
                    space_id,
                    conversation_id: conversation_id.to_string(),
                    url: url.clone(),
                    parent_url: parent.clone(),
                    depth: depth as i32,
                    chunk_index: idx as i32,
                    title: page.title.clone(),
                    content,
                    snippet,
                    content_hash,
                    metadata: serde_json::json!({}),
                    embedding: Some(embedding),
                    created_at: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                })
                .await?;
                persisted += 1;
            }

            if depth < self.config.max_depth {
                for link in &page.links {
                    if let Ok(link_url) = Url::parse(link) {
                        if same_registered_domain(&parsed, &link_url) && !visited.contains(link_url.as_str()) {
                            queue.push_back((link_url.to_string(), Some(url.clone()), depth + 1));
                        }
                    }
                }
            }
        }

        Ok(persisted)
    }

    async fn fetch_page(&self, url: &str) -> Result<Option<FetchedPage>> {
        let resp = self.client.get(url).send().await.map_err(RagError::from)?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.starts_with("text/html") {
            return Ok(None);
        }

        let bytes = resp.bytes().await.map_err(RagError::from)?;
        let max_bytes = if self.config.max_html_bytes > 0 {
            self.config.max_html_bytes
        } else {
            MAX_HTML_BYTES_DEFAULT
        };
        let truncated = &bytes[..bytes.len().min(max_bytes)];
        let html = String::from_utf8_lossy(truncated);

        let document = Html::parse_document(&html);
        let title = extract_title(&document);
        let text = clean_text(&document);
        let links = extract_links(&document);

        Ok(Some(FetchedPage { title, text, links }))
    }

    async fn upsert_external_doc(&self, doc: &ConversationExternalDoc) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversation_external_docs
                (user_id, space_id, conversation_id, url, parent_url, depth, chunk_index,
                 title, content, snippet, content_hash, metadata, embedding, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,now(),now())
             ON CONFLICT (user_id, conversation_id, url, chunk_index) DO UPDATE SET
                title = EXCLUDED.title,
                content = EXCLUDED.content,
                snippet = EXCLUDED.snippet,
                content_hash = EXCLUDED.content_hash,
                metadata = EXCLUDED.metadata,
                embedding = EXCLUDED.embedding,
                updated_at = now()",
        )
        .bind(doc.user_id)
        .bind(doc.space_id)
        .bind(&doc.conversation_id)
        .bind(&doc.url)
        .bind(&doc.parent_url)
        .bind(doc.depth)
        .bind(doc.chunk_index)
        .bind(&doc.title)
        .bind(&doc.content)
        .bind(&doc.snippet)
        .bind(&doc.content_hash)
        .bind(&doc.metadata)
        .bind(doc.embedding.as_deref().map(crate::vector_lit::to_vec_literal))
        .execute(&self.pool)
        .await
        .map_err(RagError::from)?;
        Ok(())
    }

    /// Top-K external chunks for `query`, filtered by tenant ownership and
    /// optionally `space_id`, ordered by vector distance ascending.
    pub async fn retrieve_external_contexts(
        &self,
        query: &str,
        top_k: usize,
        user_id: Uuid,
        conversation_id: &str,
        space_id: Option<Uuid>,
    ) -> Result<Vec<ExternalContextEnvelope>> {
        let query_vector = self.embedder.embed_query(query).await?;
        let vec_literal = crate::vector_lit::to_vec_literal(&query_vector);

        let sql = if space_id.is_some() {
            "SELECT title, url, snippet, content FROM conversation_external_docs
             WHERE user_id = $1 AND conversation_id = $2 AND space_id = $4
             ORDER BY embedding <=> $3::vector ASC LIMIT $5"
        } else {
            "SELECT title, url, snippet, content FROM conversation_external_docs
             WHERE user_id = $1 AND conversation_id = $2
             ORDER BY embedding <=> $3::vector ASC LIMIT $5"
        };

        let mut q = sqlx::query(sql).bind(user_id).bind(conversation_id).bind(&vec_literal);
        q = if let Some(sid) = space_id {
            q.bind(sid).bind(top_k as i64)
        } else {
            q.bind(top_k as i64)
        };

        let rows = q.fetch_all(&self.pool).await.map_err(RagError::from)?;
        Ok(rows
            .into_iter()
            .map(|row| ExternalContextEnvelope {
                title: row.get("title"),
                url: row.get("url"),
                snippet: row.get("snippet"),
                content: row.get("content"),
            })
            .collect())
    }
}

struct FetchedPage {
    title: String,
    text: String,
    links: Vec<String>,
}

fn extract_title(document: &Html) -> String {
    let selector = Selector::parse("title").unwrap();
    document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

fn extract_links(document: &Html) -> Vec<String> {
    let selector = Selector::parse("a[href]").unwrap();
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("href"))
        .map(|s| s.to_string())
        .collect()
}

fn clean_text(document: &Html) -> String {
    let noise = Selector::parse("script, style, noscript").unwrap();
    let noise_ids: HashSet<_> = document
        .select(&noise)
        .flat_map(|el| el.descendants().map(|d| d.id()))
        .collect();

    let mut text = String::new();
    for node in document.tree.nodes() {
        if noise_ids.contains(&node.id()) {
            continue;
        }
        if let Some(t) = node.value().as_text() {
            text.push_str(t);
            text.push(' ');
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Same registered domain: the last two labels of the host must match
/// (`docs.example.com` and `example.com` are the same registered domain;
/// `example.com` and `example.org` are not).
fn same_registered_domain(a: &Url, b: &Url) -> bool {
    match (a.host_str(), b.host_str()) {
        (Some(ha), Some(hb)) => registered_domain(ha) == registered_domain(hb),
        _ => false,
    }
}

fn registered_domain(host: &str) -> String {
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() <= 2 {
        host.to_string()
    } else {
        parts[parts.len() - 2..].join(".")
    }
}

fn sha256_hex(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_domain_strips_subdomains() {
        assert_eq!(registered_domain("docs.example.com"), "example.com");
        assert_eq!(registered_domain("example.com"), "example.com");
        assert_eq!(registered_domain("a.b.c.example.co.uk"), "co.uk");
    }

    #[test]
    fn same_registered_domain_matches_subdomain_but_not_other_tld() {
        let a = Url::parse("https://docs.example.com/page").unwrap();
        let b = Url::parse("https://blog.example.com/other").unwrap();
        let c = Url::parse("https://example.org/other").unwrap();
        assert!(same_registered_domain(&a, &b));
        assert!(!same_registered_domain(&a, &c));
    }

    #[test]
    fn clean_text_strips_script_tags() {
        let html = "<html><body><script>evil()</script><p>Hello</p></body></html>";
        let doc = Html::parse_document(html);
        let text = clean_text(&doc);
        assert!(text.contains("Hello"));
        assert!(!text.contains("evil"));
    }

    #[test]
    fn sha256_hex_is_deterministic() {
        assert_eq!(sha256_hex("abc"), sha256_hex("abc"));
        assert_ne!(sha256_hex("abc"), sha256_hex("abd"));
    }
}
