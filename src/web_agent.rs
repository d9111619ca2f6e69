//! Web Research Agent (spec §4.I) — the Deep Research orchestrator's escape
//! hatch when the local corpus is thin. Grounded on the teacher's HTTP
//! client conventions (`llm::HttpChatProvider`'s `reqwest::Client` with an
//! explicit connect/total timeout split) and on the scraping shape of
//! `DevsHero-search-scrape/mcp-server/src/scraping/rust_scraper/clean.rs`,
//! simplified to what this crate's dependency stack (`scraper`, no
//! `readability`/`html2md`/`select`) actually supports: strip
//! `script`/`style`/`noscript`, take the remaining text nodes, collapse
//! whitespace.

use std::time::Duration;

use scraper::{Html, Selector};
use serde::Deserialize;

use crate::config::WebAgentConfig;
use crate::error::{RagError, Result};
use crate::types::Hit;

#[derive(Debug, Clone, Deserialize)]
pub struct WebSearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

#[derive(Debug, Clone)]
pub struct WebFetchOutcome {
    pub title: String,
    pub url: String,
    pub content: String,
}

pub struct WebAgent {
    client: reqwest::Client,
    config: WebAgentConfig,
}

impl WebAgent {
    pub fn new(config: WebAgentConfig) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(config.deadline_seconds.clamp(5, 180)))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    /// Coverage/diversity/quality-weighted score over the local hit set.
    /// `coverage = min(|hits|/8, 1)`, `diversity = min(|unique_docs|/5, 1)`,
    /// `semantic_quality = clamp(1 - best_distance, 0, 1)`. Blend:
    /// `0.35*coverage + 0.35*diversity + 0.30*semantic_quality`.
    fn local_strength(local_hits: &[Hit]) -> f32 {
        let coverage = (local_hits.len() as f32 / 8.0).min(1.0);
        let unique_docs = local_hits
            .iter()
            .map(|h| h.document_id)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let diversity = (unique_docs as f32 / 5.0).min(1.0);
        let best_distance = local_hits
            .iter()
            .filter_map(|h| h.distance)
            .fold(f32::MAX, f32::min);
        let semantic_quality = if best_distance == f32::MAX {
            0.0
        } else {
            (1.0 - best_distance).clamp(0.0, 1.0)
        };
        0.35 * coverage + 0.35 * diversity + 0.30 * semantic_quality
    }

    /// `true` when forced, or when the local hit set is weak enough
    /// (`local_strength < 0.55`) that a web search is worth the latency.
    pub fn should_consider_web(local_hits: &[Hit], force_web: bool) -> bool {
        force_web || Self::local_strength(local_hits) < 0.55
    }

    /// Confidence in the final answer: a base of `0.25`, plus coverage and
    /// diversity terms, plus a flat `0.15` bump if a web fetch contributed,
    /// clamped to `[0.1, 0.98]` — never absolute certainty, never zero.
    pub fn compute_confidence(local_hits: &[Hit], used_web: bool) -> f32 {
        let coverage = (local_hits.len() as f32 / 8.0).min(1.0);
        let unique_docs = local_hits
            .iter()
            .map(|h| h.document_id)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let diversity = (unique_docs as f32 / 5.0).min(1.0);
        let web_bonus = if used_web { 0.15 } else { 0.0 };
        (0.25 + 0.35 * coverage + 0.25 * diversity + web_bonus).clamp(0.1, 0.98)
    }

    /// Fetches and cleans a single best web result for `query`, bounded by
    /// whatever remains of the shared turn deadline. Skips entirely when
    /// `remaining < 5s` unless `force` (an explicit missing-concept loop
    /// request). The fetch timeout itself is clamped to `3..=8` seconds so
    /// one slow page can't exhaust the whole remaining budget.
    pub async fn maybe_fetch_web(&self, query: &str, remaining: Duration, force: bool) -> Option<WebFetchOutcome> {
        if remaining < Duration::from_secs(5) && !force {
            return None;
        }
        let budget = remaining.as_secs_f64().clamp(3.0, 8.0);
        let fetch_timeout = Duration::from_secs_f64(budget);

        let results = match self.search(query, fetch_timeout).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "web search failed");
                return None;
            }
        };
        let top = results.into_iter().next()?;
        match self.fetch_and_clean(&top.url, fetch_timeout).await {
            Ok(content) if !content.trim().is_empty() => Some(WebFetchOutcome {
                title: top.title,
                url: top.url,
                content,
            }),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, url = %top.url, "web fetch failed");
                None
            }
        }
    }

    async fn search(&self, query: &str, timeout: Duration) -> Result<Vec<WebSearchResult>> {
        let resp = self
            .client
            .get(&self.config.search_engine_url)
            .query(&[("q", query)])
            .timeout(timeout)
            .send()
            .await
            .map_err(RagError::from)?;
        if !resp.status().is_success() {
            return Err(RagError::Unavailable(format!(
                "web search engine returned {}",
                resp.status()
            )));
        }
        let results: Vec<WebSearchResult> = resp.json().await.map_err(RagError::from)?;
        Ok(results.into_iter().take(self.config.top_k).collect())
    }

    async fn fetch_and_clean(&self, url: &str, timeout: Duration) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(RagError::from)?;
        if !resp.status().is_success() {
            return Err(RagError::Unavailable(format!("fetch of {url} returned {}", resp.status())));
        }
        let body = resp.text().await.map_err(RagError::from)?;
        Ok(clean_html(&body))
    }

    /// Labeled envelope blocks combining local and web context, in the shape
    /// the rag answerer's prompt composer expects (`"Local result: ..."` /
    /// `"Web result: {title}"`).
    pub fn aggregate_contexts(local: &[Hit], web: Option<&WebFetchOutcome>) -> Vec<String> {
        let mut blocks: Vec<String> = local
            .iter()
            .map(|h| format!("Local result: {}\n{}", h.title, h.content))
            .collect();
        if let Some(w) = web {
            blocks.push(format!("Web result: {}\nSource: {}\n{}", w.title, w.url, w.content));
        }
        blocks
    }
}

/// Strips `script`/`style`/`noscript` and collapses whitespace over whatever
/// text remains — no readability heuristics, just noise removal.
fn clean_html(html: &str) -> String {
    let document = Html::parse_document(html);
    let noise = Selector::parse("script, style, noscript").unwrap();
    let noise_ids: std::collections::HashSet<_> = document
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceType;
    use uuid::Uuid;

    fn hit(distance: f32) -> Hit {
        Hit {
            chunk_id: None,
            document_id: Uuid::new_v4(),
            chunk_index: 0,
            content: "x".to_string(),
            file_name: "f".to_string(),
            file_type: SourceType::Txt,
            title: "t".to_string(),
            distance: Some(distance),
            rank: None,
        }
    }

    #[test]
    fn empty_local_hits_always_suggest_web() {
        assert!(WebAgent::should_consider_web(&[], false));
    }

    #[test]
    fn many_strong_diverse_hits_do_not_suggest_web() {
        let hits: Vec<Hit> = (0..8).map(|_| hit(0.02)).collect();
        assert!(!WebAgent::should_consider_web(&hits, false));
    }

    #[test]
    fn force_web_overrides_strong_local_hits() {
        let hits: Vec<Hit> = (0..8).map(|_| hit(0.02)).collect();
        assert!(WebAgent::should_consider_web(&hits, true));
    }

    #[test]
    fn confidence_is_clamped_and_bumped_by_web() {
        let no_web = WebAgent::compute_confidence(&[], false);
        let with_web = WebAgent::compute_confidence(&[], true);
        assert!((0.1..=0.98).contains(&no_web));
        assert!((with_web - no_web - 0.15).abs() < 1e-6);
    }

    #[test]
    fn clean_html_strips_script_and_style_tags() {
        let html = "<html><body><script>evil()</script><style>.x{}</style><p>Hello world</p></body></html>";
        let cleaned = clean_html(html);
        assert!(cleaned.contains("Hello world"));
        assert!(!cleaned.contains("evil"));
    }

    #[test]
    fn aggregate_contexts_labels_local_and_web_blocks() {
        let local = vec![hit(0.1)];
        let web = WebFetchOutcome {
            title: "Example".to_string(),
            url: "https://example.com".to_string(),
            content: "body text".to_string(),
        };
        let blocks = WebAgent::aggregate_contexts(&local, Some(&web));
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].starts_with("Local result:"));
        assert!(blocks[1].starts_with("Web result:"));
    }
}
