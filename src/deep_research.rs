//! Deep Research Orchestrator (spec §4.K) — the conversational state machine
//! composing F (retrieval), I (web agent), J (external URL ingestor), and
//! persisting through L (conversation store).
//!
//! Coverage-weakness and should-rewrite decisions use the literal formulas
//! named below; those are the testable contract.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use std::sync::LazyLock;
use uuid::Uuid;

use crate::config::DeepResearchConfig;
use crate::conversation_store::ConversationStore;
use crate::error::Result;
use crate::llm::LlmProvider;
use crate::retrieval::RetrievalEngine;
use crate::types::{Hit, MetadataFilter, StepRole};
use crate::url_ingestor::{ExternalContextEnvelope, UrlIngestor};
use crate::web_agent::{WebAgent, WebFetchOutcome};

static SUBQUERY_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(and|or|,|;|\n)\b").unwrap());

/// If `|q| < 80` chars, return `[q]` unchanged. Otherwise split on the
/// word-boundary regex `\b(and|or|,|;|\n)\b` (case-insensitive); accept the
/// split only if it produces 2..6 non-empty parts, else return `[q]`. Cap
/// the result at 4 subqueries.
pub fn split_subqueries(q: &str) -> Vec<String> {
    if q.chars().count() < 80 {
        return vec![q.to_string()];
    }
    let parts: Vec<String> = SUBQUERY_SPLIT_RE
        .split(q)
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if !(2..=6).contains(&parts.len()) {
        return vec![q.to_string()];
    }
    parts.into_iter().take(4).collect()
}

/// `|hits| < 4 OR |unique_docs| < 2`.
pub fn coverage_weak(hits: &[Hit]) -> bool {
    if hits.len() < 4 {
        return true;
    }
    let unique_docs: HashSet<_> = hits.iter().map(|h| h.document_id).collect();
    unique_docs.len() < 2
}

fn tokenize(s: &str) -> HashSet<String> {
    s.chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|t| t.len() > 1)
        .map(|t| t.to_string())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f32;
    let union = a.union(b).count() as f32;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Reranks candidate hits by `base + recency_boost * recency`, where
/// `base = -distance` (or `rank` when distance is null) and
/// `recency = exp(-ln2 * age_seconds / (half_life_days * 86400))`.
/// Requires the `created_at` of each hit's owning document; `created_at_of`
/// returns `None` for documents the caller couldn't batch-fetch, in which
/// case recency contributes nothing for that hit.
pub fn rerank_by_recency(
    hits: &[Hit],
    created_at_of: impl Fn(Uuid) -> Option<chrono::DateTime<chrono::Utc>>,
    recency_boost: f32,
    half_life_days: f32,
    top_n: usize,
) -> Vec<Hit> {
    let now = chrono::Utc::now();
    let mut scored: Vec<(f32, Hit)> = hits
        .iter()
        .cloned()
        .map(|h| {
            let base = h.distance.map(|d| -d).unwrap_or_else(|| h.rank.unwrap_or(0.0));
            let recency = created_at_of(h.document_id)
                .map(|created_at| {
                    let age_seconds = (now - created_at).num_seconds().max(0) as f32;
                    let half_life_seconds = (half_life_days.max(0.001) * 86400.0).max(1.0);
                    (-std::f32::consts::LN_2 * age_seconds / half_life_seconds).exp()
                })
                .unwrap_or(0.0);
            let score = base + recency_boost * recency;
            (score, h)
        })
        .collect();
    scored.sort_by(|(a, _), (b, _)| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_n);
    scored.into_iter().map(|(_, h)| h).collect()
}

/// Filters follow-up candidates by Jaccard relevance against the current
/// question and the conversation snippet, dedups by normalized form, and
/// drops any identical to the question itself.
pub fn filter_followups(
    candidates: Vec<String>,
    question: &str,
    conversation_snippet: &str,
    relevance_min: f32,
) -> Vec<String> {
    let question_tokens = tokenize(question);
    let snippet_tokens = tokenize(conversation_snippet);
    let normalized_question = question.trim().to_lowercase();

    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for candidate in candidates {
        let normalized = candidate.trim().to_lowercase();
        if normalized.is_empty() || normalized == normalized_question {
            continue;
        }
        if !seen.insert(normalized.clone()) {
            continue;
        }
        let candidate_tokens = tokenize(&candidate);
        let sim_q = jaccard(&candidate_tokens, &question_tokens);
        let sim_conv = jaccard(&candidate_tokens, &snippet_tokens);
        if sim_q.max(sim_conv) >= relevance_min {
            out.push(candidate);
        }
    }
    out
}

fn preview(s: &str, chars: usize) -> String {
    s.chars().take(chars).collect()
}

fn last_chars(s: &str, chars: usize) -> String {
    let total = s.chars().count();
    if total <= chars {
        s.to_string()
    } else {
        s.chars().skip(total - chars).collect()
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfidence {
    pub local: f32,
    pub web: f32,
    pub url: f32,
}

#[derive(Debug, Clone)]
pub struct TurnReferences {
    pub local: Vec<Hit>,
    pub url: Vec<ExternalContextEnvelope>,
    pub web: Option<WebFetchOutcome>,
}

#[derive(Debug, Clone)]
pub struct DeepResearchTurnResult {
    pub answer: String,
    pub references: TurnReferences,
    pub confidence: f32,
    pub source_confidence: SourceConfidence,
    pub followup_questions: Vec<String>,
    pub web_attempted: bool,
    pub elapsed_seconds: f64,
}

pub struct DeepResearchOrchestrator {
    pub retrieval: Arc<RetrievalEngine>,
    pub web_agent: Arc<WebAgent>,
    pub url_ingestor: Arc<UrlIngestor>,
    pub conversation_store: Arc<ConversationStore>,
    pub chunker: crate::processing::chunker::TextChunker,
    pub llm: Arc<dyn LlmProvider>,
    pub config: DeepResearchConfig,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl DeepResearchOrchestrator {
    fn turn_deadline(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds.max(15))
    }

    async fn llm_rewrite_query(&self, message: &str, recent: &str) -> Option<String> {
        self.llm
            .chat(
                &format!("Rewrite this question into a single, more specific search query for retrieval: {message}"),
                recent,
                self.max_tokens,
                self.temperature,
            )
            .await
    }

    async fn llm_identify_missing(&self, message: &str, context_preview: &str) -> Option<String> {
        self.llm
            .chat(
                &format!("List concepts, entities, or facts still missing to fully answer: {message}. Reply with a short comma-separated list, or \"none\"."),
                context_preview,
                self.max_tokens,
                self.temperature,
            )
            .await
    }

    async fn llm_synthesize(&self, message: &str, full_ctx: &str, recent: &str) -> Option<String> {
        let context = format!("{full_ctx}\n\nConversation so far:\n{recent}");
        self.llm.chat(message, &context, self.max_tokens, self.temperature).await
    }

    async fn llm_refine(&self, message: &str, draft: &str, full_ctx: &str, recent: &str) -> Option<String> {
        let context = format!("Draft answer:\n{draft}\n\nSupporting context:\n{full_ctx}\n\nConversation so far:\n{recent}");
        self.llm
            .chat(
                &format!("Refine and tighten this draft answer to: {message}"),
                &context,
                self.max_tokens,
                self.temperature,
            )
            .await
    }

    async fn maybe_generate_followups(&self, message: &str, context_preview: &str, recent: &str) -> Vec<String> {
        let context = format!("{context_preview}\n\nConversation so far:\n{recent}");
        let raw = self
            .llm
            .chat(
                &format!("Suggest up to 4 natural follow-up questions a user might ask after: {message}. One per line."),
                &context,
                self.max_tokens,
                self.temperature,
            )
            .await;
        match raw {
            Some(text) => text
                .lines()
                .map(|l| l.trim().trim_start_matches(['-', '*', '•']).trim().to_string())
                .filter(|l| !l.is_empty())
                .collect(),
            None => Vec::new(),
        }
    }

    fn missing_to_concepts(missing: &str) -> Vec<String> {
        missing
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("none"))
            .collect()
    }

    /// Runs one Deep Research turn per the spec's `ask` pipeline.
    pub async fn ask(
        &self,
        conversation_id: &str,
        user_id: Uuid,
        space_id: Option<Uuid>,
        message: &str,
        urls: &[String],
        force_web: bool,
    ) -> Result<DeepResearchTurnResult> {
        let start = Instant::now();
        let deadline = self.turn_deadline();
        let remaining = |start: Instant, deadline: Duration| deadline.saturating_sub(start.elapsed());

        self.conversation_store.ensure_conversation(conversation_id, user_id, space_id).await?;
        self.conversation_store
            .append_step(conversation_id, user_id, StepRole::User, message, vec![], serde_json::json!({}))
            .await?;

        let detail = self.conversation_store.get_conversation_detail(conversation_id, user_id).await?;
        let recent_steps: Vec<&str> = detail
            .steps
            .iter()
            .filter(|s| s.role != StepRole::System)
            .rev()
            .take(8)
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let recent = recent_steps.join("\n");
        let snippet = last_chars(&recent, 1000);
        let seed = format!("{message}\n\nConversation so far:\n{snippet}");

        let subqueries = split_subqueries(&seed);

        if !urls.is_empty() {
            let _ = self
                .url_ingestor
                .ingest_external_urls(urls, user_id, space_id, conversation_id, &self.chunker)
                .await;
        }

        let filter = MetadataFilter { space_id, ..Default::default() };
        // Subqueries are independent: each is its own hybrid_search call, so
        // fan them out concurrently instead of awaiting one at a time.
        let subquery_results = futures::future::join_all(
            subqueries
                .iter()
                .map(|sq| self.retrieval.hybrid(sq, self.config.local_top_k, user_id, space_id, &filter)),
        )
        .await;
        let mut hits: Vec<Hit> = Vec::new();
        for result in subquery_results {
            if let Ok(mut sq_hits) = result {
                hits.append(&mut sq_hits);
            }
        }

        if coverage_weak(&hits) {
            if let Some(rewritten) = self.llm_rewrite_query(message, &recent).await {
                if let Ok(mut more) = self.retrieval.hybrid(&rewritten, self.config.local_top_k, user_id, space_id, &filter).await {
                    hits.append(&mut more);
                }
            }
        }

        let url_ctx = self
            .url_ingestor
            .retrieve_external_contexts(&seed, self.config.local_top_k, user_id, conversation_id, space_id)
            .await
            .unwrap_or_default();

        let mut search_query = message.to_string();
        let mut web_outcome: Option<WebFetchOutcome> = None;
        let mut web_attempted = false;
        let mut confidence = WebAgent::compute_confidence(&hits, false);
        let mut missing_notes: Vec<String> = Vec::new();

        for _ in 0..self.config.retry_loops {
            let remaining_budget = remaining(start, deadline);
            if WebAgent::should_consider_web(&hits, force_web) {
                web_attempted = true;
                web_outcome = self.web_agent.maybe_fetch_web(&search_query, remaining_budget, force_web).await;
            }
            confidence = WebAgent::compute_confidence(&hits, web_outcome.is_some());

            let local_blocks = WebAgent::aggregate_contexts(&hits, web_outcome.as_ref());
            let mut ctx = local_blocks.join("\n\n");
            for u in &url_ctx {
                ctx.push_str(&format!("\n\nExternal result: {}\nSource: {}\n{}", u.title, u.url, u.content));
            }

            if coverage_weak(&hits) {
                if let Some(missing) = self.llm_identify_missing(message, &preview(&ctx, 800)).await {
                    if !missing.trim().eq_ignore_ascii_case("none") {
                        missing_notes.push(missing);
                    }
                }
            }

            if confidence >= self.config.confidence_floor && !ctx.trim().is_empty() {
                break;
            }
            if let Some(rewritten) = self.llm_rewrite_query(message, &recent).await {
                search_query = rewritten;
            }
            if remaining(start, deadline) <= Duration::from_secs(2) {
                break;
            }
        }

        let mut already_known: HashSet<String> = HashSet::new();
        for _ in 0..self.config.missing_loops {
            let combined_preview = preview(&WebAgent::aggregate_contexts(&hits, web_outcome.as_ref()).join("\n\n"), 800);
            let new_missing = match self.llm_identify_missing(message, &combined_preview).await {
                Some(m) if !m.trim().eq_ignore_ascii_case("none") => Self::missing_to_concepts(&m)
                    .into_iter()
                    .filter(|c| !already_known.contains(&c.to_lowercase()))
                    .collect::<Vec<_>>(),
                _ => Vec::new(),
            };
            if new_missing.is_empty() {
                break;
            }
            for concept in new_missing.iter().take(self.config.missing_top_k) {
                if remaining(start, deadline) <= Duration::from_secs(2) {
                    break;
                }
                already_known.insert(concept.to_lowercase());
                let k = self.config.local_top_k.max(8).max(self.config.local_top_k / 2);
                if let Ok(mut more) = self.retrieval.hybrid(concept, k, user_id, space_id, &filter).await {
                    hits.append(&mut more);
                }
            }
        }

        let mut full_ctx = WebAgent::aggregate_contexts(&hits, web_outcome.as_ref()).join("\n\n");
        for u in &url_ctx {
            full_ctx.push_str(&format!("\n\nExternal result: {}\nSource: {}\n{}", u.title, u.url, u.content));
        }
        if !missing_notes.is_empty() {
            full_ctx.push_str(&format!("\n\nMissing concepts to cover: {}", missing_notes.join("; ")));
        }

        let draft = self.llm_synthesize(message, &full_ctx, &recent).await;
        let mut answer = draft.clone().unwrap_or_else(|| preview(&full_ctx, 1200));
        if draft.is_some() && !hits.is_empty() {
            if let Some(refined) = self.llm_refine(message, draft.as_deref().unwrap_or(""), &full_ctx, &recent).await {
                answer = refined;
            }
        }

        let document_ids: Vec<Uuid> = hits.iter().map(|h| h.document_id).collect::<HashSet<_>>().into_iter().collect();
        let documents = self.retrieval.chunk_store.documents_by_ids(&document_ids).await.unwrap_or_default();
        let created_at_map: std::collections::HashMap<Uuid, chrono::DateTime<chrono::Utc>> =
            documents.into_iter().map(|d| (d.id, d.created_at)).collect();
        let local_refs = rerank_by_recency(
            &hits,
            |doc_id| created_at_map.get(&doc_id).copied(),
            self.config.reference_recency_boost,
            self.config.reference_half_life_days,
            self.config.local_top_k,
        );

        let followup_candidates = self.maybe_generate_followups(message, &preview(&full_ctx, 800), &recent).await;
        let followup_questions = filter_followups(followup_candidates, message, &snippet, self.config.followup_relevance_min);

        self.conversation_store
            .append_step(conversation_id, user_id, StepRole::Assistant, &answer, vec![], serde_json::json!({}))
            .await?;

        let source_confidence = SourceConfidence {
            local: WebAgent::compute_confidence(&local_refs, false),
            web: if web_outcome.is_some() { 1.0 } else { 0.0 },
            url: if url_ctx.is_empty() { 0.0 } else { 1.0 },
        };

        Ok(DeepResearchTurnResult {
            answer,
            references: TurnReferences {
                local: local_refs,
                url: url_ctx,
                web: web_outcome,
            },
            confidence,
            source_confidence,
            followup_questions,
            web_attempted,
            elapsed_seconds: start.elapsed().as_secs_f64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceType;

    #[test]
    fn short_query_is_not_split() {
        assert_eq!(split_subqueries("what is rust"), vec!["what is rust".to_string()]);
    }

    #[test]
    fn long_conjunctive_query_splits_on_and() {
        let q = "Tell me about the history of Rome and the history of Greece and the history of Egypt and their trade routes across the Mediterranean";
        let parts = split_subqueries(q);
        assert!(parts.len() >= 2 && parts.len() <= 4);
    }

    #[test]
    fn long_query_with_no_separators_stays_single() {
        let q = "a".repeat(120);
        assert_eq!(split_subqueries(&q), vec![q]);
    }

    #[test]
    fn too_many_parts_falls_back_to_whole_query() {
        let q = "a, b, c, d, e, f, g, h, i, j, k, l, m, n, o, p, q, r, s, t, u, v, w, x, y, z, and more long filler text to cross eighty chars";
        let parts = split_subqueries(q);
        assert_eq!(parts, vec![q.to_string()]);
    }

    fn hit(doc: Uuid, distance: Option<f32>) -> Hit {
        Hit {
            chunk_id: None,
            document_id: doc,
            chunk_index: 0,
            content: "x".to_string(),
            file_name: "f".to_string(),
            file_type: SourceType::Txt,
            title: "t".to_string(),
            distance,
            rank: None,
        }
    }

    #[test]
    fn coverage_weak_true_when_few_hits() {
        assert!(coverage_weak(&[]));
        assert!(coverage_weak(&[hit(Uuid::new_v4(), Some(0.1))]));
    }

    #[test]
    fn coverage_weak_true_when_single_document() {
        let doc = Uuid::new_v4();
        let hits: Vec<Hit> = (0..5).map(|_| hit(doc, Some(0.1))).collect();
        assert!(coverage_weak(&hits));
    }

    #[test]
    fn coverage_not_weak_with_enough_diverse_hits() {
        let hits: Vec<Hit> = (0..5).map(|_| hit(Uuid::new_v4(), Some(0.1))).collect();
        assert!(!coverage_weak(&hits));
    }

    #[test]
    fn recency_rerank_prefers_fresher_documents_at_equal_base_score() {
        let old_doc = Uuid::new_v4();
        let new_doc = Uuid::new_v4();
        let hits = vec![hit(old_doc, Some(0.2)), hit(new_doc, Some(0.2))];
        let now = chrono::Utc::now();
        let created = move |id: Uuid| {
            if id == old_doc {
                Some(now - chrono::Duration::days(365))
            } else {
                Some(now - chrono::Duration::days(1))
            }
        };
        let ranked = rerank_by_recency(&hits, created, 0.5, 30.0, 2);
        assert_eq!(ranked[0].document_id, new_doc);
    }

    #[test]
    fn followup_filter_drops_question_duplicate_and_irrelevant() {
        let candidates = vec![
            "What is rust ownership?".to_string(),
            "What is rust ownership?".to_string(),
            "Completely unrelated topic about cooking".to_string(),
        ];
        let filtered = filter_followups(candidates, "What is rust ownership?", "discussing rust memory safety", 0.2);
        assert!(filtered.is_empty());
    }

    #[test]
    fn followup_filter_keeps_relevant_novel_question() {
        let candidates = vec!["How does rust borrow checker enforce ownership rules?".to_string()];
        let filtered = filter_followups(candidates, "What is rust ownership?", "discussing rust ownership and borrowing", 0.1);
        assert_eq!(filtered.len(), 1);
    }
}
