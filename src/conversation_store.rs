//! Conversation Store (spec §4.L) — durable conversation header, ordered
//! steps, and notebook entries for the Deep Research orchestrator (K).
//!
//! Grounded on the original system's `deep_research_store.py`: `append_step`
//! computes its next `step_index` with a single CTE so Postgres serializes
//! concurrent appends to the same `conversation_id`, giving a total order
//! without an explicit lock. Every mutating operation verifies ownership and
//! surfaces `NotFound` rather than `Unauthorized` on mismatch, so a caller
//! can never learn that a conversation exists but isn't theirs.

use sqlx::{FromRow, PgPool, Row};
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::types::{DeepResearchConversation, DeepResearchStep, NotebookEntry, StepRole};

pub struct ConversationStore {
    pool: PgPool,
}

#[derive(FromRow)]
struct ConversationRow {
    conversation_id: String,
    user_id: Uuid,
    space_id: Option<Uuid>,
    title: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<ConversationRow> for DeepResearchConversation {
    fn from(r: ConversationRow) -> Self {
        Self {
            conversation_id: r.conversation_id,
            user_id: r.user_id,
            space_id: r.space_id,
            title: r.title,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// Summary row for `list_conversations`: header plus a joined step count and
/// the conversation's first user question.
#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub conversation: DeepResearchConversation,
    pub step_count: i64,
    pub first_question: Option<String>,
}

/// Full detail for `get_conversation_detail`.
#[derive(Debug, Clone)]
pub struct ConversationDetail {
    pub conversation: DeepResearchConversation,
    pub steps: Vec<DeepResearchStep>,
    pub notebook: Vec<NotebookEntry>,
}

impl ConversationStore {
    pub async fn connect(database_url: &str, min_connections: u32, max_connections: u32) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .min_connections(min_connections)
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(RagError::from)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotent upsert by `conversation_id`: creates the conversation if
    /// absent; on conflict preserves the existing `title` and only touches
    /// `updated_at`.
    pub async fn ensure_conversation(
        &self,
        conversation_id: &str,
        user_id: Uuid,
        space_id: Option<Uuid>,
    ) -> Result<DeepResearchConversation> {
        let row: ConversationRow = sqlx::query_as(
            "INSERT INTO deep_research_conversations (conversation_id, user_id, space_id, title, created_at, updated_at)
             VALUES ($1, $2, $3, NULL, now(), now())
             ON CONFLICT (conversation_id) DO UPDATE SET updated_at = now()
             RETURNING conversation_id, user_id, space_id, title, created_at, updated_at",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(space_id)
        .fetch_one(&self.pool)
        .await
        .map_err(RagError::from)?;

        if row.user_id != user_id {
            return Err(RagError::NotFound("conversation not found".to_string()));
        }
        Ok(row.into())
    }

    /// Appends a step with an atomically computed next `step_index`, via a
    /// single statement whose CTE scans `step_index` for this
    /// `conversation_id` — Postgres serializes concurrent inserts targeting
    /// the same conversation, giving a strictly monotonic, dense sequence.
    /// Updates the conversation's `updated_at` in the same transaction.
    pub async fn append_step(
        &self,
        conversation_id: &str,
        user_id: Uuid,
        role: StepRole,
        content: &str,
        context_refs: Vec<serde_json::Value>,
        metadata: serde_json::Value,
    ) -> Result<DeepResearchStep> {
        let mut tx = self.pool.begin().await.map_err(RagError::from)?;

        let owner: Option<Uuid> = sqlx::query_scalar(
            "SELECT user_id FROM deep_research_conversations WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(RagError::from)?;

        match owner {
            Some(owner_id) if owner_id == user_id => {}
            _ => {
                tx.rollback().await.ok();
                return Err(RagError::NotFound("conversation not found".to_string()));
            }
        }

        let role_str = role_to_str(role);
        let row = sqlx::query(
            "WITH next_idx AS (
                SELECT COALESCE(MAX(step_index) + 1, 0) AS idx
                FROM deep_research_steps WHERE conversation_id = $1
             )
             INSERT INTO deep_research_steps (conversation_id, step_index, role, content, context_refs, metadata, created_at)
             SELECT $1, idx, $2, $3, $4, $5, now() FROM next_idx
             RETURNING step_index, created_at",
        )
        .bind(conversation_id)
        .bind(role_str)
        .bind(content)
        .bind(serde_json::Value::Array(context_refs.clone()))
        .bind(&metadata)
        .fetch_one(&mut *tx)
        .await
        .map_err(RagError::from)?;

        sqlx::query("UPDATE deep_research_conversations SET updated_at = now() WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await
            .map_err(RagError::from)?;

        tx.commit().await.map_err(RagError::from)?;

        Ok(DeepResearchStep {
            conversation_id: conversation_id.to_string(),
            step_index: row.get("step_index"),
            role,
            content: content.to_string(),
            context_refs,
            metadata,
            created_at: row.get("created_at"),
        })
    }

    /// Most-recent-first, capped at 100, optionally filtered by `space_id`.
    pub async fn list_conversations(
        &self,
        user_id: Uuid,
        space_id: Option<Uuid>,
    ) -> Result<Vec<ConversationSummary>> {
        let rows = sqlx::query(
            "SELECT c.conversation_id, c.user_id, c.space_id, c.title, c.created_at, c.updated_at,
                    COUNT(s.step_index) AS step_count,
                    (SELECT content FROM deep_research_steps
                       WHERE conversation_id = c.conversation_id AND role = 'user'
                       ORDER BY step_index ASC LIMIT 1) AS first_question
             FROM deep_research_conversations c
             LEFT JOIN deep_research_steps s ON s.conversation_id = c.conversation_id
             WHERE c.user_id = $1 AND ($2::uuid IS NULL OR c.space_id = $2)
             GROUP BY c.conversation_id, c.user_id, c.space_id, c.title, c.created_at, c.updated_at
             ORDER BY c.updated_at DESC
             LIMIT 100",
        )
        .bind(user_id)
        .bind(space_id)
        .fetch_all(&self.pool)
        .await
        .map_err(RagError::from)?;

        Ok(rows
            .into_iter()
            .map(|row| ConversationSummary {
                conversation: DeepResearchConversation {
                    conversation_id: row.get("conversation_id"),
                    user_id: row.get("user_id"),
                    space_id: row.get("space_id"),
                    title: row.get("title"),
                    created_at: row.get("created_at"),
                    updated_at: row.get("updated_at"),
                },
                step_count: row.get("step_count"),
                first_question: row.get("first_question"),
            })
            .collect())
    }

    /// Conversation + steps (index order) + notebook entries. Ownership
    /// mismatch or missing conversation both surface `NotFound`.
    pub async fn get_conversation_detail(&self, conversation_id: &str, user_id: Uuid) -> Result<ConversationDetail> {
        let conv_row: Option<ConversationRow> = sqlx::query_as(
            "SELECT conversation_id, user_id, space_id, title, created_at, updated_at
             FROM deep_research_conversations WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RagError::from)?;

        let conv_row = conv_row.ok_or_else(|| RagError::NotFound("conversation not found".to_string()))?;
        if conv_row.user_id != user_id {
            return Err(RagError::NotFound("conversation not found".to_string()));
        }

        let step_rows = sqlx::query(
            "SELECT conversation_id, step_index, role, content, context_refs, metadata, created_at
             FROM deep_research_steps WHERE conversation_id = $1 ORDER BY step_index ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(RagError::from)?;

        let steps = step_rows
            .into_iter()
            .map(|row| {
                let role_str: String = row.get("role");
                let context_refs: serde_json::Value = row.get("context_refs");
                DeepResearchStep {
                    conversation_id: row.get("conversation_id"),
                    step_index: row.get("step_index"),
                    role: str_to_role(&role_str),
                    content: row.get("content"),
                    context_refs: context_refs.as_array().cloned().unwrap_or_default(),
                    metadata: row.get("metadata"),
                    created_at: row.get("created_at"),
                }
            })
            .collect();

        let notebook_rows: Vec<(i64, String, String, String, serde_json::Value, chrono::DateTime<chrono::Utc>, chrono::DateTime<chrono::Utc>)> =
            sqlx::query_as(
                "SELECT id, conversation_id, title, content, source, created_at, updated_at
                 FROM notebook_entries WHERE conversation_id = $1 ORDER BY created_at ASC",
            )
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(RagError::from)?;

        let notebook = notebook_rows
            .into_iter()
            .map(|(id, conversation_id, title, content, source, created_at, updated_at)| NotebookEntry {
                id,
                conversation_id,
                title,
                content,
                source,
                created_at,
                updated_at,
            })
            .collect();

        Ok(ConversationDetail {
            conversation: conv_row.into(),
            steps,
            notebook,
        })
    }

    pub async fn update_title(&self, conversation_id: &str, user_id: Uuid, title: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE deep_research_conversations SET title = $3, updated_at = now()
             WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(title)
        .execute(&self.pool)
        .await
        .map_err(RagError::from)?;
        if result.rows_affected() == 0 {
            return Err(RagError::NotFound("conversation not found".to_string()));
        }
        Ok(())
    }

    pub async fn add_notebook_entry(
        &self,
        conversation_id: &str,
        user_id: Uuid,
        title: &str,
        content: &str,
        source: serde_json::Value,
    ) -> Result<NotebookEntry> {
        let owner: Option<Uuid> = sqlx::query_scalar(
            "SELECT user_id FROM deep_research_conversations WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RagError::from)?;
        match owner {
            Some(owner_id) if owner_id == user_id => {}
            _ => return Err(RagError::NotFound("conversation not found".to_string())),
        }

        let row = sqlx::query(
            "INSERT INTO notebook_entries (conversation_id, title, content, source, created_at, updated_at)
             VALUES ($1, $2, $3, $4, now(), now())
             RETURNING id, created_at, updated_at",
        )
        .bind(conversation_id)
        .bind(title)
        .bind(content)
        .bind(&source)
        .fetch_one(&self.pool)
        .await
        .map_err(RagError::from)?;

        Ok(NotebookEntry {
            id: row.get("id"),
            conversation_id: conversation_id.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            source,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    pub async fn delete_notebook_entry(&self, entry_id: i64, conversation_id: &str, user_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM notebook_entries
             WHERE id = $1 AND conversation_id = $2
               AND conversation_id IN (SELECT conversation_id FROM deep_research_conversations WHERE user_id = $3)",
        )
        .bind(entry_id)
        .bind(conversation_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(RagError::from)?;
        if result.rows_affected() == 0 {
            return Err(RagError::NotFound("notebook entry not found".to_string()));
        }
        Ok(())
    }
}

fn role_to_str(role: StepRole) -> &'static str {
    match role {
        StepRole::User => "user",
        StepRole::Assistant => "assistant",
        StepRole::System => "system",
    }
}

fn str_to_role(s: &str) -> StepRole {
    match s {
        "assistant" => StepRole::Assistant,
        "system" => StepRole::System,
        _ => StepRole::User,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_string() {
        for role in [StepRole::User, StepRole::Assistant, StepRole::System] {
            assert_eq!(str_to_role(role_to_str(role)), role);
        }
    }
}
