//! Data model (spec §3): the rows every component reads or writes.
//!
//! These types are deliberately plain — no ORM traits, no derive(sqlx::FromRow)
//! leaking into the retrieval core. `chunk_store`/`conversation_store` map rows
//! onto these types at the boundary.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SourceType {
    Pdf,
    Html,
    Txt,
    Docx,
    Pptx,
    Xlsx,
    Xml,
    Csv,
    Md,
    Json,
    Image,
    Audio,
    Video,
}

impl SourceType {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "pdf" => Self::Pdf,
            "html" | "htm" => Self::Html,
            "docx" => Self::Docx,
            "pptx" => Self::Pptx,
            "xlsx" | "xls" => Self::Xlsx,
            "xml" => Self::Xml,
            "csv" => Self::Csv,
            "md" | "markdown" => Self::Md,
            "json" => Self::Json,
            "png" | "jpg" | "jpeg" | "webp" | "gif" => Self::Image,
            "mp3" | "wav" | "flac" | "ogg" => Self::Audio,
            "mp4" | "mov" | "webm" => Self::Video,
            _ => Self::Txt,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub user_id: Uuid,
    pub space_id: Option<Uuid>,
    pub source_path: String,
    pub source_type: SourceType,
    pub title: String,
    pub metadata: HashMap<String, String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Invariant: `(document_id, chunk_index)` is unique and dense starting at 0
/// within a document. `content_tsv` is a derived full-text projection the
/// relational store keeps in lockstep with `content` at insert time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub chunk_index: i32,
    pub content: String,
    pub content_chars: i32,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAsset {
    pub id: Uuid,
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub space_id: Option<Uuid>,
    pub file_path: String,
    pub thumbnail_path: Option<String>,
    pub width: i32,
    pub height: i32,
    pub tags: Vec<String>,
    pub caption: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Invariant: exactly one default space per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Space {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepResearchConversation {
    pub conversation_id: String,
    pub user_id: Uuid,
    pub space_id: Option<Uuid>,
    pub title: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepRole {
    User,
    Assistant,
    System,
}

/// Invariant: `step_index` is dense per conversation; appending is atomic
/// with respect to concurrent appends (enforced by the store, not the caller).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepResearchStep {
    pub conversation_id: String,
    pub step_index: i32,
    pub role: StepRole,
    pub content: String,
    pub context_refs: Vec<serde_json::Value>,
    pub metadata: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotebookEntry {
    pub id: i64,
    pub conversation_id: String,
    pub title: String,
    pub content: String,
    pub source: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Invariant: `(user_id, conversation_id, url, chunk_index)` unique; upsert semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationExternalDoc {
    pub user_id: Uuid,
    pub space_id: Option<Uuid>,
    pub conversation_id: String,
    pub url: String,
    pub parent_url: Option<String>,
    pub depth: i32,
    pub chunk_index: i32,
    pub title: String,
    pub content: String,
    pub snippet: String,
    pub content_hash: String,
    pub metadata: serde_json::Value,
    pub embedding: Option<Vec<f32>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Filters applied to every query shape in D and E. `user_id` is mandatory at
/// the call site (not optional here) so a filter can never be built without it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetadataFilter {
    pub space_id: Option<Uuid>,
    pub source_type: Option<SourceType>,
    pub source_path: Option<String>,
    pub tags: Vec<String>,
    pub date_from: Option<chrono::DateTime<chrono::Utc>>,
    pub date_to: Option<chrono::DateTime<chrono::Utc>>,
}

/// A chunk hit returned by F (semantic/fulltext/hybrid).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub chunk_id: Option<Uuid>,
    pub document_id: Uuid,
    pub chunk_index: i32,
    pub content: String,
    pub file_name: String,
    pub file_type: SourceType,
    pub title: String,
    /// Smaller is better; `d = 1 - clamp(similarity, 0, 1)` for ANN hits.
    pub distance: Option<f32>,
    /// Present for fulltext/BM25 hits; larger is better.
    pub rank: Option<f32>,
}

impl Hit {
    /// `fingerprint(H)`: deterministic function of `(document_id, chunk_index)`
    /// pairs in the order given, joined with `:`.
    pub fn fingerprint(hits: &[Hit]) -> String {
        hits.iter()
            .map(|h| format!("{}-{}", h.document_id, h.chunk_index))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// An image hit returned by F's image search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageHit {
    pub rank: usize,
    pub doc_id: Uuid,
    pub image_id: Uuid,
    pub file_path: String,
    pub thumbnail_path: Option<String>,
    pub caption: Option<String>,
    pub tags: Vec<String>,
    pub score: f32,
}
