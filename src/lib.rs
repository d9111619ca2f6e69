pub mod cache;
pub mod chunk_store;
pub mod config;
pub mod context;
pub mod conversation_store;
pub mod deep_research;
pub mod embeddings;
pub mod error;
pub mod llm;
pub mod processing;
pub mod query_cache;
pub mod rag_engine;
pub mod retrieval;
pub mod runtime_tuning;
pub mod search;
pub mod search_index;
pub mod types;
pub mod url_ingestor;
pub mod vector_lit;
pub mod web_agent;

pub use config::RagConfig;
pub use context::AppContext;
pub use error::{RagError, Result};
pub use rag_engine::{Answer, AnswerMode, RagAnswerer};
pub use retrieval::RetrievalEngine;
pub use types::{Chunk, Document, Hit, ImageHit, MetadataFilter, SourceType};

pub use uuid::Uuid;
