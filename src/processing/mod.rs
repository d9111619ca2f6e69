pub mod chunker;

pub use chunker::{ChunkResult, ContextualChunkResult, TextChunker};
