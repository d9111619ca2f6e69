//! Embedder contract (spec §6). Internals (model loading, tokenization) are
//! explicitly out of scope; this crate only depends on the pure-function
//! shape. Grounded on the teacher's `embeddings::EmbeddingModel` trait,
//! extended with the image-path/image-text methods the spec's cross-modal
//! search (§4.F image search) requires and the teacher's trait lacked.

use async_trait::async_trait;

use crate::error::Result;

/// A pure function from strings (or image paths) to dense, L2-normalized
/// vectors. Implementations must be deterministic for identical input and
/// `Send + Sync` so one instance can be shared across every request.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Embed a query string into the text embedding space (`D_text` dims).
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a document/chunk string into the text embedding space.
    async fn embed_document(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of documents. Default: sequential calls; implementations
    /// with native batching should override.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed_document(t).await?);
        }
        Ok(out)
    }

    /// Embed image files at the given paths into the image embedding space
    /// (`D_img` dims), for image-to-image search.
    async fn embed_image_paths(&self, paths: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed free text into the *image* embedding space (`D_img` dims), for
    /// text-to-image cross-modal search.
    async fn embed_image_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn text_dimension(&self) -> usize;
    fn image_dimension(&self) -> usize;
}
