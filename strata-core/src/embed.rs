//! Embedding capability supplied by the host application.

/// A text embedding provider.
///
/// `embed` returns one slot per input. A `None` slot, or a missing slot at the
/// end of a short result, marks a chunk the provider could not embed; those
/// chunks are dropped. An `Err` is a provider outage and aborts the pass.
pub trait Embedder: Send + Sync {
    /// Stable identity of the model; part of the vector artifact id.
    fn id(&self) -> &str;

    /// Largest chunk, in tokens, the provider accepts.
    fn max_chunk_tokens(&self) -> usize;

    fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>, EmbedError>;
}

/// Provider failure as reported by the embedder.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct EmbedError(pub String);

impl EmbedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
