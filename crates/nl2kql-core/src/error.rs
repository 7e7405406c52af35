//! Error taxonomy for retrieval, generation and storage failures.
//!
//! Validation problems are deliberately absent: they are reported inside
//! [`ValidationReport`](crate::validate::ValidationReport) and never
//! abort a request.

use thiserror::Error;

use crate::models::CollectionKind;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The primary embedding backend failed or timed out.
    #[error("embedding backend unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("retrieval returned no candidates")]
    RetrievalEmpty,

    #[error("generation timed out after {0}s")]
    GenerationTimeout(u64),

    #[error("generation failed: {0}")]
    GenerationError(String),

    /// A collection rebuild failed; the collection keeps its previous contents.
    #[error("rebuild of collection '{collection}' failed: {reason}")]
    StoreRebuildFailure {
        collection: CollectionKind,
        reason: String,
    },

    #[error("invalid dimension: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::EmbeddingUnavailable(_)
                | CoreError::GenerationTimeout(_)
                | CoreError::GenerationError(_)
                | CoreError::Storage(_)
        )
    }
}
