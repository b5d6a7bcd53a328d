//! Pipeline error kinds.
//!
//! Every failure that can end an analysis job carries an [`ErrorKind`]
//! whose string form is stable and safe for machines to match on.
//! Admission-time rejections reuse the same kind strings but are raised
//! by the app crate's guard and never enter job state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, machine-checkable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    IngestionUnavailable,
    ContentTooLarge,
    EmbeddingDimensionMismatch,
    EmbeddingCallFailed,
    IndexPromotionConflict,
    RetrievalEmpty,
    GenerationCallFailed,
    StageTimeout,
    QuotaExceeded,
    AlreadyInProgress,
    JobInterrupted,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::IngestionUnavailable => "ingestion_unavailable",
            ErrorKind::ContentTooLarge => "content_too_large",
            ErrorKind::EmbeddingDimensionMismatch => "embedding_dimension_mismatch",
            ErrorKind::EmbeddingCallFailed => "embedding_call_failed",
            ErrorKind::IndexPromotionConflict => "index_promotion_conflict",
            ErrorKind::RetrievalEmpty => "retrieval_empty",
            ErrorKind::GenerationCallFailed => "generation_call_failed",
            ErrorKind::StageTimeout => "stage_timeout",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::AlreadyInProgress => "already_in_progress",
            ErrorKind::JobInterrupted => "job_interrupted",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage-level failure inside the analysis pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Both ingestion strategies failed.
    #[error("repository content unavailable: {0}")]
    IngestionUnavailable(String),

    /// Every eligible file exceeded the configured ceilings.
    #[error("no usable files: {rejected} file(s) exceeded the {max_bytes}-byte ceiling")]
    ContentTooLarge { rejected: usize, max_bytes: u64 },

    /// A vector did not match the dimension of its generation (or the query
    /// embedding did not match the index).
    #[error("embedding dimension mismatch: expected {expected}, got {actual} ({context})")]
    EmbeddingDimensionMismatch {
        expected: usize,
        actual: usize,
        context: String,
    },

    /// Too many chunks were dropped after exhausting embedding retries.
    #[error("embedding failed for {dropped} of {total} chunks (max drop rate {max_rate:.2})")]
    EmbeddingCallFailed {
        dropped: usize,
        total: usize,
        max_rate: f64,
    },

    /// The query text could not be embedded.
    #[error("query embedding failed: {0}")]
    QueryEmbeddingFailed(String),

    /// Another generation was promoted concurrently.
    #[error("promotion of generation {generation_id} conflicted with {actual:?}")]
    IndexPromotionConflict {
        generation_id: String,
        actual: Option<String>,
    },

    /// Retrieval produced nothing. Never fatal; surfaced for logging.
    #[error("retrieval returned no context")]
    RetrievalEmpty,

    /// The generation collaborator exhausted its retry budget.
    #[error("generation failed after {attempts} attempt(s): {message}")]
    GenerationCallFailed { attempts: u32, message: String },

    /// A stage exceeded its maximum duration.
    #[error("stage {stage} exceeded {limit_secs}s")]
    StageTimeout { stage: String, limit_secs: u64 },

    /// The job was left unfinished by a worker that went away.
    #[error("job interrupted: {0}")]
    JobInterrupted(String),

    /// Storage, I/O, or other unexpected failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::IngestionUnavailable(_) => ErrorKind::IngestionUnavailable,
            PipelineError::ContentTooLarge { .. } => ErrorKind::ContentTooLarge,
            PipelineError::EmbeddingDimensionMismatch { .. } => {
                ErrorKind::EmbeddingDimensionMismatch
            }
            PipelineError::EmbeddingCallFailed { .. } | PipelineError::QueryEmbeddingFailed(_) => {
                ErrorKind::EmbeddingCallFailed
            }
            PipelineError::IndexPromotionConflict { .. } => ErrorKind::IndexPromotionConflict,
            PipelineError::RetrievalEmpty => ErrorKind::RetrievalEmpty,
            PipelineError::GenerationCallFailed { .. } => ErrorKind::GenerationCallFailed,
            PipelineError::StageTimeout { .. } => ErrorKind::StageTimeout,
            PipelineError::JobInterrupted(_) => ErrorKind::JobInterrupted,
            PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }
}
