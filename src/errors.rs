
use thiserror::Error;

/// Errors raised while loading or transforming cooccurrence data.
///
/// Nothing here is transient: every variant points at a data or
/// configuration defect, so callers should fail fast rather than retry.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing or unreadable store files.
    #[error("storage error: {0}")]
    Storage(String),

    /// Stored data disagrees with the store metadata (vocab size, factors).
    #[error("format error: {0}")]
    Format(String),

    /// Partition tensors whose shapes do not line up with the marginals.
    #[error("shape error: expected {expected}, got {actual}")]
    Shape { expected: String, actual: String },

    /// Non-finite values left after the zero-count handling of a transform.
    #[error("numeric error: {0}")]
    Numeric(String),

    /// A loader worker died before finishing its assigned sectors.
    #[error("worker error: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Storage(e.to_string())
    }
}

impl From<ndarray_npy::ReadNpyError> for PipelineError {
    fn from(e: ndarray_npy::ReadNpyError) -> Self {
        PipelineError::Storage(e.to_string())
    }
}

impl From<ndarray_npy::WriteNpyError> for PipelineError {
    fn from(e: ndarray_npy::WriteNpyError) -> Self {
        PipelineError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for PipelineError {
    fn from(e: bincode::Error) -> Self {
        PipelineError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Format(e.to_string())
    }
}
