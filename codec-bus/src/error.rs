//! Error taxonomy shared by every backend and pipeline.
//!
//! Construction failures (`BackendUnavailable`, `FatalBackendInit`) are returned
//! synchronously to whoever builds a pipeline. Per-unit failures
//! (`DecodeRejected`, `EncodeRejected`) are logged by the stage that hit them
//! and never leave the worker thread.

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The requested variant cannot serve this codec/profile. Recoverable by
    /// opening another variant at construction time.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// One submitted unit could not be decoded (corrupt bitstream etc).
    #[error("unit rejected by decoder: {0}")]
    DecodeRejected(String),

    /// One submitted frame could not be converted or encoded.
    #[error("frame rejected by encoder: {0}")]
    EncodeRejected(String),

    /// No pooled buffer could be obtained and the caller cannot wait.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The engine failed to initialize at all.
    #[error("backend failed to initialize: {0}")]
    FatalBackendInit(String),

    /// The pipeline or backend is shutting down and accepts no more work.
    #[error("closed")]
    Closed,
}

impl CodecError {
    /// Whether a different backend variant may still succeed.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, CodecError::BackendUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
