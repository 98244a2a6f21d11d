use sophia_store::StoreError;

/// The error type of the inference layer.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    /// The ruleset, closure plan or engine configuration is invalid
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    /// An unexpected condition, denoting a programming error; not recoverable
    #[error("Fatal inference error: {0}")]
    Fatal(String),
    /// The underlying store failed
    #[error("Repository error: {0}")]
    Repository(
        #[from]
        #[source]
        StoreError,
    ),
    /// Rewriting a query or an update failed
    #[error("Could not rewrite {0}: {1}")]
    Rewrite(&'static str, #[source] Box<InferenceError>),
    /// The inference session could not be created, or failed to update the closure
    #[error("Inference session failed: {0}")]
    Session(#[source] Box<InferenceError>),
    /// The inference context was accessed while locked, or written while read-only
    #[error("Inference context is not accessible for {0}")]
    ContextLocked(&'static str),
    /// A cursor was used after the inference context was re-locked
    #[error("Cursor was closed when its inference context was locked")]
    CursorClosed,
    /// The closure metadata file is malformed
    #[error("Invalid closure metadata: {0}")]
    Metadata(String),
    /// An IO error occurred while reading or writing closure metadata
    #[error("IO error: {0}")]
    Io(
        #[from]
        #[source]
        std::io::Error,
    ),
}

impl InferenceError {
    /// Whether this error denotes a programming error rather than an ordinary failure.
    pub fn is_fatal(&self) -> bool {
        match self {
            InferenceError::Fatal(_) => true,
            InferenceError::Rewrite(_, e) | InferenceError::Session(e) => e.is_fatal(),
            _ => false,
        }
    }
}
