use thiserror::Error;

/// Error taxonomy for the mesh runtime.
///
/// Variants map directly onto the kinds enumerated in the error-handling
/// design: each is handled by a specific layer rather than bubbled up
/// generically. See `delivery::sender` for how `Transient`/`Permanent` drive
/// delivery-log transitions.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("auth rejected: {0}")]
    AuthRejected(String),

    #[error("no route to destination: {0}")]
    NoRoute(String),

    #[error("backpressure: {0}")]
    Backpressure(String),

    #[error("stream unknown: {0}")]
    StreamUnknown(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("permanent error: {0}")]
    Permanent(String),

    #[error("leader redirect to {0}")]
    LeaderRedirect(String),

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("fatal invariant violation: {0}")]
    Fatal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MeshError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::Transient(_) | MeshError::NoRoute(_) | MeshError::Backpressure(_)
        )
    }
}

impl From<bincode::error::EncodeError> for MeshError {
    fn from(e: bincode::error::EncodeError) -> Self {
        MeshError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for MeshError {
    fn from(e: bincode::error::DecodeError) -> Self {
        MeshError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
