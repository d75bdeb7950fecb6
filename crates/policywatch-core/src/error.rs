//! Error types for PolicyWatch

/// Result type alias using PolicyWatch's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for PolicyWatch operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed source record
    #[error("parse error: {0}")]
    Parse(String),

    /// Source object has no metadata block
    #[error("object missing metadata field")]
    MissingMetadata,

    /// Source object metadata is not a map
    #[error("metadata is not a map")]
    InvalidMetadataType,

    /// Source object is not a JSON object
    #[error("unsupported object type: {0}")]
    UnsupportedObjectType(String),

    /// Handler precondition failed: a required field is absent or empty
    #[error("missing field: {0}")]
    MissingField(String),

    /// Handler precondition failed: a field has the wrong shape
    #[error("invalid field type: {0}")]
    InvalidFieldType(String),

    /// Transient source failure, eligible for retry
    #[error("retryable source error: {0}")]
    RetryableSource(String),

    /// Permanent source failure
    #[error("source error: {0}")]
    NonRetryableSource(String),

    /// Rate limiter token was not acquired in time
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Reporting API rejected the event or could not be reached
    #[error("delivery error: {0}")]
    Delivery(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Network/IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a new missing field error
    pub fn missing_field(msg: impl Into<String>) -> Self {
        Self::MissingField(msg.into())
    }

    /// Create a new invalid field type error
    pub fn invalid_field_type(msg: impl Into<String>) -> Self {
        Self::InvalidFieldType(msg.into())
    }

    /// Create a new retryable source error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::RetryableSource(msg.into())
    }

    /// Create a new non-retryable source error
    pub fn non_retryable(msg: impl Into<String>) -> Self {
        Self::NonRetryableSource(msg.into())
    }

    /// Create a new delivery error
    pub fn delivery(msg: impl Into<String>) -> Self {
        Self::Delivery(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a retry of the failed operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableSource(_))
    }
}
