use thiserror::Error;

/// Sentinel errors the broker adapter (C1) surfaces above its boundary.
/// The underlying `redis` error is never leaked to callers.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("key does not exist")]
    KeyDoesNotExist,
    #[error("stream not found")]
    StreamNotFound,
    #[error("consumer group not found")]
    GroupNotFound,
    #[error("no stream entry")]
    NoStreamEntry,
    #[error("lock value mismatch")]
    LockValueMismatch,
    #[error("broker transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ConsumerConfigError {
    #[error("{field} must be non-zero")]
    MustBeNonZero { field: &'static str },
    #[error("{field} is required")]
    Missing { field: &'static str },
}

/// Outcome of handing a decoded envelope to a user-supplied handler.
/// A tagged union, not an exception: see spec design notes on RetryAfter.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("upstream call failed: {0}")]
    Upstream(String),
    #[error("store error: {0}")]
    Store(#[from] BrokerError),
    #[error("malformed entry: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("size mismatch: store has {actual} transactions, config expects {expected}")]
    SizeMismatch { expected: i64, actual: i64 },
    #[error("part upload failed for part {part_number}: {source}")]
    PartUpload {
        part_number: i32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("multipart initiate failed: {0}")]
    Initiate(String),
    #[error("multipart complete failed: {0}")]
    Complete(String),
    #[error(transparent)]
    Store(#[from] BrokerError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Crate-wide error boundary. Workers log this via `tracing::error!` and
/// continue their outer loop; it never crosses an HTTP response boundary
/// because this crate has no inbound HTTP surface.
#[derive(Debug)]
pub enum AppError {
    Broker(BrokerError),
    Handler(HandlerError),
    Upload(UploadError),
    Config(ConfigError),
    Cancelled,
}

impl AppError {
    /// Matches the spec's error taxonomy (§7): transient upstream / 5xx /
    /// transport failures are retriable, the caller should set a
    /// retry-after marker and move on rather than treat this as fatal.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AppError::Broker(BrokerError::Transport(_)) | AppError::Handler(HandlerError::Upstream(_))
        )
    }

    /// 400/401-class errors: permanent, routed to DLQ after max_retry.
    pub fn is_permanent(&self) -> bool {
        matches!(self, AppError::Handler(HandlerError::Malformed(_)))
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Broker(e) => write!(f, "broker error: {e}"),
            AppError::Handler(e) => write!(f, "handler error: {e}"),
            AppError::Upload(e) => write!(f, "upload error: {e}"),
            AppError::Config(e) => write!(f, "config error: {e}"),
            AppError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Broker(e) => Some(e),
            AppError::Handler(e) => Some(e),
            AppError::Upload(e) => Some(e),
            AppError::Config(e) => Some(e),
            AppError::Cancelled => None,
        }
    }
}

impl From<BrokerError> for AppError {
    fn from(e: BrokerError) -> Self {
        AppError::Broker(e)
    }
}

impl From<HandlerError> for AppError {
    fn from(e: HandlerError) -> Self {
        AppError::Handler(e)
    }
}

impl From<UploadError> for AppError {
    fn from(e: UploadError) -> Self {
        AppError::Upload(e)
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::Config(e)
    }
}
