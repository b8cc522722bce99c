//! Error types for the recorder orchestrator.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persisted-store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Pool runtime error: {0}")]
    PoolRuntime(#[from] deadpool_postgres::PoolError),
}

/// Job queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue connection failed: {0}")]
    Connection(String),

    #[error("Queue command failed: {0}")]
    Command(String),

    #[error("Unexpected queue reply: {0}")]
    Decode(String),
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
            QueueError::Connection(e.to_string())
        } else {
            QueueError::Command(e.to_string())
        }
    }
}

/// Container lifecycle errors.
///
/// `LimitExceeded` and `UserAlreadyActive` are admission rejections: they end
/// the job immediately. Everything else is worth another attempt.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("Recorder limit reached: {running} running, limit is {limit}")]
    LimitExceeded { running: usize, limit: usize },

    #[error("User {user_id} already has an active recorder ({container_id})")]
    UserAlreadyActive {
        user_id: String,
        container_id: String,
    },

    #[error("Failed to pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("Failed to create container {name}: {reason}")]
    Create { name: String, reason: String },

    #[error("Failed to start container {id}: {reason}")]
    Start { id: String, reason: String },

    #[error("Container runtime error: {0}")]
    Runtime(String),
}

impl ContainerError {
    /// Whether a fresh attempt may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ContainerError::LimitExceeded { .. } | ContainerError::UserAlreadyActive { .. }
        )
    }
}

/// Failure inside one session attempt.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl SessionError {
    /// Admission rejections end the job; everything else is retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Container(e) => e.is_retryable(),
            SessionError::Database(_) => true,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
