use thiserror::Error;

/// Errors from the framework's own API (not from user operations).
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("continuous task `{0}` is already started")]
    AlreadyStarted(String),

    #[error("continuous task `{0}` has no body")]
    MissingBody(String),

    #[error("worker for continuous task `{0}` refused the loop")]
    WorkerRejected(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
