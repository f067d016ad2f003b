use crate::models::DownloadStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid download request: {0}")]
    InvalidRequest(String),

    #[error("invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: DownloadStatus,
        to: DownloadStatus,
    },

    #[error("video info is already set for this task")]
    InfoAlreadySet,

    #[error("retry budget already spent for this task")]
    RetryExhausted,

    #[error("worker pool is shut down")]
    PoolShutDown,

    #[error("unknown task id: {0}")]
    UnknownTask(String),

    #[error("invalid engine config: {0}")]
    ConfigInvalid(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("external tool failed: {tool} (code={code:?}) {stderr}")]
    ExternalToolFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },
}

pub type Result<T> = std::result::Result<T, EngineError>;
