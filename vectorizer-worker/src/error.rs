use thiserror::Error;
use vectorizer_task::{TaskError, TaskStatus};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("transform error: {0}")]
    Transform(#[from] crate::transform::TransformError),
    #[error("path {0} is invalid")]
    InvalidPath(String),
    #[error("cannot process task with status {0}")]
    UnexpectedStatus(TaskStatus),
    #[error("transformer panicked: {0}")]
    TransformPanic(String),
}
