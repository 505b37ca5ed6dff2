use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("store error: {0}")]
    Store(#[from] etcd_client::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("task `{0}` not found")]
    TaskMissing(String),
    #[error("cannot {action} task in state {state}")]
    WrongState { action: &'static str, state: String },
    #[error("{0} failed: another writer raced us")]
    Raced(&'static str),
}
