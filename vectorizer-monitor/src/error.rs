use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Store(#[from] etcd_client::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
