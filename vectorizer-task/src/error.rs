//! The error taxonomy from spec §7, as explicit result variants rather
//! than the exceptions the original implementation threw (§9 Design
//! Notes: "re-architect as an explicit result variant").

use thiserror::Error;

use crate::model::{InterruptReason, TaskStatus};

#[derive(Debug, Error)]
pub enum TaskError {
    /// Attempted a transition from the wrong state. The controller or
    /// worker issuing the op should treat this as a raced dispatch.
    #[error("task `{task_id}` expected status `{expected}` but was `{actual}`")]
    StatusMismatch {
        task_id: String,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    /// The lease expired mid-work: this worker no longer owns the task.
    #[error("task `{task_id}` lease expired")]
    Timeout { task_id: String },

    /// A pause/cancel request was honored; the batch loop should unwind
    /// cleanly. State has already been durably updated by the time this
    /// is returned.
    #[error("task `{task_id}` was interrupted: {reason}")]
    Interrupted {
        task_id: String,
        reason: InterruptReason,
    },

    #[error(transparent)]
    Store(#[from] etcd_client::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
