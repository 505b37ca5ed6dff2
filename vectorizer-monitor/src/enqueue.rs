//! Enqueue side of the monitor (spec §4.5): puts a queue marker for any
//! task in a runnable status, unless it's already queued or claimed.

use etcd_client::{Client, Compare, CompareOp, Txn, TxnOp};
use vectorizer_task::key::{claim_key, queue_key};
use vectorizer_task::model::TaskStatus;

use crate::error::MonitorError;

/// Enqueues `task_id` if its status warrants it. Idempotent and safe
/// against concurrently-running monitors.
pub async fn enqueue_if_runnable(
    client: &mut Client,
    service: &str,
    task_id: &str,
    status: TaskStatus,
) -> Result<(), MonitorError> {
    if !status.is_runnable() {
        return Ok(());
    }
    enqueue(client, service, task_id).await
}

async fn enqueue(client: &mut Client, service: &str, task_id: &str) -> Result<(), MonitorError> {
    let claim = claim_key(service, task_id);
    let queue = queue_key(service, task_id);

    let result = client
        .txn(
            Txn::new()
                .when([
                    Compare::version(&claim[..], CompareOp::Equal, 0),
                    Compare::version(&queue[..], CompareOp::Equal, 0),
                ])
                .and_then([TxnOp::put(&queue[..], b"".to_vec(), None)]),
        )
        .await?;

    if result.succeeded() {
        eprintln!("enqueue {task_id}");
    }

    Ok(())
}
