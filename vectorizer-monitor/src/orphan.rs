//! Orphan repatriation (spec §4.5): a task stuck in `running` whose
//! claim has evaporated gets moved to `resuming` so a worker can pick it
//! back up without operator intervention.

use etcd_client::{Client, Compare, CompareOp, Txn, TxnOp};
use vectorizer_task::key::{claim_key, interrupt_key, task_key};
use vectorizer_task::model::{TaskData, TaskStatus};

use crate::error::MonitorError;

/// If `task_id` is `running` with no claim, transactionally moves it to
/// `resuming` and clears any stale interrupt request, guarded by the
/// task value and claim absence observed at read time. Either guard
/// failing (a worker reacquired it, or the state already moved on)
/// means this call is a no-op: spec.md calls this convergent and safe
/// against concurrent monitors.
pub async fn pause_if_orphan(
    client: &mut Client,
    service: &str,
    task_id: &str,
) -> Result<(), MonitorError> {
    let task_key = task_key(service, task_id);
    let response = client.get(&task_key[..], None).await?;
    let Some(kv) = response.kvs().first() else {
        return Ok(());
    };

    let observed_value = kv.value().to_vec();
    let mut state: TaskData = match serde_json::from_slice(&observed_value) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("unparsable task {task_id}, leaving alone: {e}");
            return Ok(());
        }
    };

    if state.status != TaskStatus::Running {
        return Ok(());
    }

    state.status = TaskStatus::Resuming;
    let claim = claim_key(service, task_id);
    let interrupt = interrupt_key(service, task_id);
    let serialized = serde_json::to_vec(&state)?;

    let result = client
        .txn(
            Txn::new()
                .when([
                    Compare::value(&task_key[..], CompareOp::Equal, observed_value),
                    Compare::version(&claim[..], CompareOp::Equal, 0),
                ])
                .and_then([
                    TxnOp::put(&task_key[..], serialized, None),
                    TxnOp::delete(&interrupt[..], None),
                ]),
        )
        .await?;

    if result.succeeded() {
        eprintln!("orphan repatriated: {task_id} -> resuming");
    }

    Ok(())
}
