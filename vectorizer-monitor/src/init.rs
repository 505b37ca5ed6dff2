//! Startup scan (spec §4.5): before relying on watches, sweep the
//! existing `tasks/` keyspace so nothing already runnable or orphaned at
//! monitor startup is missed.

use etcd_client::{Client, GetOptions, SortOrder, SortTarget};
use vectorizer_task::key::{get_increment_key, key_after_prefix, tasks_prefix, task_id_from_key};
use vectorizer_task::model::{TaskData, TaskStatus};

use crate::enqueue::enqueue_if_runnable;
use crate::error::MonitorError;
use crate::orphan::pause_if_orphan;

const SCAN_LIMIT: i64 = 1000;

/// Scans `tasks/` in creation order, enqueuing runnable tasks and
/// repatriating orphaned `running` ones. Returns the revision the scan
/// observed, so the caller can anchor its watches from `revision + 1`
/// without missing or double-processing anything in between.
pub async fn scan_existing_tasks(
    client: &mut Client,
    service: &str,
) -> Result<i64, MonitorError> {
    let prefix = tasks_prefix(service);
    let end_key = key_after_prefix(&prefix);
    let mut start_key = prefix.clone();
    let mut revision = 0i64;

    loop {
        let mut options = GetOptions::new()
            .with_range(&end_key[..])
            .with_sort(SortTarget::Create, SortOrder::Ascend)
            .with_limit(SCAN_LIMIT);
        if revision != 0 {
            options = options.with_revision(revision);
        }

        let result = client.get(&start_key[..], Some(options)).await?;
        if revision == 0 {
            revision = result.header().expect("no header").revision();
        }

        let kvs = result.kvs();
        for kv in kvs {
            let task_id = task_id_from_key(&prefix, kv.key()).to_string();
            match serde_json::from_slice::<TaskData>(kv.value()) {
                Ok(data) if data.status == TaskStatus::Running => {
                    pause_if_orphan(client, service, &task_id).await?;
                }
                Ok(data) => {
                    enqueue_if_runnable(client, service, &task_id, data.status).await?;
                }
                Err(e) => eprintln!("unparsable task {task_id} during startup scan: {e}"),
            }
        }

        if (kvs.len() as i64) < SCAN_LIMIT {
            break;
        }
        start_key = get_increment_key(kvs.last().expect("kvs empty").key());
    }

    Ok(revision)
}
