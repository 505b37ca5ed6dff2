//! The task queue and claim protocol (spec §4.4).

use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, PutOptions, SortOrder,
    SortTarget, Txn, TxnOp, WatchOptions,
};
use tokio_stream::StreamExt;

use crate::error::TaskError;
use crate::key::{
    claim_key, get_increment_key, key_after_prefix, queue_key, queue_prefix, task_id_from_key,
    task_key,
};
use crate::model::TaskData;
use crate::task::{Task, DEFAULT_TTL};

/// A connection to the coordination store, scoped to one service and
/// bound to one worker identity.
pub struct Queue {
    client: Client,
    service: String,
    identity: String,
}

impl Queue {
    pub async fn connect<E: AsRef<str>, S: AsRef<[E]>>(
        endpoints: S,
        options: Option<ConnectOptions>,
        service: String,
        identity: String,
    ) -> Result<Self, etcd_client::Error> {
        let client = Client::connect(endpoints, options).await?;
        Ok(Queue {
            client,
            service,
            identity,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    async fn fetch_task_state(&mut self, task_id: &str) -> Result<TaskData, TaskError> {
        let key = task_key(&self.service, task_id);
        let response = self.client.get(&key[..], None).await?;
        let kv = response
            .kvs()
            .first()
            .unwrap_or_else(|| panic!("task {task_id} vanished between list and claim"));
        Ok(serde_json::from_slice(kv.value())?)
    }

    /// Atomically claims one task: deletes its queue marker and writes a
    /// lease-backed claim, provided nobody else holds the claim already.
    /// Returns `None` on a lost race; the caller simply moves on to the
    /// next candidate (spec §4.4: "no retry storm").
    async fn claim_task(&mut self, task_id: &str) -> Result<Option<Task>, TaskError> {
        let queue_key = queue_key(&self.service, task_id);
        let claim_key = claim_key(&self.service, task_id);

        let lease = self
            .client
            .lease_grant(DEFAULT_TTL.as_secs() as i64, None)
            .await?;

        let result = self
            .client
            .txn(
                Txn::new()
                    .when([Compare::version(&claim_key[..], CompareOp::Equal, 0)])
                    .and_then([
                        TxnOp::delete(&queue_key[..], None),
                        TxnOp::put(
                            &claim_key[..],
                            self.identity.as_bytes(),
                            Some(PutOptions::new().with_lease(lease.id())),
                        ),
                    ])
                    .or_else([TxnOp::delete(&queue_key[..], None)]),
            )
            .await?;

        if !result.succeeded() {
            return Ok(None);
        }

        let state = self.fetch_task_state(task_id).await?;
        Ok(Some(Task::new(
            self.client.clone(),
            self.service.clone(),
            task_id.to_string(),
            self.identity.clone(),
            lease.id(),
            state,
        )))
    }

    fn queue_task_id<'a>(&self, key: &'a [u8]) -> &'a str {
        queue_task_id(&self.service, key)
    }

    /// Blocks until a task is claimed, per spec §4.4: list the current
    /// queue oldest-first (ties broken by queue-marker creation order),
    /// and if nothing claimable is found, watch for new arrivals starting
    /// from the revision the list itself observed. Anchoring the watch to
    /// that revision (rather than opening it only once the list is
    /// exhausted and the store has since moved on) is what avoids the
    /// lost-wakeup race: any marker put between the list starting and the
    /// watch opening is still replayed to us.
    pub async fn next_task(&mut self) -> Result<Task, TaskError> {
        let prefix = queue_prefix(&self.service);
        let end_key = key_after_prefix(&prefix);

        let mut start_key = prefix.clone();
        let mut list_revision = 0i64;
        loop {
            let result = self
                .client
                .get(
                    &start_key[..],
                    Some(
                        GetOptions::new()
                            .with_range(&end_key[..])
                            .with_sort(SortTarget::Create, SortOrder::Ascend)
                            .with_limit(100),
                    ),
                )
                .await?;

            if list_revision == 0 {
                list_revision = result.header().expect("no header").revision();
            }

            for kv in result.kvs() {
                let task_id = self.queue_task_id(kv.key()).to_string();
                if let Some(task) = self.claim_task(&task_id).await? {
                    return Ok(task);
                }
            }

            if !result.more() {
                break;
            }
            start_key = get_increment_key(result.kvs().last().expect("kvs empty").key());
        }

        let (mut watcher, mut watch_stream) = self
            .client
            .watch(
                &prefix[..],
                Some(
                    WatchOptions::new()
                        .with_prefix()
                        .with_fragment()
                        .with_start_revision(list_revision),
                ),
            )
            .await?;

        while let Some(event) = watch_stream.try_next().await? {
            for e in event.events() {
                if e.event_type() == EventType::Put {
                    let kv = e.kv().expect("put event without kv");
                    let task_id = self.queue_task_id(kv.key()).to_string();
                    if let Some(task) = self.claim_task(&task_id).await? {
                        watcher.cancel().await?;
                        return Ok(task);
                    }
                }
            }
        }

        unreachable!("queue watch ended without producing a task");
    }
}

fn queue_task_id<'a>(service: &str, key: &'a [u8]) -> &'a str {
    task_id_from_key(&queue_prefix(service), key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_task_id_strips_prefix() {
        // `Queue::claim_task`/`next_task` need a live etcd connection and
        // are covered by the integration-style tests in vectorizer-worker
        // that drive a real claim/run/resume cycle. Here we only check the
        // pure prefix-stripping this module adds on top of `key`.
        let key = queue_key("vectorizer", "a->b");
        assert_eq!(queue_task_id("vectorizer", &key), "a->b");
    }
}
