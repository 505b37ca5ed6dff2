//! The worker-side task handle (spec §4.2) and its liveness/interrupt
//! check (§4.3).

use std::time::Duration;

use etcd_client::{Client, Compare, CompareOp, PutOptions, Txn, TxnOp};
use serde::Serialize;
use tokio_stream::StreamExt;

use crate::error::TaskError;
use crate::key::{claim_key, interrupt_key, task_key};
use crate::model::{InterruptReason, Progress, TaskData, TaskStatus};

/// A worker's binding to one claimed task and its lease.
///
/// Every mutating method re-asserts the claim in the same transaction
/// that rewrites the task state (spec invariant 2), guarded by the
/// lease that granted the claim actually still being the one attached
/// to `claims/{id}` (spec §9, second open question): if the lease
/// expired and someone else claimed the task between our last `alive()`
/// and this write, the whole transaction is rejected instead of
/// silently losing the claim half of it.
pub struct Task {
    client: Client,
    service: String,
    task_id: String,
    identity: String,
    lease: i64,
    state: TaskData,
}

impl Task {
    pub(crate) fn new(
        client: Client,
        service: String,
        task_id: String,
        identity: String,
        lease: i64,
        state: TaskData,
    ) -> Self {
        Task {
            client,
            service,
            task_id,
            identity,
            lease,
            state,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn status(&self) -> TaskStatus {
        self.state.status
    }

    pub fn state(&self) -> &TaskData {
        &self.state
    }

    pub fn init(&self) -> crate::model::TaskInit {
        self.state.init.clone()
    }

    pub fn progress(&self) -> Option<Progress> {
        self.state.progress
    }

    fn task_key(&self) -> Vec<u8> {
        task_key(&self.service, &self.task_id)
    }

    fn claim_key(&self) -> Vec<u8> {
        claim_key(&self.service, &self.task_id)
    }

    fn interrupt_key(&self) -> Vec<u8> {
        interrupt_key(&self.service, &self.task_id)
    }

    /// Liveness probe: renews the lease and checks for a pending
    /// interrupt. Must be called at the head of every mutating op and
    /// at every chunk boundary of a long-running loop (spec §4.3).
    pub async fn alive(&mut self) -> Result<(), TaskError> {
        let (mut keeper, mut stream) = self.client.lease_keep_alive(self.lease).await?;
        keeper.keep_alive().await?;
        let response = stream
            .try_next()
            .await?
            .expect("no keepalive response received");

        if response.ttl() == 0 {
            return Err(TaskError::Timeout {
                task_id: self.task_id.clone(),
            });
        }

        let interrupt = self.client.get(&self.interrupt_key()[..], None).await?;
        if let Some(kv) = interrupt.kvs().first() {
            let reason = InterruptReason::from_bytes(kv.value())
                .unwrap_or_else(|| panic!("unknown interrupt reason: {:?}", kv.value()));
            self.interrupt(reason).await?;
            return Err(TaskError::Interrupted {
                task_id: self.task_id.clone(),
                reason,
            });
        }

        Ok(())
    }

    async fn update_state(&mut self, extra_success_ops: Vec<TxnOp>) -> Result<(), TaskError> {
        self.alive().await?;
        self.update_state_noalive(extra_success_ops).await
    }

    async fn update_state_noalive(
        &mut self,
        extra_success_ops: Vec<TxnOp>,
    ) -> Result<(), TaskError> {
        let data = serde_json::to_vec(&self.state)?;
        let mut success_ops = vec![
            TxnOp::put(
                &self.claim_key()[..],
                self.identity.as_bytes(),
                Some(PutOptions::new().with_lease(self.lease)),
            ),
            TxnOp::put(&self.task_key()[..], data, None),
        ];
        success_ops.extend(extra_success_ops);

        let result = self
            .client
            .txn(
                Txn::new()
                    .when([Compare::lease(
                        &self.claim_key()[..],
                        CompareOp::Equal,
                        self.lease,
                    )])
                    .and_then(success_ops),
            )
            .await?;

        if !result.succeeded() {
            return Err(TaskError::Timeout {
                task_id: self.task_id.clone(),
            });
        }

        Ok(())
    }

    fn verify_status(&self, expected: TaskStatus) -> Result<(), TaskError> {
        if self.status() != expected {
            return Err(TaskError::StatusMismatch {
                task_id: self.task_id.clone(),
                expected,
                actual: self.status(),
            });
        }
        Ok(())
    }

    /// Checks liveness (and honors any pending interrupt) while
    /// `self.state.status` still reflects what's actually persisted,
    /// then mutates to `to` and commits. Mutating `self.state.status`
    /// before calling `alive()` would make a concurrent interrupt's
    /// `verify_status(Running)` check the *target* status instead of the
    /// real one — e.g. `finish()` flipping to `Complete` before `alive()`
    /// runs would make a same-window pause/cancel request fail with
    /// `StatusMismatch` instead of being honored, leaving the interrupt
    /// key and claim behind forever.
    async fn transition_to(&mut self, from: TaskStatus, to: TaskStatus) -> Result<(), TaskError> {
        self.verify_status(from)?;
        self.alive().await?;
        self.state.status = to;
        self.update_state_noalive(Vec::new()).await
    }

    pub async fn start(&mut self) -> Result<(), TaskError> {
        self.transition_to(TaskStatus::Pending, TaskStatus::Running)
            .await
    }

    pub async fn resume(&mut self) -> Result<(), TaskError> {
        self.transition_to(TaskStatus::Resuming, TaskStatus::Running)
            .await
    }

    pub async fn set_progress(&mut self, progress: Progress) -> Result<(), TaskError> {
        self.verify_status(TaskStatus::Running)?;
        self.state.progress = Some(progress);
        self.update_state(Vec::new()).await
    }

    pub async fn finish(&mut self, result: u64) -> Result<(), TaskError> {
        self.state.result = Some(result);
        self.transition_to(TaskStatus::Running, TaskStatus::Complete)
            .await?;
        self.release_claim().await
    }

    pub async fn finish_error<T: Serialize>(&mut self, error: T) -> Result<(), TaskError> {
        self.state.error = Some(serde_json::to_value(error)?.to_string());
        self.transition_to(TaskStatus::Running, TaskStatus::Error)
            .await?;
        self.release_claim().await
    }

    /// Honor an interrupt request: verify we're running, move to the
    /// target status, delete the interrupt key, all in one transaction,
    /// then revoke the lease.
    async fn interrupt(&mut self, reason: InterruptReason) -> Result<(), TaskError> {
        self.verify_status(TaskStatus::Running)?;
        self.state.status = reason.target_status();
        let delete_interrupt = vec![TxnOp::delete(&self.interrupt_key()[..], None)];
        self.update_state_noalive(delete_interrupt).await?;
        self.release_claim().await
    }

    async fn release_claim(&mut self) -> Result<(), TaskError> {
        self.client.lease_revoke(self.lease).await?;
        Ok(())
    }
}

/// Recommended claim lease TTL from spec §5. Workers must call `alive()`
/// at least every `DEFAULT_TTL / 3`.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskInit;
    use std::collections::BTreeMap;

    fn pending_state() -> TaskData {
        TaskData {
            status: TaskStatus::Pending,
            init: TaskInit {
                input_file: "a.jsonl".into(),
                output_file: "a.vec".into(),
            },
            progress: None,
            result: None,
            error: None,
            other_fields: BTreeMap::new(),
        }
    }

    #[test]
    fn default_ttl_matches_spec_recommendation() {
        assert_eq!(DEFAULT_TTL, Duration::from_secs(10));
    }

    // `Task`'s methods all require a live etcd connection, so the bulk of
    // its behavior is covered by integration-style tests in
    // vectorizer-worker, which exercises the full claim/run/resume cycle
    // against the chunk loop. This module covers the pure logic that
    // doesn't need a store: state construction and status bookkeeping.
    #[test]
    fn pending_state_has_no_progress_or_result() {
        let state = pending_state();
        assert_eq!(state.status, TaskStatus::Pending);
        assert!(state.progress.is_none());
        assert!(state.result.is_none());
    }
}
