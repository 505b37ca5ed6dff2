//! The two background watch-drainers from spec §5: each watches one
//! prefix and forwards parsed events into a single bounded channel, so
//! the consumer can handle them one at a time and no two transactions
//! from this monitor instance ever overlap.

use etcd_client::{Client, EventType, WatchFilterType, WatchOptions};
use tokio::sync::mpsc::Sender;
use tokio_stream::StreamExt;

use crate::error::MonitorError;

/// An event worth reacting to, already decoupled from the borrowed
/// `etcd_client` watch response it came from.
#[derive(Debug)]
pub enum MonitorEvent {
    /// A task record was created or updated.
    TaskPut { key: Vec<u8>, value: Vec<u8> },
    /// A claim key disappeared — lease expiry or explicit revoke.
    ClaimDelete { key: Vec<u8> },
}

/// Watches `tasks/` for puts (ignoring deletes, which don't happen to
/// task records in steady state) starting from `start_revision`.
pub async fn drain_task_puts(
    mut client: Client,
    prefix: Vec<u8>,
    start_revision: i64,
    sender: Sender<MonitorEvent>,
) -> Result<(), MonitorError> {
    let (_watcher, mut stream) = client
        .watch(
            &prefix[..],
            Some(
                WatchOptions::new()
                    .with_prefix()
                    .with_start_revision(start_revision)
                    .with_filters([WatchFilterType::NoDelete])
                    .with_fragment(),
            ),
        )
        .await?;

    while let Some(response) = stream.try_next().await? {
        if response.canceled() {
            break;
        }
        for event in response.events() {
            if event.event_type() != EventType::Put {
                continue;
            }
            let Some(kv) = event.kv() else { continue };
            let forwarded = MonitorEvent::TaskPut {
                key: kv.key().to_vec(),
                value: kv.value().to_vec(),
            };
            if sender.send(forwarded).await.is_err() {
                break;
            }
        }
    }

    Ok(())
}

/// Watches `claims/` for deletes (lease expiry or explicit revoke)
/// starting from `start_revision`.
pub async fn drain_claim_deletes(
    mut client: Client,
    prefix: Vec<u8>,
    start_revision: i64,
    sender: Sender<MonitorEvent>,
) -> Result<(), MonitorError> {
    let (_watcher, mut stream) = client
        .watch(
            &prefix[..],
            Some(
                WatchOptions::new()
                    .with_prefix()
                    .with_start_revision(start_revision)
                    .with_filters([WatchFilterType::NoPut])
                    .with_fragment(),
            ),
        )
        .await?;

    while let Some(response) = stream.try_next().await? {
        if response.canceled() {
            break;
        }
        for event in response.events() {
            if event.event_type() != EventType::Delete {
                continue;
            }
            let Some(kv) = event.kv() else { continue };
            let forwarded = MonitorEvent::ClaimDelete {
                key: kv.key().to_vec(),
            };
            if sender.send(forwarded).await.is_err() {
                break;
            }
        }
    }

    Ok(())
}
