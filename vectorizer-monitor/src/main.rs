mod enqueue;
mod error;
mod init;
mod orphan;
mod watch;

use std::error::Error;

use clap::Parser;
use etcd_client::Client;
use tokio::sync::mpsc;
use vectorizer_task::key::{claims_prefix, task_id_from_key, tasks_prefix};

use crate::watch::MonitorEvent;

/// Watches the coordination store for one service, enqueuing runnable
/// tasks and repatriating orphaned ones. Safe to run more than one of
/// these against the same service; every write is a guarded transaction.
#[derive(Parser, Debug)]
struct Command {
    /// etcd endpoint(s); falls back to $ETCD_HOST, then localhost:2379.
    #[arg(long)]
    etcd: Vec<String>,
    #[arg(long, default_value = "vectorizer")]
    service: String,
    /// How many in-flight events the two watch drainers may queue up
    /// before the consumer loop backpressures them.
    #[arg(long, default_value_t = 256)]
    channel_capacity: usize,
}

fn resolve_etcd_endpoints(cli: Vec<String>) -> Vec<String> {
    if !cli.is_empty() {
        return cli;
    }
    match std::env::var("ETCD_HOST") {
        Ok(host) => vec![host],
        Err(_) => vec!["localhost:2379".to_string()],
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Command::parse();
    let endpoints = resolve_etcd_endpoints(args.etcd);
    let mut client = Client::connect(endpoints, None).await?;

    eprintln!("scanning existing tasks for service `{}`", args.service);
    let revision = init::scan_existing_tasks(&mut client, &args.service).await?;
    eprintln!("startup scan done, watching from revision {}", revision + 1);

    let (sender, mut receiver) = mpsc::channel(args.channel_capacity);

    let tasks_handle = tokio::spawn(watch::drain_task_puts(
        client.clone(),
        tasks_prefix(&args.service),
        revision + 1,
        sender.clone(),
    ));
    let claims_handle = tokio::spawn(watch::drain_claim_deletes(
        client.clone(),
        claims_prefix(&args.service),
        revision + 1,
        sender,
    ));

    let tasks_prefix = tasks_prefix(&args.service);
    let claims_prefix = claims_prefix(&args.service);

    // Single consumer: every enqueue/pause_if_orphan transaction this
    // process issues goes through here, one at a time, so two of this
    // monitor's own transactions never race each other.
    while let Some(event) = receiver.recv().await {
        let result = match event {
            MonitorEvent::TaskPut { key, value } => {
                let task_id = task_id_from_key(&tasks_prefix, &key).to_string();
                match serde_json::from_slice::<vectorizer_task::TaskData>(&value) {
                    Ok(data) => {
                        enqueue::enqueue_if_runnable(&mut client, &args.service, &task_id, data.status)
                            .await
                    }
                    Err(e) => {
                        eprintln!("unparsable task {task_id}: {e}");
                        Ok(())
                    }
                }
            }
            MonitorEvent::ClaimDelete { key } => {
                let task_id = task_id_from_key(&claims_prefix, &key).to_string();
                orphan::pause_if_orphan(&mut client, &args.service, &task_id).await
            }
        };

        if let Err(e) = result {
            eprintln!("monitor event handling failed: {e}");
        }
    }

    tasks_handle.await??;
    claims_handle.await??;

    Ok(())
}
