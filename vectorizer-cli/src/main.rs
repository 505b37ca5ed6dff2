mod error;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use etcd_client::{Client, Compare, CompareOp, GetOptions, Txn, TxnOp};
use vectorizer_task::key::{claim_key, interrupt_key, queue_key, task_id_from_key, task_key, tasks_prefix};
use vectorizer_task::model::{TaskData, TaskStatus};

use crate::error::CliError;

/// Administrative command surface for the coordination store: create,
/// inspect, and nudge tasks without a worker attached.
#[derive(Parser, Debug)]
#[command(name = "manage")]
struct Command {
    /// etcd endpoint(s); falls back to $ETCD_HOST, then localhost:2379.
    #[arg(long)]
    etcd: Vec<String>,
    #[arg(long, default_value = "vectorizer")]
    service: String,
    #[command(subcommand)]
    command: Subcommands,
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    /// Create a task that vectorizes `input` into `output`.
    Process {
        input: String,
        output: String,
        #[arg(long = "task-name")]
        task_name: Option<String>,
    },
    /// Print a task's status.
    Status {
        task_name: String,
        #[arg(long)]
        raw: bool,
    },
    /// List every task for the service.
    List,
    /// Pause a running task, or cancel a pending resume.
    Pause { task_name: String },
    /// Move a paused task back to resuming.
    Resume { task_name: String },
    /// Move an errored task back to resuming, clearing its error.
    Retry { task_name: String },
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
async fn main() -> ExitCode {
    let args = Command::parse();
    let mut client = match Client::connect(resolve_etcd_endpoints(args.etcd), None).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("failed to connect to etcd: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match args.command {
        Subcommands::Process {
            input,
            output,
            task_name,
        } => process(&mut client, &args.service, input, output, task_name).await,
        Subcommands::Status { task_name, raw } => {
            status(&mut client, &args.service, &task_name, raw).await
        }
        Subcommands::List => list(&mut client, &args.service).await,
        Subcommands::Pause { task_name } => pause(&mut client, &args.service, &task_name).await,
        Subcommands::Resume { task_name } => resume(&mut client, &args.service, &task_name).await,
        Subcommands::Retry { task_name } => retry(&mut client, &args.service, &task_name).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn process(
    client: &mut Client,
    service: &str,
    input: String,
    output: String,
    task_name: Option<String>,
) -> Result<(), CliError> {
    let task_name = task_name.unwrap_or_else(|| format!("{input}->{output}"));
    let key = task_key(service, &task_name);
    let data = TaskData::new_pending(vectorizer_task::model::TaskInit {
        input_file: input,
        output_file: output,
    });
    client.put(&key[..], serde_json::to_vec(&data)?, None).await?;
    println!("created task: `{task_name}`");
    Ok(())
}

async fn fetch(
    client: &mut Client,
    service: &str,
    task_name: &str,
) -> Result<(Vec<u8>, TaskData), CliError> {
    let key = task_key(service, task_name);
    let response = client.get(&key[..], None).await?;
    let kv = response
        .kvs()
        .first()
        .ok_or_else(|| CliError::TaskMissing(task_name.to_string()))?;
    let value = kv.value().to_vec();
    let data: TaskData = serde_json::from_slice(&value)?;
    Ok((value, data))
}

fn status_line(task_name: &str, data: &TaskData) -> String {
    let mut line = format!(
        "{task_name} ({}->{}): {}",
        data.init.input_file, data.init.output_file, data.status
    );
    if let Some(progress) = data.progress {
        let rate = progress
            .rate
            .map(|r| format!("{r:.2}"))
            .unwrap_or_else(|| "unknown".to_string());
        let avg_rate = progress
            .avg_rate
            .map(|r| format!("{r:.2}"))
            .unwrap_or_else(|| "unknown".to_string());
        line.push_str(&format!(
            ", progress: {}/{}, rate: {rate} (avg {avg_rate})",
            progress.count, progress.total
        ));
    }
    line
}

async fn status(
    client: &mut Client,
    service: &str,
    task_name: &str,
    raw: bool,
) -> Result<(), CliError> {
    let (_value, data) = fetch(client, service, task_name).await?;
    if raw {
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{}", status_line(task_name, &data));
        if let Some(error) = &data.error {
            println!("{error}");
        }
    }
    Ok(())
}

async fn list(client: &mut Client, service: &str) -> Result<(), CliError> {
    let prefix = tasks_prefix(service);
    let response = client
        .get(&prefix[..], Some(GetOptions::new().with_prefix()))
        .await?;
    for kv in response.kvs() {
        let task_name = task_id_from_key(&prefix, kv.key());
        match serde_json::from_slice::<TaskData>(kv.value()) {
            Ok(data) => println!("{}", status_line(task_name, &data)),
            Err(e) => eprintln!("{task_name}: unparsable task record: {e}"),
        }
    }
    Ok(())
}

async fn pause(client: &mut Client, service: &str, task_name: &str) -> Result<(), CliError> {
    let (observed_value, mut data) = fetch(client, service, task_name).await?;

    match data.status {
        TaskStatus::Running => {
            let interrupt = interrupt_key(service, task_name);
            client
                .put(&interrupt[..], b"pause".to_vec(), None)
                .await?;
            Ok(())
        }
        TaskStatus::Resuming => {
            let task_key = task_key(service, task_name);
            let claim = claim_key(service, task_name);
            let queue = queue_key(service, task_name);
            let interrupt = interrupt_key(service, task_name);

            data.status = TaskStatus::Paused;
            let serialized = serde_json::to_vec(&data)?;

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
                            TxnOp::delete(&queue[..], None),
                        ]),
                )
                .await?;

            if !result.succeeded() {
                return Err(CliError::Raced("pausing a resuming task"));
            }
            Ok(())
        }
        other => Err(CliError::WrongState {
            action: "pause",
            state: other.to_string(),
        }),
    }
}

async fn resume(client: &mut Client, service: &str, task_name: &str) -> Result<(), CliError> {
    let (observed_value, mut data) = fetch(client, service, task_name).await?;
    if data.status != TaskStatus::Paused {
        return Err(CliError::WrongState {
            action: "resume",
            state: data.status.to_string(),
        });
    }

    data.status = TaskStatus::Resuming;
    replace(client, service, task_name, observed_value, &data, "resume").await
}

async fn retry(client: &mut Client, service: &str, task_name: &str) -> Result<(), CliError> {
    let (observed_value, mut data) = fetch(client, service, task_name).await?;
    if data.status != TaskStatus::Error {
        return Err(CliError::WrongState {
            action: "retry",
            state: data.status.to_string(),
        });
    }

    data.error = None;
    data.status = TaskStatus::Resuming;
    replace(client, service, task_name, observed_value, &data, "retry").await
}

async fn replace(
    client: &mut Client,
    service: &str,
    task_name: &str,
    observed_value: Vec<u8>,
    data: &TaskData,
    action: &'static str,
) -> Result<(), CliError> {
    let key = task_key(service, task_name);
    let serialized = serde_json::to_vec(data)?;
    let result = client
        .txn(
            Txn::new()
                .when([Compare::value(&key[..], CompareOp::Equal, observed_value)])
                .and_then([TxnOp::put(&key[..], serialized, None)]),
        )
        .await?;

    if !result.succeeded() {
        return Err(CliError::Raced(action));
    }
    Ok(())
}
