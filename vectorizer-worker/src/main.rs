mod error;
mod path;
mod runner;
mod transform;

use std::path::PathBuf;

use clap::Parser;
use vectorizer_task::Queue;

use crate::runner::WorkerConfig;
use crate::transform::HashStubTransformer;

#[derive(Parser, Debug)]
struct Command {
    /// etcd endpoint(s); falls back to $ETCD_HOST, then localhost:2379.
    #[arg(long)]
    etcd: Vec<String>,
    #[arg(long, default_value = "vectorizer")]
    service: String,
    /// Identity this worker claims tasks under; falls back to
    /// $VECTORIZER_IDENTITY, then the local hostname.
    #[arg(long)]
    identity: Option<String>,
    /// Root directory input/output paths are resolved against; falls
    /// back to $VECTORIZER_DIRECTORY.
    #[arg(long)]
    directory: Option<PathBuf>,
    /// Falls back to $VECTORIZER_CHUNK_SIZE, then 100.
    #[arg(long)]
    chunk_size: Option<usize>,
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

fn resolve_identity(cli: Option<String>) -> String {
    cli.or_else(|| std::env::var("VECTORIZER_IDENTITY").ok())
        .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
}

fn resolve_directory(cli: Option<PathBuf>) -> PathBuf {
    cli.or_else(|| std::env::var("VECTORIZER_DIRECTORY").ok().map(PathBuf::from))
        .expect("a working directory is required (--directory or $VECTORIZER_DIRECTORY)")
}

fn resolve_chunk_size(cli: Option<usize>) -> usize {
    cli.or_else(|| {
        std::env::var("VECTORIZER_CHUNK_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
    })
    .unwrap_or(100)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    vectorizer_task::panic::install_panic_hook();

    let args = Command::parse();
    let identity = resolve_identity(args.identity);
    let config = WorkerConfig {
        directory: resolve_directory(args.directory),
        chunk_size: resolve_chunk_size(args.chunk_size),
    };
    let transformer = HashStubTransformer;

    eprintln!("worker `{identity}` starting, directory {:?}", config.directory);

    let mut queue = Queue::connect(
        resolve_etcd_endpoints(args.etcd),
        None,
        args.service,
        identity,
    )
    .await?;

    loop {
        let task = queue.next_task().await?;
        eprintln!("claimed task {} in status {}", task.task_id(), task.status());
        if let Err(e) = runner::run(task, &config, &transformer).await {
            eprintln!("task run failed: {e}");
        }
    }
}
