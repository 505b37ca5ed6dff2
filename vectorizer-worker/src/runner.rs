//! The resumable batch loop (spec §4.6): chunked processing with a
//! fsync-before-finish durability boundary and file-size-derived resume.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::Instant;

use serde_json::Value;
use vectorizer_task::{Progress, Task, TaskError, TaskStatus};

use crate::error::WorkerError;
use crate::path::resolve_path;
use crate::transform::BatchTransformer;

/// Bytes produced per item by every [`BatchTransformer`]; also the unit
/// `resume` uses to recover a durable item count from output file size.
pub const RECORD_WIDTH: u64 = 4096;

/// How many trailing chunks `avg_rate` is averaged over.
const RATE_WINDOW: usize = 10;

pub struct WorkerConfig {
    pub directory: PathBuf,
    pub chunk_size: usize,
}

/// Runs one claimed task to a terminal or interrupted state. Dispatches
/// on the status the task was claimed in, same as the original's
/// `match task.status(): pending -> start, running|resuming -> resume`.
pub async fn run(
    mut task: Task,
    config: &WorkerConfig,
    transformer: &dyn BatchTransformer,
) -> Result<(), WorkerError> {
    let outcome = match task.status() {
        TaskStatus::Pending => run_fresh(&mut task, config, transformer).await,
        TaskStatus::Resuming | TaskStatus::Running => {
            run_resumed(&mut task, config, transformer).await
        }
        other => return Err(WorkerError::UnexpectedStatus(other)),
    };

    match outcome {
        Ok(()) => Ok(()),
        Err(WorkerError::Task(TaskError::Interrupted { .. })) => Ok(()),
        Err(WorkerError::Task(e @ TaskError::StatusMismatch { .. })) => {
            eprintln!("{} raced out from under us: {e}", task.task_id());
            Ok(())
        }
        Err(WorkerError::Task(e @ TaskError::Timeout { .. })) => {
            eprintln!("{} lost its lease mid-run: {e}", task.task_id());
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            task.finish_error(message).await?;
            Ok(())
        }
    }
}

async fn run_fresh(
    task: &mut Task,
    config: &WorkerConfig,
    transformer: &dyn BatchTransformer,
) -> Result<(), WorkerError> {
    task.start().await?;

    let input_path = resolve_path(&config.directory, &task.init().input_file)?;
    let total = count_lines(&input_path)?;
    task.set_progress(Progress {
        count: 0,
        total,
        rate: None,
        avg_rate: None,
    })
    .await?;

    run_chunks(task, config, transformer, 0, 0, total).await
}

async fn run_resumed(
    task: &mut Task,
    config: &WorkerConfig,
    transformer: &dyn BatchTransformer,
) -> Result<(), WorkerError> {
    if task.status() == TaskStatus::Resuming {
        task.resume().await?;
    }

    let output_path = resolve_path(&config.directory, &task.init().output_file)?;
    let size = std::fs::metadata(&output_path).map(|m| m.len()).unwrap_or(0);
    let count = size / RECORD_WIDTH;
    let truncate_to = count * RECORD_WIDTH;

    eprintln!(
        "{} resuming after already vectorizing {count}",
        task.task_id()
    );

    let total = match task.progress() {
        Some(progress) => progress.total,
        None => count_lines(&resolve_path(&config.directory, &task.init().input_file)?)?,
    };

    task.set_progress(Progress {
        count,
        total,
        rate: None,
        avg_rate: None,
    })
    .await?;

    run_chunks(task, config, transformer, truncate_to, count, total).await
}

/// The chunk loop itself: read input sequentially, skip already-done
/// lines, accumulate a chunk, transform and checkpoint at each boundary.
async fn run_chunks(
    task: &mut Task,
    config: &WorkerConfig,
    transformer: &dyn BatchTransformer,
    truncate_to: u64,
    initial_count: u64,
    total: u64,
) -> Result<(), WorkerError> {
    let input_path = resolve_path(&config.directory, &task.init().input_file)?;
    let output_path = resolve_path(&config.directory, &task.init().output_file)?;

    let mut reader = BufReader::new(File::open(&input_path)?);
    let output = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&output_path)?;
    output.set_len(truncate_to)?;
    let mut writer = BufWriter::new(output);
    writer.seek(SeekFrom::Start(truncate_to))?;

    let mut skip = initial_count;
    let mut count = initial_count;
    let mut chunk: Vec<Value> = Vec::with_capacity(config.chunk_size);
    let mut window: VecDeque<(usize, f64)> = VecDeque::with_capacity(RATE_WINDOW);

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        if skip > 0 {
            skip -= 1;
            continue;
        }

        chunk.push(serde_json::from_str(trimmed)?);
        if chunk.len() == config.chunk_size {
            flush_chunk(
                task,
                &mut writer,
                transformer,
                &mut chunk,
                &mut count,
                total,
                &mut window,
            )
            .await?;
        }
    }

    if !chunk.is_empty() {
        flush_chunk(
            task,
            &mut writer,
            transformer,
            &mut chunk,
            &mut count,
            total,
            &mut window,
        )
        .await?;
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;

    task.finish(count).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn flush_chunk(
    task: &mut Task,
    writer: &mut BufWriter<File>,
    transformer: &dyn BatchTransformer,
    chunk: &mut Vec<Value>,
    count: &mut u64,
    total: u64,
    window: &mut VecDeque<(usize, f64)>,
) -> Result<(), WorkerError> {
    task.alive().await?;

    let started = Instant::now();
    let task_id = task.task_id().to_string();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        vectorizer_task::panic::run_marked(&task_id, || transformer.process_chunk(chunk, writer))
    }));
    let result = match outcome {
        Ok(result) => result,
        Err(_) => {
            let message = vectorizer_task::panic::take_captured_panic(&task_id)
                .unwrap_or_else(|| format!("task {task_id} panicked with no captured message"));
            return Err(WorkerError::TransformPanic(message));
        }
    };
    result?;
    let elapsed = started.elapsed().as_secs_f64();

    *count += chunk.len() as u64;
    window.push_back((chunk.len(), elapsed));
    if window.len() > RATE_WINDOW {
        window.pop_front();
    }

    let rate = positive_rate(chunk.len(), elapsed);
    let (window_items, window_secs) = window
        .iter()
        .fold((0usize, 0.0), |(items, secs), (i, d)| (items + i, secs + d));
    let avg_rate = positive_rate(window_items, window_secs);

    task.set_progress(Progress {
        count: *count,
        total,
        rate,
        avg_rate,
    })
    .await?;

    chunk.clear();
    Ok(())
}

fn positive_rate(items: usize, seconds: f64) -> Option<f64> {
    if seconds > 0.0 {
        Some(items as f64 / seconds)
    } else {
        None
    }
}

fn count_lines(path: &std::path::Path) -> Result<u64, WorkerError> {
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0u64;
    for line in reader.lines() {
        line?;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::HashStubTransformer;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn write_input(path: &std::path::Path, lines: usize) {
        let mut f = File::create(path).unwrap();
        for i in 0..lines {
            writeln!(f, "{{\"i\":{i}}}").unwrap();
        }
    }

    #[test]
    fn count_lines_matches_line_count() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.jsonl");
        write_input(&input, 7);
        assert_eq!(count_lines(&input).unwrap(), 7);
    }

    #[test]
    fn record_width_matches_spec_constant() {
        assert_eq!(RECORD_WIDTH, 4096);
    }

    #[test]
    fn positive_rate_is_none_for_zero_duration() {
        assert_eq!(positive_rate(10, 0.0), None);
        assert!(positive_rate(10, 2.0).unwrap() > 0.0);
    }

    // The full chunk loop needs a claimed `Task`, which needs a live
    // coordination store; that path is exercised end-to-end wherever
    // this crate is deployed against a real etcd. This module sticks to
    // the pure arithmetic (resume offsets, rate windows) that doesn't.
    #[test]
    fn hash_stub_transformer_produces_resume_consistent_output() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out.vec");
        let transformer = HashStubTransformer;

        let items: Vec<Value> = (0..5).map(|i| serde_json::json!({"i": i})).collect();
        let mut full = Vec::new();
        transformer.process_chunk(&items, &mut full).unwrap();

        // Simulate: process the first 3 items, "crash", then resume and
        // reprocess from the file-size-derived offset.
        let mut partial = Vec::new();
        transformer.process_chunk(&items[..3], &mut partial).unwrap();
        std::fs::write(&out, &partial).unwrap();

        let size = std::fs::metadata(&out).unwrap().len();
        let resumed_count = (size / RECORD_WIDTH) as usize;
        assert_eq!(resumed_count, 3);

        let mut resumed_tail = Vec::new();
        transformer
            .process_chunk(&items[resumed_count..], &mut resumed_tail)
            .unwrap();
        let mut reassembled = partial;
        reassembled.extend(resumed_tail);
        assert_eq!(reassembled, full);
    }
}
