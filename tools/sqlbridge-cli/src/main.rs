///
/// sqlbridge - JSON-lines worker host
///
/// Spawns one worker and connects it to the standard streams:
/// - each stdin line is a request object (`{"id": 1, "action": "exec", ...}`)
/// - each response is written to stdout as one line, in worker order
/// - lines that are not valid requests are answered with `{id: null, error}`
///
/// The worker is drained and stopped when stdin closes.
///

mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use serde_json::Value as Json;
use sqlbridge_worker::{Worker, WorkerRequest, WorkerResponse};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use config::{CliConfig, load_config};

#[derive(Parser)]
#[command(name = "sqlbridge")]
#[command(author, version, about = "Serve a sqlbridge worker over JSON lines", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database image to open before reading requests
    #[arg(long)]
    open: Option<PathBuf>,

    /// Log filter, e.g. `info` or `sqlbridge_sqlite3=debug`
    #[arg(long)]
    log_level: Option<String>,
}

async fn write_responses(mut responses: UnboundedReceiver<WorkerResponse>) {
    let mut stdout = tokio::io::stdout();
    while let Some(response) = responses.recv().await {
        let line = match response.to_json() {
            Ok(line) => line,
            Err(err) => {
                error!(error = %err, "failed to encode response");
                continue;
            }
        };
        if let Err(err) = stdout.write_all(format!("{line}\n").as_bytes()).await {
            error!(error = %err, "failed to write response");
            return;
        }
        if let Err(err) = stdout.flush().await {
            error!(error = %err, "failed to flush stdout");
            return;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("error: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => CliConfig::default(),
    };

    let level = cli.log_level.unwrap_or(config.log.level);
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (tx, rx) = mpsc::unbounded_channel();
    let worker = match Worker::spawn(tx.clone()) {
        Ok(worker) => worker,
        Err(err) => {
            eprintln!("error: failed to start worker: {err}");
            return ExitCode::FAILURE;
        }
    };
    let writer = tokio::spawn(write_responses(rx));

    if let Some(path) = cli.open.or(config.worker.open) {
        match tokio::fs::read(&path).await {
            Ok(image) => {
                info!(path = %path.display(), bytes = image.len(), "opening startup image");
                let request = WorkerRequest::new("open", "open").with_buffer(image);
                if let Err(err) = worker.post(request) {
                    error!(error = %err, "failed to queue startup image");
                }
            }
            Err(err) => {
                eprintln!("error: failed to read {}: {err}", path.display());
                return ExitCode::FAILURE;
            }
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                error!(error = %err, "failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let posted = WorkerRequest::from_json(&line).and_then(|request| worker.post(request));
        if let Err(err) = posted {
            debug!(error = %err, "rejected request line");
            let _ = tx.send(WorkerResponse::error(Json::Null, err.to_string()));
        }
    }

    drop(tx);
    if tokio::task::spawn_blocking(move || worker.terminate()).await.is_err() {
        error!("worker shutdown panicked");
    }
    let _ = writer.await;
    ExitCode::SUCCESS
}
