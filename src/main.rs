// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use segment_relay::config::LoggingConfig;
use segment_relay::{
    load_config_with_env, Clock, HttpUploadApi, Ledger, NetworkMonitor, PendingUploadRecord,
    RelayConfig, SegmentMeta, SegmentStore, SystemClock, UploadHub, UploadWorker, WorkerCommand,
    WorkerDeps,
};

/// Segment Relay - deliver recorded media segments to remote storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    /// Execution context tag (overrides config file)
    #[arg(long)]
    context_tag: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read JSON-line commands on stdin, write JSON-line events on stdout
    Serve,
    /// Claim and deliver every abandoned ledger record, then exit
    Sweep {
        /// Give up waiting for the queue to drain after this many seconds
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
    /// Print the ledger and segment store usage
    Status,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    store_backend: &'static str,
    store_usage_bytes: u64,
    store_budget_bytes: u64,
    segments: Vec<SegmentMeta>,
    pending_uploads: Vec<PendingUploadRecord>,
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("Invalid log level")?;

    // stdout carries the event stream, so logs go to stderr
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = match logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

struct Runtime {
    store: Arc<SegmentStore>,
    ledger: Arc<Ledger>,
    worker: Arc<UploadWorker>,
}

async fn build_runtime(config: &RelayConfig) -> Result<Runtime> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store = Arc::new(SegmentStore::from_config(&config.storage, clock.clone()).await?);
    info!(
        "Segment store: {} ({} of {} bytes used)",
        store.backend_type(),
        store.usage_bytes().await,
        store.budget_bytes()
    );

    let ledger = Arc::new(Ledger::open(&config.ledger)?);
    let api = Arc::new(HttpUploadApi::new(&config.upload.api)?);
    let network = Arc::new(NetworkMonitor::from_config(&config.network));

    let worker = Arc::new(UploadWorker::new(
        &config.upload,
        WorkerDeps {
            api,
            ledger: ledger.clone(),
            store: Some(store.clone()),
            network,
            clock,
        },
    ));

    Ok(Runtime {
        store,
        ledger,
        worker,
    })
}

async fn serve(config: &RelayConfig) -> Result<()> {
    let runtime = build_runtime(config).await?;
    let hub = UploadHub::new();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let _events = hub.subscribe(move |event| match serde_json::to_string(event) {
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(e) => warn!("Failed to encode event: {}", e),
    });
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    hub.init(runtime.worker.clone()).await?;
    let tag = runtime.worker.context_tag().to_string();

    // Pick up whatever earlier runs left behind
    runtime.worker.sweep().await;
    info!("Serving upload context '{}' on stdin", tag);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    info!("stdin closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WorkerCommand>(&line) {
                    Ok(command) => hub.dispatch(&tag, command).await?,
                    Err(e) => warn!("Ignoring malformed command: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    hub.shutdown().await;
    if let Err(e) = writer.await {
        warn!("Event writer ended abnormally: {}", e);
    }
    Ok(())
}

async fn sweep(config: &RelayConfig, timeout: Duration) -> Result<()> {
    let runtime = build_runtime(config).await?;
    let worker = runtime.worker.clone();

    let _failures = worker.subscribe(|event| {
        if let segment_relay::UploadEvent::SegmentFailed {
            local_segment_id,
            reason,
        } = event
        {
            error!("Segment {} not delivered: {}", local_segment_id, reason);
        }
    });

    worker.start().await;
    let queued = worker.sweep().await;
    let drained = worker.wait_idle(timeout).await;
    worker.shutdown().await;

    let stats = worker.stats();
    info!(
        "Sweep finished: {} queued, {} delivered, {} failed, {} retries",
        queued, stats.uploaded, stats.failed, stats.retries_scheduled
    );
    if !drained {
        warn!("Sweep timed out with work remaining; it stays in the ledger");
    }
    Ok(())
}

async fn status(config: &RelayConfig) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = SegmentStore::from_config(&config.storage, clock).await?;
    let ledger = Arc::new(Ledger::open(&config.ledger)?);

    let report = StatusReport {
        store_backend: store.backend_type(),
        store_usage_bytes: store.usage_bytes().await,
        store_budget_bytes: store.budget_bytes(),
        segments: store.list_segments().await,
        pending_uploads: ledger.blocking(|l| l.list()).await?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration from file
    let mut config = load_config_with_env(&args.config)?;

    // Apply CLI overrides
    if let Some(tag) = args.context_tag {
        config.upload.context_tag = tag;
    }

    init_tracing(&config.logging)?;
    info!("Loaded configuration from: {:?}", args.config);
    info!("Context tag: {}", config.upload.context_tag);

    match args.command {
        Command::Serve => serve(&config).await,
        Command::Sweep { timeout_secs } => sweep(&config, Duration::from_secs(timeout_secs)).await,
        Command::Status => status(&config).await,
    }
}
