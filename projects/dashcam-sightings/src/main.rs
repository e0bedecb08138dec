mod cli;
mod pipeline;
mod run_artifacts;
mod run_context;
mod video;
mod web;

use anyhow::Result;
use cli::{Args, Command, ProcessArgs};
use indicatif::{ProgressBar, ProgressStyle};
use pipeline::orchestrator::{run_batch, BatchRequest, ProcessingState};
use pipeline::scanner::ConfiguredBackend;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use web::server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();

    match args.command {
        Command::Process(process) => run_process(process).await,
        Command::Serve(serve) => run_server(serve.host, serve.port, serve.pipeline.to_config()).await,
    }
}

async fn run_process(args: ProcessArgs) -> Result<()> {
    let config = args.pipeline.to_config();
    let batch_id = args
        .batch_id
        .unwrap_or_else(|| chrono::Local::now().format("batch-%Y%m%d-%H%M%S").to_string());
    let request = BatchRequest {
        video_root: PathBuf::from(&args.video_root),
        output_dir: PathBuf::from(&args.output_root).join(&batch_id),
        config: config.clone(),
    };
    let state = Arc::new(ProcessingState::new(batch_id));

    let pb = ProgressBar::new(1000);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% {msg}")?
            .progress_chars("#>-"),
    );

    let ticker_state = state.clone();
    let ticker_pb = pb.clone();
    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(200));
        loop {
            interval.tick().await;
            ticker_pb.set_position((ticker_state.progress() * 1000.0) as u64);
            if let Some(activity) = ticker_state.activity() {
                ticker_pb.set_message(activity);
            }
            if !ticker_state.is_active.load(Ordering::Relaxed) {
                break;
            }
        }
    });

    let cancel_state = state.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling batch {}", cancel_state.batch_id);
            cancel_state.cancel();
        }
    });

    let backend = ConfiguredBackend::new(config);
    let handle = tokio::runtime::Handle::current();
    let worker_state = state.clone();
    let result =
        tokio::task::spawn_blocking(move || run_batch(&request, &backend, &worker_state, &handle))
            .await?;
    ticker.abort();

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            pb.abandon_with_message("failed");
            return Err(e);
        }
    };
    pb.set_position((state.progress() * 1000.0) as u64);
    pb.finish_with_message(if summary.cancelled { "cancelled" } else { "done" });

    for (video, reason) in &summary.video_failures {
        tracing::warn!("{}: {}", video, reason);
    }
    tracing::info!(
        "Batch {}: {} videos, {} sightings, {} rows, {} composites ({} failed)",
        summary.batch_id,
        summary.videos_scanned,
        summary.sightings,
        summary.rows,
        summary.composites.len(),
        summary.composite_failures.len()
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
