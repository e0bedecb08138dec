// Pipeline orchestrator: manages the lifecycle of a batch
//
// Scans every video of a batch on a pool of worker threads, then merges,
// exports and composites on the orchestrating thread once all workers joined.

use crate::pipeline::compositor::{
    compose, composite_file_name, unique_file_names, CompositeJob, CompositorSettings,
};
use crate::pipeline::export::{write_report, REPORT_FILE_NAME};
use crate::pipeline::merge::merge_with_gap;
use crate::pipeline::scanner::{scan_video, ScanBackend, ScanOutcome};
pub use crate::pipeline::types::ProcessingState;
use crate::pipeline::types::{PipelineConfig, ReportRow, Sighting, VideoSource};
use crate::run_artifacts::write_json_artifact;
use crate::run_context::{batch_id_for, create_run, discover_clips, Discovery};
use anyhow::{anyhow, Result};
use crossbeam::channel;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

const SCAN_PROGRESS_SHARE: f64 = 0.8;
const REPORT_PROGRESS: f64 = 0.85;
const COMPOSITES_DIR: &str = "composites";

// Global registry of batches started in this process
lazy_static::lazy_static! {
    static ref BATCH_REGISTRY: RwLock<HashMap<String, Arc<ProcessingState>>> =
        RwLock::new(HashMap::new());
}

pub fn get_processing_state(batch_id: &str) -> Option<Arc<ProcessingState>> {
    BATCH_REGISTRY.read().unwrap().get(batch_id).cloned()
}

fn register_batch(batch_id: &str, state: Arc<ProcessingState>) {
    tracing::info!("Registering processing state for batch: {}", batch_id);
    BATCH_REGISTRY
        .write()
        .unwrap()
        .insert(batch_id.to_string(), state);
}

/// Cancel a batch. Returns false if the batch is unknown.
pub fn stop_batch(batch_id: &str) -> bool {
    if let Some(state) = get_processing_state(batch_id) {
        state.cancel();
        true
    } else {
        false
    }
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub video_root: PathBuf,
    pub output_dir: PathBuf,
    pub config: PipelineConfig,
}

/// What a batch produced and what failed along the way
#[derive(Debug, Default, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub videos_scanned: usize,
    /// (video, reason)
    pub video_failures: Vec<(String, String)>,
    pub sightings: usize,
    pub rows: usize,
    pub report: Option<PathBuf>,
    pub composites: Vec<PathBuf>,
    /// (file name, reason)
    pub composite_failures: Vec<(String, String)>,
    pub cancelled: bool,
}

/// Result of one video, tagged with its position in the batch
pub struct VideoOutcome {
    pub index: usize,
    pub source: VideoSource,
    pub result: Result<ScanOutcome>,
}

fn worker_count(config: &PipelineConfig, videos: usize) -> usize {
    let wanted = if config.workers > 0 {
        config.workers
    } else {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    };
    wanted.min(videos).max(1)
}

/// Scan `sources` on a pool of worker threads. Outcomes come back in the
/// order of `sources`, regardless of which worker finished first.
pub fn scan_videos(
    sources: Vec<VideoSource>,
    backend: &dyn ScanBackend,
    config: &PipelineConfig,
    state: &ProcessingState,
) -> Vec<VideoOutcome> {
    let total = sources.len();
    let workers = worker_count(config, total);
    let queue: Mutex<VecDeque<(usize, VideoSource)>> =
        Mutex::new(sources.into_iter().enumerate().collect());
    let (tx, rx) = channel::unbounded::<VideoOutcome>();

    tracing::info!("Scanning {} videos with {} workers", total, workers);

    let mut outcomes = Vec::with_capacity(total);
    thread::scope(|scope| {
        for worker in 0..workers {
            let tx = tx.clone();
            let queue = &queue;
            scope.spawn(move || {
                tracing::debug!("Scan worker {} started", worker);
                scan_worker(queue, tx, backend, config, state);
                tracing::debug!("Scan worker {} finished", worker);
            });
        }
        drop(tx);

        // Single consumer: the only writer of aggregate results
        for outcome in rx.iter() {
            report_outcome(&outcome, state);
            outcomes.push(outcome);
            state.advance_progress(SCAN_PROGRESS_SHARE * outcomes.len() as f64 / total.max(1) as f64);
        }
    });

    outcomes.sort_by_key(|o| o.index);
    outcomes
}

fn scan_worker(
    queue: &Mutex<VecDeque<(usize, VideoSource)>>,
    tx: channel::Sender<VideoOutcome>,
    backend: &dyn ScanBackend,
    config: &PipelineConfig,
    state: &ProcessingState,
) {
    // Each worker owns its model sessions
    let mut adapters = backend.create_adapters();

    loop {
        if !state.is_active.load(Ordering::Relaxed) {
            break;
        }
        let next = match queue.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(_) => break,
        };
        let Some((index, source)) = next else {
            break;
        };

        state.set_activity(Some(format!("Scanning {}", source.file_name())));
        let result = match adapters.as_mut() {
            Ok(adapters) => backend.open_reader(&source).map(|mut reader| {
                scan_video(reader.as_mut(), adapters, &source, config, &state.is_active)
            }),
            Err(e) => Err(anyhow!("Failed to load detection adapters: {:#}", e)),
        };

        if tx.send(VideoOutcome { index, source, result }).is_err() {
            break;
        }
    }
}

fn report_outcome(outcome: &VideoOutcome, state: &ProcessingState) {
    let name = outcome.source.file_name();
    match &outcome.result {
        Ok(ScanOutcome::Completed(sightings)) => {
            state.record_detection_count(&name, sightings.len());
            state.log(format!("Found {} vehicles in {}", sightings.len(), name));
        }
        Ok(ScanOutcome::Interrupted {
            sightings,
            reason,
            dropped_tracks,
        }) => {
            state.record_detection_count(&name, sightings.len());
            state.log_failure(format!(
                "Decoding of {} stopped after {} vehicles ({}); {} open tracks dropped",
                name,
                sightings.len(),
                reason,
                dropped_tracks
            ));
        }
        Ok(ScanOutcome::Cancelled) => state.log(format!("Scan of {} cancelled", name)),
        Err(e) => state.log_failure(format!("Failed to process {}: {:#}", name, e)),
    }
}

/// Concatenate sightings in batch order
pub fn collect_sightings(outcomes: &[VideoOutcome]) -> Vec<Sighting> {
    outcomes
        .iter()
        .filter_map(|o| o.result.as_ref().ok())
        .flat_map(|outcome| outcome.sightings().iter().cloned())
        .collect()
}

/// Run a whole batch on the calling thread. Composites are rendered on the
/// tokio runtime behind `runtime`.
pub fn run_batch(
    request: &BatchRequest,
    backend: &dyn ScanBackend,
    state: &ProcessingState,
    runtime: &tokio::runtime::Handle,
) -> Result<BatchSummary> {
    let config = &request.config;
    let mut summary = BatchSummary {
        batch_id: state.batch_id.clone(),
        ..Default::default()
    };

    let discovery = discover_clips(&request.video_root);
    for (path, reason) in &discovery.skipped {
        state.log(format!("Skipping {}: {}", path.display(), reason));
    }
    for clip in discovery.clips.iter().filter(|c| !c.is_complete()) {
        state.log(format!(
            "Clip {} has {} of 4 angles; no composites will be rendered for it",
            clip.id,
            clip.files.len()
        ));
    }
    let metadata = create_run(&request.output_dir, &request.video_root, &discovery)?;

    let sources = discovery.sources();
    state.total_videos.store(sources.len(), Ordering::Relaxed);
    state.log(format!(
        "Processing {} videos from {} clips",
        sources.len(),
        discovery.clips.len()
    ));

    let outcomes = scan_videos(sources, backend, config, state);
    if state.is_cancelled.load(Ordering::Relaxed) {
        return Ok(cancelled(state, summary, "Batch cancelled; report and composites skipped"));
    }

    for outcome in &outcomes {
        match &outcome.result {
            Ok(ScanOutcome::Interrupted { reason, .. }) => summary
                .video_failures
                .push((outcome.source.file_name(), reason.clone())),
            Err(e) => summary
                .video_failures
                .push((outcome.source.file_name(), format!("{:#}", e))),
            Ok(_) => {}
        }
    }
    summary.videos_scanned = outcomes.len();

    let sightings = collect_sightings(&outcomes);
    summary.sightings = sightings.len();
    if let Err(e) = write_json_artifact(&metadata.output_dir.join("sightings.json"), &sightings) {
        state.log_failure(format!("Failed to write sightings.json: {:#}", e));
    }

    state.set_activity(Some("Merging sightings...".to_string()));
    let rows = merge_with_gap(&sightings, config.merge_gap);
    summary.rows = rows.len();
    if let Err(e) = write_json_artifact(&metadata.output_dir.join("report.json"), &rows) {
        state.log_failure(format!("Failed to write report.json: {:#}", e));
    }

    state.set_activity(Some("Generating CSV report...".to_string()));
    let report_path = metadata.output_dir.join(REPORT_FILE_NAME);
    match write_report(&report_path, &rows) {
        Ok(()) => {
            state.log(format!("Report saved with {} vehicles", rows.len()));
            summary.report = Some(report_path);
        }
        Err(e) => state.log_failure(format!("Failed to write report: {:#}", e)),
    }
    state.advance_progress(REPORT_PROGRESS);

    if !render_composites(&rows, &discovery, request, state, runtime, &mut summary) {
        return Ok(cancelled(state, summary, "Composition cancelled"));
    }

    state.log(format!(
        "Batch complete: {} sightings, {} rows, {} composites",
        summary.sightings,
        summary.rows,
        summary.composites.len()
    ));
    state.advance_progress(1.0);
    state.finish();
    Ok(summary)
}

/// A cancelled batch is left inactive but never marked complete
fn cancelled(state: &ProcessingState, mut summary: BatchSummary, message: &str) -> BatchSummary {
    state.log(message);
    state.set_activity(None);
    state.is_active.store(false, Ordering::Relaxed);
    summary.cancelled = true;
    summary
}

/// Render one composite per plated row. Returns `false` if the batch was
/// cancelled part way.
fn render_composites(
    rows: &[ReportRow],
    discovery: &Discovery,
    request: &BatchRequest,
    state: &ProcessingState,
    runtime: &tokio::runtime::Handle,
    summary: &mut BatchSummary,
) -> bool {
    let plated: Vec<&ReportRow> = rows.iter().filter(|r| r.plate.is_some()).collect();
    if plated.is_empty() {
        return true;
    }

    let settings = CompositorSettings::from(&request.config);
    let output_dir = request.output_dir.join(COMPOSITES_DIR);
    let names = unique_file_names(plated.iter().map(|row| composite_file_name(row)));
    let no_files = BTreeMap::new();

    for (done, (row, name)) in plated.iter().zip(names).enumerate() {
        if state.is_cancelled.load(Ordering::Relaxed) {
            return false;
        }
        state.set_activity(Some(format!("Compositing {}", name)));

        let files = discovery
            .clip(&row.origin.clip_id)
            .map(|clip| &clip.files)
            .unwrap_or(&no_files);
        let result = CompositeJob::new(row, files, output_dir.join(&name))
            .and_then(|job| runtime.block_on(compose(&job, &settings)));

        match result {
            Ok(outcome) => {
                state.log(format!("Composite saved: {} ({:?})", name, outcome.backend));
                summary.composites.push(outcome.output);
            }
            Err(e) => {
                state.log_failure(format!("Composite {} failed: {}", name, e));
                summary.composite_failures.push((name, e.to_string()));
            }
        }

        let fraction = (done + 1) as f64 / plated.len() as f64;
        state.advance_progress(REPORT_PROGRESS + (1.0 - REPORT_PROGRESS) * fraction);
    }
    true
}

/// Start a batch on a background thread and register its state.
pub fn start_batch(
    request: BatchRequest,
    backend: Arc<dyn ScanBackend>,
    runtime: tokio::runtime::Handle,
) -> Result<Arc<ProcessingState>> {
    let batch_id = batch_id_for(&request.output_dir)?;

    if let Some(state) = get_processing_state(&batch_id) {
        if state.is_active.load(Ordering::Relaxed) {
            anyhow::bail!("Batch {} is already being processed", batch_id);
        }
    }

    let state = Arc::new(ProcessingState::new(batch_id.clone()));
    register_batch(&batch_id, state.clone());

    let worker_state = state.clone();
    thread::spawn(move || {
        if let Err(e) = run_batch(&request, backend.as_ref(), &worker_state, &runtime) {
            tracing::error!("Batch {} failed: {:#}", worker_state.batch_id, e);
            if let Ok(mut error) = worker_state.error.write() {
                *error = Some(format!("{:#}", e));
            }
            worker_state.log_failure(format!("Batch failed: {:#}", e));
            worker_state.finish();
        }
    });

    Ok(state)
}
