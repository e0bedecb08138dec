// Scanner: samples one video, runs the detection capabilities and feeds the
// track associator until the stream ends

use crate::pipeline::detection::Adapters;
use crate::pipeline::tracker::{TrackAssociator, TrackerConfig};
use crate::pipeline::types::{
    Frame, Observation, PipelineConfig, Sighting, SightingOrigin, VideoSource,
};
use crate::video::{open_reader, sample_stride, VideoReader};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};

/// How a single video's scan ended
#[derive(Debug)]
pub enum ScanOutcome {
    /// End of stream reached; every track was closed
    Completed(Vec<Sighting>),
    /// Decoding broke mid-stream. `sightings` holds tracks closed before the
    /// failure; open tracks were dropped.
    Interrupted {
        sightings: Vec<Sighting>,
        reason: String,
        dropped_tracks: usize,
    },
    /// The batch was cancelled; partial results are discarded
    Cancelled,
}

impl ScanOutcome {
    pub fn sightings(&self) -> &[Sighting] {
        match self {
            ScanOutcome::Completed(sightings) => sightings,
            ScanOutcome::Interrupted { sightings, .. } => sightings,
            ScanOutcome::Cancelled => &[],
        }
    }
}

/// Where readers and adapters come from. Each worker thread asks for its own
/// adapters; model sessions are never shared between threads.
pub trait ScanBackend: Send + Sync {
    fn open_reader(&self, source: &VideoSource) -> Result<Box<dyn VideoReader>>;
    fn create_adapters(&self) -> Result<Adapters>;
}

/// Production backend: real decoders and the adapters named in the config
pub struct ConfiguredBackend {
    config: PipelineConfig,
}

impl ConfiguredBackend {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }
}

impl ScanBackend for ConfiguredBackend {
    fn open_reader(&self, source: &VideoSource) -> Result<Box<dyn VideoReader>> {
        open_reader(&source.path, &self.config.backend)
    }

    fn create_adapters(&self) -> Result<Adapters> {
        Adapters::from_config(&self.config)
    }
}

/// Scan one video to completion (or interruption/cancellation).
pub fn scan_video(
    reader: &mut dyn VideoReader,
    adapters: &mut Adapters,
    source: &VideoSource,
    config: &PipelineConfig,
    is_active: &AtomicBool,
) -> ScanOutcome {
    let video_name = source.file_name();
    let fps = match reader.source_fps() {
        Ok(fps) => fps,
        Err(e) => {
            tracing::warn!("{}: unknown frame rate ({}), sampling every frame", video_name, e);
            0.0
        }
    };
    let stride = sample_stride(fps, config.passes_per_second);
    tracing::debug!(
        "{}: sampling every {} of ~{} frames",
        video_name,
        stride,
        reader.frame_count().unwrap_or(0)
    );

    let mut tracker = TrackAssociator::new(TrackerConfig::from(config), SightingOrigin::from(source));
    let mut sightings = Vec::new();
    let mut index: usize = 0;

    loop {
        if index % stride == 0 {
            if !is_active.load(Ordering::Relaxed) {
                tracing::info!("{}: scan cancelled at frame {}", video_name, index);
                return ScanOutcome::Cancelled;
            }

            let decoded = match reader.next_frame() {
                Ok(Some(decoded)) => decoded,
                Ok(None) => break,
                Err(e) => return interrupted(tracker, sightings, &video_name, e),
            };

            let frame = Frame {
                image: decoded.mat,
                timestamp: decoded.timestamp,
                angle: source.angle,
            };
            let observations = observe(adapters, &frame, source, &video_name);
            sightings.extend(tracker.observe_frame(frame.timestamp, observations));
        } else {
            match reader.skip_frame() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => return interrupted(tracker, sightings, &video_name, e),
            }
        }
        index += 1;
    }

    sightings.extend(tracker.finish());
    tracing::info!(
        "{}: {} frames decoded, {} sightings",
        video_name,
        index,
        sightings.len()
    );
    ScanOutcome::Completed(sightings)
}

fn interrupted(
    tracker: TrackAssociator,
    sightings: Vec<Sighting>,
    video_name: &str,
    error: anyhow::Error,
) -> ScanOutcome {
    let dropped_tracks = tracker.open_tracks();
    tracing::warn!(
        "{}: decoding stopped ({}); dropping {} open tracks",
        video_name,
        error,
        dropped_tracks
    );
    ScanOutcome::Interrupted {
        sightings,
        reason: error.to_string(),
        dropped_tracks,
    }
}

/// Run all three capabilities on one sampled frame. A failing capability counts
/// as "nothing found" for this frame.
fn observe(
    adapters: &mut Adapters,
    frame: &Frame,
    source: &VideoSource,
    video_name: &str,
) -> Vec<Observation> {
    let vehicles = match adapters.vehicles.detect_vehicles(frame) {
        Ok(vehicles) => vehicles,
        Err(e) => {
            tracing::warn!(
                "{} @ {:.2}s: vehicle detection failed: {}",
                video_name,
                frame.timestamp,
                e
            );
            return Vec::new();
        }
    };

    vehicles
        .into_iter()
        .map(|detection| {
            let plate = adapters
                .plates
                .detect_plate(frame, &detection.bbox)
                .unwrap_or_else(|e| {
                    tracing::warn!(
                        "{} @ {:.2}s: plate detection failed: {}",
                        video_name,
                        frame.timestamp,
                        e
                    );
                    None
                });
            let identity = adapters
                .identity
                .resolve_identity(frame, &detection.bbox, frame.timestamp, &source.path)
                .unwrap_or_else(|e| {
                    tracing::warn!(
                        "{} @ {:.2}s: identity resolution failed: {}",
                        video_name,
                        frame.timestamp,
                        e
                    );
                    None
                });
            Observation {
                detection,
                plate,
                identity,
            }
        })
        .collect()
}
