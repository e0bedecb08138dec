use chrono::{DateTime, Local};
use opencv::core::Mat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

pub use crate::run_artifacts::BBox;

/// One of the four fixed dashcam positions.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum CameraAngle {
    Front,
    Back,
    LeftRepeater,
    RightRepeater,
}

impl CameraAngle {
    pub const ALL: [CameraAngle; 4] = [
        CameraAngle::Front,
        CameraAngle::Back,
        CameraAngle::LeftRepeater,
        CameraAngle::RightRepeater,
    ];

    /// Token used in dashcam file names, e.g. `..._12-30-00-left_repeater.mp4`.
    pub fn token(&self) -> &'static str {
        match self {
            CameraAngle::Front => "front",
            CameraAngle::Back => "back",
            CameraAngle::LeftRepeater => "left_repeater",
            CameraAngle::RightRepeater => "right_repeater",
        }
    }

    /// Case-insensitive substring match, first hit in `ALL` order wins.
    pub fn from_filename(name: &str) -> Option<Self> {
        let lowercased = name.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|angle| lowercased.contains(angle.token()))
    }
}

impl fmt::Display for CameraAngle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// A decoded video the pipeline can scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSource {
    pub path: PathBuf,
    pub angle: CameraAngle,
    pub clip_id: String,
}

impl VideoSource {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string()
    }
}

/// A decoded frame handed to the detection capabilities
pub struct Frame {
    pub image: Mat,
    /// Presentation timestamp in seconds, monotonic within one video
    pub timestamp: f64,
    pub angle: CameraAngle,
}

/// A vehicle box reported by the vehicle detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub bbox: BBox,
    pub confidence: f32,
}

/// A normalized plate read from a vehicle region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateReading {
    pub number: String,
    pub confidence: f32,
    pub bbox: BBox,
}

/// Make/model/color attributes reported by the identity resolver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VehicleIdentity {
    pub make: Option<String>,
    pub model: Option<String>,
    pub color: Option<String>,
    pub year: Option<String>,
    pub confidence: f32,
}

/// Everything the capabilities reported for one vehicle box on one frame
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub detection: RawDetection,
    pub plate: Option<PlateReading>,
    pub identity: Option<VehicleIdentity>,
}

#[cfg(test)]
impl Observation {
    pub fn vehicle(bbox: BBox, confidence: f32) -> Self {
        Self {
            detection: RawDetection { bbox, confidence },
            plate: None,
            identity: None,
        }
    }

    pub fn with_plate(mut self, number: &str, confidence: f32) -> Self {
        self.plate = Some(PlateReading {
            number: number.to_string(),
            confidence,
            bbox: self.detection.bbox,
        });
        self
    }

    pub fn with_identity(mut self, identity: VehicleIdentity) -> Self {
        self.identity = Some(identity);
        self
    }
}

/// Best-known plate of a track, refined monotonically
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedPlate {
    pub number: String,
    pub confidence: f32,
    pub bbox: BBox,
    pub first_appearance: f64,
    pub last_appearance: f64,
}

/// Which video a sighting was observed in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SightingOrigin {
    pub source: PathBuf,
    pub angle: CameraAngle,
    pub clip_id: String,
}

impl From<&VideoSource> for SightingOrigin {
    fn from(source: &VideoSource) -> Self {
        Self {
            source: source.path.clone(),
            angle: source.angle,
            clip_id: source.clip_id.clone(),
        }
    }
}

/// A finalized (closed) track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
    pub time_start: f64,
    pub time_end: f64,
    pub bbox: BBox,
    pub confidence: f32,
    pub plate: Option<TrackedPlate>,
    pub identity: Option<VehicleIdentity>,
    pub origin: SightingOrigin,
}

impl Sighting {
    pub fn plate_number(&self) -> Option<&str> {
        self.plate.as_ref().map(|p| p.number.as_str())
    }
}

/// One merged, exportable vehicle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub time_start: f64,
    pub time_end: f64,
    pub bbox: BBox,
    pub confidence: f32,
    pub plate: Option<TrackedPlate>,
    pub identity: Option<VehicleIdentity>,
    /// Origin of the sighting that opened this row
    pub origin: SightingOrigin,
}

pub const UNKNOWN: &str = "Unknown";

impl ReportRow {
    pub fn duration(&self) -> f64 {
        self.time_end - self.time_start
    }

    pub fn make(&self) -> &str {
        self.identity
            .as_ref()
            .and_then(|i| i.make.as_deref())
            .unwrap_or(UNKNOWN)
    }

    pub fn model(&self) -> &str {
        self.identity
            .as_ref()
            .and_then(|i| i.model.as_deref())
            .unwrap_or(UNKNOWN)
    }

    pub fn color(&self) -> &str {
        self.identity
            .as_ref()
            .and_then(|i| i.color.as_deref())
            .unwrap_or(UNKNOWN)
    }

    /// Plate number, empty when the row was keyed synthetically
    pub fn plate_number(&self) -> &str {
        self.plate.as_ref().map(|p| p.number.as_str()).unwrap_or("")
    }
}

impl From<&ReportRow> for Sighting {
    fn from(row: &ReportRow) -> Self {
        Sighting {
            time_start: row.time_start,
            time_end: row.time_end,
            bbox: row.bbox,
            confidence: row.confidence,
            plate: row.plate.clone(),
            identity: row.identity.clone(),
            origin: row.origin.clone(),
        }
    }
}

/// Tunables for one batch
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Target detection passes per second of footage
    pub passes_per_second: f64,
    /// A track closes once its last match is this far behind the current frame
    pub inactivity_window: f64,
    /// Plateless detections match a track only strictly above this IoU
    pub iou_threshold: f32,
    /// Sightings of one plate closer than this are folded into one row
    pub merge_gap: f64,
    pub min_vehicle_conf: f32,
    pub quadrant_width: u32,
    pub quadrant_height: u32,
    pub ffmpeg_path: String,
    pub ffmpeg_timeout: Duration,
    /// "opencv" or "ffmpeg"
    pub backend: String,
    pub model_path: Option<String>,
    pub plate_command: Option<String>,
    pub identity_command: Option<String>,
    /// 0 = one worker per available core
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            passes_per_second: 2.0,
            inactivity_window: 2.0,
            iou_threshold: 0.5,
            merge_gap: 1.0,
            min_vehicle_conf: 0.5,
            quadrant_width: 640,
            quadrant_height: 480,
            ffmpeg_path: "ffmpeg".to_string(),
            ffmpeg_timeout: Duration::from_secs(300),
            backend: "opencv".to_string(),
            model_path: None,
            plate_command: None,
            identity_command: None,
            workers: 0,
        }
    }
}

/// A timestamped, human-readable progress message
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Local>,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.at.format("%H:%M"), self.message)
    }
}

/// Processing state shared between video workers, the orchestrator and the
/// progress API
#[derive(Debug)]
pub struct ProcessingState {
    pub batch_id: String,
    pub total_videos: AtomicUsize,
    pub is_active: AtomicBool,
    pub is_complete: AtomicBool,
    pub is_cancelled: AtomicBool,
    pub error: RwLock<Option<String>>,
    progress: RwLock<f64>,
    activity: RwLock<Option<String>>,
    logs: RwLock<Vec<LogEntry>>,
    /// Vehicles found per video file name
    detection_counts: RwLock<BTreeMap<String, usize>>,
    pub start_time: Instant,
}

impl ProcessingState {
    pub fn new(batch_id: String) -> Self {
        Self {
            batch_id,
            total_videos: AtomicUsize::new(0),
            is_active: AtomicBool::new(true),
            is_complete: AtomicBool::new(false),
            is_cancelled: AtomicBool::new(false),
            error: RwLock::new(None),
            progress: RwLock::new(0.0),
            activity: RwLock::new(None),
            logs: RwLock::new(Vec::new()),
            detection_counts: RwLock::new(BTreeMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Move progress forward. Never goes backwards and stays within [0, 1].
    pub fn advance_progress(&self, fraction: f64) {
        if let Ok(mut progress) = self.progress.write() {
            let clamped = fraction.clamp(0.0, 1.0);
            if clamped > *progress {
                *progress = clamped;
            }
        }
    }

    pub fn progress(&self) -> f64 {
        self.progress.read().map(|p| *p).unwrap_or(0.0)
    }

    pub fn set_activity(&self, activity: Option<String>) {
        if let Ok(mut current) = self.activity.write() {
            *current = activity;
        }
    }

    pub fn activity(&self) -> Option<String> {
        self.activity.read().map(|a| a.clone()).unwrap_or(None)
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("[{}] {}", self.batch_id, message);
        self.push_log(message);
    }

    /// Log a per-item failure
    pub fn log_failure(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("[{}] {}", self.batch_id, message);
        self.push_log(message);
    }

    fn push_log(&self, message: String) {
        if let Ok(mut logs) = self.logs.write() {
            logs.push(LogEntry {
                at: Local::now(),
                message,
            });
        }
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.read().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn record_detection_count(&self, video: &str, count: usize) {
        if let Ok(mut counts) = self.detection_counts.write() {
            counts.insert(video.to_string(), count);
        }
    }

    pub fn detection_counts(&self) -> BTreeMap<String, usize> {
        self.detection_counts
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Stop scheduling new work; in-flight scans stop at their next sampled frame
    pub fn cancel(&self) {
        self.is_cancelled.store(true, Ordering::Relaxed);
        self.is_active.store(false, Ordering::Relaxed);
    }

    pub fn finish(&self) {
        self.is_complete.store(true, Ordering::Relaxed);
        self.is_active.store(false, Ordering::Relaxed);
        self.set_activity(None);
    }

    pub fn to_progress_json(&self) -> serde_json::Value {
        let logs: Vec<String> = self.logs().iter().map(|l| l.to_string()).collect();

        serde_json::json!({
            "batch_id": self.batch_id,
            "total_videos": self.total_videos.load(Ordering::Relaxed),
            "is_active": self.is_active.load(Ordering::Relaxed),
            "is_complete": self.is_complete.load(Ordering::Relaxed),
            "is_cancelled": self.is_cancelled.load(Ordering::Relaxed),
            "error": self.error.read().map(|e| e.clone()).unwrap_or(None),
            "progress": self.progress(),
            "activity": self.activity(),
            "detection_counts": self.detection_counts(),
            "logs": logs,
            "elapsed_secs": self.start_time.elapsed().as_secs_f64(),
        })
    }
}
