// Fakes shared by scanner and orchestrator tests.

use crate::pipeline::detection::{Adapters, IdentityResolver, PlateDetector, VehicleDetector};
use crate::pipeline::scanner::ScanBackend;
use crate::pipeline::types::{
    BBox, Frame, Observation, PlateReading, RawDetection, VehicleIdentity, VideoSource,
};
use crate::video::{check_stream_end, DecodedFrame, VideoReader};
use anyhow::{anyhow, Result};
use opencv::core::{Mat, Scalar, CV_8UC1};
use opencv::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

fn millis(t: f64) -> i64 {
    (t * 1000.0).round() as i64
}

/// Tiny single-channel frame whose row count encodes the video it came from.
fn tagged_mat(video: i32) -> Mat {
    Mat::new_rows_cols_with_default(video + 1, 1, CV_8UC1, Scalar::all(0.0)).unwrap()
}

fn video_of(frame: &Frame) -> i32 {
    frame.image.rows() - 1
}

pub struct FakeReader {
    video: i32,
    fps: f64,
    total: usize,
    next: usize,
    fail_at: Option<usize>,
    /// Frames actually present; `total` is only what the container claims
    present: Option<usize>,
}

impl FakeReader {
    pub fn new(video: i32, fps: f64, total: usize) -> Self {
        Self {
            video,
            fps,
            total,
            next: 0,
            fail_at: None,
            present: None,
        }
    }

    /// The stream runs dry after `present` frames while still advertising `total`
    pub fn ending_at(mut self, present: usize) -> Self {
        self.present = Some(present);
        self
    }

    /// Decoding frame `index` fails
    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }
}

impl VideoReader for FakeReader {
    fn frame_count(&self) -> Result<usize> {
        Ok(self.total)
    }

    fn source_fps(&self) -> Result<f64> {
        Ok(self.fps)
    }

    fn next_frame(&mut self) -> Result<Option<DecodedFrame>> {
        if self.fail_at == Some(self.next) {
            return Err(anyhow!("corrupt packet at frame {}", self.next));
        }
        if self.next >= self.present.unwrap_or(self.total) {
            check_stream_end(self.next, self.total)?;
            return Ok(None);
        }
        let timestamp = self.next as f64 / self.fps;
        self.next += 1;
        Ok(Some(DecodedFrame {
            timestamp,
            mat: tagged_mat(self.video),
        }))
    }
}

/// Canned observations per (video, timestamp). Plate and identity adapters
/// answer for the observation whose box matches the queried region.
#[derive(Clone, Default)]
pub struct Script {
    frames: BTreeMap<(i32, i64), Vec<Observation>>,
    failing: BTreeSet<(i32, i64)>,
    seen: Arc<Mutex<Vec<(i32, f64)>>>,
}

impl Script {
    pub fn at(mut self, video: i32, t: f64, observations: Vec<Observation>) -> Self {
        self.frames.insert((video, millis(t)), observations);
        self
    }

    /// The vehicle detector errors on this frame
    pub fn failing_at(mut self, video: i32, t: f64) -> Self {
        self.failing.insert((video, millis(t)));
        self
    }

    /// Every (video, timestamp) the vehicle detector was asked about
    pub fn seen(&self) -> Vec<(i32, f64)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn adapters(&self) -> Adapters {
        let script = Arc::new(self.clone());
        Adapters {
            vehicles: Box::new(ScriptedAdapter(script.clone())),
            plates: Box::new(ScriptedAdapter(script.clone())),
            identity: Box::new(ScriptedAdapter(script)),
        }
    }

    fn lookup(&self, frame: &Frame, region: &BBox) -> Option<&Observation> {
        self.frames
            .get(&(video_of(frame), millis(frame.timestamp)))
            .and_then(|obs| obs.iter().find(|o| o.detection.bbox == *region))
    }
}

struct ScriptedAdapter(Arc<Script>);

impl VehicleDetector for ScriptedAdapter {
    fn detect_vehicles(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        let key = (video_of(frame), millis(frame.timestamp));
        self.0
            .seen
            .lock()
            .unwrap()
            .push((key.0, frame.timestamp));
        if self.0.failing.contains(&key) {
            return Err(anyhow!("model session lost"));
        }
        Ok(self
            .0
            .frames
            .get(&key)
            .map(|obs| obs.iter().map(|o| o.detection).collect())
            .unwrap_or_default())
    }
}

impl PlateDetector for ScriptedAdapter {
    fn detect_plate(&mut self, frame: &Frame, region: &BBox) -> Result<Option<PlateReading>> {
        Ok(self.0.lookup(frame, region).and_then(|o| o.plate.clone()))
    }
}

impl IdentityResolver for ScriptedAdapter {
    fn resolve_identity(
        &mut self,
        frame: &Frame,
        region: &BBox,
        _timestamp: f64,
        _source: &Path,
    ) -> Result<Option<VehicleIdentity>> {
        Ok(self.0.lookup(frame, region).and_then(|o| o.identity.clone()))
    }
}

/// Backend handing out fake readers; the video id is the source's index in
/// `sources`.
pub struct FakeBackend {
    pub script: Script,
    pub sources: Vec<VideoSource>,
    pub fps: f64,
    pub frames: usize,
}

impl ScanBackend for FakeBackend {
    fn open_reader(&self, source: &VideoSource) -> Result<Box<dyn VideoReader>> {
        let video = self
            .sources
            .iter()
            .position(|s| s == source)
            .ok_or_else(|| anyhow!("Failed to open video at: '{}'", source.path.display()))?;
        Ok(Box::new(FakeReader::new(video as i32, self.fps, self.frames)))
    }

    fn create_adapters(&self) -> Result<Adapters> {
        Ok(self.script.adapters())
    }
}
