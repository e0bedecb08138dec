use crate::pipeline::types::{CameraAngle, VideoSource};
use crate::run_artifacts::write_json_artifact;
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Recording timestamp prefix used by dashcam file names
const CLIP_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const CLIP_TIMESTAMP_LEN: usize = 19;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BatchMetadata {
    pub batch_id: String,
    pub created_at: DateTime<Utc>,
    pub video_root: PathBuf,
    pub clip_count: usize,
    pub video_count: usize,
    #[serde(skip)]
    pub output_dir: PathBuf,
}

/// Up to one file per camera angle, all recorded at the same moment
#[derive(Debug, Clone, PartialEq)]
pub struct ClipSet {
    pub id: String,
    pub recorded_at: Option<NaiveDateTime>,
    pub files: BTreeMap<CameraAngle, PathBuf>,
}

impl ClipSet {
    pub fn sources(&self) -> Vec<VideoSource> {
        self.files
            .iter()
            .map(|(angle, path)| VideoSource {
                path: path.clone(),
                angle: *angle,
                clip_id: self.id.clone(),
            })
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        CameraAngle::ALL.iter().all(|a| self.files.contains_key(a))
    }
}

/// Result of walking a video root
#[derive(Debug, Default)]
pub struct Discovery {
    pub clips: Vec<ClipSet>,
    /// Files that were not scheduled, with the reason
    pub skipped: Vec<(PathBuf, String)>,
}

impl Discovery {
    pub fn sources(&self) -> Vec<VideoSource> {
        self.clips.iter().flat_map(|c| c.sources()).collect()
    }

    pub fn clip(&self, id: &str) -> Option<&ClipSet> {
        self.clips.iter().find(|c| c.id == id)
    }
}

pub fn list_videos(video_root: &Path) -> Vec<PathBuf> {
    let mut videos: Vec<PathBuf> = WalkDir::new(video_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|s| s.to_lowercase() == "mp4")
                .unwrap_or(false)
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    videos.sort();
    videos
}

/// Find the first `YYYY-MM-DD_HH-MM-SS` run in a file name.
pub fn parse_clip_timestamp(name: &str) -> Option<(String, NaiveDateTime)> {
    if name.len() < CLIP_TIMESTAMP_LEN {
        return None;
    }
    (0..=name.len() - CLIP_TIMESTAMP_LEN)
        .filter(|&i| name.is_char_boundary(i) && name.is_char_boundary(i + CLIP_TIMESTAMP_LEN))
        .find_map(|i| {
            let candidate = &name[i..i + CLIP_TIMESTAMP_LEN];
            NaiveDateTime::parse_from_str(candidate, CLIP_TIMESTAMP_FORMAT)
                .ok()
                .map(|ts| (candidate.to_string(), ts))
        })
}

/// Clip-set id of a file: its recording timestamp, or the stem with the
/// angle token removed when the name carries no timestamp.
fn clip_key(stem: &str, angle: CameraAngle) -> (String, Option<NaiveDateTime>) {
    if let Some((id, ts)) = parse_clip_timestamp(stem) {
        return (id, Some(ts));
    }
    let lowered = stem.to_ascii_lowercase();
    let id = match lowered.find(angle.token()) {
        Some(pos) => format!("{}{}", &stem[..pos], &stem[pos + angle.token().len()..]),
        None => stem.to_string(),
    };
    let id = id.trim_matches(|c| c == '-' || c == '_').to_string();
    (if id.is_empty() { stem.to_string() } else { id }, None)
}

/// Walk `video_root` and group its dashcam files into clip sets, ordered by
/// recording time then id.
pub fn discover_clips(video_root: &Path) -> Discovery {
    let mut clips: BTreeMap<String, ClipSet> = BTreeMap::new();
    let mut skipped = Vec::new();

    for path in list_videos(video_root) {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            skipped.push((path.clone(), "file name is not valid UTF-8".to_string()));
            continue;
        };
        let Some(angle) = CameraAngle::from_filename(stem) else {
            tracing::info!("Skipping {}: no camera angle in file name", path.display());
            skipped.push((path.clone(), "no camera angle in file name".to_string()));
            continue;
        };

        let (id, recorded_at) = clip_key(stem, angle);
        let clip = clips.entry(id.clone()).or_insert_with(|| ClipSet {
            id,
            recorded_at,
            files: BTreeMap::new(),
        });
        if clip.files.contains_key(&angle) {
            tracing::info!("Skipping {}: duplicate {} angle", path.display(), angle);
            skipped.push((path.clone(), format!("duplicate {} angle", angle)));
            continue;
        }
        clip.files.insert(angle, path);
    }

    let mut clips: Vec<ClipSet> = clips.into_values().collect();
    clips.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then_with(|| a.id.cmp(&b.id)));
    Discovery { clips, skipped }
}

/// Batch id derived from the output directory name
pub fn batch_id_for(output_dir: &Path) -> Result<String> {
    output_dir
        .file_name()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid output directory: {}", output_dir.display()))
}

/// Create the output directory of a batch and record its metadata.json.
pub fn create_run(output_dir: &Path, video_root: &Path, discovery: &Discovery) -> Result<BatchMetadata> {
    let batch_id = batch_id_for(output_dir)?;
    fs::create_dir_all(output_dir)?;

    let metadata = BatchMetadata {
        batch_id,
        created_at: Utc::now(),
        video_root: video_root.to_path_buf(),
        clip_count: discovery.clips.len(),
        video_count: discovery.clips.iter().map(|c| c.files.len()).sum(),
        output_dir: output_dir.to_path_buf(),
    };
    write_json_artifact(&output_dir.join("metadata.json"), &metadata)?;

    Ok(metadata)
}
