// Multi-angle compositor: renders the four camera angles of a clip set into one
// 2x2 video for the time window of a report row.
//
// ffmpeg is tried first; if it is missing, fails, or times out the same grid is
// rendered in-process with OpenCV.

use crate::pipeline::merge::format_time;
use crate::pipeline::types::{CameraAngle, PipelineConfig, ReportRow};
use anyhow::{anyhow, bail};
use opencv::core::{Mat, Rect, Scalar, Size, CV_8UC3};
use opencv::prelude::*;
use opencv::videoio::{VideoCapture, VideoWriter, CAP_ANY, CAP_PROP_FPS, CAP_PROP_POS_MSEC};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;

/// Shortest window rendered; single-sample sightings would otherwise yield
/// empty files.
const MIN_COMPOSITE_SECS: f64 = 1.0;
const FALLBACK_FPS: f64 = 30.0;

/// Angles in row-major grid order: front | back over left | right
pub const GRID: [CameraAngle; 4] = [
    CameraAngle::Front,
    CameraAngle::Back,
    CameraAngle::LeftRepeater,
    CameraAngle::RightRepeater,
];

#[derive(Debug, Error)]
pub enum CompositeError {
    #[error("missing {0} angle")]
    MissingAngle(CameraAngle),

    #[error("ffmpeg binary unavailable: {0}")]
    ToolUnavailable(#[source] std::io::Error),

    #[error("ffmpeg failed (exit code {exit_code:?}): {stderr}")]
    ToolFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("ffmpeg timed out after {0:?}")]
    ToolTimedOut(Duration),

    #[error("OpenCV fallback failed: {0}")]
    FallbackFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompositeError {
    /// Whether the OpenCV path should be attempted after this primary failure
    fn allows_fallback(&self) -> bool {
        matches!(
            self,
            CompositeError::ToolUnavailable(_)
                | CompositeError::ToolFailed { .. }
                | CompositeError::ToolTimedOut(_)
        )
    }
}

/// One file per angle. Cannot be built with any angle missing.
#[derive(Debug, Clone, PartialEq)]
pub struct AngleSources {
    front: PathBuf,
    back: PathBuf,
    left_repeater: PathBuf,
    right_repeater: PathBuf,
}

impl AngleSources {
    pub fn from_files(files: &BTreeMap<CameraAngle, PathBuf>) -> Result<Self, CompositeError> {
        let take = |angle: CameraAngle| {
            files
                .get(&angle)
                .cloned()
                .ok_or(CompositeError::MissingAngle(angle))
        };
        Ok(Self {
            front: take(CameraAngle::Front)?,
            back: take(CameraAngle::Back)?,
            left_repeater: take(CameraAngle::LeftRepeater)?,
            right_repeater: take(CameraAngle::RightRepeater)?,
        })
    }

    pub fn get(&self, angle: CameraAngle) -> &Path {
        match angle {
            CameraAngle::Front => &self.front,
            CameraAngle::Back => &self.back,
            CameraAngle::LeftRepeater => &self.left_repeater,
            CameraAngle::RightRepeater => &self.right_repeater,
        }
    }
}

/// A row's time window bound to the four files it is rendered from
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeJob {
    pub sources: AngleSources,
    /// Seek offset into every angle, seconds
    pub start: f64,
    pub duration: f64,
    pub output: PathBuf,
}

impl CompositeJob {
    pub fn new(
        row: &ReportRow,
        clip_files: &BTreeMap<CameraAngle, PathBuf>,
        output: PathBuf,
    ) -> Result<Self, CompositeError> {
        Ok(Self {
            sources: AngleSources::from_files(clip_files)?,
            start: row.time_start.max(0.0),
            duration: row.duration().max(MIN_COMPOSITE_SECS),
            output,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CompositorSettings {
    pub ffmpeg_path: String,
    pub timeout: Duration,
    pub quadrant_width: u32,
    pub quadrant_height: u32,
}

impl From<&PipelineConfig> for CompositorSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            timeout: config.ffmpeg_timeout,
            quadrant_width: config.quadrant_width,
            quadrant_height: config.quadrant_height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeBackend {
    Ffmpeg,
    Opencv,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeOutcome {
    pub output: PathBuf,
    pub backend: CompositeBackend,
}

/// Render `job`, trying ffmpeg first and OpenCV second.
pub async fn compose(
    job: &CompositeJob,
    settings: &CompositorSettings,
) -> Result<CompositeOutcome, CompositeError> {
    if let Some(dir) = job.output.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let result = compose_inner(job, settings).await;
    if result.is_err() {
        discard_partial(&job.output).await;
    }
    result
}

async fn compose_inner(
    job: &CompositeJob,
    settings: &CompositorSettings,
) -> Result<CompositeOutcome, CompositeError> {
    match run_ffmpeg(job, settings).await {
        Ok(()) => {
            return Ok(CompositeOutcome {
                output: job.output.clone(),
                backend: CompositeBackend::Ffmpeg,
            })
        }
        Err(e) if e.allows_fallback() => {
            tracing::warn!(
                "ffmpeg compositing of {} failed ({}), falling back to OpenCV",
                job.output.display(),
                e
            );
        }
        Err(e) => return Err(e),
    }

    let fallback_job = job.clone();
    let fallback_settings = settings.clone();
    tokio::task::spawn_blocking(move || compose_with_opencv(&fallback_job, &fallback_settings))
        .await
        .map_err(|e| CompositeError::FallbackFailed(e.to_string()))??;

    Ok(CompositeOutcome {
        output: job.output.clone(),
        backend: CompositeBackend::Opencv,
    })
}

/// A failed render may leave a truncated file under the final name
async fn discard_partial(output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => tracing::debug!("Removed partial composite {}", output.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            "Failed to remove partial composite {}: {}",
            output.display(),
            e
        ),
    }
}

async fn run_ffmpeg(job: &CompositeJob, settings: &CompositorSettings) -> Result<(), CompositeError> {
    let args = ffmpeg_args(job, settings);
    tracing::debug!("{} {}", settings.ffmpeg_path, args.join(" "));

    let child = tokio::process::Command::new(&settings.ffmpeg_path)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(CompositeError::ToolUnavailable)?;

    // Dropping the wait future on timeout drops the child, which kills it
    let output = match tokio::time::timeout(settings.timeout, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => return Err(CompositeError::ToolTimedOut(settings.timeout)),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // ffmpeg puts the actual error at the end of a long banner
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        return Err(CompositeError::ToolFailed {
            exit_code: output.status.code(),
            stderr: tail.into_iter().rev().collect::<Vec<_>>().join("\n"),
        });
    }
    Ok(())
}

/// Full ffmpeg argument list (without the program name)
pub fn ffmpeg_args(job: &CompositeJob, settings: &CompositorSettings) -> Vec<String> {
    let seek = format_time(job.start);
    let mut args = Vec::new();
    for angle in GRID {
        args.push("-ss".to_string());
        args.push(seek.clone());
        args.push("-i".to_string());
        args.push(job.sources.get(angle).to_string_lossy().into_owned());
    }
    args.extend(
        [
            "-filter_complex".to_string(),
            filter_graph(settings.quadrant_width, settings.quadrant_height),
            "-t".to_string(),
            format!("{:.2}", job.duration),
            "-map".to_string(),
            "[out]".to_string(),
        ]
        .into_iter(),
    );
    args.extend(
        ["-c:v", "libx264", "-preset", "fast", "-crf", "23", "-an", "-y"]
            .into_iter()
            .map(str::to_string),
    );
    args.push(job.output.to_string_lossy().into_owned());
    args
}

/// Scale every input to the quadrant size, then stack in `GRID` order.
pub fn filter_graph(width: u32, height: u32) -> String {
    let scaled: String = (0..GRID.len())
        .map(|i| format!("[{i}:v]scale={width}:{height}[v{i}];"))
        .collect();
    format!("{scaled}[v0][v1]hstack[top];[v2][v3]hstack[bottom];[top][bottom]vstack[out]")
}

/// Pixel rectangle of `angle` on a canvas of 2x2 quadrants.
pub fn quadrant_rect(angle: CameraAngle, width: i32, height: i32) -> Rect {
    let index = GRID.iter().position(|a| *a == angle).unwrap_or(0) as i32;
    Rect::new((index % 2) * width, (index / 2) * height, width, height)
}

fn compose_with_opencv(job: &CompositeJob, settings: &CompositorSettings) -> Result<(), CompositeError> {
    render_grid(job, settings).map_err(|e| CompositeError::FallbackFailed(format!("{:#}", e)))
}

struct AngleCapture {
    angle: CameraAngle,
    capture: VideoCapture,
    exhausted: bool,
}

fn seek_capture(
    capture: &mut VideoCapture,
    angle: CameraAngle,
    path: &Path,
    start: f64,
) -> anyhow::Result<()> {
    if start <= 0.0 {
        return Ok(());
    }
    if !capture.set(CAP_PROP_POS_MSEC, start * 1000.0)? {
        bail!(
            "{} angle at {} cannot seek to {}",
            angle,
            path.display(),
            format_time(start)
        );
    }
    Ok(())
}

fn render_grid(job: &CompositeJob, settings: &CompositorSettings) -> anyhow::Result<()> {
    let quadrant = Size::new(settings.quadrant_width as i32, settings.quadrant_height as i32);
    let canvas_size = Size::new(quadrant.width * 2, quadrant.height * 2);

    let mut captures = Vec::with_capacity(GRID.len());
    for angle in GRID {
        let path = job.sources.get(angle);
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Video path is not valid UTF-8: {:?}", path))?;
        let mut capture = VideoCapture::from_file(path_str, CAP_ANY)?;
        if !capture.is_opened()? {
            bail!("Failed to open {} angle at {}", angle, path.display());
        }
        seek_capture(&mut capture, angle, path, job.start)?;
        captures.push(AngleCapture {
            angle,
            capture,
            exhausted: false,
        });
    }

    let fps = match captures[0].capture.get(CAP_PROP_FPS)? {
        fps if fps > 0.0 => fps,
        _ => FALLBACK_FPS,
    };
    let output = job
        .output
        .to_str()
        .ok_or_else(|| anyhow!("Output path is not valid UTF-8: {:?}", job.output))?;
    let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
    let mut writer = VideoWriter::new(output, fourcc, fps, canvas_size, true)?;
    if !writer.is_opened()? {
        bail!("Failed to open video writer at {}", output);
    }

    let total_frames = (job.duration * fps).round().max(1.0) as usize;
    let mut frame = Mat::default();
    let mut scaled = Mat::default();
    let mut written = 0usize;

    for _ in 0..total_frames {
        let mut canvas = Mat::new_size_with_default(canvas_size, CV_8UC3, Scalar::all(0.0))?;
        let mut any_frame = false;

        for slot in captures.iter_mut().filter(|s| !s.exhausted) {
            if !slot.capture.read(&mut frame)? || frame.empty() {
                tracing::debug!("{} angle exhausted after {} frames", slot.angle, written);
                slot.exhausted = true;
                continue;
            }
            any_frame = true;
            opencv::imgproc::resize(
                &frame,
                &mut scaled,
                quadrant,
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )?;
            let rect = quadrant_rect(slot.angle, quadrant.width, quadrant.height);
            let mut roi = Mat::roi_mut(&mut canvas, rect)?;
            scaled.copy_to(&mut *roi)?;
        }

        if !any_frame {
            break;
        }
        writer.write(&canvas)?;
        written += 1;
    }

    writer.release()?;
    if written == 0 {
        bail!("No frames could be read from any angle");
    }
    tracing::info!("OpenCV composite {}: {} frames", output, written);
    Ok(())
}

/// `{make} - {model} - {plate}.mp4` with path separators replaced.
pub fn composite_file_name(row: &ReportRow) -> String {
    format!(
        "{} - {} - {}.mp4",
        sanitize(row.make()),
        sanitize(row.model()),
        sanitize(row.plate_number())
    )
}

fn sanitize(component: &str) -> String {
    component.replace(['/', '\\'], "_")
}

/// Disambiguate repeated names: the second and later copies get ` (2)`,
/// ` (3)`, ... before the extension.
pub fn unique_file_names(names: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    names
        .into_iter()
        .map(|name| {
            let count = seen.entry(name.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                return name;
            }
            match name.strip_suffix(".mp4") {
                Some(stem) => format!("{} ({}).mp4", stem, count),
                None => format!("{} ({})", name, count),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{BBox, SightingOrigin, TrackedPlate, VehicleIdentity};

    fn clip_files(angles: &[CameraAngle]) -> BTreeMap<CameraAngle, PathBuf> {
        angles
            .iter()
            .map(|a| (*a, PathBuf::from(format!("/clips/2024-03-01_08-15-00-{}.mp4", a))))
            .collect()
    }

    fn row(start: f64, end: f64) -> ReportRow {
        ReportRow {
            time_start: start,
            time_end: end,
            bbox: BBox::default(),
            confidence: 0.9,
            plate: Some(TrackedPlate {
                number: "ABC 1234".to_string(),
                confidence: 0.9,
                bbox: BBox::default(),
                first_appearance: start,
                last_appearance: end,
            }),
            identity: Some(VehicleIdentity {
                make: Some("Tesla".to_string()),
                model: Some("Model 3".to_string()),
                ..Default::default()
            }),
            origin: SightingOrigin {
                source: PathBuf::from("/clips/2024-03-01_08-15-00-front.mp4"),
                angle: CameraAngle::Front,
                clip_id: "2024-03-01_08-15-00".to_string(),
            },
        }
    }

    fn settings() -> CompositorSettings {
        CompositorSettings::from(&PipelineConfig::default())
    }

    #[test]
    fn test_job_requires_every_angle() {
        let files = clip_files(&[CameraAngle::Front, CameraAngle::Back, CameraAngle::RightRepeater]);
        let err = CompositeJob::new(&row(1.0, 4.0), &files, PathBuf::from("out.mp4")).unwrap_err();
        assert!(matches!(err, CompositeError::MissingAngle(CameraAngle::LeftRepeater)));
        assert_eq!(err.to_string(), "missing left_repeater angle");
    }

    #[test]
    fn test_ffmpeg_args() {
        let job = CompositeJob::new(
            &row(65.25, 68.5),
            &clip_files(&CameraAngle::ALL),
            PathBuf::from("/out/Tesla - Model 3 - ABC 1234.mp4"),
        )
        .unwrap();
        let args = ffmpeg_args(&job, &settings());

        assert_eq!(&args[..4], ["-ss", "00:01:05.250", "-i", "/clips/2024-03-01_08-15-00-front.mp4"]);
        assert_eq!(args[7], "/clips/2024-03-01_08-15-00-back.mp4");
        assert_eq!(args[11], "/clips/2024-03-01_08-15-00-left_repeater.mp4");
        assert_eq!(args[15], "/clips/2024-03-01_08-15-00-right_repeater.mp4");

        let tail: Vec<&str> = args[16..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec![
                "-filter_complex",
                "[0:v]scale=640:480[v0];[1:v]scale=640:480[v1];[2:v]scale=640:480[v2];[3:v]scale=640:480[v3];[v0][v1]hstack[top];[v2][v3]hstack[bottom];[top][bottom]vstack[out]",
                "-t",
                "3.25",
                "-map",
                "[out]",
                "-c:v",
                "libx264",
                "-preset",
                "fast",
                "-crf",
                "23",
                "-an",
                "-y",
                "/out/Tesla - Model 3 - ABC 1234.mp4",
            ]
        );
    }

    #[test]
    fn test_short_rows_get_minimum_window() {
        let job = CompositeJob::new(&row(5.0, 5.0), &clip_files(&CameraAngle::ALL), PathBuf::from("o.mp4"))
            .unwrap();
        assert_eq!(job.duration, MIN_COMPOSITE_SECS);
    }

    #[test]
    fn test_quadrant_layout() {
        let rect = |a| {
            let r = quadrant_rect(a, 640, 480);
            (r.x, r.y, r.width, r.height)
        };
        assert_eq!(rect(CameraAngle::Front), (0, 0, 640, 480));
        assert_eq!(rect(CameraAngle::Back), (640, 0, 640, 480));
        assert_eq!(rect(CameraAngle::LeftRepeater), (0, 480, 640, 480));
        assert_eq!(rect(CameraAngle::RightRepeater), (640, 480, 640, 480));
    }

    #[test]
    fn test_file_names() {
        let mut unknown = row(0.0, 1.0);
        unknown.identity = None;
        unknown.plate.as_mut().unwrap().number = "AB/1234".to_string();
        assert_eq!(composite_file_name(&row(0.0, 1.0)), "Tesla - Model 3 - ABC 1234.mp4");
        assert_eq!(composite_file_name(&unknown), "Unknown - Unknown - AB_1234.mp4");

        let names = unique_file_names(vec![
            "A.mp4".to_string(),
            "B.mp4".to_string(),
            "A.mp4".to_string(),
            "A.mp4".to_string(),
        ]);
        assert_eq!(names, vec!["A.mp4", "B.mp4", "A (2).mp4", "A (3).mp4"]);
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_is_tool_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let job = CompositeJob::new(
            &row(0.0, 2.0),
            &clip_files(&CameraAngle::ALL),
            dir.path().join("out.mp4"),
        )
        .unwrap();
        let mut settings = settings();
        settings.ffmpeg_path = "definitely-not-ffmpeg".to_string();

        let err = run_ffmpeg(&job, &settings).await.unwrap_err();
        assert!(matches!(err, CompositeError::ToolUnavailable(_)));
        assert!(err.allows_fallback());
    }

    #[tokio::test]
    async fn test_fallback_failure_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let job = CompositeJob::new(
            &row(0.0, 2.0),
            &clip_files(&CameraAngle::ALL),
            dir.path().join("composites").join("out.mp4"),
        )
        .unwrap();
        let mut settings = settings();
        settings.ffmpeg_path = "definitely-not-ffmpeg".to_string();

        let err = compose(&job, &settings).await.unwrap_err();
        assert!(matches!(err, CompositeError::FallbackFailed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_tool_failed() {
        let dir = tempfile::tempdir().unwrap();
        let job = CompositeJob::new(
            &row(0.0, 2.0),
            &clip_files(&CameraAngle::ALL),
            dir.path().join("out.mp4"),
        )
        .unwrap();
        let mut settings = settings();
        settings.ffmpeg_path = "false".to_string();

        let err = run_ffmpeg(&job, &settings).await.unwrap_err();
        assert!(matches!(err, CompositeError::ToolFailed { exit_code: Some(1), .. }));
        assert!(err.allows_fallback());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_ffmpeg_times_out_and_falls_back() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("slow-ffmpeg");
        std::fs::write(&tool, "#!/bin/sh\nexec sleep 5\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let job = CompositeJob::new(
            &row(0.0, 2.0),
            &clip_files(&CameraAngle::ALL),
            dir.path().join("out.mp4"),
        )
        .unwrap();
        let mut settings = settings();
        settings.ffmpeg_path = tool.to_string_lossy().into_owned();
        settings.timeout = Duration::from_millis(100);

        let started = std::time::Instant::now();
        let err = run_ffmpeg(&job, &settings).await.unwrap_err();
        assert!(matches!(err, CompositeError::ToolTimedOut(t) if t == Duration::from_millis(100)));
        assert!(err.allows_fallback());
        assert!(started.elapsed() < Duration::from_secs(2));

        // the OpenCV path is attempted next; the clips do not exist so it fails
        let err = compose(&job, &settings).await.unwrap_err();
        assert!(matches!(err, CompositeError::FallbackFailed(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_job_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("composites").join("Tesla - Model 3 - ABC 1234.mp4");
        std::fs::create_dir_all(output.parent().unwrap()).unwrap();
        std::fs::write(&output, b"truncated mp4").unwrap();

        let job = CompositeJob::new(&row(0.0, 2.0), &clip_files(&CameraAngle::ALL), output.clone())
            .unwrap();
        let mut settings = settings();
        settings.ffmpeg_path = "false".to_string();

        let err = compose(&job, &settings).await.unwrap_err();
        assert!(matches!(err, CompositeError::FallbackFailed(_)));
        assert!(!output.exists());
    }

    #[test]
    fn test_unseekable_capture_is_an_error() {
        let mut capture = VideoCapture::default().unwrap();
        let err = seek_capture(&mut capture, CameraAngle::Back, Path::new("/clips/back.mp4"), 12.5)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "back angle at /clips/back.mp4 cannot seek to 00:00:12.500"
        );
        // no seek needed from the start
        assert!(seek_capture(&mut capture, CameraAngle::Back, Path::new("/clips/back.mp4"), 0.0).is_ok());
    }
}
