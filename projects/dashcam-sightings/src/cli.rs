use crate::pipeline::types::PipelineConfig;
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Process every dashcam clip under a directory and exit
    Process(ProcessArgs),
    /// Serve the batch progress API
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
pub struct ProcessArgs {
    /// Root directory for dashcam video files
    #[arg(long, env = "DASHCAM_VIDEO_ROOT")]
    pub video_root: String,

    /// Root directory for batch outputs
    #[arg(long, env = "DASHCAM_OUTPUT_ROOT")]
    pub output_root: String,

    /// Name of the batch output directory (defaults to a timestamp)
    #[arg(long)]
    pub batch_id: Option<String>,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port to bind to
    #[arg(long, default_value_t = 12206)]
    pub port: u16,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

#[derive(clap::Args, Debug)]
pub struct PipelineArgs {
    /// RT-DETR ONNX model used for vehicle detection
    #[arg(long, env = "DASHCAM_MODEL_PATH")]
    pub model_path: Option<String>,

    /// ffmpeg binary used for composites
    #[arg(long, env = "DASHCAM_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg: String,

    /// Seconds before a composite ffmpeg run is killed
    #[arg(long, default_value_t = 300)]
    pub ffmpeg_timeout_secs: u64,

    /// OCR program; receives the path of a JPEG vehicle crop
    #[arg(long, env = "DASHCAM_PLATE_COMMAND")]
    pub plate_command: Option<String>,

    /// Vehicle identifier program; receives a JSON request
    #[arg(long, env = "DASHCAM_IDENTITY_COMMAND")]
    pub identity_command: Option<String>,

    /// Video decoding backend
    #[arg(long, default_value = "opencv", value_parser = ["opencv", "ffmpeg"])]
    pub backend: String,

    /// Parallel video workers (0 = one per core)
    #[arg(long, default_value_t = 0)]
    pub workers: usize,

    /// Detection passes per second of footage
    #[arg(long, default_value_t = 2.0)]
    pub passes_per_second: f64,

    /// Sightings of one plate closer than this many seconds are merged
    #[arg(long, default_value_t = 1.0)]
    pub merge_gap: f64,
}

impl PipelineArgs {
    pub fn to_config(&self) -> PipelineConfig {
        PipelineConfig {
            passes_per_second: self.passes_per_second,
            merge_gap: self.merge_gap,
            ffmpeg_path: self.ffmpeg.clone(),
            ffmpeg_timeout: Duration::from_secs(self.ffmpeg_timeout_secs),
            backend: self.backend.clone(),
            model_path: self.model_path.clone(),
            plate_command: self.plate_command.clone(),
            identity_command: self.identity_command.clone(),
            workers: self.workers,
            ..Default::default()
        }
    }
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
