pub mod ffmpeg_reader;
pub mod opencv_reader;

use anyhow::{anyhow, Context, Result};
use opencv::core::Mat;
use std::path::Path;

/// A frame as it comes out of a decoder
pub struct DecodedFrame {
    /// Presentation timestamp in seconds
    pub timestamp: f64,
    pub mat: Mat,
}

/// Sequential decoder over one video file.
///
/// `Ok(None)` / `Ok(false)` mean end of stream; `Err` means the stream cannot be
/// decoded any further.
pub trait VideoReader: Send {
    fn frame_count(&self) -> Result<usize>;
    fn source_fps(&self) -> Result<f64>;
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>>;

    /// Advance past one frame without converting it. Backends override this
    /// when they can skip cheaper than a full read.
    fn skip_frame(&mut self) -> Result<bool> {
        Ok(self.next_frame()?.is_some())
    }
}

/// Open a reader with the named backend ("ffmpeg" or "opencv").
pub fn open_reader(path: &Path, backend: &str) -> Result<Box<dyn VideoReader>> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow!("Video path is not valid UTF-8: {:?}", path))?;

    let reader: Box<dyn VideoReader> = match backend {
        "ffmpeg" => Box::new(
            ffmpeg_reader::FfmpegReader::new(path_str)
                .with_context(|| format!("Failed to open video with ffmpeg at: '{}'", path_str))?,
        ),
        "opencv" => Box::new(
            opencv_reader::OpencvReader::new(path_str)
                .with_context(|| format!("Failed to open video at: '{}'", path_str))?,
        ),
        other => return Err(anyhow!("Unsupported decode backend: {}", other)),
    };
    Ok(reader)
}

/// Frame-count metadata may be estimated from the duration and overshoot the
/// decodable stream by a frame or two.
const FRAME_COUNT_SLACK: usize = 2;

/// Called when a decoder stops yielding frames. A stream that ends well short
/// of the frame count its container advertises was truncated or corrupted.
/// `advertised == 0` means the count is unknown.
pub fn check_stream_end(decoded: usize, advertised: usize) -> Result<()> {
    if advertised > 0 && decoded + FRAME_COUNT_SLACK < advertised {
        return Err(anyhow!(
            "stream ended at frame {} of {}",
            decoded,
            advertised
        ));
    }
    Ok(())
}

/// Number of decoded frames between detection passes so that roughly
/// `passes_per_second` frames per second reach the detectors.
pub fn sample_stride(source_fps: f64, passes_per_second: f64) -> usize {
    if !source_fps.is_finite() || source_fps <= 0.0 || passes_per_second <= 0.0 {
        return 1;
    }
    ((source_fps / passes_per_second).round() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_stride_targets_two_passes_per_second() {
        assert_eq!(sample_stride(30.0, 2.0), 15);
        assert_eq!(sample_stride(36.0, 2.0), 18);
        assert_eq!(sample_stride(29.97, 2.0), 15);
        assert_eq!(sample_stride(25.0, 2.0), 13);
    }

    #[test]
    fn test_sample_stride_never_zero() {
        assert_eq!(sample_stride(1.0, 2.0), 1);
        assert_eq!(sample_stride(0.0, 2.0), 1);
        assert_eq!(sample_stride(f64::NAN, 2.0), 1);
    }

    #[test]
    fn test_short_stream_is_an_error() {
        let err = check_stream_end(300, 1800).unwrap_err();
        assert_eq!(err.to_string(), "stream ended at frame 300 of 1800");
    }

    #[test]
    fn test_stream_end_tolerates_estimated_counts() {
        assert!(check_stream_end(1800, 1800).is_ok());
        assert!(check_stream_end(1798, 1800).is_ok());
        assert!(check_stream_end(1797, 1800).is_err());
        // unknown frame count
        assert!(check_stream_end(12, 0).is_ok());
    }

    #[test]
    fn test_open_reader_rejects_unknown_backend() {
        let err = open_reader(Path::new("clip.mp4"), "gstreamer").err().unwrap();
        assert!(err.to_string().contains("Unsupported decode backend"));
    }
}
