use super::{check_stream_end, DecodedFrame, VideoReader};
use anyhow::{anyhow, Context, Result};
use ffmpeg_next::ffi;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;
use ffmpeg_next::util::frame::Video as VideoFrame;
use opencv::{core, prelude::*};
use std::path::Path;

/// Video reader backed by FFmpeg via ffmpeg-next.
///
/// Frames are decoded in presentation order and converted to BGR24 only when
/// they are actually handed out; skipped frames stay in decoder format.
pub struct FfmpegReader {
    input_ctx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::codec::decoder::Video,
    video_stream_index: usize,
    /// Seconds per pts tick
    time_base: f64,
    /// Lazily created on first frame (source format is only known then).
    scaler: Option<scaling::Context>,
    source_fps: f64,
    total_frames: usize,
    /// Frame count from stream metadata, 0 when only estimated
    advertised_frames: usize,
    frames_decoded: usize,
    reuse_frame: VideoFrame,
    reuse_packet: ffmpeg_next::codec::packet::Packet,
    eof_sent: bool,
}

// SAFETY: a reader is created and consumed by exactly one video worker thread.
// The raw pointers inside ffmpeg-next types are never shared across threads.
unsafe impl Send for FfmpegReader {}

impl FfmpegReader {
    pub fn new(path: &str) -> Result<Self> {
        ffmpeg_next::init().context("Failed to initialize FFmpeg")?;

        let source = Path::new(path);
        if !source.exists() {
            return Err(anyhow!("Video file not found: {}", path));
        }

        let input_ctx = ffmpeg_next::format::input(&source).context("Failed to open video file")?;

        let video_stream = input_ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| anyhow!("No video stream found in {}", path))?;
        let video_stream_index = video_stream.index();

        let rational_fps = video_stream.avg_frame_rate();
        let source_fps = if rational_fps.denominator() > 0 && rational_fps.numerator() > 0 {
            rational_fps.numerator() as f64 / rational_fps.denominator() as f64
        } else {
            tracing::warn!("FfmpegReader: could not determine FPS, defaulting to 30.0");
            30.0
        };

        let tb = video_stream.time_base();
        let time_base = if tb.denominator() > 0 {
            tb.numerator() as f64 / tb.denominator() as f64
        } else {
            0.0
        };

        let duration_secs = input_ctx.duration() as f64 / ffi::AV_TIME_BASE as f64;
        let stream_frames = video_stream.frames() as usize;
        let total_frames = if stream_frames == 0 {
            (duration_secs * source_fps).round() as usize
        } else {
            stream_frames
        };

        tracing::info!(
            "FfmpegReader: opened {}, duration={:.2}s, fps={:.2}, estimated_frames={}",
            path,
            duration_secs,
            source_fps,
            total_frames
        );

        let decoder_ctx =
            ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())
                .context("Failed to create decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("Failed to open video decoder")?;

        Ok(Self {
            input_ctx,
            decoder,
            video_stream_index,
            time_base,
            scaler: None,
            source_fps,
            total_frames,
            advertised_frames: stream_frames,
            frames_decoded: 0,
            reuse_frame: VideoFrame::empty(),
            reuse_packet: ffmpeg_next::codec::packet::Packet::empty(),
            eof_sent: false,
        })
    }

    /// Pull the next decoded frame into `target`. Returns `Ok(false)` at end of stream.
    fn decode_into(&mut self, target: &mut VideoFrame) -> Result<bool> {
        loop {
            match self.decoder.receive_frame(target) {
                Ok(()) => return Ok(true),
                Err(ffmpeg_next::Error::Eof) => return Ok(false),
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {
                    if self.eof_sent {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(anyhow!("Decoder error: {}", e)),
            }

            // Feed packets until one belongs to the video stream, or flush at EOF
            let mut fed = false;
            loop {
                match self.reuse_packet.read(&mut self.input_ctx) {
                    Ok(()) => {
                        if self.reuse_packet.stream() == self.video_stream_index {
                            self.decoder
                                .send_packet(&self.reuse_packet)
                                .context("Failed to send packet to decoder")?;
                            fed = true;
                            break;
                        }
                    }
                    Err(ffmpeg_next::Error::Eof) => break,
                    Err(e) => {
                        return Err(anyhow!(
                            "Demux error after frame {}: {}",
                            self.frames_decoded,
                            e
                        ))
                    }
                }
            }
            if !fed {
                self.decoder
                    .send_eof()
                    .context("Failed to send EOF to decoder")?;
                self.eof_sent = true;
            }
        }
    }

    fn frame_timestamp(&self, frame: &VideoFrame) -> f64 {
        match frame.timestamp().or_else(|| frame.pts()) {
            Some(pts) if self.time_base > 0.0 => pts as f64 * self.time_base,
            _ => self.frames_decoded as f64 / self.source_fps,
        }
    }

    fn to_bgr(&mut self, frame: &VideoFrame) -> Result<VideoFrame> {
        if self.scaler.is_none() {
            let scaler = scaling::Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                Pixel::BGR24,
                frame.width(),
                frame.height(),
                scaling::Flags::BILINEAR,
            )
            .context("Failed to create scaler")?;
            self.scaler = Some(scaler);
        }

        let mut bgr = VideoFrame::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.run(frame, &mut bgr).context("Scaler failed")?;
        }
        Ok(bgr)
    }
}

/// Deep-copy a BGR24 ffmpeg frame into an OpenCV Mat that owns its data.
fn bgr_frame_to_mat(frame: &VideoFrame) -> Result<core::Mat> {
    let width = frame.width() as i32;
    let height = frame.height() as i32;
    let data = frame.data(0);
    let stride = frame.stride(0);
    let row_bytes = width as usize * 3;

    let mut mat = core::Mat::new_rows_cols_with_default(
        height,
        width,
        core::CV_8UC3,
        core::Scalar::all(0.0),
    )?;

    for y in 0..height as usize {
        let src_row = &data[y * stride..y * stride + row_bytes];
        let dst_ptr = mat.ptr_mut(y as i32)?;
        // SAFETY: each Mat row holds exactly `row_bytes` bytes for CV_8UC3.
        unsafe {
            std::ptr::copy_nonoverlapping(src_row.as_ptr(), dst_ptr, row_bytes);
        }
    }

    Ok(mat)
}

impl VideoReader for FfmpegReader {
    fn frame_count(&self) -> Result<usize> {
        Ok(self.total_frames)
    }

    fn source_fps(&self) -> Result<f64> {
        Ok(self.source_fps)
    }

    fn next_frame(&mut self) -> Result<Option<DecodedFrame>> {
        let mut raw = VideoFrame::empty();
        if !self.decode_into(&mut raw)? {
            check_stream_end(self.frames_decoded, self.advertised_frames)?;
            return Ok(None);
        }

        let timestamp = self.frame_timestamp(&raw);
        let bgr = self.to_bgr(&raw)?;
        let mat = bgr_frame_to_mat(&bgr)?;
        self.frames_decoded += 1;

        Ok(Some(DecodedFrame { timestamp, mat }))
    }

    fn skip_frame(&mut self) -> Result<bool> {
        // Swap out the persistent frame so decode_into can borrow self mutably
        let mut frame = std::mem::replace(&mut self.reuse_frame, VideoFrame::empty());
        let decoded = self.decode_into(&mut frame);
        self.reuse_frame = frame;
        if decoded? {
            self.frames_decoded += 1;
            return Ok(true);
        }
        check_stream_end(self.frames_decoded, self.advertised_frames)?;
        Ok(false)
    }
}
