// Detection capabilities consumed by the scanner.
//
// Each capability is a one-method trait so the tracker can be driven by canned
// results in tests and by real models or subprocess bridges in production.

use crate::pipeline::bridge::{CommandIdentityResolver, CommandPlateReader, NoIdentity, NoPlates};
use crate::pipeline::types::{
    BBox, Frame, PipelineConfig, PlateReading, RawDetection, VehicleIdentity,
};
use anyhow::{anyhow, Result};
use image::{DynamicImage, ImageBuffer, Rgb};
use opencv::core::Mat;
use opencv::prelude::*;
use std::path::Path;
use usls::models::RTDETR;
use usls::{Config, Image};

/// COCO classes treated as vehicles
const VEHICLE_CLASSES: [&str; 4] = ["car", "truck", "bus", "motorcycle"];

pub trait VehicleDetector: Send {
    fn detect_vehicles(&mut self, frame: &Frame) -> Result<Vec<RawDetection>>;
}

pub trait PlateDetector: Send {
    fn detect_plate(&mut self, frame: &Frame, region: &BBox) -> Result<Option<PlateReading>>;
}

pub trait IdentityResolver: Send {
    fn resolve_identity(
        &mut self,
        frame: &Frame,
        region: &BBox,
        timestamp: f64,
        source: &Path,
    ) -> Result<Option<VehicleIdentity>>;
}

/// The three capabilities one video worker runs with
pub struct Adapters {
    pub vehicles: Box<dyn VehicleDetector>,
    pub plates: Box<dyn PlateDetector>,
    pub identity: Box<dyn IdentityResolver>,
}

impl Adapters {
    /// Build the production adapters described by `config`.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let model_path = config
            .model_path
            .as_deref()
            .ok_or_else(|| anyhow!("No vehicle detection model configured"))?;
        let vehicles = RtDetrVehicleDetector::new(model_path, config.min_vehicle_conf)
            .map_err(|e| anyhow!("Failed to load model: {}", e))?;

        let plates: Box<dyn PlateDetector> = match config.plate_command.as_deref() {
            Some(command) => Box::new(CommandPlateReader::new(command)?),
            None => Box::new(NoPlates),
        };

        let identity: Box<dyn IdentityResolver> = match config.identity_command.as_deref() {
            Some(command) => Box::new(CommandIdentityResolver::new(command)?),
            None => Box::new(NoIdentity),
        };

        Ok(Self {
            vehicles: Box::new(vehicles),
            plates,
            identity,
        })
    }
}

/// RT-DETR (usls) vehicle detector. Handles BGR-to-RGB conversion and corrects
/// for aspect-ratio padding in the underlying model library.
pub struct RtDetrVehicleDetector {
    model: RTDETR,
    min_conf: f32,
}

impl RtDetrVehicleDetector {
    pub fn new(model_path: &str, min_conf: f32) -> Result<Self> {
        let config = Config::default()
            .with_model_file(model_path)
            .with_class_names(&usls::NAMES_COCO_80);

        #[cfg(target_os = "macos")]
        let config = config.with_model_device(usls::Device::CoreMl);

        let config = config.commit()?;
        let model = RTDETR::new(config)?;
        Ok(Self { model, min_conf })
    }
}

impl VehicleDetector for RtDetrVehicleDetector {
    fn detect_vehicles(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        let size = frame.image.size()?;
        let img_w = size.width as f32;
        let img_h = size.height as f32;
        if img_w <= 0.0 || img_h <= 0.0 {
            return Ok(Vec::new());
        }

        let image = Image::from(mat_to_dynamic_image(&frame.image)?);
        let results = self.model.forward(&[image])?;

        // usls RT-DETR scales boxes against the padded square; undo that.
        let (x_corr, y_corr) = if img_w > img_h {
            (img_w / img_h, 1.0)
        } else if img_h > img_w {
            (1.0, img_h / img_w)
        } else {
            (1.0, 1.0)
        };

        let detections = results
            .into_iter()
            .next()
            .map(|y| y.hbbs)
            .unwrap_or_default()
            .into_iter()
            .filter(|hbb| hbb.confidence().unwrap_or(0.0) >= self.min_conf)
            .filter(|hbb| {
                hbb.name()
                    .map(|name| VEHICLE_CLASSES.contains(&name))
                    .unwrap_or(false)
            })
            .map(|hbb| RawDetection {
                bbox: BBox {
                    x: (hbb.xmin() * x_corr / img_w).clamp(0.0, 1.0),
                    y: (hbb.ymin() * y_corr / img_h).clamp(0.0, 1.0),
                    w: (hbb.width() * x_corr / img_w).clamp(0.0, 1.0),
                    h: (hbb.height() * y_corr / img_h).clamp(0.0, 1.0),
                },
                confidence: hbb.confidence().unwrap_or(0.0),
            })
            .collect();

        Ok(detections)
    }
}

/// Convert an OpenCV Mat (BGR) to an image::DynamicImage (RGB)
fn mat_to_dynamic_image(mat: &Mat) -> Result<DynamicImage> {
    let mut rgb_mat = Mat::default();
    opencv::imgproc::cvt_color_def(mat, &mut rgb_mat, opencv::imgproc::COLOR_BGR2RGB)?;

    let size = rgb_mat.size()?;
    if !rgb_mat.is_continuous() {
        return Err(anyhow!("Mat is not continuous"));
    }

    let buffer = rgb_mat.data_bytes()?.to_vec();
    let img_buffer =
        ImageBuffer::<Rgb<u8>, _>::from_vec(size.width as u32, size.height as u32, buffer)
            .ok_or_else(|| anyhow!("Failed to create ImageBuffer from Mat data"))?;

    Ok(DynamicImage::ImageRgb8(img_buffer))
}

/// Pixel rectangle of a normalized region, clamped to the frame. `None` when
/// the clamped region is empty.
pub fn region_to_rect(region: &BBox, width: i32, height: i32) -> Option<opencv::core::Rect> {
    let x1 = (region.x * width as f32).floor().clamp(0.0, width as f32) as i32;
    let y1 = (region.y * height as f32).floor().clamp(0.0, height as f32) as i32;
    let x2 = ((region.x + region.w) * width as f32)
        .ceil()
        .clamp(0.0, width as f32) as i32;
    let y2 = ((region.y + region.h) * height as f32)
        .ceil()
        .clamp(0.0, height as f32) as i32;

    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(opencv::core::Rect::new(x1, y1, x2 - x1, y2 - y1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_to_rect_scales_and_clamps() {
        let rect = region_to_rect(&BBox::new(0.25, 0.5, 0.5, 0.25), 640, 480).unwrap();
        assert_eq!((rect.x, rect.y, rect.width, rect.height), (160, 240, 320, 120));

        let clamped = region_to_rect(&BBox::new(0.9, 0.9, 0.5, 0.5), 100, 100).unwrap();
        assert_eq!((clamped.x, clamped.y, clamped.width, clamped.height), (90, 90, 10, 10));
    }

    #[test]
    fn test_region_to_rect_rejects_empty_region() {
        assert!(region_to_rect(&BBox::new(1.2, 0.0, 0.1, 0.1), 100, 100).is_none());
        assert!(region_to_rect(&BBox::new(0.5, 0.5, 0.0, 0.2), 100, 100).is_none());
    }

    #[test]
    fn test_from_config_requires_model() {
        let config = PipelineConfig::default();
        let err = Adapters::from_config(&config).err().unwrap();
        assert!(err.to_string().contains("No vehicle detection model"));
    }
}
