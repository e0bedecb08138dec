// Subprocess-backed detection capabilities.
//
// Plate OCR and make/model/color identification live in external programs. Both
// speak JSON on stdout; this module owns the wire format and plate text rules.

use crate::pipeline::detection::{region_to_rect, IdentityResolver, PlateDetector};
use crate::pipeline::types::{BBox, Frame, PlateReading, VehicleIdentity};
use anyhow::{anyhow, Context, Result};
use opencv::core::{Mat, Vector};
use opencv::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` exited with code {code:?}: {stderr}")]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("`{program}` produced malformed output: {source}")]
    MalformedOutput {
        program: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Upper-case, strip separators and validate a raw OCR string.
///
/// Accepted plates are 5-8 ASCII alphanumerics with at least one letter and
/// one digit. The result is re-formatted with [`format_plate`].
pub fn normalize_plate(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .to_uppercase()
        .chars()
        .filter(|c| *c != ' ' && *c != '-')
        .collect();

    if !(5..=8).contains(&cleaned.len()) {
        return None;
    }
    if !cleaned.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    let has_letter = cleaned.chars().any(|c| c.is_ascii_alphabetic());
    let has_digit = cleaned.chars().any(|c| c.is_ascii_digit());
    if !has_letter || !has_digit {
        return None;
    }

    Some(format_plate(&cleaned))
}

/// `ABC1234` -> `ABC 1234`, `ABC123` -> `ABC-123`, anything else unchanged.
pub fn format_plate(cleaned: &str) -> String {
    match cleaned.len() {
        7 => format!("{} {}", &cleaned[..3], &cleaned[3..]),
        6 => format!("{}-{}", &cleaned[..3], &cleaned[3..]),
        _ => cleaned.to_string(),
    }
}

/// A configured external program: first whitespace-separated token is the
/// executable, the rest are leading arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn parse(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("Empty command line"))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Run with one extra trailing argument, returning stdout on success.
    fn run(&self, extra_arg: &str) -> std::result::Result<String, BridgeError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(extra_arg)
            .output()
            .map_err(|source| BridgeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(BridgeError::NonZeroExit {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[derive(Debug, Deserialize)]
struct PlateResponse {
    text: Option<String>,
    #[serde(default)]
    confidence: f32,
    /// Plate box relative to the crop
    bbox: Option<[f32; 4]>,
}

/// Interpret OCR output for a crop taken at `crop` (frame-normalized).
fn parse_plate_response(
    program: &str,
    stdout: &str,
    crop: &BBox,
) -> std::result::Result<Option<PlateReading>, BridgeError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let response: PlateResponse =
        serde_json::from_str(trimmed).map_err(|source| BridgeError::MalformedOutput {
            program: program.to_string(),
            source,
        })?;

    let Some(number) = response.text.as_deref().and_then(normalize_plate) else {
        return Ok(None);
    };
    let inner = response
        .bbox
        .map(BBox::from_xywh)
        .unwrap_or(BBox::new(0.0, 0.0, 1.0, 1.0));

    Ok(Some(PlateReading {
        number,
        confidence: response.confidence.clamp(0.0, 1.0),
        bbox: crop.project_from(&inner),
    }))
}

/// Reads plates by handing a JPEG crop of the vehicle to an OCR program.
pub struct CommandPlateReader {
    command: CommandLine,
}

impl CommandPlateReader {
    pub fn new(command: &str) -> Result<Self> {
        Ok(Self {
            command: CommandLine::parse(command).context("Invalid plate command")?,
        })
    }
}

impl PlateDetector for CommandPlateReader {
    fn detect_plate(&mut self, frame: &Frame, region: &BBox) -> Result<Option<PlateReading>> {
        let size = frame.image.size()?;
        let Some(rect) = region_to_rect(region, size.width, size.height) else {
            return Ok(None);
        };

        let roi = Mat::roi(&frame.image, rect)?;
        let mut crop = Mat::default();
        roi.copy_to(&mut crop)?;

        let image_file = tempfile::Builder::new()
            .prefix("plate-")
            .suffix(".jpg")
            .tempfile()
            .context("Failed to create plate crop file")?;
        let image_path = image_file
            .path()
            .to_str()
            .ok_or_else(|| anyhow!("Temporary path is not valid UTF-8"))?
            .to_string();
        if !opencv::imgcodecs::imwrite(&image_path, &crop, &Vector::new())? {
            return Err(anyhow!("Failed to encode plate crop"));
        }

        // The OCR tool sees the pixel crop; map its box back through the
        // crop's actual (clamped) extent.
        let crop_box = BBox::new(
            rect.x as f32 / size.width as f32,
            rect.y as f32 / size.height as f32,
            rect.width as f32 / size.width as f32,
            rect.height as f32 / size.height as f32,
        );

        let stdout = self.command.run(&image_path)?;
        Ok(parse_plate_response(&self.command.program, &stdout, &crop_box)?)
    }
}

#[derive(Debug, Serialize)]
struct IdentityRequest<'a> {
    video_path: &'a str,
    timestamp: f64,
    bbox: [f32; 4],
}

#[derive(Debug, Deserialize)]
struct IdentityResponse {
    make: Option<String>,
    model: Option<String>,
    color: Option<String>,
    year: Option<String>,
    #[serde(default)]
    confidence: f32,
    error: Option<String>,
}

fn parse_identity_response(
    program: &str,
    stdout: &str,
) -> std::result::Result<Option<VehicleIdentity>, BridgeError> {
    let response: IdentityResponse =
        serde_json::from_str(stdout.trim()).map_err(|source| BridgeError::MalformedOutput {
            program: program.to_string(),
            source,
        })?;

    if let Some(error) = response.error {
        tracing::warn!("Identity resolver `{}` reported: {}", program, error);
        return Ok(None);
    }

    let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
    let identity = VehicleIdentity {
        make: non_empty(response.make),
        model: non_empty(response.model),
        color: non_empty(response.color),
        year: non_empty(response.year),
        confidence: response.confidence.clamp(0.0, 1.0),
    };

    if identity.make.is_none() && identity.model.is_none() && identity.color.is_none() {
        return Ok(None);
    }
    Ok(Some(identity))
}

/// Resolves make/model/color by asking an identifier program about a region of
/// the source video at a timestamp.
pub struct CommandIdentityResolver {
    command: CommandLine,
}

impl CommandIdentityResolver {
    pub fn new(command: &str) -> Result<Self> {
        Ok(Self {
            command: CommandLine::parse(command).context("Invalid identity command")?,
        })
    }
}

impl IdentityResolver for CommandIdentityResolver {
    fn resolve_identity(
        &mut self,
        _frame: &Frame,
        region: &BBox,
        timestamp: f64,
        source: &Path,
    ) -> Result<Option<VehicleIdentity>> {
        let video_path = source
            .to_str()
            .ok_or_else(|| anyhow!("Video path is not valid UTF-8: {:?}", source))?;
        let request = serde_json::to_string(&IdentityRequest {
            video_path,
            timestamp,
            bbox: region.to_xywh(),
        })?;

        match self.command.run(&request) {
            Ok(stdout) => Ok(parse_identity_response(&self.command.program, &stdout)?),
            Err(BridgeError::NonZeroExit { program, code, stderr }) => {
                tracing::warn!(
                    "Identity resolver `{}` exited with {:?} at {:.2}s: {}",
                    program,
                    code,
                    timestamp,
                    stderr
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Used when no plate command is configured
pub struct NoPlates;

impl PlateDetector for NoPlates {
    fn detect_plate(&mut self, _frame: &Frame, _region: &BBox) -> Result<Option<PlateReading>> {
        Ok(None)
    }
}

/// Used when no identity command is configured
pub struct NoIdentity;

impl IdentityResolver for NoIdentity {
    fn resolve_identity(
        &mut self,
        _frame: &Frame,
        _region: &BBox,
        _timestamp: f64,
        _source: &Path,
    ) -> Result<Option<VehicleIdentity>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::CameraAngle;

    #[test]
    fn test_normalize_plate_formats_by_length() {
        assert_eq!(normalize_plate("abc1234").as_deref(), Some("ABC 1234"));
        assert_eq!(normalize_plate("abc 123").as_deref(), Some("ABC-123"));
        assert_eq!(normalize_plate("AB-C12").as_deref(), Some("ABC12"));
        assert_eq!(normalize_plate("7xyz12ab").as_deref(), Some("7XYZ12AB"));
    }

    #[test]
    fn test_normalize_plate_rejects_invalid_text() {
        assert_eq!(normalize_plate("AB12"), None);
        assert_eq!(normalize_plate("ABCDEFGHI1"), None);
        assert_eq!(normalize_plate("ABCDEF"), None);
        assert_eq!(normalize_plate("123456"), None);
        assert_eq!(normalize_plate("AB#1234"), None);
        assert_eq!(normalize_plate(""), None);
    }

    #[test]
    fn test_parse_plate_response_maps_box_into_frame() {
        let crop = BBox::new(0.5, 0.5, 0.5, 0.5);
        let stdout = r#"{"text": "abc-1234", "confidence": 0.8, "bbox": [0.5, 0.0, 0.5, 0.5]}"#;
        let plate = parse_plate_response("ocr", stdout, &crop).unwrap().unwrap();
        assert_eq!(plate.number, "ABC 1234");
        assert_eq!(plate.confidence, 0.8);
        assert_eq!(plate.bbox, BBox::new(0.75, 0.5, 0.25, 0.25));
    }

    #[test]
    fn test_parse_plate_response_absent_cases() {
        let crop = BBox::new(0.0, 0.0, 1.0, 1.0);
        assert!(parse_plate_response("ocr", "", &crop).unwrap().is_none());
        assert!(parse_plate_response("ocr", r#"{"text": null}"#, &crop)
            .unwrap()
            .is_none());
        assert!(parse_plate_response("ocr", r#"{"text": "HELLO"}"#, &crop)
            .unwrap()
            .is_none());
        assert!(matches!(
            parse_plate_response("ocr", "not json", &crop),
            Err(BridgeError::MalformedOutput { .. })
        ));
    }

    #[test]
    fn test_parse_identity_response() {
        let stdout = r#"{"make": "Tesla", "model": "Model 3", "color": "Red", "year": "2021", "confidence": 0.9}"#;
        let identity = parse_identity_response("id", stdout).unwrap().unwrap();
        assert_eq!(identity.make.as_deref(), Some("Tesla"));
        assert_eq!(identity.year.as_deref(), Some("2021"));

        let failed = r#"{"make": "", "model": "", "color": "", "confidence": 0.0, "error": "no vehicle"}"#;
        assert!(parse_identity_response("id", failed).unwrap().is_none());

        let blank = r#"{"make": "", "model": " ", "confidence": 0.2}"#;
        assert!(parse_identity_response("id", blank).unwrap().is_none());
    }

    #[test]
    fn test_command_line_parse() {
        let cmd = CommandLine::parse("python3 scripts/identify.py --fast").unwrap();
        assert_eq!(cmd.program, "python3");
        assert_eq!(cmd.args, vec!["scripts/identify.py", "--fast"]);
        assert!(CommandLine::parse("   ").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_non_zero_exit_is_absence() {
        let mut resolver = CommandIdentityResolver::new("false").unwrap();
        let frame = Frame {
            image: Mat::default(),
            timestamp: 1.0,
            angle: CameraAngle::Front,
        };
        let result = resolver
            .resolve_identity(&frame, &BBox::new(0.1, 0.1, 0.2, 0.2), 1.0, Path::new("a.mp4"))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let cmd = CommandLine::parse("definitely-not-a-real-ocr-binary").unwrap();
        assert!(matches!(cmd.run("x"), Err(BridgeError::Spawn { .. })));
    }
}
