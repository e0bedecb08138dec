// Run artifact struct definitions
//
// This module contains the normalized box shared by every pipeline stage and
// the helpers that persist a batch's JSON artifacts inside its output directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// Normalized bounding box (unit square, top-left origin)
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Build from an `[x, y, w, h]` array as exchanged with external tools.
    pub fn from_xywh(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }

    pub fn to_xywh(&self) -> [f32; 4] {
        [self.x, self.y, self.w, self.h]
    }

    pub fn area(&self) -> f32 {
        if self.w <= 0.0 || self.h <= 0.0 {
            return 0.0;
        }
        self.w * self.h
    }

    pub fn intersection_area(&self, other: &BBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);
        let w = x2 - x1;
        let h = y2 - y1;
        if w <= 0.0 || h <= 0.0 {
            return 0.0;
        }
        w * h
    }

    /// Intersection-over-Union. Degenerate (zero-area) boxes yield 0.
    pub fn iou(&self, other: &BBox) -> f32 {
        let area_a = self.area();
        let area_b = other.area();
        if area_a <= 0.0 || area_b <= 0.0 {
            return 0.0;
        }
        let intersection = self.intersection_area(other);
        let union = area_a + area_b - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }

    /// Map a box expressed relative to `self` back into the coordinate space
    /// `self` lives in.
    pub fn project_from(&self, inner: &BBox) -> BBox {
        BBox {
            x: self.x + inner.x * self.w,
            y: self.y + inner.y * self.h,
            w: inner.w * self.w,
            h: inner.h * self.h,
        }
    }
}

/// Write bytes so that readers never observe a partial file: the content goes
/// to a temp file in the destination directory which is then renamed over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {:?}", dir))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {:?}", dir))?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to move artifact into place at {:?}", path))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_artifact<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    write_atomic(path, content.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identical_boxes() {
        let a = BBox::new(0.1, 0.1, 0.2, 0.2);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint_boxes() {
        let a = BBox::new(0.0, 0.0, 0.1, 0.1);
        let b = BBox::new(0.5, 0.5, 0.1, 0.1);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_half_overlap_is_exact() {
        let a = BBox::new(0.0, 0.0, 0.5, 0.5);
        let b = BBox::new(0.0, 0.0, 0.25, 0.5);
        assert_eq!(a.iou(&b), 0.5);
    }

    #[test]
    fn test_iou_degenerate_box_is_zero() {
        let a = BBox::new(0.2, 0.2, 0.0, 0.0);
        assert_eq!(a.iou(&a), 0.0);
        let b = BBox::new(0.2, 0.2, 0.3, 0.0);
        assert_eq!(b.iou(&BBox::new(0.2, 0.2, 0.3, 0.3)), 0.0);
    }

    #[test]
    fn test_project_from_region() {
        let region = BBox::new(0.5, 0.5, 0.5, 0.5);
        let inner = BBox::new(0.5, 0.0, 0.5, 0.5);
        assert_eq!(region.project_from(&inner), BBox::new(0.75, 0.5, 0.25, 0.25));
    }

    #[test]
    fn test_write_atomic_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        // No stray temp files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
