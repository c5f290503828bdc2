//! Thumbnail requests, variants and the jobs the queue hands to workers

use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Result, StationError};

/// Lower is more urgent. Derived `Ord` follows declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Priority {
    /// On screen right now
    Visible = 0,
    /// Within the adjacency window of the visible range
    Adjacent = 1,
    Background = 2,
}

impl Priority {
    /// Priority of item `index` given the visible range and how many items
    /// either side still count as adjacent
    pub fn from_viewport(index: usize, visible: Range<usize>, adjacency_window: usize) -> Self {
        if visible.contains(&index) {
            return Priority::Visible;
        }
        let distance = if index < visible.start {
            visible.start - index
        } else {
            // index >= end; the last visible item is end - 1
            index + 1 - visible.end
        };
        if distance <= adjacency_window {
            Priority::Adjacent
        } else {
            Priority::Background
        }
    }

    pub fn rank(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

/// A crop rectangle in image-relative coordinates (0.0..=1.0)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CropRegion {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

const EDGE_TOLERANCE: f32 = 1e-4;

impl CropRegion {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Result<Self> {
        let values = [x, y, width, height];
        if values.iter().any(|v| !v.is_finite() || *v < 0.0 || *v > 1.0) {
            return Err(StationError::InvalidCropRegion(format!(
                "({x}, {y}, {width}, {height}) must lie within 0..=1"
            )));
        }
        if width <= 0.0 || height <= 0.0 {
            return Err(StationError::InvalidCropRegion(format!(
                "{width} x {height} is empty"
            )));
        }
        if x + width > 1.0 + EDGE_TOLERANCE || y + height > 1.0 + EDGE_TOLERANCE {
            return Err(StationError::InvalidCropRegion(format!(
                "({x}, {y}, {width}, {height}) extends past the image"
            )));
        }
        Ok(Self {
            x,
            y,
            width,
            height,
        })
    }

    /// Default region for one page of a two-page spread
    pub fn half(side: Side) -> Self {
        let x = match side {
            Side::Left => 0.0,
            Side::Right => 0.5,
        };
        Self {
            x,
            y: 0.0,
            width: 0.5,
            height: 1.0,
        }
    }

    /// `(x, y, width, height)` in pixels, never empty, always inside the image
    pub fn to_pixels(&self, image_width: u32, image_height: u32) -> (u32, u32, u32, u32) {
        let scale = |v: f32, extent: u32| (v * extent as f32).round() as u32;

        let x = scale(self.x, image_width).min(image_width.saturating_sub(1));
        let y = scale(self.y, image_height).min(image_height.saturating_sub(1));
        let width = scale(self.width, image_width).clamp(1, image_width - x);
        let height = scale(self.height, image_height).clamp(1, image_height - y);
        (x, y, width, height)
    }

    /// Per-mille rounding, so float noise doesn't split cache entries
    fn quantized(&self) -> [u16; 4] {
        [self.x, self.y, self.width, self.height].map(|v| (v * 1000.0).round() as u16)
    }
}

/// What part of a scan a thumbnail shows
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Variant {
    Whole,
    Page { side: Side, region: CropRegion },
    /// The operator switched this page off; shown as a placeholder
    Disabled { side: Side },
}

impl Variant {
    pub fn page(side: Side) -> Self {
        Variant::Page {
            side,
            region: CropRegion::half(side),
        }
    }

    pub fn key(&self) -> VariantKey {
        match self {
            Variant::Whole => VariantKey::Whole,
            Variant::Page { side, region } => VariantKey::Page(*side, region.quantized()),
            Variant::Disabled { side } => VariantKey::Disabled(*side),
        }
    }

    pub fn crop_region(&self) -> Option<CropRegion> {
        match self {
            Variant::Page { region, .. } => Some(*region),
            _ => None,
        }
    }
}

/// Hashable identity of a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VariantKey {
    Whole,
    Page(Side, [u16; 4]),
    Disabled(Side),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ThumbnailKey {
    pub path: PathBuf,
    pub variant: VariantKey,
}

impl fmt::Display for ThumbnailKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.variant {
            VariantKey::Whole => write!(f, "{}", self.path.display()),
            VariantKey::Page(side, [x, y, w, h]) => {
                write!(f, "{}#{}@{},{},{},{}", self.path.display(), side, x, y, w, h)
            }
            VariantKey::Disabled(side) => write!(f, "{}#{}-disabled", self.path.display(), side),
        }
    }
}

/// What a caller asks for
#[derive(Debug, Clone, PartialEq)]
pub struct ThumbnailRequest {
    pub path: PathBuf,
    pub variant: Variant,
    pub priority: Priority,
}

impl ThumbnailRequest {
    pub fn new(path: impl Into<PathBuf>, variant: Variant, priority: Priority) -> Self {
        Self {
            path: path.into(),
            variant,
            priority,
        }
    }

    pub fn whole(path: impl Into<PathBuf>, priority: Priority) -> Self {
        Self::new(path, Variant::Whole, priority)
    }

    pub fn key(&self) -> ThumbnailKey {
        ThumbnailKey {
            path: self.path.clone(),
            variant: self.variant.key(),
        }
    }
}

/// A request frozen by the queue: sequence and path epoch are fixed at enqueue
#[derive(Debug, Clone, PartialEq)]
pub struct ThumbnailJob {
    pub priority: Priority,
    pub sequence: u64,
    pub source_path: PathBuf,
    pub variant: Variant,
    pub(crate) epoch: u64,
}

impl ThumbnailJob {
    pub fn key(&self) -> ThumbnailKey {
        ThumbnailKey {
            path: self.source_path.clone(),
            variant: self.variant.key(),
        }
    }

    pub fn crop_region(&self) -> Option<CropRegion> {
        self.variant.crop_region()
    }

    pub fn source(&self) -> &Path {
        &self.source_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_from_viewport() {
        assert_eq!(Priority::from_viewport(5, 4..8, 3), Priority::Visible);
        assert_eq!(Priority::from_viewport(1, 4..8, 3), Priority::Adjacent);
        assert_eq!(Priority::from_viewport(10, 4..8, 3), Priority::Adjacent);
        assert_eq!(Priority::from_viewport(11, 4..8, 3), Priority::Background);
        assert_eq!(Priority::from_viewport(0, 4..8, 3), Priority::Background);
        assert!(Priority::Visible < Priority::Background);
    }

    #[test]
    fn test_crop_region_validation() {
        assert!(CropRegion::new(0.0, 0.0, 1.0, 1.0).is_ok());
        assert!(CropRegion::new(0.5, 0.0, 0.5, 1.0).is_ok());
        assert!(CropRegion::new(-0.1, 0.0, 0.5, 1.0).is_err());
        assert!(CropRegion::new(0.0, 0.0, 0.0, 1.0).is_err());
        assert!(CropRegion::new(0.6, 0.0, 0.5, 1.0).is_err());
        assert!(CropRegion::new(f32::NAN, 0.0, 0.5, 1.0).is_err());
    }

    #[test]
    fn test_region_to_pixels() {
        let right = CropRegion::half(Side::Right);
        assert_eq!(right.to_pixels(200, 100), (100, 0, 100, 100));

        let sliver = CropRegion::new(0.999, 0.0, 0.001, 1.0).unwrap();
        let (x, _, w, _) = sliver.to_pixels(10, 10);
        assert!(x + w <= 10 && w >= 1);
    }

    #[test]
    fn test_keys_ignore_float_noise() {
        let a = Variant::Page {
            side: Side::Left,
            region: CropRegion::new(0.0, 0.0, 0.5, 1.0).unwrap(),
        };
        let b = Variant::Page {
            side: Side::Left,
            region: CropRegion::new(0.0, 0.0, 0.500_01, 1.0).unwrap(),
        };
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), Variant::page(Side::Right).key());
        assert_ne!(
            Variant::Disabled { side: Side::Left }.key(),
            Variant::page(Side::Left).key()
        );
    }
}
