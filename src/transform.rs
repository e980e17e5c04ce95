//! Transform registry and the closed set of pixel transforms
//!
//! A transform is a pure function from an encoded image payload to a new
//! encoded payload. Every variant decodes the payload, maps each pixel
//! independently, and re-encodes the result as PNG, so applying the same
//! transform to the same bytes always yields the same bytes.

use crate::{PipelineError, Result};
use image::{DynamicImage, ImageFormat, Rgba};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::str::FromStr;
use std::sync::Arc;

/// Tag identifying one transform variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    Grayscale,
    Tint,
    Sepia,
}

impl TransformKind {
    pub const ALL: [TransformKind; 3] = [
        TransformKind::Grayscale,
        TransformKind::Tint,
        TransformKind::Sepia,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            TransformKind::Grayscale => "grayscale",
            TransformKind::Tint => "tint",
            TransformKind::Sepia => "sepia",
        }
    }

    /// Construct the transform instance for this tag.
    pub fn build(self) -> Arc<dyn Transform> {
        match self {
            TransformKind::Grayscale => Arc::new(GrayscaleTransform),
            TransformKind::Tint => Arc::new(TintTransform::default()),
            TransformKind::Sepia => Arc::new(SepiaTransform),
        }
    }
}

impl std::fmt::Display for TransformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for TransformKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grayscale" => Ok(TransformKind::Grayscale),
            "tint" => Ok(TransformKind::Tint),
            "sepia" => Ok(TransformKind::Sepia),
            _ => Err(PipelineError::UnknownTransformKind(s.to_string())),
        }
    }
}

/// A stateless per-pixel image transform.
///
/// Implementors only supply [`Transform::map_pixel`]; decoding and
/// re-encoding are shared by the provided [`Transform::apply`].
pub trait Transform: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> TransformKind;

    fn map_pixel(&self, pixel: Rgba<u8>) -> Rgba<u8>;

    /// Decode `payload`, map every pixel, and encode the result as PNG.
    ///
    /// Fails with [`PipelineError::Decode`] when `payload` is not an image.
    fn apply(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let decoded = image::load_from_memory(payload)
            .map_err(|e| PipelineError::decode("payload", e))?;

        let mut pixels = decoded.to_rgba8();
        for pixel in pixels.pixels_mut() {
            *pixel = self.map_pixel(*pixel);
        }

        let mut encoded = Vec::new();
        DynamicImage::ImageRgba8(pixels)
            .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
            .map_err(|e| PipelineError::decode("payload", format!("re-encode failed: {e}")))?;

        Ok(encoded)
    }
}

fn clamp_channel(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Rec.601 luminance.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrayscaleTransform;

impl Transform for GrayscaleTransform {
    fn kind(&self) -> TransformKind {
        TransformKind::Grayscale
    }

    fn map_pixel(&self, pixel: Rgba<u8>) -> Rgba<u8> {
        let [r, g, b, a] = pixel.0;
        let luma = clamp_channel(0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32);
        Rgba([luma, luma, luma, a])
    }
}

/// Blends every channel toward a fixed colour.
#[derive(Debug, Clone, Copy)]
pub struct TintTransform {
    pub color: [u8; 3],
    /// Blend factor in `0.0..=1.0`.
    pub strength: f32,
}

impl Default for TintTransform {
    fn default() -> Self {
        Self {
            color: [255, 0, 0],
            strength: 0.3,
        }
    }
}

impl Transform for TintTransform {
    fn kind(&self) -> TransformKind {
        TransformKind::Tint
    }

    fn map_pixel(&self, pixel: Rgba<u8>) -> Rgba<u8> {
        let [r, g, b, a] = pixel.0;
        let blend = |channel: u8, tint: u8| {
            let c = channel as f32;
            clamp_channel(c + (tint as f32 - c) * self.strength)
        };
        Rgba([
            blend(r, self.color[0]),
            blend(g, self.color[1]),
            blend(b, self.color[2]),
            a,
        ])
    }
}

/// Fixed sepia tone curve.
#[derive(Debug, Clone, Copy, Default)]
pub struct SepiaTransform;

impl Transform for SepiaTransform {
    fn kind(&self) -> TransformKind {
        TransformKind::Sepia
    }

    fn map_pixel(&self, pixel: Rgba<u8>) -> Rgba<u8> {
        let [r, g, b, a] = pixel.0;
        let (r, g, b) = (r as f32, g as f32, b as f32);
        Rgba([
            clamp_channel(0.393 * r + 0.769 * g + 0.189 * b),
            clamp_channel(0.349 * r + 0.686 * g + 0.168 * b),
            clamp_channel(0.272 * r + 0.534 * g + 0.131 * b),
            a,
        ])
    }
}

/// The ordered, immutable set of transforms applied in a run.
///
/// Cloning is cheap; every clone shares the same transform instances.
#[derive(Debug, Clone)]
pub struct TransformRegistry {
    transforms: Vec<Arc<dyn Transform>>,
}

impl TransformRegistry {
    pub fn new(kinds: &[TransformKind]) -> Self {
        Self {
            transforms: kinds.iter().map(|kind| kind.build()).collect(),
        }
    }

    /// Construct a single transform by tag.
    pub fn create(tag: &str) -> Result<Arc<dyn Transform>> {
        Ok(tag.parse::<TransformKind>()?.build())
    }

    /// Build a registry from configured tags, rejecting empty and duplicate lists.
    pub fn from_tags<S: AsRef<str>>(tags: &[S]) -> Result<Self> {
        if tags.is_empty() {
            return Err(PipelineError::Configuration(
                "At least one transform must be configured".to_string(),
            ));
        }

        let mut kinds: Vec<TransformKind> = Vec::with_capacity(tags.len());
        for tag in tags {
            let kind = tag.as_ref().parse::<TransformKind>()?;
            if kinds.contains(&kind) {
                return Err(PipelineError::Configuration(format!(
                    "Transform '{kind}' is listed more than once"
                )));
            }
            kinds.push(kind);
        }

        Ok(Self::new(&kinds))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Transform>> {
        self.transforms.iter()
    }

    pub fn kinds(&self) -> Vec<TransformKind> {
        self.transforms.iter().map(|t| t.kind()).collect()
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new(&TransformKind::ALL)
    }
}
