//! Visual suppression of flagged images.

use std::collections::HashMap;

use image::imageops;
use image::{DynamicImage, RgbaImage};
use serde::{Deserialize, Serialize};

/// How flagged content is obscured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuppressionStyle {
    /// Blur strength in pixels (default: 20).
    pub amount: f32,
    /// Drop colour as well as detail.
    pub grayscale: bool,
    /// Reveal the original while the pointer is over it.
    pub unblur_on_hover: bool,
}

impl Default for SuppressionStyle {
    fn default() -> Self {
        Self {
            amount: 20.0,
            grayscale: true,
            unblur_on_hover: false,
        }
    }
}

/// Blurs (and optionally desaturates) a copy of `image`. Alpha is kept.
pub fn apply_visual_suppression(image: &RgbaImage, style: &SuppressionStyle) -> RgbaImage {
    let sigma = (style.amount / 2.0).max(0.0);
    let blurred = if sigma > 0.0 {
        imageops::blur(image, sigma)
    } else {
        image.clone()
    };

    if style.grayscale {
        DynamicImage::ImageLumaA8(imageops::grayscale_alpha(&blurred)).to_rgba8()
    } else {
        blurred
    }
}

/// Presentation layer that can obscure and restore elements.
pub trait VisualSuppressor {
    /// Handle naming one displayed element.
    type Element: ?Sized;

    fn apply_visual_suppression(&mut self, element: &Self::Element, style: &SuppressionStyle);

    fn remove_visual_suppression(&mut self, element: &Self::Element);
}

struct RasterEntry {
    original: RgbaImage,
    suppressed: Option<(RgbaImage, SuppressionStyle)>,
}

/// In-memory image set that keeps originals so suppression can be undone.
#[derive(Default)]
pub struct RasterSuppressor {
    entries: HashMap<String, RasterEntry>,
}

impl RasterSuppressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an image under `id`.
    pub fn insert(&mut self, id: impl Into<String>, image: RgbaImage) {
        self.entries.insert(
            id.into(),
            RasterEntry {
                original: image,
                suppressed: None,
            },
        );
    }

    /// The image as it should currently be displayed.
    pub fn view(&self, id: &str, hovered: bool) -> Option<&RgbaImage> {
        let entry = self.entries.get(id)?;
        match &entry.suppressed {
            Some((_, style)) if hovered && style.unblur_on_hover => Some(&entry.original),
            Some((image, _)) => Some(image),
            None => Some(&entry.original),
        }
    }

    pub fn is_suppressed(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| entry.suppressed.is_some())
    }
}

impl VisualSuppressor for RasterSuppressor {
    type Element = str;

    fn apply_visual_suppression(&mut self, element: &str, style: &SuppressionStyle) {
        if let Some(entry) = self.entries.get_mut(element) {
            let image = apply_visual_suppression(&entry.original, style);
            entry.suppressed = Some((image, *style));
        }
    }

    fn remove_visual_suppression(&mut self, element: &str) {
        if let Some(entry) = self.entries.get_mut(element) {
            entry.suppressed = None;
        }
    }
}
