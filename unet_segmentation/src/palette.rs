use image::RgbImage;
use ndarray::Array3;

use crate::error::{Result, SegmentationError};

/// Mask colors of the dataset, as RGB triples stored on disk.
pub const CLASS_COLORS: [(&str, [u8; 3]); 5] = [
    ("nonmaskingbackground", [255, 0, 0]),
    ("maskingbackground", [0, 255, 0]),
    ("animal", [0, 0, 255]),
    ("nonmaskingforegroundattention", [255, 255, 255]),
    ("unlabelled", [0, 0, 0]),
];

pub fn class_names() -> impl Iterator<Item = &'static str> {
    CLASS_COLORS.iter().map(|(name, _)| *name)
}

pub fn class_color(name: &str) -> Result<[u8; 3]> {
    CLASS_COLORS
        .iter()
        .find(|(class, _)| *class == name)
        .map(|(_, color)| *color)
        .ok_or_else(|| SegmentationError::UnknownClass(name.to_string()))
}

/// An ordered, validated list of classes to extract from a mask.
///
/// Every name is resolved against [`CLASS_COLORS`] when the selection is
/// built, so decoding never has to look up a class per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSelection {
    names: Vec<String>,
    colors: Vec<[u8; 3]>,
}

impl ClassSelection {
    pub fn new<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        if names.is_empty() {
            return Err(SegmentationError::EmptySelection);
        }
        let colors = names
            .iter()
            .map(|name| class_color(name.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let names = names.iter().map(|name| name.as_ref().to_string()).collect();

        Ok(Self { names, colors })
    }

    /// Selects every known class, in palette order.
    pub fn all() -> Self {
        Self {
            names: class_names().map(String::from).collect(),
            colors: CLASS_COLORS.iter().map(|(_, color)| *color).collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn colors(&self) -> &[[u8; 3]] {
        &self.colors
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Splits an RGB mask into one binary plane per selected class.
///
/// The result has shape `(height, width, selection.len())`. A pixel whose
/// color matches none of the selected classes is zero in every plane.
pub fn decode_mask(mask: &RgbImage, selection: &ClassSelection) -> Array3<f32> {
    let (width, height) = mask.dimensions();
    let mut planes = Array3::<f32>::zeros((height as usize, width as usize, selection.len()));

    for (x, y, pixel) in mask.enumerate_pixels() {
        for (k, color) in selection.colors().iter().enumerate() {
            if pixel.0 == *color {
                planes[[y as usize, x as usize, k]] = 1.0;
            }
        }
    }
    planes
}

pub fn decode<S: AsRef<str>>(mask: &RgbImage, classes: &[S]) -> Result<Array3<f32>> {
    let selection = ClassSelection::new(classes)?;
    Ok(decode_mask(mask, &selection))
}
