use crate::core::exif::Orientation;
use image::{imageops::FilterType, DynamicImage};

/// Produces the square, upright bitmaps the analyzers work on.
#[derive(Debug, Clone)]
pub struct BitmapNormalizer {
    filter: FilterType,
}

impl BitmapNormalizer {
    pub fn new() -> Self {
        Self {
            filter: FilterType::Triangle,
        }
    }

    pub fn normalize(
        &self,
        image: DynamicImage,
        orientation: Orientation,
        target_size: u32,
    ) -> DynamicImage {
        let upright = apply_orientation(image, orientation);
        let size = target_size.max(1);
        upright.resize_exact(size, size, self.filter)
    }
}

impl Default for BitmapNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn apply_orientation(image: DynamicImage, orientation: Orientation) -> DynamicImage {
    match orientation {
        Orientation::Normal => image,
        Orientation::FlipHorizontal => image.fliph(),
        Orientation::Rotate180 => image.rotate180(),
        Orientation::FlipVertical => image.flipv(),
        Orientation::Transpose => image.rotate90().fliph(),
        Orientation::Rotate90 => image.rotate90(),
        Orientation::Transverse => image.rotate270().fliph(),
        Orientation::Rotate270 => image.rotate270(),
    }
}
