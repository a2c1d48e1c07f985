//! 64-bit difference hash ("dHash").
//!
//! The bitmap is reduced to a 9x8 luminance grid and each bit records whether a
//! pixel is brighter than its right-hand neighbour. This survives re-encoding,
//! resizing and orientation-metadata changes, but a mirrored copy or a large crop
//! produces an unrelated fingerprint.

use image::{imageops::FilterType, DynamicImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const GRID_WIDTH: u32 = 9;
const GRID_HEIGHT: u32 = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("Invalid fingerprint data: {value:?}")]
    InvalidData { value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    pub fn from_bitmap(bitmap: &DynamicImage) -> Self {
        let grid = image::imageops::resize(
            &bitmap.to_luma8(),
            GRID_WIDTH,
            GRID_HEIGHT,
            FilterType::Triangle,
        );

        let mut bits = 0u64;
        for row in 0..GRID_HEIGHT {
            for col in 0..GRID_WIDTH - 1 {
                let left = grid.get_pixel(col, row).0[0];
                let right = grid.get_pixel(col + 1, row).0[0];
                bits <<= 1;
                if left > right {
                    bits |= 1;
                }
            }
        }
        Fingerprint(bits)
    }

    /// Number of differing bits.
    pub fn distance(&self, other: &Fingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_hex(value: &str) -> Result<Self, FingerprintError> {
        let invalid = || FingerprintError::InvalidData {
            value: value.to_string(),
        };
        if value.len() != 16 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        u64::from_str_radix(value, 16)
            .map(Fingerprint)
            .map_err(|_| invalid())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
