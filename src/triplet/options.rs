use crate::warp::Padding;
use serde::{Deserialize, Serialize};

/// Geometry and masking options of the triplet builders.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TripletOptions {
    /// Centre crop `(h, w)` taken from the full-resolution images.
    pub crop_size: (usize, usize),
    /// Final `(h, w)` after the crop; equal to the crop size to skip resizing.
    pub output_size: (usize, usize),
    pub padding_mode: Padding,
    /// Below this fraction of valid correspondences the correspondence mask
    /// replaces the zero-border mask.
    pub min_percent_valid_corr: f32,
    pub compute_mask_zero_borders: bool,
    /// Seed used to rebuild identical triplets at every validation pass.
    pub validation_seed: Option<u64>,
}

impl Default for TripletOptions {
    fn default() -> Self {
        Self {
            crop_size: (256, 256),
            output_size: (256, 256),
            padding_mode: Padding::Zeros,
            min_percent_valid_corr: 0.1,
            compute_mask_zero_borders: false,
            validation_seed: None,
        }
    }
}

impl TripletOptions {
    pub fn with_crop(mut self, h: usize, w: usize) -> Self {
        self.crop_size = (h, w);
        self.output_size = (h, w);
        self
    }

    pub fn with_output(mut self, h: usize, w: usize) -> Self {
        self.output_size = (h, w);
        self
    }
}
