use crate::composition::Composition;
use crate::image::Mask;
use serde::{Deserialize, Serialize};

/// Coverage of the training mask at one level of the composition.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelMaskReport {
    /// Level index, 0 = coarsest.
    pub level_index: usize,
    pub width: usize,
    pub height: usize,
    /// Fraction of pixels supervised by the composed flow.
    pub valid_fraction: f32,
    /// Fraction kept by the cyclic-consistency test, when computed.
    pub cyclic_fraction: Option<f32>,
}

/// Mask statistics of a whole composition, coarse to fine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskStage {
    pub levels: Vec<LevelMaskReport>,
}

impl MaskStage {
    pub fn from_composition(composition: &Composition) -> Self {
        let levels = composition
            .levels
            .iter()
            .enumerate()
            .map(|(level, lvl)| {
                let [_, height, width] = lvl.mask.shape();
                LevelMaskReport {
                    level_index: level,
                    width,
                    height,
                    valid_fraction: lvl.mask.total_fraction(),
                    cyclic_fraction: lvl.cyclic_mask.as_ref().map(Mask::total_fraction),
                }
            })
            .collect();
        Self { levels }
    }
}
