//! Weighted sum of a point-wise objective over the levels of a
//! coarse-to-fine estimate.
use super::pointwise::PointwiseObjective;
use super::Stats;
use crate::error::{Error, Result};
use crate::flow::FlowField;
use crate::image::Mask;
use crate::preprocess::MASK_RESIZE_COVERAGE;
use crate::resample::{resize_bilinear, resize_bilinear_backward, resize_mask};
use log::debug;
use serde::{Deserialize, Serialize};

/// How ground truth is brought down to a level's resolution.
///
/// Synthetic flows are dense, so bilinear is the default. Sparse ground
/// truth (keypoint matches, datasets with holes) needs `SparseMaxPool`:
/// bilinear would average isolated values with the zeros around them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GtResize {
    #[default]
    Bilinear,
    /// Positive/negative max pooling, for sparse ground truth.
    SparseMaxPool,
}

/// Masks handed to a multi-scale evaluation.
#[derive(Clone, Copy, Debug)]
pub enum LevelMasks<'a> {
    None,
    /// One mask at ground-truth resolution, resized per level.
    Shared(&'a Mask),
    /// One mask per level, coarse to fine.
    PerLevel(&'a [Mask]),
}

impl<'a> From<Option<&'a Mask>> for LevelMasks<'a> {
    fn from(mask: Option<&'a Mask>) -> Self {
        mask.map_or(LevelMasks::None, LevelMasks::Shared)
    }
}

#[derive(Clone, Debug)]
pub struct MultiScaleOutput {
    pub value: f32,
    pub stats: Stats,
    /// Gradient with respect to each estimate level, coarse to fine.
    pub grads: Vec<FlowField>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiScaleLoss {
    /// One weight per level, coarse to fine.
    pub level_weights: Vec<f32>,
    pub objective: PointwiseObjective,
    /// Bring ground truth to each level; otherwise upsample each estimate
    /// to the ground-truth resolution.
    pub downsample_gt: bool,
    pub gt_resize: GtResize,
}

impl Default for MultiScaleLoss {
    fn default() -> Self {
        Self {
            level_weights: vec![0.32, 0.08, 0.02, 0.01, 0.005],
            objective: PointwiseObjective::default(),
            downsample_gt: true,
            gt_resize: GtResize::Bilinear,
        }
    }
}

impl MultiScaleLoss {
    /// Evaluate `estimates` (coarse to fine) against `gt`.
    ///
    /// Estimates carry displacements in pixels of the ground-truth
    /// resolution, so ground truth is resized spatially without rescaling
    /// its values.
    pub fn evaluate(&self, estimates: &[FlowField], gt: &FlowField, masks: LevelMasks<'_>) -> Result<MultiScaleOutput> {
        if estimates.is_empty() {
            return Err(Error::shape("multi-scale loss needs at least one estimate level"));
        }
        if self.level_weights.len() < estimates.len() {
            return Err(Error::config(format!(
                "{} level weights for {} estimate levels",
                self.level_weights.len(),
                estimates.len()
            )));
        }
        if let LevelMasks::PerLevel(m) = masks {
            if m.len() != estimates.len() {
                return Err(Error::shape(format!(
                    "{} masks for {} estimate levels",
                    m.len(),
                    estimates.len()
                )));
            }
        }
        let (h, w) = gt.dims();
        let name = self.objective.kind.name();
        let mut stats = Stats::new();
        let mut total = 0.0f32;
        let mut grads = Vec::with_capacity(estimates.len());
        for (idx, (est, &weight)) in estimates.iter().zip(&self.level_weights).enumerate() {
            if est.batch() != gt.batch() {
                return Err(Error::shape(format!(
                    "level {idx} batch {} vs ground truth {}",
                    est.batch(),
                    gt.batch()
                )));
            }
            let (h_, w_) = est.dims();
            let level_mask = match masks {
                LevelMasks::None => None,
                LevelMasks::Shared(m) => Some(m.clone()),
                LevelMasks::PerLevel(m) => Some(m[idx].clone()),
            };
            let (value, grad) = if self.downsample_gt {
                let gt_level = match self.gt_resize {
                    GtResize::Bilinear => gt.resize_spatial(h_, w_),
                    GtResize::SparseMaxPool => gt.sparse_downsample(h_, w_),
                };
                let mask = level_mask.map(|m| resize_mask(&m, h_, w_, MASK_RESIZE_COVERAGE));
                let out = self.objective.evaluate(&gt_level, est, mask.as_ref())?;
                (out.value, out.grad)
            } else {
                let up = FlowField::new(resize_bilinear(est.tensor(), h, w))?;
                let mask = level_mask.map(|m| resize_mask(&m, h, w, MASK_RESIZE_COVERAGE));
                let out = self.objective.evaluate(gt, &up, mask.as_ref())?;
                let back = resize_bilinear_backward(out.grad.tensor(), h_, w_);
                (out.value, FlowField::new(back)?)
            };
            debug!("multi-scale level {idx} ({h_}x{w_}): {name}={value:.4} weight={weight}");
            stats.insert(format!("{name}_level_{idx}"), value);
            total += weight * value;
            grads.push(grad.scale_channels(weight, weight));
        }
        stats.insert(format!("{name}/total"), total);
        Ok(MultiScaleOutput {
            value: total,
            stats,
            grads,
        })
    }
}
