//! Per-pixel flow errors aggregated with per-sample normalisation.
//!
//! For every sample the error is summed over its valid pixels and scaled by
//! `H·W / (valid + 1e-6)`, so a sample with a sparse mask weighs as much as a
//! dense one. Pixels that are masked out or whose error is NaN/Inf contribute
//! neither value nor gradient.
use crate::error::{Error, Result};
use crate::flow::FlowField;
use crate::image::Mask;
use crate::preprocess::MASK_RESIZE_COVERAGE;
use crate::resample::resize_mask;
use serde::{Deserialize, Serialize};

const CHARBONNIER_EPS: f32 = 0.01;
const CHARBONNIER_ALPHA: f32 = 0.4;
const VALID_COUNT_EPS: f32 = 1e-6;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointwiseLoss {
    /// Euclidean end-point error.
    #[default]
    Epe,
    /// Sum of absolute component errors.
    L1,
    /// `(L1 + 0.01)^0.4`.
    Charbonnier,
}

impl PointwiseLoss {
    pub fn name(&self) -> &'static str {
        match self {
            PointwiseLoss::Epe => "EPE",
            PointwiseLoss::L1 => "L1",
            PointwiseLoss::Charbonnier => "L1_charbonnier",
        }
    }

    /// Error at one pixel and its derivative with respect to `(dx, dy)`,
    /// where `d = est − gt`.
    #[inline]
    fn pixel(&self, dx: f32, dy: f32) -> (f32, f32, f32) {
        match self {
            PointwiseLoss::Epe => {
                let e = (dx * dx + dy * dy).sqrt();
                if e > 0.0 {
                    (e, dx / e, dy / e)
                } else {
                    (e, 0.0, 0.0)
                }
            }
            PointwiseLoss::L1 => (dx.abs() + dy.abs(), sign(dx), sign(dy)),
            PointwiseLoss::Charbonnier => {
                let base = dx.abs() + dy.abs() + CHARBONNIER_EPS;
                let e = base.powf(CHARBONNIER_ALPHA);
                let de = CHARBONNIER_ALPHA * base.powf(CHARBONNIER_ALPHA - 1.0);
                (e, de * sign(dx), de * sign(dy))
            }
        }
    }
}

#[inline]
fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// A scalar loss and its gradient with respect to the estimate.
#[derive(Clone, Debug)]
pub struct LossValue {
    pub value: f32,
    pub grad: FlowField,
    /// Valid pixels per sample after NaN/Inf exclusion.
    pub valid_counts: Vec<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointwiseObjective {
    pub kind: PointwiseLoss,
    /// Divide the batch sum by the batch size.
    pub sum_normalized: bool,
}

impl Default for PointwiseObjective {
    fn default() -> Self {
        Self {
            kind: PointwiseLoss::Epe,
            sum_normalized: true,
        }
    }
}

impl PointwiseObjective {
    pub fn new(kind: PointwiseLoss, sum_normalized: bool) -> Self {
        Self { kind, sum_normalized }
    }

    pub fn evaluate(&self, gt: &FlowField, est: &FlowField, mask: Option<&Mask>) -> Result<LossValue> {
        gt.ensure_same_shape(est, "loss operands")?;
        let (b, (h, w)) = (gt.batch(), gt.dims());
        let resized;
        let mask = match mask {
            Some(m) if m.b != b => {
                return Err(Error::shape(format!(
                    "loss mask {:?} vs flow {:?}",
                    m.shape(),
                    gt.tensor().shape()
                )))
            }
            Some(m) if (m.h, m.w) != (h, w) => {
                resized = resize_mask(m, h, w, MASK_RESIZE_COVERAGE);
                Some(&resized)
            }
            other => other,
        };

        let n = h * w;
        let mut grad = FlowField::zeros(b, h, w);
        let mut value = 0.0f64;
        let mut valid_counts = Vec::with_capacity(b);
        let mut errors = vec![0.0f32; n];
        let mut pixel_grads = vec![(0.0f32, 0.0f32); n];
        let mut valid = vec![false; n];
        for bb in 0..b {
            let (gx, gy) = (gt.tensor().plane(bb, 0).data, gt.tensor().plane(bb, 1).data);
            let (ex, ey) = (est.tensor().plane(bb, 0).data, est.tensor().plane(bb, 1).data);
            let sample_mask = mask.map(|m| m.sample(bb));
            let mut count = 0usize;
            for i in 0..n {
                let (e, ddx, ddy) = self.kind.pixel(ex[i] - gx[i], ey[i] - gy[i]);
                let ok = e.is_finite() && sample_mask.map_or(true, |m| m[i]);
                valid[i] = ok;
                errors[i] = e;
                pixel_grads[i] = (ddx, ddy);
                count += usize::from(ok);
            }
            let norm = n as f32 / (count as f32 + VALID_COUNT_EPS);
            let mut sample_sum = 0.0f64;
            let t = grad.tensor_mut();
            for i in 0..n {
                if valid[i] {
                    sample_sum += errors[i] as f64;
                    let (ddx, ddy) = pixel_grads[i];
                    let idx_x = t.idx(bb, 0, i / w, i % w);
                    let idx_y = t.idx(bb, 1, i / w, i % w);
                    t.data[idx_x] = ddx * norm;
                    t.data[idx_y] = ddy * norm;
                }
            }
            value += sample_sum * norm as f64;
            valid_counts.push(count);
        }
        let mut value = value as f32;
        if self.sum_normalized && b > 0 {
            value /= b as f32;
            grad = grad.scale_channels(1.0 / b as f32, 1.0 / b as f32);
        }
        for v in grad.tensor_mut().data.iter_mut() {
            if !v.is_finite() {
                *v = 0.0;
            }
        }
        Ok(LossValue {
            value,
            grad,
            valid_counts,
        })
    }
}
