//! Evaluation metrics against dense ground truth.
//!
//! Estimates are bilinearly upsampled to the ground-truth resolution and
//! compared over the valid pixels of the whole batch. With no valid pixel
//! the metrics are `NaN`, which callers may filter.
use crate::error::{Error, Result};
use crate::flow::FlowField;
use crate::image::Mask;
use crate::resample::resize_bilinear;

/// Default PCK thresholds in pixels.
pub const PCK_THRESHOLDS: [f32; 3] = [1.0, 3.0, 5.0];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RealMetrics {
    pub epe: f32,
    /// Fraction of valid pixels with end-point error at most each threshold.
    pub pck: [f32; 3],
}

/// Thresholds scaled with the image size, used for semantic matching.
pub fn semantic_thresholds(h: usize, w: usize) -> [f32; 3] {
    let m = h.max(w) as f32;
    [m * 0.05, m * 0.1, m * 0.15]
}

fn endpoint_errors(est: &FlowField, gt: &FlowField, mask: &Mask) -> Result<Vec<f32>> {
    let (h, w) = gt.dims();
    if est.batch() != gt.batch() || mask.shape() != [gt.batch(), h, w] {
        return Err(Error::shape(format!(
            "metrics: estimate {:?}, ground truth {:?}, mask {:?}",
            est.tensor().shape(),
            gt.tensor().shape(),
            mask.shape()
        )));
    }
    let up = FlowField::new(resize_bilinear(est.tensor(), h, w))?;
    let mut errors = Vec::new();
    for b in 0..gt.batch() {
        let m = mask.sample(b);
        let (ex, ey) = (up.tensor().plane(b, 0).data, up.tensor().plane(b, 1).data);
        let (gx, gy) = (gt.tensor().plane(b, 0).data, gt.tensor().plane(b, 1).data);
        for i in (0..h * w).filter(|&i| m[i]) {
            let (dx, dy) = (ex[i] - gx[i], ey[i] - gy[i]);
            errors.push((dx * dx + dy * dy).sqrt());
        }
    }
    Ok(errors)
}

fn mean(values: impl Iterator<Item = f32>, n: usize) -> f32 {
    if n == 0 {
        return f32::NAN;
    }
    (values.map(f64::from).sum::<f64>() / n as f64) as f32
}

/// Average end-point error over the valid pixels of the batch.
pub fn real_epe(est: &FlowField, gt: &FlowField, mask: &Mask) -> Result<f32> {
    let errors = endpoint_errors(est, gt, mask)?;
    Ok(mean(errors.iter().copied(), errors.len()))
}

/// EPE and PCK at `thresholds`.
pub fn real_metrics(est: &FlowField, gt: &FlowField, mask: &Mask, thresholds: [f32; 3]) -> Result<RealMetrics> {
    let errors = endpoint_errors(est, gt, mask)?;
    let n = errors.len();
    let pck = thresholds.map(|t| mean(errors.iter().map(|&e| if e <= t { 1.0 } else { 0.0 }), n));
    Ok(RealMetrics {
        epe: mean(errors.iter().copied(), n),
        pck,
    })
}

/// F-beta score of a predicted binary mask, averaged over the batch.
pub fn fbeta_score(truth: &Mask, prediction: &Mask, beta: f32) -> Result<f32> {
    const EPS: f32 = 1e-8;
    if truth.shape() != prediction.shape() {
        return Err(Error::shape(format!(
            "fbeta: {:?} vs {:?}",
            truth.shape(),
            prediction.shape()
        )));
    }
    let beta2 = beta * beta;
    let mut acc = 0.0f32;
    for b in 0..truth.b {
        let (t, p) = (truth.sample(b), prediction.sample(b));
        let tp = t.iter().zip(p).filter(|(a, b)| **a && **b).count() as f32;
        let precision = tp / (prediction.count(b) as f32 + EPS);
        let recall = tp / (truth.count(b) as f32 + EPS);
        acc += precision * recall / (precision * beta2 + recall + EPS) * (1.0 + beta2);
    }
    Ok(acc / truth.b.max(1) as f32)
}
