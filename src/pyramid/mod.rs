//! Multi-resolution image pyramid with separable blur and 2× decimation.
//!
//! Every `(batch, channel)` plane is filtered and decimated independently;
//! level 0 is the input itself and each further level halves both
//! dimensions (rounding up). Borders clamp to the image extent.
//!
//! [`GaussianPyramidExtractor`] exposes the pyramid as a
//! [`FeatureExtractor`](crate::actor::FeatureExtractor) so that backbones
//! without learned features can still share one pyramid per image across
//! the flow directions of a step.
use crate::actor::{FeatureExtractor, FeaturePyramid};
use crate::error::{Error, Result};
use crate::image::{Plane, Tensor};
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Symmetric 1D kernel applied along rows, then columns.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SeparableKernel(&'static [f32]);

impl SeparableKernel {
    #[inline]
    pub fn taps(&self) -> &[f32] {
        self.0
    }
}

impl Default for SeparableKernel {
    fn default() -> Self {
        GAUSSIAN_5TAP
    }
}

/// Binomial approximation of a Gaussian, `[1, 4, 6, 4, 1] / 16`.
pub const GAUSSIAN_5TAP: SeparableKernel = SeparableKernel(&[0.0625, 0.25, 0.375, 0.25, 0.0625]);

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PyramidOptions {
    /// Number of levels (>= 1).
    pub levels: usize,
    /// Number of initial downscale steps that blur before decimating.
    pub blur_levels: usize,
    #[serde(skip)]
    pub kernel: SeparableKernel,
}

impl Default for PyramidOptions {
    fn default() -> Self {
        Self::new(4)
    }
}

impl PyramidOptions {
    pub fn new(levels: usize) -> Self {
        Self {
            levels,
            blur_levels: usize::MAX,
            kernel: GAUSSIAN_5TAP,
        }
    }

    pub fn with_blur_levels(mut self, blur_levels: usize) -> Self {
        self.blur_levels = blur_levels;
        self
    }
}

/// Pyramid of every plane of `t`, finest first; level `i` is
/// `(B, C, ⌈H/2^i⌉, ⌈W/2^i⌉)`.
pub fn build_tensor_pyramid(t: &Tensor, options: &PyramidOptions) -> Result<Vec<Tensor>> {
    if t.plane_len() == 0 || t.b * t.c == 0 {
        return Err(Error::shape(format!("cannot build a pyramid of {:?}", t.shape())));
    }
    let count = options.levels.max(1);
    let mut levels = Vec::with_capacity(count);
    levels.push(t.clone());
    for lvl in 1..count {
        let prev = &levels[lvl - 1];
        let mut next = Tensor::zeros(prev.b, prev.c, prev.h.div_ceil(2), prev.w.div_ceil(2));
        let (c, n) = (prev.c, next.plane_len());
        let blur = lvl <= options.blur_levels;
        next.data.par_chunks_mut(n).enumerate().for_each(|(i, dst)| {
            let src = prev.plane(i / c, i % c);
            if blur {
                blur_decimate(src, dst, options.kernel, &mut RowCache::default());
            } else {
                decimate(src, dst);
            }
        });
        debug!("pyramid level {lvl}: {}x{} blur={blur}", next.w, next.h);
        levels.push(next);
    }
    Ok(levels)
}

/// Classical Gaussian pyramid used as a parameter-free feature extractor.
#[derive(Clone, Copy, Debug, Default)]
pub struct GaussianPyramidExtractor {
    pub options: PyramidOptions,
}

impl GaussianPyramidExtractor {
    pub fn new(levels: usize) -> Self {
        Self {
            options: PyramidOptions::new(levels),
        }
    }
}

impl FeatureExtractor for GaussianPyramidExtractor {
    fn pyramid(&self, image: &Tensor) -> Result<FeaturePyramid> {
        Ok(FeaturePyramid {
            levels: build_tensor_pyramid(image, &self.options)?,
        })
    }
}

/// Output width of a decimated plane of `src`.
#[inline]
fn out_width(src: &Plane<'_>) -> usize {
    src.w.div_ceil(2)
}

fn decimate(src: Plane<'_>, dst: &mut [f32]) {
    let ow = out_width(&src);
    for (y, out_row) in dst.chunks_mut(ow).enumerate() {
        let src_row = src.row((2 * y).min(src.h - 1));
        for (x, out) in out_row.iter_mut().enumerate() {
            *out = src_row[(2 * x).min(src.w - 1)];
        }
    }
}

/// Horizontally filtered and decimated source rows, keyed by source row, so
/// that the vertical pass reuses rows shared by consecutive output rows.
#[derive(Default)]
struct RowCache {
    rows: Vec<f32>,
    keys: Vec<Option<usize>>,
}

fn blur_decimate(src: Plane<'_>, dst: &mut [f32], kernel: SeparableKernel, cache: &mut RowCache) {
    let taps = kernel.taps();
    let ow = out_width(&src);
    if ow == 0 || taps.is_empty() {
        return;
    }
    let radius = (taps.len() / 2) as isize;
    cache.rows.clear();
    cache.rows.resize(ow * taps.len(), 0.0);
    cache.keys.clear();
    cache.keys.resize(taps.len(), None);

    for (y, out_row) in dst.chunks_mut(ow).enumerate() {
        for (k, key) in cache.keys.iter_mut().enumerate() {
            let sy = clamp_index(2 * y as isize + k as isize - radius, src.h);
            if *key != Some(sy) {
                let slot = &mut cache.rows[k * ow..(k + 1) * ow];
                blur_row_decimate(src.row(sy), slot, taps, radius);
                *key = Some(sy);
            }
        }
        for (x, out) in out_row.iter_mut().enumerate() {
            *out = taps
                .iter()
                .enumerate()
                .map(|(k, &tap)| tap * cache.rows[k * ow + x])
                .sum();
        }
    }
}

fn blur_row_decimate(row: &[f32], out: &mut [f32], taps: &[f32], radius: isize) {
    for (x, px) in out.iter_mut().enumerate() {
        let centre = 2 * x as isize - radius;
        *px = taps
            .iter()
            .enumerate()
            .map(|(k, &tap)| tap * row[clamp_index(centre + k as isize, row.len())])
            .sum();
    }
}

#[inline]
fn clamp_index(idx: isize, len: usize) -> usize {
    idx.clamp(0, len.saturating_sub(1) as isize) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_sizes_halve_rounding_up() {
        let t = Tensor::filled(2, 3, 9, 16, 1.0);
        let levels = build_tensor_pyramid(&t, &PyramidOptions::new(3)).unwrap();
        let shapes: Vec<_> = levels.iter().map(|l| l.shape()).collect();
        assert_eq!(shapes, vec![[2, 3, 9, 16], [2, 3, 5, 8], [2, 3, 3, 4]]);
    }

    #[test]
    fn constant_planes_stay_constant() {
        let mut t = Tensor::zeros(1, 2, 8, 8);
        t.plane_mut(0, 0).fill(0.25);
        t.plane_mut(0, 1).fill(0.75);
        let levels = build_tensor_pyramid(&t, &PyramidOptions::new(3)).unwrap();
        let last = levels.last().unwrap();
        assert!(last.plane(0, 0).data.iter().all(|v| (v - 0.25).abs() < 1e-6));
        assert!(last.plane(0, 1).data.iter().all(|v| (v - 0.75).abs() < 1e-6));
    }

    #[test]
    fn unblurred_decimation_picks_even_pixels() {
        let data = (0..16).map(|v| v as f32).collect();
        let t = Tensor::from_vec(1, 1, 4, 4, data).unwrap();
        let levels = build_tensor_pyramid(&t, &PyramidOptions::new(2).with_blur_levels(0)).unwrap();
        assert_eq!(levels[1].plane(0, 0).data, &[0.0, 2.0, 8.0, 10.0]);
    }

    #[test]
    fn blur_smooths_an_impulse() {
        let mut t = Tensor::zeros(1, 1, 8, 8);
        t.set(0, 0, 4, 4, 16.0);
        let levels = build_tensor_pyramid(&t, &PyramidOptions::new(2)).unwrap();
        let p = levels[1].plane(0, 0);
        // 16 · 0.375² at the centre sample
        assert!((p.get(2, 2) - 2.25).abs() < 1e-5);
        assert!((p.data.iter().sum::<f32>() - 4.0).abs() < 1e-4);
    }

    #[test]
    fn extractor_reports_levels() {
        let pyr = GaussianPyramidExtractor::new(4)
            .pyramid(&Tensor::zeros(1, 3, 32, 32))
            .unwrap();
        assert_eq!(pyr.levels.len(), 4);
        assert_eq!(pyr.levels[3].shape(), [1, 3, 4, 4]);
    }
}
