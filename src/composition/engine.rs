use crate::error::{Error, Result};
use crate::flow::FlowField;
use crate::image::Mask;
use crate::resample::resize_mask;
use crate::warp::{validity_mask, warp, warp_backward_flow, warp_backward_input, Padding};
use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposerOptions {
    pub detach_flow_for_warping: bool,
    pub compute_cyclic_consistency: bool,
    pub alpha_1: f32,
    pub alpha_2: f32,
    /// Minimum warped coverage of a constant-ones map for a valid pixel.
    pub sampling_threshold: f32,
    /// Minimum coverage of the downsampled external mask.
    pub valid_mask_coverage: f32,
}

impl Default for ComposerOptions {
    fn default() -> Self {
        Self {
            detach_flow_for_warping: true,
            compute_cyclic_consistency: false,
            alpha_1: 0.01,
            alpha_2: 0.5,
            sampling_threshold: 0.2,
            valid_mask_coverage: 0.98,
        }
    }
}

/// Everything computed for one pyramid level.
#[derive(Clone, Debug)]
pub struct ComposedLevel {
    /// Composed target-prime → target flow.
    pub flow: FlowField,
    /// Target-prime → source estimate rescaled to the level, used for warping.
    pub warping_flow: FlowField,
    /// Source → target estimate warped into the target-prime frame.
    pub warped_source_to_target: FlowField,
    pub mask: Mask,
    pub cyclic_mask: Option<Mask>,
}

#[derive(Clone, Debug, Default)]
pub struct Composition {
    /// Coarse to fine, like the estimates.
    pub levels: Vec<ComposedLevel>,
}

impl Composition {
    pub fn composed_flows(&self) -> Vec<FlowField> {
        self.levels.iter().map(|l| l.flow.clone()).collect()
    }

    pub fn masks(&self) -> Vec<Mask> {
        self.levels.iter().map(|l| l.mask.clone()).collect()
    }

    pub fn cyclic_masks(&self) -> Option<Vec<Mask>> {
        self.levels.iter().map(|l| l.cyclic_mask.clone()).collect()
    }
}

#[derive(Clone, Debug, Default)]
pub struct FlowComposer {
    pub options: ComposerOptions,
}

fn check_levels(a: &[FlowField], b: &[FlowField], what: &str) -> Result<()> {
    if a.is_empty() || a.len() != b.len() {
        return Err(Error::shape(format!(
            "{what}: {} vs {} pyramid levels",
            a.len(),
            b.len()
        )));
    }
    Ok(())
}

/// Pixels where `|est + warped − gt|² <= alpha_1 (|est|² + |warped|² + |gt|²) + alpha_2`.
fn cyclic_consistency_mask(
    est: &FlowField,
    warped: &FlowField,
    synthetic: &FlowField,
    alpha_1: f32,
    alpha_2: f32,
) -> Mask {
    let (h, w) = est.dims();
    let gt = synthetic.resize_spatial(h, w);
    let mut mask = Mask::full(est.batch(), h, w, false);
    for b in 0..est.batch() {
        let planes = [
            (est.tensor().plane(b, 0).data, est.tensor().plane(b, 1).data),
            (warped.tensor().plane(b, 0).data, warped.tensor().plane(b, 1).data),
            (gt.tensor().plane(b, 0).data, gt.tensor().plane(b, 1).data),
        ];
        let [(ex, ey), (wx, wy), (gx, gy)] = planes;
        for (i, m) in mask.sample_mut(b).iter_mut().enumerate() {
            let (dx, dy) = (ex[i] + wx[i] - gx[i], ey[i] + wy[i] - gy[i]);
            let mag = ex[i] * ex[i] + ey[i] * ey[i] + wx[i] * wx[i] + wy[i] * wy[i] + gx[i] * gx[i] + gy[i] * gy[i];
            // NaN comparisons are false, so non-finite pixels stay invalid
            *m = dx * dx + dy * dy <= alpha_1 * mag + alpha_2;
        }
    }
    mask
}

impl FlowComposer {
    pub fn new(options: ComposerOptions) -> Self {
        Self { options }
    }

    fn level_scale(&self, level: &FlowField, flow_gt: &FlowField) -> (f32, f32) {
        let (h, w) = flow_gt.dims();
        let (h_, w_) = level.dims();
        (w_ as f32 / w.max(1) as f32, h_ as f32 / h.max(1) as f32)
    }

    /// Compose target-prime → target per level.
    ///
    /// `flow_gt` is the synthetic target-prime → target flow and fixes the
    /// canonical resolution; `valid_mask`, if any, must share its batch.
    pub fn compose(
        &self,
        flow_gt: &FlowField,
        valid_mask: Option<&Mask>,
        est_target_prime_to_source: &[FlowField],
        est_source_to_target: &[FlowField],
    ) -> Result<Composition> {
        check_levels(est_target_prime_to_source, est_source_to_target, "composition")?;
        if let Some(m) = valid_mask {
            if m.b != flow_gt.batch() {
                return Err(Error::shape(format!(
                    "valid mask {:?} vs ground truth {:?}",
                    m.shape(),
                    flow_gt.tensor().shape()
                )));
            }
        }
        let opts = &self.options;
        let mut levels = Vec::with_capacity(est_target_prime_to_source.len());
        for (idx, (tp_s, s_t)) in est_target_prime_to_source
            .iter()
            .zip(est_source_to_target)
            .enumerate()
        {
            tp_s.ensure_same_shape(s_t, "composition level")?;
            if tp_s.batch() != flow_gt.batch() {
                return Err(Error::shape(format!(
                    "level {idx} has batch {}, ground truth {}",
                    tp_s.batch(),
                    flow_gt.batch()
                )));
            }
            let (h_, w_) = tp_s.dims();
            let (sx, sy) = self.level_scale(tp_s, flow_gt);
            let warping_flow = tp_s.scale_channels(sx, sy);

            let warped = FlowField::new(warp(s_t.tensor(), &warping_flow, Padding::Zeros)?)?;
            let flow = tp_s.add(&warped)?;

            let mut mask = validity_mask(&warping_flow, opts.sampling_threshold)?;
            if let Some(valid) = valid_mask {
                mask = mask.and(&resize_mask(valid, h_, w_, opts.valid_mask_coverage))?;
            }
            let cyclic_mask = if opts.compute_cyclic_consistency {
                let cyclic = cyclic_consistency_mask(tp_s, &warped, flow_gt, opts.alpha_1, opts.alpha_2);
                mask = mask.and(&cyclic)?;
                Some(cyclic)
            } else {
                None
            };
            debug!(
                "composition level {idx}: {h_}x{w_} valid={:.3}",
                mask.total_fraction()
            );
            levels.push(ComposedLevel {
                flow,
                warping_flow,
                warped_source_to_target: warped,
                mask,
                cyclic_mask,
            });
        }
        Ok(Composition { levels })
    }

    /// Gradients of a loss with respect to both estimates, given its
    /// gradients with respect to each composed flow.
    ///
    /// Returns `(grad_target_prime_to_source, grad_source_to_target)`.
    pub fn backward(
        &self,
        composition: &Composition,
        flow_gt: &FlowField,
        est_source_to_target: &[FlowField],
        grad_composed: &[FlowField],
    ) -> Result<(Vec<FlowField>, Vec<FlowField>)> {
        if composition.levels.len() != est_source_to_target.len()
            || composition.levels.len() != grad_composed.len()
        {
            return Err(Error::shape(format!(
                "backward: {} levels, {} estimates, {} gradients",
                composition.levels.len(),
                est_source_to_target.len(),
                grad_composed.len()
            )));
        }
        let mut grad_tp_s = Vec::with_capacity(grad_composed.len());
        let mut grad_s_t = Vec::with_capacity(grad_composed.len());
        for ((level, s_t), g) in composition.levels.iter().zip(est_source_to_target).zip(grad_composed) {
            g.ensure_same_shape(&level.flow, "composed gradient")?;
            let to_s_t = warp_backward_input(g.tensor(), &level.warping_flow, Padding::Zeros)?;
            let mut to_tp_s = g.clone();
            if !self.options.detach_flow_for_warping {
                let (sx, sy) = self.level_scale(g, flow_gt);
                let through_warp =
                    warp_backward_flow(g.tensor(), s_t.tensor(), &level.warping_flow, Padding::Zeros)?;
                to_tp_s = to_tp_s.add(&through_warp.scale_channels(sx, sy))?;
            }
            grad_tp_s.push(to_tp_s);
            grad_s_t.push(FlowField::new(to_s_t)?);
        }
        Ok((grad_tp_s, grad_s_t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_flow(b: usize, h: usize, w: usize) -> FlowField {
        FlowField::from_fn(b, h, w, |bb, x, y| {
            (0.3 * x as f32 - 1.0 + bb as f32, 0.2 * y as f32 - 0.5)
        })
    }

    #[test]
    fn zero_first_flow_returns_second() {
        let gt = FlowField::zeros(1, 8, 8);
        let s_t = ramp_flow(1, 8, 8);
        let comp = FlowComposer::default()
            .compose(&gt, None, &[FlowField::zeros(1, 8, 8)], &[s_t.clone()])
            .unwrap();
        let flow = &comp.levels[0].flow;
        for (a, b) in flow.tensor().data.iter().zip(&s_t.tensor().data) {
            assert!((a - b).abs() < 1e-4);
        }
        assert_eq!(comp.levels[0].mask.count(0), 64);
    }

    #[test]
    fn flow_composed_with_inverse_is_identity() {
        let (h, w) = (12, 12);
        let gt = FlowField::zeros(1, h, w);
        let fwd = FlowField::constant(1, h, w, 2.0, -1.0);
        let inv = FlowField::constant(1, h, w, -2.0, 1.0);
        let comp = FlowComposer::default().compose(&gt, None, &[fwd], &[inv]).unwrap();
        let level = &comp.levels[0];
        for y in 0..h {
            for x in 0..w {
                if level.mask.get(0, y, x) {
                    assert!(level.flow.dx(0, y, x).abs() < 1e-5 && level.flow.dy(0, y, x).abs() < 1e-5);
                }
            }
        }
        assert!(!level.mask.get(0, 0, 0), "sampling above the image is invalid");
        assert!(level.mask.get(0, 5, 5));
    }

    #[test]
    fn diverged_estimates_are_masked_out() {
        let gt = FlowField::zeros(1, 8, 8);
        let s_t = ramp_flow(1, 8, 8);
        let options = ComposerOptions {
            compute_cyclic_consistency: true,
            ..ComposerOptions::default()
        };
        let composer = FlowComposer::new(options);
        for v in [1e30, -1e30, f32::INFINITY, f32::NAN] {
            let tp_s = FlowField::constant(1, 8, 8, v, 0.0);
            let comp = composer.compose(&gt, None, &[tp_s], &[s_t.clone()]).unwrap();
            let level = &comp.levels[0];
            assert_eq!(level.mask.count(0), 0, "estimate {v} left valid pixels");
            assert!(level.warped_source_to_target.tensor().data.iter().all(|&x| x == 0.0));
        }
        // a diverged source → target estimate fails the cyclic check
        let bad_s_t = FlowField::constant(1, 8, 8, f32::NAN, 1e30);
        let comp = composer
            .compose(&gt, None, &[FlowField::zeros(1, 8, 8)], &[bad_s_t])
            .unwrap();
        assert_eq!(comp.levels[0].mask.count(0), 0);
    }

    #[test]
    fn coarse_levels_rescale_the_warping_copy() {
        let gt = FlowField::zeros(1, 16, 16);
        let tp_s = FlowField::constant(1, 4, 4, 8.0, 0.0);
        let comp = FlowComposer::default()
            .compose(&gt, None, &[tp_s], &[FlowField::zeros(1, 4, 4)])
            .unwrap();
        assert!((comp.levels[0].warping_flow.dx(0, 0, 0) - 2.0).abs() < 1e-6);
        // 2 level pixels to the right: only the first two columns sample inside
        assert_eq!(comp.levels[0].mask.count(0), 8);
    }

    #[test]
    fn external_mask_is_downsampled_strictly() {
        let gt = FlowField::zeros(1, 8, 8);
        let mut valid = Mask::full(1, 8, 8, true);
        valid.data[0] = false;
        let comp = FlowComposer::default()
            .compose(&gt, Some(&valid), &[FlowField::zeros(1, 4, 4)], &[FlowField::zeros(1, 4, 4)])
            .unwrap();
        assert!(!comp.levels[0].mask.get(0, 0, 0));
        assert_eq!(comp.levels[0].mask.count(0), 15);
    }

    #[test]
    fn cyclic_check_only_removes_pixels() {
        let gt = ramp_flow(2, 10, 10);
        let tp_s = vec![ramp_flow(2, 5, 5), ramp_flow(2, 10, 10)];
        let s_t = vec![
            FlowField::constant(2, 5, 5, 3.0, -2.0),
            FlowField::from_fn(2, 10, 10, |_, x, _| (0.5 * x as f32, 0.0)),
        ];
        let plain = FlowComposer::default().compose(&gt, None, &tp_s, &s_t).unwrap();
        let cyclic = FlowComposer::new(ComposerOptions {
            compute_cyclic_consistency: true,
            ..ComposerOptions::default()
        })
        .compose(&gt, None, &tp_s, &s_t)
        .unwrap();
        let mut removed = 0;
        for (p, c) in plain.levels.iter().zip(&cyclic.levels) {
            for (&a, &b) in p.mask.data.iter().zip(&c.mask.data) {
                assert!(a || !b, "cyclic check added a pixel");
                removed += usize::from(a && !b);
            }
        }
        assert!(removed > 0);
        assert_eq!(cyclic.cyclic_masks().map(|m| m.len()), Some(2));
        assert!(plain.cyclic_masks().is_none());
    }

    #[test]
    fn level_mismatch_is_a_shape_error() {
        let gt = FlowField::zeros(1, 8, 8);
        let err = FlowComposer::default().compose(&gt, None, &[FlowField::zeros(1, 4, 4)], &[]);
        assert!(matches!(err, Err(Error::Shape(_))));
        let err = FlowComposer::default().compose(
            &gt,
            None,
            &[FlowField::zeros(1, 4, 4)],
            &[FlowField::zeros(1, 4, 5)],
        );
        assert!(matches!(err, Err(Error::Shape(_))));
    }

    #[test]
    fn detached_backward_passes_gradient_straight_to_first_flow() {
        let gt = FlowField::zeros(1, 6, 6);
        let tp_s = vec![FlowField::constant(1, 6, 6, 0.5, 0.25)];
        let s_t = vec![ramp_flow(1, 6, 6)];
        let g = vec![FlowField::constant(1, 6, 6, 1.0, -1.0)];
        let detached = FlowComposer::default();
        let comp = detached.compose(&gt, None, &tp_s, &s_t).unwrap();
        let (g1, g2) = detached.backward(&comp, &gt, &s_t, &g).unwrap();
        assert_eq!(g1[0], g[0]);
        assert!(g2[0].tensor().data.iter().any(|v| *v != 0.0));

        let attached = FlowComposer::new(ComposerOptions {
            detach_flow_for_warping: false,
            ..ComposerOptions::default()
        });
        let comp = attached.compose(&gt, None, &tp_s, &s_t).unwrap();
        let (g1, _) = attached.backward(&comp, &gt, &s_t, &g).unwrap();
        // d/dF1 of F2(p + F1) for a ramp F2 is its slope: 0.3 in x, 0.2 in y
        assert!((g1[0].dx(0, 2, 2) - (1.0 + 0.3)).abs() < 1e-4, "{}", g1[0].dx(0, 2, 2));
        assert!((g1[0].dy(0, 2, 2) - (-1.0 - 0.2)).abs() < 1e-4, "{}", g1[0].dy(0, 2, 2));
    }
}
