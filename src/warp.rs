//! Backward warping of tensors by dense flow fields.
//!
//! `warp(t, flow)` samples `t` at `p + flow(p)` for every output pixel `p`
//! with bilinear interpolation. The sampling grid is formed in pixel units,
//! normalised to `[-1, 1]` by `max(dim - 1, 1)` and mapped back with aligned
//! corners, so a zero flow reproduces the input exactly.
//!
//! Padding decides what an out-of-range tap reads: [`Padding::Zeros`] reads
//! zero (which is what makes synthetic borders detectable), [`Padding::Border`]
//! clamps the sampling position to the image extent.
//!
//! The two `*_backward` functions are the exact derivatives of `warp` with
//! respect to the sampled tensor and to the flow. They are what the
//! composition engine uses to propagate loss gradients.
use crate::error::{Error, Result};
use crate::flow::FlowField;
use crate::image::{Mask, Tensor};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    #[default]
    Zeros,
    Border,
}

/// Bilinear footprint of one sampling position.
#[derive(Clone, Copy, Debug)]
struct Footprint {
    x0: isize,
    y0: isize,
    wx: f32,
    wy: f32,
    /// d(source x)/d(flow x); zero when the coordinate was clamped.
    dsx: f32,
    dsy: f32,
}

#[inline]
fn source_coord(p: f32, size: usize) -> f32 {
    let denom = size.saturating_sub(1).max(1) as f32;
    let normalized = 2.0 * p / denom - 1.0;
    (normalized + 1.0) * 0.5 * size.saturating_sub(1) as f32
}

#[inline]
fn footprint(x: usize, y: usize, fx: f32, fy: f32, w: usize, h: usize, padding: Padding) -> Option<Footprint> {
    let mut sx = source_coord(x as f32 + fx, w);
    let mut sy = source_coord(y as f32 + fy, h);
    if !sx.is_finite() || !sy.is_finite() {
        return None;
    }
    let mut dsx = if w > 1 { 1.0 } else { 0.0 };
    let mut dsy = if h > 1 { 1.0 } else { 0.0 };
    if padding == Padding::Zeros {
        // every tap of a position this far out reads zero padding
        if !(-2.0..=(w + 1) as f32).contains(&sx) || !(-2.0..=(h + 1) as f32).contains(&sy) {
            return None;
        }
    } else {
        let (max_x, max_y) = ((w - 1) as f32, (h - 1) as f32);
        if sx < 0.0 || sx > max_x {
            sx = sx.clamp(0.0, max_x);
            dsx = 0.0;
        }
        if sy < 0.0 || sy > max_y {
            sy = sy.clamp(0.0, max_y);
            dsy = 0.0;
        }
    }
    let (fx0, fy0) = (sx.floor(), sy.floor());
    Some(Footprint {
        x0: fx0 as isize,
        y0: fy0 as isize,
        wx: sx - fx0,
        wy: sy - fy0,
        dsx,
        dsy,
    })
}

#[inline]
fn tap(plane: &[f32], x: isize, y: isize, w: usize, h: usize) -> f32 {
    if x < 0 || y < 0 || x as usize >= w || y as usize >= h {
        0.0
    } else {
        plane[y as usize * w + x as usize]
    }
}

#[inline]
fn taps(plane: &[f32], f: &Footprint, w: usize, h: usize) -> [f32; 4] {
    [
        tap(plane, f.x0, f.y0, w, h),
        tap(plane, f.x0 + 1, f.y0, w, h),
        tap(plane, f.x0, f.y0 + 1, w, h),
        tap(plane, f.x0 + 1, f.y0 + 1, w, h),
    ]
}

fn check_operands(t: &Tensor, flow: &FlowField) -> Result<()> {
    if t.b != flow.batch() || (t.h, t.w) != flow.dims() {
        return Err(Error::shape(format!(
            "warp operand {:?} does not match flow {:?}",
            t.shape(),
            flow.tensor().shape()
        )));
    }
    Ok(())
}

fn footprints(flow: &FlowField, b: usize, padding: Padding) -> Vec<Option<Footprint>> {
    let (h, w) = flow.dims();
    let fxs = flow.tensor().plane(b, 0).data;
    let fys = flow.tensor().plane(b, 1).data;
    (0..h * w)
        .map(|i| footprint(i % w, i / w, fxs[i], fys[i], w, h, padding))
        .collect()
}

/// Sample `t` at `p + flow(p)`.
pub fn warp(t: &Tensor, flow: &FlowField, padding: Padding) -> Result<Tensor> {
    check_operands(t, flow)?;
    let mut out = Tensor::zeros(t.b, t.c, t.h, t.w);
    let sample_len = t.c * t.plane_len();
    if sample_len == 0 {
        return Ok(out);
    }
    let (h, w, n) = (t.h, t.w, t.plane_len());
    out.data
        .par_chunks_mut(sample_len)
        .enumerate()
        .for_each(|(b, dst)| {
            let fps = footprints(flow, b, padding);
            for c in 0..t.c {
                let src = t.plane(b, c).data;
                let dst = &mut dst[c * n..(c + 1) * n];
                for (i, fp) in fps.iter().enumerate() {
                    if let Some(f) = fp {
                        let [v00, v01, v10, v11] = taps(src, f, w, h);
                        dst[i] = (1.0 - f.wy) * ((1.0 - f.wx) * v00 + f.wx * v01)
                            + f.wy * ((1.0 - f.wx) * v10 + f.wx * v11);
                    }
                }
            }
        });
    Ok(out)
}

/// Region that was sourced from inside the image: warp a constant-ones map
/// with zero padding and keep pixels reaching at least `threshold`.
pub fn validity_mask(flow: &FlowField, threshold: f32) -> Result<Mask> {
    let (h, w) = flow.dims();
    let ones = Tensor::ones(flow.batch(), 1, h, w);
    let sampled = warp(&ones, flow, Padding::Zeros)?;
    Mask::from_threshold(&sampled, threshold)
}

/// Gradient of `warp(t, flow)` with respect to `t`, given the gradient of
/// the warped output.
pub fn warp_backward_input(grad_out: &Tensor, flow: &FlowField, padding: Padding) -> Result<Tensor> {
    check_operands(grad_out, flow)?;
    let mut grad_in = Tensor::zeros(grad_out.b, grad_out.c, grad_out.h, grad_out.w);
    let sample_len = grad_out.c * grad_out.plane_len();
    if sample_len == 0 {
        return Ok(grad_in);
    }
    let (h, w, n) = (grad_out.h, grad_out.w, grad_out.plane_len());
    grad_in
        .data
        .par_chunks_mut(sample_len)
        .enumerate()
        .for_each(|(b, dst)| {
            let fps = footprints(flow, b, padding);
            for c in 0..grad_out.c {
                let g = grad_out.plane(b, c).data;
                let dst = &mut dst[c * n..(c + 1) * n];
                for (i, fp) in fps.iter().enumerate() {
                    let (Some(f), gv) = (fp, g[i]) else { continue };
                    if gv == 0.0 {
                        continue;
                    }
                    let corners = [
                        (f.x0, f.y0, (1.0 - f.wx) * (1.0 - f.wy)),
                        (f.x0 + 1, f.y0, f.wx * (1.0 - f.wy)),
                        (f.x0, f.y0 + 1, (1.0 - f.wx) * f.wy),
                        (f.x0 + 1, f.y0 + 1, f.wx * f.wy),
                    ];
                    for (x, y, wgt) in corners {
                        if x >= 0 && y >= 0 && (x as usize) < w && (y as usize) < h {
                            dst[y as usize * w + x as usize] += gv * wgt;
                        }
                    }
                }
            }
        });
    Ok(grad_in)
}

/// Gradient of `warp(t, flow)` with respect to the flow.
pub fn warp_backward_flow(
    grad_out: &Tensor,
    t: &Tensor,
    flow: &FlowField,
    padding: Padding,
) -> Result<FlowField> {
    check_operands(t, flow)?;
    t.ensure_same_shape(grad_out, "warp gradient")?;
    let (h, w) = flow.dims();
    let mut grad = Tensor::zeros(t.b, 2, h, w);
    let n = t.plane_len();
    if n == 0 {
        return FlowField::new(grad);
    }
    grad.data
        .par_chunks_mut(2 * n)
        .enumerate()
        .for_each(|(b, dst)| {
            let fps = footprints(flow, b, padding);
            let (gx_out, gy_out) = dst.split_at_mut(n);
            for c in 0..t.c {
                let src = t.plane(b, c).data;
                let g = grad_out.plane(b, c).data;
                for (i, fp) in fps.iter().enumerate() {
                    let (Some(f), gv) = (fp, g[i]) else { continue };
                    if gv == 0.0 {
                        continue;
                    }
                    let [v00, v01, v10, v11] = taps(src, f, w, h);
                    let d_sx = (1.0 - f.wy) * (v01 - v00) + f.wy * (v11 - v10);
                    let d_sy = (1.0 - f.wx) * (v10 - v00) + f.wx * (v11 - v01);
                    gx_out[i] += gv * d_sx * f.dsx;
                    gy_out[i] += gv * d_sy * f.dsy;
                }
            }
        });
    FlowField::new(grad)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(b: usize, c: usize, h: usize, w: usize) -> Tensor {
        let mut t = Tensor::zeros(b, c, h, w);
        for (i, v) in t.data.iter_mut().enumerate() {
            *v = ((i * 7919) % 251) as f32;
        }
        t
    }

    #[test]
    fn zero_flow_is_identity() {
        let t = ramp(2, 3, 5, 9);
        let out = warp(&t, &FlowField::zeros(2, 5, 9), Padding::Zeros).unwrap();
        for (a, b) in out.data.iter().zip(&t.data) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn integer_translation_shifts_content() {
        let t = ramp(1, 1, 6, 6);
        let out = warp(&t, &FlowField::constant(1, 6, 6, 2.0, -1.0), Padding::Zeros).unwrap();
        assert!((out.get(0, 0, 3, 1) - t.get(0, 0, 2, 3)).abs() < 1e-4);
        assert_eq!(out.get(0, 0, 0, 0), 0.0, "sampling above the image reads zero");
        assert_eq!(out.get(0, 0, 3, 5), 0.0, "sampling right of the image reads zero");
    }

    #[test]
    fn border_padding_clamps() {
        let t = ramp(1, 1, 4, 4);
        let out = warp(&t, &FlowField::constant(1, 4, 4, 10.0, 0.0), Padding::Border).unwrap();
        for y in 0..4 {
            assert!((out.get(0, 0, y, 0) - t.get(0, 0, y, 3)).abs() < 1e-4);
        }
    }

    #[test]
    fn validity_mask_matches_translation() {
        let mask = validity_mask(&FlowField::constant(1, 4, 8, 3.0, 0.0), 0.2).unwrap();
        assert_eq!(mask.count(0), 4 * 5);
    }

    #[test]
    fn diverged_flow_reads_zero_padding() {
        let t = Tensor::ones(1, 1, 4, 4);
        let cases = [
            (1e30, 0.0),
            (0.0, -1e30),
            (f32::MAX, f32::MAX),
            (f32::INFINITY, 0.0),
            (0.0, f32::NEG_INFINITY),
            (f32::NAN, 0.0),
        ];
        for (dx, dy) in cases {
            let flow = FlowField::constant(1, 4, 4, dx, dy);
            let out = warp(&t, &flow, Padding::Zeros).unwrap();
            assert!(out.data.iter().all(|&v| v == 0.0), "flow ({dx}, {dy}) sampled inside");
            let mask = validity_mask(&flow, 0.2).unwrap();
            assert_eq!(mask.count(0), 0, "flow ({dx}, {dy}) marked valid");
            let g = Tensor::ones(1, 1, 4, 4);
            let gin = warp_backward_input(&g, &flow, Padding::Zeros).unwrap();
            assert!(gin.data.iter().all(|&v| v == 0.0));
            let gflow = warp_backward_flow(&g, &t, &flow, Padding::Zeros).unwrap();
            assert!(gflow.tensor().data.iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn diverged_flow_clamps_under_border_padding() {
        let t = ramp(1, 1, 4, 4);
        let out = warp(&t, &FlowField::constant(1, 4, 4, -1e30, 1e30), Padding::Border).unwrap();
        for y in 0..4 {
            for x in 0..4 {
                assert!((out.get(0, 0, y, x) - t.get(0, 0, 3, 0)).abs() < 1e-4);
            }
        }
        let nan = warp(&t, &FlowField::constant(1, 4, 4, f32::NAN, 0.0), Padding::Border).unwrap();
        assert!(nan.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn input_backward_is_adjoint() {
        let t = ramp(1, 2, 5, 6);
        let flow = FlowField::from_fn(1, 5, 6, |_, x, y| (0.3 * x as f32 - 0.7, 0.45 * y as f32 - 1.1));
        let mut g = Tensor::zeros(1, 2, 5, 6);
        for (i, v) in g.data.iter_mut().enumerate() {
            *v = (i as f32 * 0.3).sin();
        }
        let y = warp(&t, &flow, Padding::Zeros).unwrap();
        let gt = warp_backward_input(&g, &flow, Padding::Zeros).unwrap();
        let lhs: f32 = y.data.iter().zip(&g.data).map(|(a, b)| a * b).sum();
        let rhs: f32 = t.data.iter().zip(&gt.data).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-2 * lhs.abs().max(1.0), "{lhs} vs {rhs}");
    }

    #[test]
    fn flow_backward_matches_finite_differences() {
        let mut t = Tensor::zeros(1, 1, 6, 6);
        for y in 0..6 {
            for x in 0..6 {
                t.set(0, 0, y, x, (x * x) as f32 + 2.0 * y as f32);
            }
        }
        let flow = FlowField::constant(1, 6, 6, 0.3, 0.6);
        let g = Tensor::ones(1, 1, 6, 6);
        let grad = warp_backward_flow(&g, &t, &flow, Padding::Zeros).unwrap();
        // interior pixel (2, 2): d/dfx is the x-slope between columns 2 and 3
        assert!((grad.dx(0, 2, 2) - 5.0).abs() < 1e-4);
        assert!((grad.dy(0, 2, 2) - 2.0).abs() < 1e-4);
    }
}
