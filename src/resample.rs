//! Spatial resampling of batched tensors and masks.
//!
//! - `resize_bilinear` follows the half-pixel-centre convention (corners not
//!   aligned), sampling `src = (dst + 0.5) * in / out - 0.5` clamped at 0.
//! - `resize_bilinear_backward` is its exact adjoint, used to route loss
//!   gradients from an upsampled estimate back to its native resolution.
//! - `resize_area` and `sparse_max_pool` use adaptive pooling windows
//!   `[floor(i * in / out), ceil((i + 1) * in / out))`.
//!
//! All kernels work per `(batch, channel)` plane and run planes in parallel.
use crate::image::{Mask, Tensor};
use rayon::prelude::*;

#[derive(Clone, Copy, Debug)]
struct Tap {
    i0: usize,
    i1: usize,
    l0: f32,
    l1: f32,
}

fn linear_taps(input: usize, output: usize) -> Vec<Tap> {
    let scale = input as f32 / output as f32;
    (0..output)
        .map(|o| {
            let src = ((o as f32 + 0.5) * scale - 0.5).max(0.0);
            let i0 = (src.floor() as usize).min(input - 1);
            let i1 = (i0 + 1).min(input - 1);
            let l1 = (src - i0 as f32).clamp(0.0, 1.0);
            Tap {
                i0,
                i1,
                l0: 1.0 - l1,
                l1,
            }
        })
        .collect()
}

#[inline]
fn adaptive_range(i: usize, input: usize, output: usize) -> (usize, usize) {
    let start = (i * input) / output;
    let end = ((i + 1) * input).div_ceil(output);
    (start, end.max(start + 1).min(input))
}

fn is_degenerate(t: &Tensor, h: usize, w: usize) -> bool {
    t.plane_len() == 0 || h == 0 || w == 0 || t.b * t.c == 0
}

/// Bilinear resize of every plane to `h × w`.
pub fn resize_bilinear(t: &Tensor, h: usize, w: usize) -> Tensor {
    if t.h == h && t.w == w {
        return t.clone();
    }
    let mut out = Tensor::zeros(t.b, t.c, h, w);
    if is_degenerate(t, h, w) {
        return out;
    }
    let ty = linear_taps(t.h, h);
    let tx = linear_taps(t.w, w);
    let in_w = t.w;
    out.data
        .par_chunks_mut(h * w)
        .zip(t.data.par_chunks(t.plane_len()))
        .for_each(|(dst, src)| {
            for (y, a) in ty.iter().enumerate() {
                let r0 = &src[a.i0 * in_w..(a.i0 + 1) * in_w];
                let r1 = &src[a.i1 * in_w..(a.i1 + 1) * in_w];
                for (x, b) in tx.iter().enumerate() {
                    dst[y * w + x] = a.l0 * (b.l0 * r0[b.i0] + b.l1 * r0[b.i1])
                        + a.l1 * (b.l0 * r1[b.i0] + b.l1 * r1[b.i1]);
                }
            }
        });
    out
}

/// Adjoint of [`resize_bilinear`]: scatter `grad` (at the resized
/// resolution) back onto an `in_h × in_w` grid.
pub fn resize_bilinear_backward(grad: &Tensor, in_h: usize, in_w: usize) -> Tensor {
    if grad.h == in_h && grad.w == in_w {
        return grad.clone();
    }
    let mut out = Tensor::zeros(grad.b, grad.c, in_h, in_w);
    if is_degenerate(grad, in_h, in_w) {
        return out;
    }
    let ty = linear_taps(in_h, grad.h);
    let tx = linear_taps(in_w, grad.w);
    let gw = grad.w;
    out.data
        .par_chunks_mut(in_h * in_w)
        .zip(grad.data.par_chunks(grad.plane_len()))
        .for_each(|(dst, g)| {
            for (y, a) in ty.iter().enumerate() {
                for (x, b) in tx.iter().enumerate() {
                    let v = g[y * gw + x];
                    if v == 0.0 {
                        continue;
                    }
                    dst[a.i0 * in_w + b.i0] += v * a.l0 * b.l0;
                    dst[a.i0 * in_w + b.i1] += v * a.l0 * b.l1;
                    dst[a.i1 * in_w + b.i0] += v * a.l1 * b.l0;
                    dst[a.i1 * in_w + b.i1] += v * a.l1 * b.l1;
                }
            }
        });
    out
}

/// Area (adaptive average) resize, used for images.
pub fn resize_area(t: &Tensor, h: usize, w: usize) -> Tensor {
    if t.h == h && t.w == w {
        return t.clone();
    }
    let mut out = Tensor::zeros(t.b, t.c, h, w);
    if is_degenerate(t, h, w) {
        return out;
    }
    let (in_h, in_w) = (t.h, t.w);
    out.data
        .par_chunks_mut(h * w)
        .zip(t.data.par_chunks(t.plane_len()))
        .for_each(|(dst, src)| {
            for y in 0..h {
                let (y0, y1) = adaptive_range(y, in_h, h);
                for x in 0..w {
                    let (x0, x1) = adaptive_range(x, in_w, w);
                    let mut acc = 0.0f32;
                    for sy in y0..y1 {
                        acc += src[sy * in_w + x0..sy * in_w + x1].iter().sum::<f32>();
                    }
                    dst[y * w + x] = acc / ((y1 - y0) * (x1 - x0)) as f32;
                }
            }
        });
    out
}

/// Downsample a sparse map treating zeros as missing data.
///
/// Positive values and negative values are max-pooled separately (the latter
/// on their magnitude) and recombined, so an isolated measurement survives
/// instead of being averaged away by its empty neighbours.
pub fn sparse_max_pool(t: &Tensor, h: usize, w: usize) -> Tensor {
    if t.h == h && t.w == w {
        return t.clone();
    }
    let mut out = Tensor::zeros(t.b, t.c, h, w);
    if is_degenerate(t, h, w) {
        return out;
    }
    let (in_h, in_w) = (t.h, t.w);
    out.data
        .par_chunks_mut(h * w)
        .zip(t.data.par_chunks(t.plane_len()))
        .for_each(|(dst, src)| {
            for y in 0..h {
                let (y0, y1) = adaptive_range(y, in_h, h);
                for x in 0..w {
                    let (x0, x1) = adaptive_range(x, in_w, w);
                    let mut pos = 0.0f32;
                    let mut neg = 0.0f32;
                    for sy in y0..y1 {
                        for &v in &src[sy * in_w + x0..sy * in_w + x1] {
                            if v > 0.0 {
                                pos = pos.max(v);
                            } else if v < 0.0 {
                                neg = neg.max(-v);
                            }
                        }
                    }
                    dst[y * w + x] = pos - neg;
                }
            }
        });
    out
}

/// Resize a mask bilinearly and keep pixels whose interpolated coverage is at
/// least `min_coverage`.
pub fn resize_mask(mask: &Mask, h: usize, w: usize, min_coverage: f32) -> Mask {
    if mask.h == h && mask.w == w {
        return mask.clone();
    }
    let resized = resize_bilinear(&mask.to_tensor(), h, w);
    Mask {
        b: mask.b,
        h,
        w,
        data: resized.data.iter().map(|&v| v >= min_coverage).collect(),
    }
}
