//! Dense 2-channel displacement fields.
//!
//! Channel 0 holds horizontal and channel 1 vertical displacement in pixels.
//! Changing the spatial resolution of a field must also change its values:
//! channel 0 scales with `W'/W` and channel 1 with `H'/H`. [`FlowField::resize`]
//! does both; resampling the raw tensor alone is never correct for flow.
use crate::error::{Error, Result};
use crate::image::{Mask, Tensor};
use crate::resample::{resize_bilinear, sparse_max_pool};

#[derive(Clone, Debug, PartialEq)]
pub struct FlowField(Tensor);

impl FlowField {
    /// Wrap a `(B, 2, H, W)` tensor.
    pub fn new(t: Tensor) -> Result<Self> {
        if t.c != 2 {
            return Err(Error::shape(format!(
                "flow field must have 2 channels, got shape {:?}",
                t.shape()
            )));
        }
        Ok(Self(t))
    }

    pub fn zeros(b: usize, h: usize, w: usize) -> Self {
        Self(Tensor::zeros(b, 2, h, w))
    }

    /// Field with the same displacement `(dx, dy)` everywhere.
    pub fn constant(b: usize, h: usize, w: usize, dx: f32, dy: f32) -> Self {
        let mut t = Tensor::zeros(b, 2, h, w);
        for bb in 0..b {
            t.plane_mut(bb, 0).fill(dx);
            t.plane_mut(bb, 1).fill(dy);
        }
        Self(t)
    }

    /// Build a field by evaluating `f(b, x, y) -> (dx, dy)` at each pixel.
    pub fn from_fn(b: usize, h: usize, w: usize, f: impl Fn(usize, usize, usize) -> (f32, f32)) -> Self {
        let mut t = Tensor::zeros(b, 2, h, w);
        for bb in 0..b {
            for y in 0..h {
                for x in 0..w {
                    let (dx, dy) = f(bb, x, y);
                    t.set(bb, 0, y, x, dx);
                    t.set(bb, 1, y, x, dy);
                }
            }
        }
        Self(t)
    }

    #[inline]
    pub fn tensor(&self) -> &Tensor {
        &self.0
    }

    #[inline]
    pub fn tensor_mut(&mut self) -> &mut Tensor {
        &mut self.0
    }

    #[inline]
    pub fn batch(&self) -> usize {
        self.0.b
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.0.h
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.0.w
    }

    #[inline]
    pub fn dims(&self) -> (usize, usize) {
        (self.0.h, self.0.w)
    }

    #[inline]
    pub fn dx(&self, b: usize, y: usize, x: usize) -> f32 {
        self.0.get(b, 0, y, x)
    }

    #[inline]
    pub fn dy(&self, b: usize, y: usize, x: usize) -> f32 {
        self.0.get(b, 1, y, x)
    }

    /// Multiply channel 0 by `sx` and channel 1 by `sy`.
    pub fn scale_channels(&self, sx: f32, sy: f32) -> FlowField {
        let mut out = self.0.clone();
        for b in 0..out.b {
            out.plane_mut(b, 0).iter_mut().for_each(|v| *v *= sx);
            out.plane_mut(b, 1).iter_mut().for_each(|v| *v *= sy);
        }
        FlowField(out)
    }

    /// Bilinear resize with channel-wise value rescaling.
    pub fn resize(&self, h: usize, w: usize) -> FlowField {
        if (h, w) == self.dims() {
            return self.clone();
        }
        let (sx, sy) = (w as f32 / self.width() as f32, h as f32 / self.height() as f32);
        FlowField(resize_bilinear(&self.0, h, w)).scale_channels(sx, sy)
    }

    /// Bilinear resize keeping displacement values in their current units.
    pub fn resize_spatial(&self, h: usize, w: usize) -> FlowField {
        FlowField(resize_bilinear(&self.0, h, w))
    }

    /// Sparse-aware spatial downsampling keeping displacement units.
    pub fn sparse_downsample(&self, h: usize, w: usize) -> FlowField {
        FlowField(sparse_max_pool(&self.0, h, w))
    }

    pub fn crop(&self, y0: usize, x0: usize, h: usize, w: usize) -> FlowField {
        FlowField(self.0.crop(y0, x0, h, w))
    }

    pub fn add(&self, other: &FlowField) -> Result<FlowField> {
        Ok(FlowField(self.0.add(&other.0)?))
    }

    pub fn ensure_same_shape(&self, other: &FlowField, what: &str) -> Result<()> {
        self.0.ensure_same_shape(&other.0, what)
    }

    /// Per-pixel squared magnitude `dx² + dy²` as a `(B, 1, H, W)` tensor.
    pub fn magnitude_sq(&self) -> Tensor {
        let (h, w) = self.dims();
        let mut out = Tensor::zeros(self.batch(), 1, h, w);
        for b in 0..self.batch() {
            let gx = self.0.plane(b, 0).data;
            let gy = self.0.plane(b, 1).data;
            for ((o, &x), &y) in out.plane_mut(b, 0).iter_mut().zip(gx).zip(gy) {
                *o = x * x + y * y;
            }
        }
        out
    }

    /// Pixels whose mapping `p + flow(p)` stays inside `[0, W-1] × [0, H-1]`.
    pub fn border_mask(&self) -> Mask {
        let (h, w) = self.dims();
        let (max_x, max_y) = (w.saturating_sub(1) as f32, h.saturating_sub(1) as f32);
        let mut mask = Mask::full(self.batch(), h, w, false);
        for b in 0..self.batch() {
            let gx = self.0.plane(b, 0).data;
            let gy = self.0.plane(b, 1).data;
            for (i, m) in mask.sample_mut(b).iter_mut().enumerate() {
                let mx = (i % w) as f32 + gx[i];
                let my = (i / w) as f32 + gy[i];
                *m = mx >= 0.0 && mx <= max_x && my >= 0.0 && my <= max_y;
            }
        }
        mask
    }
}
