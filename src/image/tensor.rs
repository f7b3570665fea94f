//! Dense batched `(B, C, H, W)` f32 tensor in row-major NCHW order.
//!
//! Images, flow fields and intermediate maps all share this layout. Each
//! `(batch, channel)` pair is a contiguous plane of `H × W` samples, which is
//! the unit the resampling and warping kernels parallelise over.
use crate::error::{Error, Result};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Borrowed view of one `(batch, channel)` plane, row-major with stride `w`.
#[derive(Clone, Copy, Debug)]
pub struct Plane<'a> {
    pub w: usize,
    pub h: usize,
    pub data: &'a [f32],
}

impl<'a> Plane<'a> {
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.w + x]
    }

    #[inline]
    pub fn row(&self, y: usize) -> &'a [f32] {
        &self.data[y * self.w..(y + 1) * self.w]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub b: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn zeros(b: usize, c: usize, h: usize, w: usize) -> Self {
        Self::filled(b, c, h, w, 0.0)
    }

    pub fn ones(b: usize, c: usize, h: usize, w: usize) -> Self {
        Self::filled(b, c, h, w, 1.0)
    }

    pub fn filled(b: usize, c: usize, h: usize, w: usize, value: f32) -> Self {
        Self {
            b,
            c,
            h,
            w,
            data: vec![value; b * c * h * w],
        }
    }

    pub fn from_vec(b: usize, c: usize, h: usize, w: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != b * c * h * w {
            return Err(Error::shape(format!(
                "buffer of {} values cannot hold ({b},{c},{h},{w})",
                data.len()
            )));
        }
        Ok(Self { b, c, h, w, data })
    }

    #[inline]
    pub fn shape(&self) -> [usize; 4] {
        [self.b, self.c, self.h, self.w]
    }

    #[inline]
    pub fn plane_len(&self) -> usize {
        self.h * self.w
    }

    #[inline]
    pub fn idx(&self, b: usize, c: usize, y: usize, x: usize) -> usize {
        ((b * self.c + c) * self.h + y) * self.w + x
    }

    #[inline]
    pub fn get(&self, b: usize, c: usize, y: usize, x: usize) -> f32 {
        self.data[self.idx(b, c, y, x)]
    }

    #[inline]
    pub fn set(&mut self, b: usize, c: usize, y: usize, x: usize, v: f32) {
        let i = self.idx(b, c, y, x);
        self.data[i] = v;
    }

    pub fn plane(&self, b: usize, c: usize) -> Plane<'_> {
        let n = self.plane_len();
        let start = (b * self.c + c) * n;
        Plane {
            w: self.w,
            h: self.h,
            data: &self.data[start..start + n],
        }
    }

    pub fn plane_mut(&mut self, b: usize, c: usize) -> &mut [f32] {
        let n = self.plane_len();
        let start = (b * self.c + c) * n;
        &mut self.data[start..start + n]
    }

    /// Copy a single sample out as a `(1, C, H, W)` tensor.
    pub fn sample(&self, b: usize) -> Tensor {
        let n = self.c * self.plane_len();
        Tensor {
            b: 1,
            c: self.c,
            h: self.h,
            w: self.w,
            data: self.data[b * n..(b + 1) * n].to_vec(),
        }
    }

    pub fn same_shape(&self, other: &Tensor) -> bool {
        self.shape() == other.shape()
    }

    pub fn ensure_same_shape(&self, other: &Tensor, what: &str) -> Result<()> {
        if self.same_shape(other) {
            Ok(())
        } else {
            Err(Error::shape(format!(
                "{what}: {:?} vs {:?}",
                self.shape(),
                other.shape()
            )))
        }
    }

    /// Extract the spatial window `[y0, y0+h) × [x0, x0+w)` from every plane.
    ///
    /// The window is clipped to the tensor extent.
    pub fn crop(&self, y0: usize, x0: usize, h: usize, w: usize) -> Tensor {
        let y0 = y0.min(self.h);
        let x0 = x0.min(self.w);
        let h = h.min(self.h - y0);
        let w = w.min(self.w - x0);
        let mut out = Tensor::zeros(self.b, self.c, h, w);
        for b in 0..self.b {
            for c in 0..self.c {
                let src = self.plane(b, c);
                let dst = out.plane_mut(b, c);
                for y in 0..h {
                    let row = &src.data[(y0 + y) * src.w + x0..(y0 + y) * src.w + x0 + w];
                    dst[y * w..(y + 1) * w].copy_from_slice(row);
                }
            }
        }
        out
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            data: self.data.iter().map(|&v| f(v)).collect(),
            b: self.b,
            c: self.c,
            h: self.h,
            w: self.w,
        }
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.ensure_same_shape(other, "tensor addition")?;
        Ok(Tensor {
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| a + b)
                .collect(),
            b: self.b,
            c: self.c,
            h: self.h,
            w: self.w,
        })
    }

    /// Convert to integer-like pixel values the way an 8-bit cast does:
    /// truncate towards zero, clamp to `[0, 255]`, non-finite values become 0.
    pub fn truncate_to_u8_range(&self) -> Tensor {
        self.map(|v| if v.is_finite() { v.clamp(0.0, 255.0).trunc() } else { 0.0 })
    }

    /// Scale `[0, 255]` images to `[0, 1]` and standardise with ImageNet
    /// statistics. Requires three channels.
    pub fn normalize_imagenet(&self) -> Result<Tensor> {
        if self.c != 3 {
            return Err(Error::shape(format!(
                "ImageNet normalisation expects 3 channels, got {}",
                self.c
            )));
        }
        let mut out = self.clone();
        for b in 0..self.b {
            for c in 0..3 {
                let (mean, std) = (IMAGENET_MEAN[c], IMAGENET_STD[c]);
                for v in out.plane_mut(b, c) {
                    *v = (*v / 255.0 - mean) / std;
                }
            }
        }
        Ok(out)
    }
}
