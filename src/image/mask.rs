//! Batched boolean validity mask of shape `(B, H, W)`.
use super::Tensor;
use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mask {
    pub b: usize,
    pub h: usize,
    pub w: usize,
    pub data: Vec<bool>,
}

impl Mask {
    pub fn full(b: usize, h: usize, w: usize, value: bool) -> Self {
        Self {
            b,
            h,
            w,
            data: vec![value; b * h * w],
        }
    }

    pub fn from_vec(b: usize, h: usize, w: usize, data: Vec<bool>) -> Result<Self> {
        if data.len() != b * h * w {
            return Err(Error::shape(format!(
                "mask buffer of {} values cannot hold ({b},{h},{w})",
                data.len()
            )));
        }
        Ok(Self { b, h, w, data })
    }

    /// Threshold a single-channel tensor: `true` where `value >= threshold`.
    pub fn from_threshold(t: &Tensor, threshold: f32) -> Result<Self> {
        if t.c != 1 {
            return Err(Error::shape(format!(
                "mask source must have one channel, got {}",
                t.c
            )));
        }
        Ok(Self {
            b: t.b,
            h: t.h,
            w: t.w,
            data: t.data.iter().map(|&v| v >= threshold).collect(),
        })
    }

    #[inline]
    pub fn idx(&self, b: usize, y: usize, x: usize) -> usize {
        (b * self.h + y) * self.w + x
    }

    #[inline]
    pub fn get(&self, b: usize, y: usize, x: usize) -> bool {
        self.data[self.idx(b, y, x)]
    }

    pub fn sample(&self, b: usize) -> &[bool] {
        let n = self.h * self.w;
        &self.data[b * n..(b + 1) * n]
    }

    pub fn sample_mut(&mut self, b: usize) -> &mut [bool] {
        let n = self.h * self.w;
        &mut self.data[b * n..(b + 1) * n]
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.b, self.h, self.w]
    }

    /// Logical AND of two masks with identical shape.
    pub fn and(&self, other: &Mask) -> Result<Mask> {
        if self.shape() != other.shape() {
            return Err(Error::shape(format!(
                "mask AND: {:?} vs {:?}",
                self.shape(),
                other.shape()
            )));
        }
        Ok(Mask {
            b: self.b,
            h: self.h,
            w: self.w,
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| a && b)
                .collect(),
        })
    }

    /// Number of valid pixels in sample `b`.
    pub fn count(&self, b: usize) -> usize {
        self.sample(b).iter().filter(|&&v| v).count()
    }

    /// Fraction of valid pixels over the whole batch.
    pub fn total_fraction(&self) -> f32 {
        let n = self.data.len().max(1);
        self.data.iter().filter(|&&v| v).count() as f32 / n as f32
    }

    pub fn crop(&self, y0: usize, x0: usize, h: usize, w: usize) -> Mask {
        let y0 = y0.min(self.h);
        let x0 = x0.min(self.w);
        let h = h.min(self.h - y0);
        let w = w.min(self.w - x0);
        let mut data = Vec::with_capacity(self.b * h * w);
        for b in 0..self.b {
            for y in 0..h {
                let start = self.idx(b, y0 + y, x0);
                data.extend_from_slice(&self.data[start..start + w]);
            }
        }
        Mask {
            b: self.b,
            h,
            w,
            data,
        }
    }

    /// `(B, 1, H, W)` tensor with `1.0` on valid pixels.
    pub fn to_tensor(&self) -> Tensor {
        Tensor {
            b: self.b,
            c: 1,
            h: self.h,
            w: self.w,
            data: self
                .data
                .iter()
                .map(|&v| if v { 1.0 } else { 0.0 })
                .collect(),
        }
    }
}
