//! I/O helpers for image tensors, masks and JSON.
//!
//! - `load_rgb_image`: read a PNG/JPEG/etc. into a `(1, 3, H, W)` tensor in `[0, 255]`.
//! - `save_rgb_sample`: write one sample of a 3-channel tensor to an RGB PNG.
//! - `save_mask`: write one sample of a mask as a black/white PNG.
//! - `write_json_file`: pretty-print a serializable value to disk.
use super::{Mask, Tensor};
use crate::error::{Error, Result};
use image::{GrayImage, Luma, Rgb, RgbImage};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Load an image from disk as an RGB tensor with integer-like values.
pub fn load_rgb_image(path: &Path) -> Result<Tensor> {
    let img = image::open(path)?.into_rgb8();
    let (w, h) = (img.width() as usize, img.height() as usize);
    let mut out = Tensor::zeros(1, 3, h, w);
    for (x, y, px) in img.enumerate_pixels() {
        for c in 0..3 {
            out.set(0, c, y as usize, x as usize, px.0[c] as f32);
        }
    }
    Ok(out)
}

/// Save sample `b` of a 3-channel tensor, clamping values to `[0, 255]`.
pub fn save_rgb_sample(tensor: &Tensor, b: usize, path: &Path) -> Result<()> {
    if tensor.c != 3 || b >= tensor.b {
        return Err(Error::shape(format!(
            "cannot save sample {b} of {:?} as RGB",
            tensor.shape()
        )));
    }
    ensure_parent_dir(path)?;
    let mut out = RgbImage::new(tensor.w as u32, tensor.h as u32);
    for y in 0..tensor.h {
        for x in 0..tensor.w {
            let px = [0, 1, 2].map(|c| tensor.get(b, c, y, x).clamp(0.0, 255.0) as u8);
            out.put_pixel(x as u32, y as u32, Rgb(px));
        }
    }
    out.save(path)?;
    Ok(())
}

/// Save sample `b` of a mask, valid pixels white.
pub fn save_mask(mask: &Mask, b: usize, path: &Path) -> Result<()> {
    if b >= mask.b {
        return Err(Error::shape(format!("mask has no sample {b}")));
    }
    ensure_parent_dir(path)?;
    let mut out = GrayImage::new(mask.w as u32, mask.h as u32);
    for y in 0..mask.h {
        for x in 0..mask.w {
            let v = if mask.get(b, y, x) { 255u8 } else { 0u8 };
            out.put_pixel(x as u32, y as u32, Luma([v]));
        }
    }
    out.save(path)?;
    Ok(())
}

/// Serialize a value as pretty JSON to `path`, creating parent directories.
pub fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent_dir(path)?;
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
