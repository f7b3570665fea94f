//! Online creation of the (source, target, target-prime) triplet.
//!
//! Target-prime is the target warped by a known synthetic flow. All three
//! images are centre-cropped so that the black borders introduced by the
//! warp mostly fall outside the patch, then optionally resized to the
//! training resolution.
use super::batch::{Keypoints, PairBatch, SyntheticTriplet, TripletBatch};
use super::options::TripletOptions;
use crate::error::{Error, Result};
use crate::flow::FlowField;
use crate::image::{Mask, Tensor};
use crate::resample::{resize_area, resize_mask};
use crate::synthetic::SyntheticFlowGenerator;
use crate::warp::warp;
use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Value at or below which every channel of a target-prime pixel marks it
/// as a zero border left by the warp.
const ZERO_BORDER_LEVEL: f32 = 1e-8;

/// Centre crop followed by an optional resize.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropGeometry {
    pub y0: usize,
    pub x0: usize,
    pub crop: (usize, usize),
    pub output: (usize, usize),
}

impl CropGeometry {
    /// Centre window of `crop` inside `(h, w)`. Start offsets never go below
    /// zero and the window never leaves the image.
    pub fn centred(h: usize, w: usize, crop: (usize, usize), output: (usize, usize)) -> Self {
        let y0 = (h / 2).saturating_sub(crop.0 / 2);
        let x0 = (w / 2).saturating_sub(crop.1 / 2);
        let crop = (crop.0.min(h - y0), crop.1.min(w - x0));
        Self { y0, x0, crop, output }
    }

    pub fn resizes(&self) -> bool {
        self.crop != self.output
    }

    /// `(sx, sy)` from crop pixels to output pixels.
    pub fn ratio(&self) -> (f32, f32) {
        (
            self.output.1 as f32 / self.crop.1.max(1) as f32,
            self.output.0 as f32 / self.crop.0.max(1) as f32,
        )
    }

    pub fn image(&self, t: &Tensor) -> Tensor {
        let cropped = t.crop(self.y0, self.x0, self.crop.0, self.crop.1);
        if self.resizes() {
            resize_area(&cropped, self.output.0, self.output.1)
        } else {
            cropped
        }
    }

    pub fn flow(&self, f: &FlowField) -> FlowField {
        let cropped = f.crop(self.y0, self.x0, self.crop.0, self.crop.1);
        cropped.resize(self.output.0, self.output.1)
    }

    /// Crop and resize a mask, keeping any pixel with non-zero coverage.
    pub fn mask(&self, m: &Mask) -> Mask {
        let cropped = m.crop(self.y0, self.x0, self.crop.0, self.crop.1);
        resize_mask(&cropped, self.output.0, self.output.1, f32::MIN_POSITIVE)
    }

    pub fn keypoints(&self, kps: &Keypoints) -> Keypoints {
        let (sx, sy) = if self.resizes() { self.ratio() } else { (1.0, 1.0) };
        kps.iter()
            .map(|sample| {
                sample
                    .iter()
                    .map(|p| [(p[0] - self.x0 as f32) * sx, (p[1] - self.y0 as f32) * sy])
                    .collect()
            })
            .collect()
    }
}

/// Zero-border mask of a cropped target-prime batch.
///
/// Decided per sample: when the correspondence mask keeps less than
/// `min_percent` of the pixels it is used directly, otherwise pixels where
/// every channel is (numerically) zero are masked out.
pub fn mask_zero_borders(prime: &Tensor, correspondence: &Mask, min_percent: f32) -> Result<Mask> {
    if correspondence.shape() != [prime.b, prime.h, prime.w] {
        return Err(Error::shape(format!(
            "correspondence mask {:?} vs image {:?}",
            correspondence.shape(),
            prime.shape()
        )));
    }
    let mut out = Mask::full(prime.b, prime.h, prime.w, true);
    let area = (prime.h * prime.w) as f32;
    for b in 0..prime.b {
        if (correspondence.count(b) as f32) < area * min_percent {
            out.sample_mut(b).copy_from_slice(correspondence.sample(b));
            continue;
        }
        let planes: Vec<&[f32]> = (0..prime.c).map(|c| prime.plane(b, c).data).collect();
        for (i, m) in out.sample_mut(b).iter_mut().enumerate() {
            *m = !planes.iter().all(|p| p[i] <= ZERO_BORDER_LEVEL);
        }
    }
    Ok(out)
}

fn validation_rng(options: &TripletOptions, pair: &PairBatch, training: bool) -> Option<StdRng> {
    match (training, options.validation_seed) {
        (false, Some(seed)) => Some(StdRng::seed_from_u64(seed.wrapping_add(pair.iteration as u64))),
        _ => None,
    }
}

/// Shared steps 2, 3, 5 and 6 for one synthetic flow.
fn synthesize(
    options: &TripletOptions,
    generator: &dyn SyntheticFlowGenerator,
    rng: &mut StdRng,
    target: &Tensor,
    geometry: &CropGeometry,
) -> Result<SyntheticTriplet> {
    let (b, h, w) = (target.b, target.h, target.w);
    let mut flow = generator.generate(rng, b, (h, w))?;
    if flow.batch() != b {
        return Err(Error::shape(format!(
            "generator returned {} flows for a batch of {b}",
            flow.batch()
        )));
    }
    if flow.dims() != (h, w) {
        flow = flow.resize(h, w);
    }
    let prime = warp(target, &flow, options.padding_mode)?.truncate_to_u8_range();

    let target_image_prime = geometry.image(&prime).truncate_to_u8_range();
    let flow_map = geometry.flow(&flow);
    let correspondence_mask = flow_map.border_mask();
    let mask_zero_borders = if options.compute_mask_zero_borders {
        Some(mask_zero_borders(
            &target_image_prime,
            &correspondence_mask,
            options.min_percent_valid_corr,
        )?)
    } else {
        None
    };
    debug!(
        "triplet: crop={:?} at ({}, {}) output={:?} valid={:.3}",
        geometry.crop,
        geometry.y0,
        geometry.x0,
        geometry.output,
        correspondence_mask.total_fraction()
    );
    Ok(SyntheticTriplet {
        target_image_prime,
        flow_map,
        correspondence_mask,
        mask_zero_borders,
    })
}

fn package(
    pair: &PairBatch,
    geometry: &CropGeometry,
    synthetic: SyntheticTriplet,
    synthetic_ss: Option<SyntheticTriplet>,
) -> TripletBatch {
    TripletBatch {
        source_image: geometry.image(&pair.source_image).truncate_to_u8_range(),
        target_image: geometry.image(&pair.target_image).truncate_to_u8_range(),
        synthetic,
        synthetic_ss,
        flow_map_target_to_source: pair.flow_map.as_ref().map(|f| geometry.flow(f)),
        correspondence_mask_target_to_source: pair.correspondence_mask.as_ref().map(|m| geometry.mask(m)),
        source_kps: pair.source_kps.as_ref().map(|k| geometry.keypoints(k)),
        target_kps: pair.target_kps.as_ref().map(|k| geometry.keypoints(k)),
        epoch: pair.epoch,
        iteration: pair.iteration,
    }
}

fn validate_options(options: &TripletOptions) -> Result<()> {
    let sizes = [options.crop_size, options.output_size];
    if sizes.iter().any(|&(h, w)| h == 0 || w == 0) {
        return Err(Error::config(format!(
            "crop_size {:?} and output_size {:?} must be non-zero",
            options.crop_size, options.output_size
        )));
    }
    if !(0.0..=1.0).contains(&options.min_percent_valid_corr) {
        return Err(Error::config(format!(
            "min_percent_valid_corr must lie in [0, 1], got {}",
            options.min_percent_valid_corr
        )));
    }
    Ok(())
}

/// Anything that turns a dataset pair into a training triplet.
pub trait TripletSource: Send + Sync {
    fn build(&self, pair: &PairBatch, rng: &mut StdRng, training: bool) -> Result<TripletBatch>;
}

pub struct TripletBuilder {
    options: TripletOptions,
    generator: Box<dyn SyntheticFlowGenerator>,
}

impl TripletBuilder {
    pub fn new(options: TripletOptions, generator: Box<dyn SyntheticFlowGenerator>) -> Result<Self> {
        validate_options(&options)?;
        Ok(Self { options, generator })
    }

    pub fn options(&self) -> &TripletOptions {
        &self.options
    }
}

impl TripletSource for TripletBuilder {
    fn build(&self, pair: &PairBatch, rng: &mut StdRng, training: bool) -> Result<TripletBatch> {
        let (h, w) = pair.dims();
        if h < self.options.crop_size.0 || w < self.options.crop_size.1 {
            debug!("crop {:?} covers the full {h}x{w} image", self.options.crop_size);
        }
        let mut local = validation_rng(&self.options, pair, training);
        let rng = local.as_mut().unwrap_or(rng);
        let geometry = CropGeometry::centred(h, w, self.options.crop_size, self.options.output_size);
        let synthetic = synthesize(&self.options, self.generator.as_ref(), rng, &pair.target_image, &geometry)?;
        Ok(package(pair, &geometry, synthetic, None))
    }
}

/// Builds two independent target-prime images from one pair; the second one
/// feeds the self-supervised branch.
pub struct TwoFlowTripletBuilder {
    options: TripletOptions,
    generator_unsupervised: Box<dyn SyntheticFlowGenerator>,
    generator_self_supervised: Box<dyn SyntheticFlowGenerator>,
}

impl TwoFlowTripletBuilder {
    pub fn new(
        options: TripletOptions,
        generator_unsupervised: Box<dyn SyntheticFlowGenerator>,
        generator_self_supervised: Box<dyn SyntheticFlowGenerator>,
    ) -> Result<Self> {
        validate_options(&options)?;
        Ok(Self {
            options,
            generator_unsupervised,
            generator_self_supervised,
        })
    }
}

impl TripletSource for TwoFlowTripletBuilder {
    fn build(&self, pair: &PairBatch, rng: &mut StdRng, training: bool) -> Result<TripletBatch> {
        let (h, w) = pair.dims();
        let mut local = validation_rng(&self.options, pair, training);
        let rng = local.as_mut().unwrap_or(rng);
        let geometry = CropGeometry::centred(h, w, self.options.crop_size, self.options.output_size);
        let un = synthesize(
            &self.options,
            self.generator_unsupervised.as_ref(),
            rng,
            &pair.target_image,
            &geometry,
        )?;
        let ss = synthesize(
            &self.options,
            self.generator_self_supervised.as_ref(),
            rng,
            &pair.target_image,
            &geometry,
        )?;
        Ok(package(pair, &geometry, un, Some(ss)))
    }
}
