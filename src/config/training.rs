use crate::actor::LossKind;
use crate::composition::{ComposerOptions, FlowComposer};
use crate::error::{Error, Result};
use crate::loss::{GtResize, LossBalancer, MultiScaleLoss, PointwiseLoss, PointwiseObjective};
use crate::preprocess::{BatchPreprocessor, MaskSource};
use crate::synthetic::{RandomTransformFlow, TransformSampler};
use crate::triplet::{TripletBuilder, TripletOptions, TripletSource, TwoFlowTripletBuilder};
use crate::warp::Padding;
use serde::{Deserialize, Serialize};

/// Weights balancing the warp-supervision and w-bipath terms.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossWeights {
    pub warp_supervision: f32,
    pub w_bipath: f32,
    pub warp_supervision_constant: f32,
    pub w_bipath_constant: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            warp_supervision: 1.0,
            w_bipath: 1.0,
            warp_supervision_constant: 1.0,
            w_bipath_constant: 1.0,
        }
    }
}

/// Full configuration of a warp-consistency run. Every field has a default,
/// so a JSON file only needs the values it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarpConsistencyConfig {
    /// `warp_supervision`, `w_bipath` or `warp_supervision_and_w_bipath`.
    pub name_of_loss: String,
    pub seed: u64,

    // triplet creation
    pub crop_size: (usize, usize),
    pub output_size: (usize, usize),
    pub padding_mode: Padding,
    pub min_percent_valid_corr: f32,
    pub compute_mask_zero_borders: bool,
    pub validation_seed: Option<u64>,
    pub transforms: TransformSampler,
    /// Independent second flow for the warp-supervision branch.
    pub transforms_self_supervised: Option<TransformSampler>,
    /// Resolution the transforms are rendered at before resizing.
    pub canonical_size: Option<(usize, usize)>,

    // batch processing
    pub normalize_images: bool,
    pub apply_mask: bool,
    pub apply_mask_zero_borders: bool,

    // composition
    pub detach_flow_for_warping: bool,
    pub compute_visibility_mask: bool,
    pub alpha_1: f32,
    pub alpha_2: f32,

    // objective
    pub objective: PointwiseLoss,
    pub sum_normalized: bool,
    pub level_weights: Vec<f32>,
    pub downsample_gt: bool,
    /// Bilinear for the dense synthetic flows; `sparse_max_pool` when the
    /// supervising ground truth is sparse.
    pub gt_resize: GtResize,
    pub loss_weight: LossWeights,
    pub apply_constant_flow_weights: bool,

    pub semantic_evaluation: bool,
}

impl Default for WarpConsistencyConfig {
    fn default() -> Self {
        let triplet = TripletOptions::default();
        let composer = ComposerOptions::default();
        Self {
            name_of_loss: "warp_supervision_and_w_bipath".to_string(),
            seed: 0,
            crop_size: triplet.crop_size,
            output_size: triplet.output_size,
            padding_mode: triplet.padding_mode,
            min_percent_valid_corr: triplet.min_percent_valid_corr,
            compute_mask_zero_borders: triplet.compute_mask_zero_borders,
            validation_seed: triplet.validation_seed,
            transforms: TransformSampler::default(),
            transforms_self_supervised: None,
            canonical_size: None,
            normalize_images: false,
            apply_mask: false,
            apply_mask_zero_borders: false,
            detach_flow_for_warping: composer.detach_flow_for_warping,
            compute_visibility_mask: composer.compute_cyclic_consistency,
            alpha_1: composer.alpha_1,
            alpha_2: composer.alpha_2,
            objective: PointwiseLoss::Epe,
            sum_normalized: true,
            level_weights: MultiScaleLoss::default().level_weights,
            downsample_gt: true,
            gt_resize: GtResize::Bilinear,
            loss_weight: LossWeights::default(),
            apply_constant_flow_weights: false,
            semantic_evaluation: false,
        }
    }
}

impl WarpConsistencyConfig {
    pub fn loss_kind(&self) -> Result<LossKind> {
        LossKind::from_name(&self.name_of_loss)
    }

    pub fn triplet_options(&self) -> TripletOptions {
        TripletOptions {
            crop_size: self.crop_size,
            output_size: self.output_size,
            padding_mode: self.padding_mode,
            min_percent_valid_corr: self.min_percent_valid_corr,
            compute_mask_zero_borders: self.compute_mask_zero_borders,
            validation_seed: self.validation_seed,
        }
    }

    fn flow_generator(&self, sampler: &TransformSampler) -> Result<RandomTransformFlow> {
        let generator = RandomTransformFlow::new(sampler.clone())?;
        Ok(match self.canonical_size {
            Some((h, w)) => generator.with_canonical_size(h, w),
            None => generator,
        })
    }

    /// Triplet builder drawing random transforms; two independent flows
    /// when a self-supervised sampler is configured.
    pub fn triplet_source(&self) -> Result<Box<dyn TripletSource>> {
        let options = self.triplet_options();
        let unsupervised = Box::new(self.flow_generator(&self.transforms)?);
        Ok(match &self.transforms_self_supervised {
            Some(sampler) => Box::new(TwoFlowTripletBuilder::new(
                options,
                unsupervised,
                Box::new(self.flow_generator(sampler)?),
            )?),
            None => Box::new(TripletBuilder::new(options, unsupervised)?),
        })
    }

    pub fn preprocessor(&self) -> BatchPreprocessor {
        BatchPreprocessor::new(
            self.normalize_images,
            MaskSource::from_flags(self.apply_mask, self.apply_mask_zero_borders),
        )
    }

    pub fn composer(&self) -> FlowComposer {
        FlowComposer::new(ComposerOptions {
            detach_flow_for_warping: self.detach_flow_for_warping,
            compute_cyclic_consistency: self.compute_visibility_mask,
            alpha_1: self.alpha_1,
            alpha_2: self.alpha_2,
            ..ComposerOptions::default()
        })
    }

    pub fn multiscale_loss(&self) -> Result<MultiScaleLoss> {
        if self.level_weights.is_empty() {
            return Err(Error::config("level_weights must not be empty"));
        }
        if let Some(w) = self.level_weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(Error::config(format!("invalid level weight {w}")));
        }
        Ok(MultiScaleLoss {
            level_weights: self.level_weights.clone(),
            objective: PointwiseObjective::new(self.objective, self.sum_normalized),
            downsample_gt: self.downsample_gt,
            gt_resize: self.gt_resize,
        })
    }

    pub fn balancer(&self) -> LossBalancer {
        let w = self.loss_weight;
        if self.apply_constant_flow_weights {
            LossBalancer::Constant {
                warp_supervision: w.warp_supervision_constant,
                w_bipath: w.w_bipath_constant,
            }
        } else {
            LossBalancer::Adaptive {
                warp_supervision: w.warp_supervision,
                w_bipath: w.w_bipath,
            }
        }
    }
}
