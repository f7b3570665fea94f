//! Turns a triplet batch into the inputs of one training step: optional
//! ImageNet normalisation and selection of the mask that gates the loss.
use crate::error::{Error, Result};
use crate::flow::FlowField;
use crate::image::{Mask, Tensor};
use crate::resample::resize_mask;
use crate::triplet::{Keypoints, SyntheticTriplet, TripletBatch};
use serde::{Deserialize, Serialize};

/// Coverage a bilinearly resized mask pixel needs to stay valid.
pub const MASK_RESIZE_COVERAGE: f32 = 0.98;

/// Which mask gates the training loss.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskSource {
    #[default]
    None,
    ZeroBorders,
    Correspondence,
}

impl MaskSource {
    pub fn from_flags(apply_mask: bool, apply_mask_zero_borders: bool) -> Self {
        if apply_mask_zero_borders {
            MaskSource::ZeroBorders
        } else if apply_mask {
            MaskSource::Correspondence
        } else {
            MaskSource::None
        }
    }
}

/// A target-prime image with its known flow and the selected loss mask.
#[derive(Clone, Debug)]
pub struct PrimeInputs {
    pub target_image_prime: Tensor,
    pub flow_map: FlowField,
    pub correspondence_mask: Mask,
    /// Loss mask at the resolution of `flow_map`, if any.
    pub mask: Option<Mask>,
}

#[derive(Clone, Debug)]
pub struct TrainingBatch {
    pub source_image: Tensor,
    pub target_image: Tensor,
    pub prime: PrimeInputs,
    pub prime_ss: Option<PrimeInputs>,
    pub flow_map_target_to_source: Option<FlowField>,
    pub correspondence_mask_target_to_source: Option<Mask>,
    pub source_kps: Option<Keypoints>,
    pub target_kps: Option<Keypoints>,
    pub epoch: usize,
    pub iteration: usize,
}

impl TrainingBatch {
    /// Inputs of the direct (warp-supervision) branch: the second triplet
    /// when one was built, the main one otherwise.
    pub fn supervision(&self) -> &PrimeInputs {
        self.prime_ss.as_ref().unwrap_or(&self.prime)
    }

    pub fn flow_dims(&self) -> (usize, usize) {
        self.prime.flow_map.dims()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPreprocessor {
    pub normalize_images: bool,
    pub mask_source: MaskSource,
}

impl BatchPreprocessor {
    pub fn new(normalize_images: bool, mask_source: MaskSource) -> Self {
        Self {
            normalize_images,
            mask_source,
        }
    }

    fn image(&self, t: &Tensor) -> Result<Tensor> {
        if self.normalize_images {
            t.normalize_imagenet()
        } else {
            Ok(t.clone())
        }
    }

    fn prime(&self, s: &SyntheticTriplet, field: &'static str) -> Result<PrimeInputs> {
        let (h, w) = s.flow_map.dims();
        let mask = match self.mask_source {
            MaskSource::None => None,
            MaskSource::ZeroBorders => Some(s.mask_zero_borders.as_ref().ok_or(Error::MissingField(field))?),
            MaskSource::Correspondence => Some(&s.correspondence_mask),
        };
        let mask = match mask {
            Some(m) if m.b != s.flow_map.batch() => {
                return Err(Error::shape(format!(
                    "loss mask {:?} does not match flow {:?}",
                    m.shape(),
                    s.flow_map.tensor().shape()
                )))
            }
            Some(m) => Some(resize_mask(m, h, w, MASK_RESIZE_COVERAGE)),
            None => None,
        };
        Ok(PrimeInputs {
            target_image_prime: self.image(&s.target_image_prime)?,
            flow_map: s.flow_map.clone(),
            correspondence_mask: s.correspondence_mask.clone(),
            mask,
        })
    }

    pub fn process(&self, batch: &TripletBatch) -> Result<TrainingBatch> {
        let prime = self.prime(&batch.synthetic, "mask_zero_borders")?;
        let prime_ss = batch
            .synthetic_ss
            .as_ref()
            .map(|s| self.prime(s, "mask_zero_borders_ss"))
            .transpose()?;
        Ok(TrainingBatch {
            source_image: self.image(&batch.source_image)?,
            target_image: self.image(&batch.target_image)?,
            prime,
            prime_ss,
            flow_map_target_to_source: batch.flow_map_target_to_source.clone(),
            correspondence_mask_target_to_source: batch.correspondence_mask_target_to_source.clone(),
            source_kps: batch.source_kps.clone(),
            target_kps: batch.target_kps.clone(),
            epoch: batch.epoch,
            iteration: batch.iteration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triplet(zero_borders: Option<Mask>) -> TripletBatch {
        let img = Tensor::filled(1, 3, 4, 4, 255.0);
        TripletBatch {
            source_image: img.clone(),
            target_image: img.clone(),
            synthetic: SyntheticTriplet {
                target_image_prime: img,
                flow_map: FlowField::zeros(1, 4, 4),
                correspondence_mask: Mask::full(1, 4, 4, true),
                mask_zero_borders: zero_borders,
            },
            synthetic_ss: None,
            flow_map_target_to_source: None,
            correspondence_mask_target_to_source: None,
            source_kps: None,
            target_kps: None,
            epoch: 0,
            iteration: 0,
        }
    }

    #[test]
    fn missing_zero_border_mask_is_fatal() {
        let p = BatchPreprocessor::new(false, MaskSource::ZeroBorders);
        let err = p.process(&triplet(None)).unwrap_err();
        assert!(matches!(err, Error::MissingField("mask_zero_borders")), "{err}");
    }

    #[test]
    fn selects_requested_mask() {
        let mut zb = Mask::full(1, 4, 4, true);
        zb.data[0] = false;
        let t = triplet(Some(zb));
        let none = BatchPreprocessor::new(false, MaskSource::None).process(&t).unwrap();
        assert!(none.prime.mask.is_none());
        let zero = BatchPreprocessor::new(false, MaskSource::ZeroBorders).process(&t).unwrap();
        assert_eq!(zero.prime.mask.unwrap().count(0), 15);
        let corr = BatchPreprocessor::new(false, MaskSource::Correspondence).process(&t).unwrap();
        assert_eq!(corr.prime.mask.unwrap().count(0), 16);
    }

    #[test]
    fn mask_is_resized_to_flow_resolution() {
        let t = triplet(Some(Mask::full(1, 8, 8, true)));
        let out = BatchPreprocessor::new(false, MaskSource::ZeroBorders).process(&t).unwrap();
        assert_eq!(out.prime.mask.unwrap().shape(), [1, 4, 4]);
    }

    #[test]
    fn normalisation_applies_imagenet_statistics() {
        let out = BatchPreprocessor::new(true, MaskSource::None).process(&triplet(None)).unwrap();
        let expected = (1.0 - 0.485) / 0.229;
        assert!((out.source_image.get(0, 0, 0, 0) - expected).abs() < 1e-4);
        assert!((out.prime.target_image_prime.get(0, 0, 1, 1) - expected).abs() < 1e-4);
    }

    #[test]
    fn flag_priority() {
        assert_eq!(MaskSource::from_flags(true, true), MaskSource::ZeroBorders);
        assert_eq!(MaskSource::from_flags(true, false), MaskSource::Correspondence);
        assert_eq!(MaskSource::from_flags(false, false), MaskSource::None);
    }
}
