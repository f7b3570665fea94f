//! Batch records passed between the pipeline stages.
//!
//! Each stage consumes the previous record by reference and returns a new
//! one: [`PairBatch`] comes from the dataset, [`TripletBatch`] from the
//! triplet builder.
use crate::error::{Error, Result};
use crate::flow::FlowField;
use crate::image::{Mask, Tensor};

/// Keypoint coordinates per sample, `(B, N, 2)` as `[x, y]` pixels.
pub type Keypoints = Vec<Vec<[f32; 2]>>;

#[derive(Clone, Debug)]
pub struct PairBatch {
    pub source_image: Tensor,
    pub target_image: Tensor,
    /// Known target → source flow, when the dataset provides one.
    pub flow_map: Option<FlowField>,
    pub correspondence_mask: Option<Mask>,
    pub source_kps: Option<Keypoints>,
    pub target_kps: Option<Keypoints>,
    pub epoch: usize,
    pub iteration: usize,
}

impl PairBatch {
    pub fn new(source_image: Tensor, target_image: Tensor) -> Result<Self> {
        source_image.ensure_same_shape(&target_image, "source/target images")?;
        if source_image.b == 0 || source_image.c == 0 {
            return Err(Error::shape(format!(
                "empty image batch {:?}",
                source_image.shape()
            )));
        }
        Ok(Self {
            source_image,
            target_image,
            flow_map: None,
            correspondence_mask: None,
            source_kps: None,
            target_kps: None,
            epoch: 0,
            iteration: 0,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.source_image.b
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.source_image.h, self.source_image.w)
    }

    /// Attach a ground-truth target → source flow and its optional mask.
    pub fn with_ground_truth(mut self, flow: FlowField, mask: Option<Mask>) -> Result<Self> {
        let expected = [self.batch_size(), 2, self.source_image.h, self.source_image.w];
        if flow.tensor().shape() != expected {
            return Err(Error::shape(format!(
                "ground-truth flow {:?}, expected {expected:?}",
                flow.tensor().shape()
            )));
        }
        if let Some(m) = &mask {
            if m.shape() != [expected[0], expected[2], expected[3]] {
                return Err(Error::shape(format!(
                    "ground-truth mask {:?} does not match flow {expected:?}",
                    m.shape()
                )));
            }
        }
        self.flow_map = Some(flow);
        self.correspondence_mask = mask;
        Ok(self)
    }

    pub fn with_keypoints(mut self, source: Keypoints, target: Keypoints) -> Result<Self> {
        if source.len() != self.batch_size() || target.len() != self.batch_size() {
            return Err(Error::shape(format!(
                "keypoints for {} / {} samples, batch has {}",
                source.len(),
                target.len(),
                self.batch_size()
            )));
        }
        self.source_kps = Some(source);
        self.target_kps = Some(target);
        Ok(self)
    }

    pub fn with_step(mut self, epoch: usize, iteration: usize) -> Self {
        self.epoch = epoch;
        self.iteration = iteration;
        self
    }
}

/// Target-prime image with its known flow and masks.
#[derive(Clone, Debug)]
pub struct SyntheticTriplet {
    pub target_image_prime: Tensor,
    /// Target-prime → target flow.
    pub flow_map: FlowField,
    /// Pixels whose synthetic mapping stays inside the target.
    pub correspondence_mask: Mask,
    pub mask_zero_borders: Option<Mask>,
}

#[derive(Clone, Debug)]
pub struct TripletBatch {
    pub source_image: Tensor,
    pub target_image: Tensor,
    pub synthetic: SyntheticTriplet,
    /// Second, independently generated triplet for the self-supervised branch.
    pub synthetic_ss: Option<SyntheticTriplet>,
    pub flow_map_target_to_source: Option<FlowField>,
    pub correspondence_mask_target_to_source: Option<Mask>,
    pub source_kps: Option<Keypoints>,
    pub target_kps: Option<Keypoints>,
    pub epoch: usize,
    pub iteration: usize,
}

impl TripletBatch {
    pub fn target_image_prime(&self) -> &Tensor {
        &self.synthetic.target_image_prime
    }

    pub fn flow_map(&self) -> &FlowField {
        &self.synthetic.flow_map
    }

    pub fn batch_size(&self) -> usize {
        self.source_image.b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_images_rejected() {
        let err = PairBatch::new(Tensor::zeros(1, 3, 8, 8), Tensor::zeros(1, 3, 8, 9));
        assert!(matches!(err, Err(Error::Shape(_))));
    }

    #[test]
    fn ground_truth_shape_checked() {
        let pair = PairBatch::new(Tensor::zeros(2, 3, 8, 8), Tensor::zeros(2, 3, 8, 8)).unwrap();
        assert!(pair.clone().with_ground_truth(FlowField::zeros(2, 4, 4), None).is_err());
        let bad_mask = Mask::full(2, 8, 4, true);
        assert!(pair
            .clone()
            .with_ground_truth(FlowField::zeros(2, 8, 8), Some(bad_mask))
            .is_err());
        let ok = pair
            .with_ground_truth(FlowField::zeros(2, 8, 8), Some(Mask::full(2, 8, 8, true)))
            .unwrap();
        assert!(ok.flow_map.is_some());
    }

    #[test]
    fn keypoints_need_one_list_per_sample() {
        let pair = PairBatch::new(Tensor::zeros(2, 3, 8, 8), Tensor::zeros(2, 3, 8, 8)).unwrap();
        let one = vec![vec![[1.0, 2.0]]];
        assert!(pair.clone().with_keypoints(one.clone(), one).is_err());
        let two = vec![vec![[1.0, 2.0]], vec![]];
        let ok = pair.with_keypoints(two.clone(), two).unwrap();
        assert_eq!(ok.target_kps.as_ref().map(Vec::len), Some(2));
    }
}
