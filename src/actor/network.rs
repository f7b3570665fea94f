use crate::error::Result;
use crate::flow::FlowField;
use crate::image::Tensor;

/// Multi-scale features of one image batch, finest level first.
#[derive(Clone, Debug, Default)]
pub struct FeaturePyramid {
    pub levels: Vec<Tensor>,
}

impl FeaturePyramid {
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Computes a [`FeaturePyramid`] once per image so that it can be shared by
/// every flow direction that image takes part in.
pub trait FeatureExtractor: Send + Sync {
    fn pyramid(&self, image: &Tensor) -> Result<FeaturePyramid>;
}

/// Flow backbone.
///
/// `forward(target, source, ..)` estimates the flow from `target` to
/// `source`: a field on the target grid whose vectors point to the matching
/// source pixel. Estimates are ordered coarse to fine and every level holds
/// displacements in pixels of the input resolution.
pub trait FlowNetwork: Send + Sync {
    /// `pyramids` is `(target, source)` when the network exposes a feature
    /// extractor.
    fn forward(
        &self,
        target: &Tensor,
        source: &Tensor,
        pyramids: Option<(&FeaturePyramid, &FeaturePyramid)>,
    ) -> Result<Vec<FlowField>>;

    /// Optional capability: a feature extractor whose output `forward`
    /// accepts in place of recomputing it.
    fn feature_extractor(&self) -> Option<&dyn FeatureExtractor> {
        None
    }
}
