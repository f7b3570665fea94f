#![doc = include_str!("../README.md")]

// Public modules (stable-ish surface)
pub mod actor;
pub mod composition;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod flow;
pub mod image;
pub mod loss;
pub mod preprocess;
pub mod triplet;
pub mod warp;

// Building blocks; public, but their signatures may still move.
pub mod pyramid;
pub mod resample;
pub mod synthetic;

// --- High-level re-exports -------------------------------------------------

pub use crate::actor::{ExecutionContext, FlowNetwork, LossKind, StepOutput, WarpConsistencyActor};
pub use crate::config::{load_config, WarpConsistencyConfig};
pub use crate::error::{Error, Result};
pub use crate::flow::FlowField;
pub use crate::image::{Mask, Tensor};
pub use crate::triplet::{PairBatch, TripletBatch, TripletBuilder, TripletSource};
pub use crate::warp::{warp, Padding};

// --- Prelude ---------------------------------------------------------------

/// Small prelude for quick experiments.
///
/// ```no_run
/// use warpc::prelude::*;
/// use rand::SeedableRng;
///
/// # fn main() -> warpc::Result<()> {
/// let image = Tensor::filled(1, 3, 64, 64, 128.0);
/// let pair = PairBatch::new(image.clone(), image)?;
/// let config = WarpConsistencyConfig::default();
/// let builder = config.triplet_source()?;
/// let mut rng = rand::rngs::StdRng::seed_from_u64(0);
/// let triplet = builder.build(&pair, &mut rng, true)?;
/// println!("flow {:?}", triplet.flow_map().dims());
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    pub use crate::actor::{FeatureExtractor, FeaturePyramid, FlowNetwork};
    pub use crate::image::{Mask, Tensor};
    pub use crate::{FlowField, PairBatch, TripletSource, WarpConsistencyActor, WarpConsistencyConfig};
}
