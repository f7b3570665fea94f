pub mod batch;
pub mod builder;
pub mod options;

pub use batch::{Keypoints, PairBatch, SyntheticTriplet, TripletBatch};
pub use builder::{mask_zero_borders, CropGeometry, TripletBuilder, TripletSource, TwoFlowTripletBuilder};
pub use options::TripletOptions;
